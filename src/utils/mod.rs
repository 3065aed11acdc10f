// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2022 irohaede <irohaede@proton.me>

//! Small platform helpers that don't belong to any one subsystem.

/// Host load/uptime, exposed by the admin surface alongside traffic counters.
///
/// Linux-only; other platforms see an empty stat.
#[cfg(target_os = "linux")]
pub mod stat {
    use std::io;

    /// One-minute load average and seconds of uptime.
    #[derive(Copy, Clone, Debug, Default, serde::Serialize)]
    pub struct SystemStat {
        pub load1: f64,
        pub uptime: f64,
    }

    /// Read `/proc/loadavg` and `/proc/uptime`. Fails only if `/proc` is unavailable.
    pub async fn read() -> io::Result<SystemStat> {
        let loadavg = tokio::fs::read_to_string("/proc/loadavg").await?;
        let load1 = loadavg
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);

        let uptime = tokio::fs::read_to_string("/proc/uptime").await?;
        let uptime = uptime
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);

        Ok(SystemStat { load1, uptime })
    }
}

#[cfg(not(target_os = "linux"))]
pub mod stat {
    use std::io;

    #[derive(Copy, Clone, Debug, Default, serde::Serialize)]
    pub struct SystemStat {
        pub load1: f64,
        pub uptime: f64,
    }

    pub async fn read() -> io::Result<SystemStat> {
        Ok(SystemStat::default())
    }
}
