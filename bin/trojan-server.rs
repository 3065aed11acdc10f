// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use trojan_proxy_server::config::Config;
use trojan_proxy_server::detect::DetectingListener;
use trojan_proxy_server::dialer::{Dialer, DirectDialer};
use trojan_proxy_server::directory::Directory;
use trojan_proxy_server::proto::Token;
use trojan_proxy_server::session::{read_request_tail, Fallback, RelaySession};
use trojan_proxy_server::admin;

fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".into());

    simple_logger::init().expect("init logger");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("build tokio runtime");

    rt.block_on(async move {
        if let Err(e) = run(config_path).await {
            log::error!("fatal: {e}");
            std::process::exit(1);
        }
    });
}

async fn run(config_path: String) -> std::io::Result<()> {
    let config = Config::load(config_path).await?;
    log::set_max_level(config.log_level);

    let listen = config.listen;
    let fallback = Arc::new(config.fallback);
    let directory: Arc<dyn Directory> = config.directory.build().await?;
    let tls_config = config.tls.build_server()?;

    if let Some(admin_cfg) = config.admin {
        spawn_admin(admin_cfg.listen, directory.clone());
    }

    let listener = TcpListener::bind(listen).await?;
    log::info!("listening on {listen}");

    let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer);

    let mut detecting = DetectingListener::spawn_tls(
        listener,
        tls_config,
        directory.clone(),
        move |stream, peer, token| {
            let dialer = dialer.clone();
            let directory = directory.clone();
            dispatch_trojan(stream, peer, token, dialer, directory)
        },
    );

    tokio::select! {
        _ = accept_loop(&mut detecting, fallback) => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("SIGINT received, shutting down...");
        }
    }

    directory.shutdown().await;
    Ok(())
}

/// Serve passthrough connections until the process is asked to stop. Runs forever on
/// its own; the caller races it against a shutdown signal.
async fn accept_loop<S>(detecting: &mut DetectingListener<S>, fallback: Arc<Fallback>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match detecting.accept().await {
            Ok((mut stream, peer)) => {
                let fallback = fallback.clone();
                tokio::spawn(async move {
                    if let Err(e) = fallback.dispatch(&mut stream, &[]).await {
                        log::debug!("fallback dispatch for {peer}: {e}");
                    }
                });
            }
            Err(e) => log::error!("accept: {e}"),
        }
    }
}

async fn dispatch_trojan<S>(
    mut stream: S,
    peer: SocketAddr,
    token: Token,
    dialer: Arc<dyn Dialer>,
    directory: Arc<dyn Directory>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    let (cmd, addr) = match read_request_tail(&mut stream).await {
        Ok(parsed) => parsed,
        Err(e) => {
            log::debug!("{peer}: malformed trojan request: {e}");
            return;
        }
    };

    let req = trojan_proxy_server::proto::Request {
        token,
        cmd,
        addr,
        payload: &[],
    };

    log::info!("{peer}: {} {}", req.cmd, req.addr);

    let session = match RelaySession::new(&req, dialer).await {
        Ok(session) => session,
        Err(e) => {
            log::debug!("{peer}: dial {}: {e}", req.addr);
            return;
        }
    };

    if let Err(e) = session.run(stream, directory, token).await {
        log::debug!("{peer}: relay: {e}");
    }
}

fn spawn_admin(listen: SocketAddr, directory: Arc<dyn Directory>) {
    tokio::spawn(async move {
        let make_svc = hyper::service::make_service_fn(move |_conn| {
            let directory = directory.clone();
            async move {
                Ok::<_, std::convert::Infallible>(hyper::service::service_fn(move |req| {
                    let directory = directory.clone();
                    async move { Ok::<_, std::convert::Infallible>(admin::handle(req, &directory).await) }
                }))
            }
        });

        let server = hyper::Server::bind(&listen).serve(make_svc);
        log::info!("admin surface listening on {listen}");
        if let Err(e) = server.await {
            log::error!("admin server: {e}");
        }
    });
}
