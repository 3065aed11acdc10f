// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Admin REST surface: three routes over the credential directory, `/trojan/users`,
//! `/trojan/users/add`, `/trojan/users/delete`. No framework — a plain `hyper`
//! handler function, since this is the whole surface.

use std::sync::Arc;

use hyper::{Body, Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::directory::Directory;
use crate::utils::stat;

#[derive(Serialize)]
struct UserRecord {
    key: String,
    up: i64,
    down: i64,
}

#[derive(Deserialize)]
struct UserRequest {
    #[serde(default)]
    password: String,
}

/// Dispatch one admin request. Unrecognized paths fall through to `404`; wrong methods
/// on a recognized path get `405`.
pub async fn handle(req: Request<Body>, directory: &Arc<dyn Directory>) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/trojan/users") => get_users(directory),
        (&Method::POST, "/trojan/users/add") => add_user(req, directory).await,
        (&Method::DELETE, "/trojan/users/delete" | "/trojan/users/del") => {
            delete_user(req, directory).await
        }
        (&Method::GET, "/trojan/stat") => get_stat().await,
        (_, "/trojan/users" | "/trojan/users/add" | "/trojan/users/delete" | "/trojan/users/del") => {
            response(StatusCode::METHOD_NOT_ALLOWED, Body::empty())
        }
        _ => response(StatusCode::NOT_FOUND, Body::empty()),
    }
}

fn get_users(directory: &Arc<dyn Directory>) -> Response<Body> {
    let mut users = Vec::new();
    directory.range(&mut |token, counter| {
        users.push(UserRecord {
            key: token.to_string(),
            up: counter.up,
            down: counter.down,
        });
    });

    match serde_json::to_vec(&users) {
        Ok(body) => response(StatusCode::OK, Body::from(body)),
        Err(e) => {
            log::error!("admin: encoding users: {e}");
            response(StatusCode::INTERNAL_SERVER_ERROR, Body::empty())
        }
    }
}

async fn add_user(req: Request<Body>, directory: &Arc<dyn Directory>) -> Response<Body> {
    match read_user_request(req).await {
        Ok(user) if !user.password.is_empty() => {
            directory.add(&user.password).await;
            response(StatusCode::OK, Body::empty())
        }
        Ok(_) => response(StatusCode::OK, Body::empty()),
        Err(resp) => resp,
    }
}

async fn delete_user(req: Request<Body>, directory: &Arc<dyn Directory>) -> Response<Body> {
    match read_user_request(req).await {
        Ok(user) if !user.password.is_empty() => {
            directory.delete(&user.password).await;
            response(StatusCode::OK, Body::empty())
        }
        Ok(_) => response(StatusCode::OK, Body::empty()),
        Err(resp) => resp,
    }
}

async fn get_stat() -> Response<Body> {
    match stat::read().await {
        Ok(s) => match serde_json::to_vec(&s) {
            Ok(body) => response(StatusCode::OK, Body::from(body)),
            Err(_) => response(StatusCode::INTERNAL_SERVER_ERROR, Body::empty()),
        },
        Err(e) => {
            log::warn!("admin: reading system stat: {e}");
            response(StatusCode::INTERNAL_SERVER_ERROR, Body::empty())
        }
    }
}

async fn read_user_request(req: Request<Body>) -> Result<UserRequest, Response<Body>> {
    let bytes = hyper::body::to_bytes(req.into_body())
        .await
        .map_err(|_| response(StatusCode::BAD_REQUEST, Body::empty()))?;
    serde_json::from_slice(&bytes).map_err(|_| response(StatusCode::BAD_REQUEST, Body::empty()))
}

fn response(status: StatusCode, body: Body) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(body)
        .expect("static response is well-formed")
}
