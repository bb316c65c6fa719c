use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use constant_time_eq::constant_time_eq;
use tracing::warn;

use crate::AppState;

/// Optional HTTP Basic authentication for the upload routes. `/health` is
/// never behind this layer.
pub async fn require_basic_auth(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let auth = &state.server.basic_auth;
    if !auth.enabled {
        return next.run(req).await;
    }

    let Some((username, password)) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_basic)
    else {
        return unauthorized();
    };

    let username_ok = constant_time_eq(username.as_bytes(), auth.username.as_bytes());
    let password_ok = if !auth.password_hash.is_empty() {
        let hash = auth.password_hash.clone();
        let candidate = password.clone();
        // bcrypt is CPU-bound; keep it off the async workers.
        tokio::task::spawn_blocking(move || bcrypt::verify(&candidate, &hash).unwrap_or(false))
            .await
            .unwrap_or(false)
    } else {
        constant_time_eq(password.as_bytes(), auth.password.as_bytes())
    };

    if !username_ok || !password_ok {
        warn!("failed authentication attempt from {remote} (username: {username})");
        return unauthorized();
    }

    next.run(req).await
}

fn parse_basic(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, r#"Basic realm="xferd""#)],
        "Unauthorized",
    )
        .into_response()
}
