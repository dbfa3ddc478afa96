use crate::config::ApiConfig;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, Method},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::MessError;

#[derive(Clone)]
pub struct AuthState {
    pub config: ApiConfig,
}

pub fn create_auth_state(config: ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState { config })
}

/// Constant-time membership check against the configured allow-list.
/// Every candidate is compared regardless of earlier matches so the total
/// work done does not leak which entry (if any) matched.
fn identity_allowed(allow_list: &[String], identity: &str) -> bool {
    let mut allowed = false;
    for candidate in allow_list {
        let matches: bool = candidate
            .as_bytes()
            .ct_eq(identity.as_bytes())
            .into();
        allowed |= matches;
    }
    allowed
}

/// Authorization middleware for the ClientGateway and BotGateway surfaces.
///
/// Identity is taken from `x-api-key` or a `Bearer` `authorization` header
/// and checked against `-usr`'s allow-list (spec §4.6, §6). When `-local` is
/// set, requests whose peer address is loopback bypass the check entirely.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, MessError> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if method == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    if auth_state.config.bind_loopback_only && peer.ip().is_loopback() {
        debug!(%path, "loopback bypass");
        return Ok(next.run(request).await);
    }

    let identity = extract_identity(&headers)?;

    if identity_allowed(&auth_state.config.allowed_identities, &identity) {
        debug!(%path, "authorized");
        Ok(next.run(request).await)
    } else {
        warn!(%path, %peer, "identity not in allow-list");
        Err(MessError::AuthZ)
    }
}

fn extract_identity(headers: &HeaderMap) -> Result<String, MessError> {
    if let Some(value) = headers.get("x-api-key") {
        return value
            .to_str()
            .map(str::to_string)
            .map_err(|_| MessError::AuthZ);
    }
    if let Some(value) = headers.get("authorization") {
        let raw = value.to_str().map_err(|_| MessError::AuthZ)?;
        return raw
            .strip_prefix("Bearer ")
            .map(str::to_string)
            .ok_or(MessError::AuthZ);
    }
    Err(MessError::AuthZ)
}
