use axum::{
    extract::{ConnectInfo, Request},
    middleware::Next,
    response::Response,
};
use governor::{clock::DefaultClock, state::keyed::DashMapStateStore, Quota, RateLimiter};
use std::{net::IpAddr, net::SocketAddr, num::NonZeroU32, sync::Arc};

use crate::error::MessError;

pub const BOT_POLLS_PER_MINUTE: u32 = 120;
pub const CLIENT_REQUESTS_PER_MINUTE: u32 = 600;

type KeyedLimiter = RateLimiter<IpAddr, DashMapStateStore<IpAddr>, DefaultClock>;

/// Per-peer-IP token buckets for the bot-facing and client-facing surfaces.
///
/// Bots poll far more often than clients query, so each surface gets its
/// own quota rather than sharing one limiter (a busy bot fleet shouldn't be
/// able to starve client requests, or vice versa).
#[derive(Clone)]
pub struct RateLimitConfig {
    pub bot_limiter: Arc<KeyedLimiter>,
    pub client_limiter: Arc<KeyedLimiter>,
}

impl RateLimitConfig {
    pub fn new() -> Self {
        let bot_quota = Quota::per_minute(NonZeroU32::new(BOT_POLLS_PER_MINUTE).unwrap());
        let client_quota = Quota::per_minute(NonZeroU32::new(CLIENT_REQUESTS_PER_MINUTE).unwrap());
        Self {
            bot_limiter: Arc::new(RateLimiter::dashmap(bot_quota)),
            client_limiter: Arc::new(RateLimiter::dashmap(client_quota)),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn bot_rate_limit_middleware(
    axum::extract::State(config): axum::extract::State<Arc<RateLimitConfig>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, MessError> {
    check(&config.bot_limiter, addr, request, next).await
}

pub async fn client_rate_limit_middleware(
    axum::extract::State(config): axum::extract::State<Arc<RateLimitConfig>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Result<Response, MessError> {
    check(&config.client_limiter, addr, request, next).await
}

async fn check(
    limiter: &KeyedLimiter,
    addr: SocketAddr,
    request: Request,
    next: Next,
) -> Result<Response, MessError> {
    if limiter.check_key(&addr.ip()).is_err() {
        tracing::warn!(ip = %addr.ip(), path = %request.uri().path(), "rate limit exceeded");
        return Err(MessError::TransientBot("rate limit exceeded".to_string()));
    }
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotas_allow_initial_request() {
        let config = RateLimitConfig::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(config.bot_limiter.check_key(&ip).is_ok());
        assert!(config.client_limiter.check_key(&ip).is_ok());
    }
}
