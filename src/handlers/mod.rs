pub mod data;
pub mod stream;
pub mod ws;

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

use crate::error::ApiError;
use crate::AppState;

// ─── Bearer auth ─────────────────────────────────────────────────

/// Enforced on every mutating endpoint, but only when a token is
/// configured.
pub fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if !state.config.auth_enabled() {
        return Ok(());
    }

    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == state.config.auth_token => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

/// Control-plane rate limit; maps a rejection into the 429 envelope
/// with its Retry-After.
pub fn check_rate_limit(state: &AppState, ip: IpAddr) -> Result<(), ApiError> {
    state
        .limiter
        .check(ip)
        .map_err(|retry_after_secs| ApiError::RateLimited { retry_after_secs })
}

// ─── Client IP resolution ────────────────────────────────────────

/// The socket peer, unless proxy headers are trusted AND the peer is
/// inside a trusted proxy range — then the first X-Forwarded-For hop.
pub fn client_ip(state: &AppState, headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
    let peer_ip = peer.ip();
    if !state.config.trust_proxy_headers {
        return peer_ip;
    }
    if !state
        .config
        .trusted_proxy_cidrs
        .iter()
        .any(|cidr| cidr_contains(cidr, peer_ip))
    {
        return peer_ip;
    }

    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or(peer_ip)
}

/// Minimal prefix match for `a.b.c.d/len` / `h:h::/len` notation.
fn cidr_contains(cidr: &str, ip: IpAddr) -> bool {
    let Some((net, len)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(net) = net.parse::<IpAddr>() else {
        return false;
    };
    let Ok(len) = len.parse::<u32>() else {
        return false;
    };

    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            if len > 32 {
                return false;
            }
            let mask = if len == 0 { 0 } else { u32::MAX << (32 - len) };
            (u32::from(net) & mask) == (u32::from(ip) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            if len > 128 {
                return false;
            }
            let mask = if len == 0 { 0 } else { u128::MAX << (128 - len) };
            (u128::from(net) & mask) == (u128::from(ip) & mask)
        }
        _ => false,
    }
}

// ─── Tests ───────────────────────────────────────────────────────
