//! Request context: who is calling from where.

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{HeaderMap, header::USER_AGENT, request::Parts},
};
use std::{convert::Infallible, net::SocketAddr};

use super::state::AuthState;
use crate::{error::AuthError, fingerprint::DeviceAttributes, session::ClientContext};

pub const CSRF_HEADER: &str = "x-csrf-token";

const FALLBACK_IP: &str = "127.0.0.1";

/// Socket peer address, when the server runs with connect info.
#[derive(Clone, Copy, Debug, Default)]
pub struct PeerAddr(pub Option<SocketAddr>);

impl<S> FromRequestParts<S> for PeerAddr
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

/// Client address: first `x-forwarded-for` entry, then `x-real-ip`, then the peer.
pub(crate) fn extract_client_ip(headers: &HeaderMap, peer: PeerAddr) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(forwarded) = forwarded {
        return forwarded.to_string();
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    if let Some(real_ip) = real_ip {
        return real_ip.to_string();
    }

    peer.0
        .map_or_else(|| FALLBACK_IP.to_string(), |addr| addr.ip().to_string())
}

/// Build the device and network context of a request.
///
/// # Errors
/// `InvalidArgument` when the `User-Agent` header is missing or empty.
pub(crate) fn client_context(
    auth_state: &AuthState,
    headers: &HeaderMap,
    peer: PeerAddr,
) -> Result<ClientContext, AuthError> {
    let user_agent = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AuthError::invalid_argument("missing user agent"))?;

    let attributes = DeviceAttributes::parse(user_agent)
        .ok_or_else(|| AuthError::invalid_argument("missing user agent"))?;
    let device_id = auth_state
        .encoder()
        .encode_attributes(&attributes)
        .ok_or_else(|| anyhow::anyhow!("failed to encode device fingerprint"))?;

    Ok(ClientContext {
        user_agent: user_agent.to_string(),
        ip_address: extract_client_ip(headers, peer),
        device_id,
        attributes,
    })
}

/// Correlation id from `Authorization: Bearer <id>`.
///
/// # Errors
/// `Unauthenticated` when the header is missing or not a bearer credential.
pub(crate) fn bearer(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AuthError::unauthenticated("missing authorization header"))?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or_else(|| AuthError::unauthenticated("expected bearer credentials"))?;
    Ok(token.trim())
}

pub(crate) fn csrf(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
}
