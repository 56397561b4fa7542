//! Server-side security gates.
//!
//! Every request passes an explicit, ordered list of [`SecurityGate`]s before
//! reaching a handler (see [`pipeline::GatePipeline`]). Each gate inspects a
//! read-only [`GateRequest`] view and returns a [`Verdict`]:
//!
//! | Gate | Rejects with |
//! |------|--------------|
//! | [`origin::OriginPolicy`] | 403 `origin_rejected`; answers preflights directly |
//! | [`size::SizeLimit`] | 413 `size_exceeded` |
//! | [`rate::RateLimit`] | 429 `rate_exceeded` + `Retry-After` |
//! | [`forgery::ForgeryCheck`] | 403 `forgery_missing` / `forgery_invalid` / `forgery_expired` |

pub mod forgery;
pub mod origin;
pub mod pipeline;
pub mod rate;
pub mod size;

use std::net::IpAddr;

use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::protocol::{ErrorBody, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateKind {
    OriginPolicy,
    SizeLimit,
    RateLimit,
    ForgeryCheck,
}

impl GateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OriginPolicy => "origin_policy",
            Self::SizeLimit => "size_limit",
            Self::RateLimit => "rate_limit",
            Self::ForgeryCheck => "forgery_check",
        }
    }
}

impl std::fmt::Display for GateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a gate sees of a request. Bodies are never read by gates.
#[derive(Debug, Clone, Copy)]
pub struct GateRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    /// Address of the directly connected peer, if known.
    pub peer: Option<IpAddr>,
}

impl GateRequest<'_> {
    /// Read-only methods that never need an anti-forgery token.
    pub fn is_safe_method(&self) -> bool {
        matches!(
            *self.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
        )
    }

    /// A browser CORS preflight: `OPTIONS` with `Origin` and
    /// `Access-Control-Request-Method`.
    pub fn is_preflight(&self) -> bool {
        self.method == Method::OPTIONS
            && self.headers.contains_key(header::ORIGIN)
            && self
                .headers
                .contains_key(header::ACCESS_CONTROL_REQUEST_METHOD)
    }

    pub fn header_str(&self, name: header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

pub enum Verdict {
    /// Let the request through; the headers are added to whatever response
    /// the rest of the chain produces.
    Admit(HeaderMap),
    /// Answer the request directly (preflights).
    Respond(Response),
    Reject(GateRejection),
}

impl Verdict {
    pub fn admit() -> Self {
        Self::Admit(HeaderMap::new())
    }
}

impl std::fmt::Debug for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admit(headers) => f.debug_tuple("Admit").field(headers).finish(),
            Self::Respond(response) => f.debug_tuple("Respond").field(&response.status()).finish(),
            Self::Reject(rejection) => f.debug_tuple("Reject").field(rejection).finish(),
        }
    }
}

pub trait SecurityGate: Send + Sync {
    fn kind(&self) -> GateKind;
    fn inspect(&self, request: &GateRequest<'_>) -> Verdict;
}

/// Why a gate refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateRejection {
    #[error("request body of {size} bytes exceeds the {limit} byte limit")]
    SizeExceeded { size: u64, limit: u64 },

    #[error("rate limit of {limit} requests exceeded, retry in {retry_after}s")]
    RateExceeded { limit: u32, retry_after: u64 },

    #[error("missing anti-forgery token")]
    ForgeryMissing,

    #[error("invalid anti-forgery token")]
    ForgeryInvalid,

    #[error("anti-forgery token expired")]
    ForgeryExpired,

    #[error("origin {origin} is not allowed")]
    OriginRejected { origin: String },
}

impl GateRejection {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SizeExceeded { .. } => ErrorKind::SizeExceeded,
            Self::RateExceeded { .. } => ErrorKind::RateExceeded,
            Self::ForgeryMissing => ErrorKind::ForgeryMissing,
            Self::ForgeryInvalid => ErrorKind::ForgeryInvalid,
            Self::ForgeryExpired => ErrorKind::ForgeryExpired,
            Self::OriginRejected { .. } => ErrorKind::OriginRejected,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::SizeExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ForgeryMissing
            | Self::ForgeryInvalid
            | Self::ForgeryExpired
            | Self::OriginRejected { .. } => StatusCode::FORBIDDEN,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl IntoResponse for GateRejection {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after();
        let body = ErrorBody {
            error: self.kind(),
            message: self.to_string(),
            retry_after,
        };
        let mut response = (self.status(), Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
