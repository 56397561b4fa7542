//! Cross-origin policy and preflight handling.

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::gate::rate::{LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER};
use crate::gate::{GateKind, GateRejection, GateRequest, SecurityGate, Verdict};
use crate::protocol::CSRF_HEADER;

const ALLOW_METHODS: &str = "GET, POST, PUT, PATCH, DELETE, OPTIONS";
const PREFLIGHT_MAX_AGE_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<String>,
}

impl OriginPolicy {
    pub fn new(allowed: &[String]) -> Self {
        Self {
            allowed: allowed.iter().map(|o| normalize(o)).collect(),
        }
    }

    pub fn is_allowed(&self, origin: &str) -> bool {
        let origin = normalize(origin);
        self.allowed.iter().any(|a| *a == origin)
    }

    /// Headers every admitted cross-origin response carries.
    fn cors_headers(origin: HeaderValue) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(header::VARY, HeaderValue::from_static("origin"));
        headers.insert(
            header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_str(&format!(
                "retry-after, {LIMIT_HEADER}, {REMAINING_HEADER}, {RESET_HEADER}"
            ))
            .unwrap_or_else(|_| HeaderValue::from_static("retry-after")),
        );
        headers
    }

    fn preflight_response(origin: HeaderValue) -> Response {
        let mut headers = Self::cors_headers(origin);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(ALLOW_METHODS),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_str(&format!("content-type, authorization, {CSRF_HEADER}"))
                .unwrap_or_else(|_| HeaderValue::from_static("content-type")),
        );
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from(PREFLIGHT_MAX_AGE_SECS),
        );
        (StatusCode::NO_CONTENT, headers).into_response()
    }
}

fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

impl SecurityGate for OriginPolicy {
    fn kind(&self) -> GateKind {
        GateKind::OriginPolicy
    }

    fn inspect(&self, request: &GateRequest<'_>) -> Verdict {
        // Non-browser clients and same-origin navigations send no Origin.
        let Some(origin) = request.headers.get(header::ORIGIN) else {
            return Verdict::admit();
        };

        let origin_str = origin.to_str().unwrap_or_default();
        if !self.is_allowed(origin_str) {
            tracing::warn!(origin = %origin_str, path = request.path, "origin rejected");
            return Verdict::Reject(GateRejection::OriginRejected {
                origin: origin_str.to_string(),
            });
        }

        if request.is_preflight() {
            tracing::debug!(origin = %origin_str, path = request.path, "answering preflight");
            return Verdict::Respond(Self::preflight_response(origin.clone()));
        }

        Verdict::Admit(Self::cors_headers(origin.clone()))
    }
}
