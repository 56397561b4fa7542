//! Ordered gate chain and the axum middleware that runs it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::config::SluiceConfig;
use crate::gate::forgery::{CsrfSigner, ForgeryCheck};
use crate::gate::origin::OriginPolicy;
use crate::gate::rate::{RateLimit, RateLimiter};
use crate::gate::size::SizeLimit;
use crate::gate::{GateKind, GateRejection, GateRequest, SecurityGate, Verdict};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderViolation {
    #[error("gate {0} appears more than once")]
    Duplicate(GateKind),

    #[error("gate {before} must run before {after}")]
    Misordered { before: GateKind, after: GateKind },
}

/// Pairs that must appear in this relative order when both are present.
const ORDERING: [(GateKind, GateKind); 2] = [
    (GateKind::OriginPolicy, GateKind::ForgeryCheck),
    (GateKind::SizeLimit, GateKind::RateLimit),
];

/// Result of running the whole chain over one request.
#[derive(Debug)]
pub enum Outcome {
    /// All gates admitted; headers are merged into the handler's response.
    Admit(HeaderMap),
    Respond(Response),
    Reject {
        rejection: GateRejection,
        /// Headers admitted by earlier gates, applied to the rejection too.
        headers: HeaderMap,
        gate: GateKind,
    },
}

pub struct GatePipeline {
    gates: Vec<Arc<dyn SecurityGate>>,
}

impl GatePipeline {
    pub fn new(gates: Vec<Arc<dyn SecurityGate>>) -> Self {
        Self { gates }
    }

    /// The production chain: origin, size, rate, forgery.
    pub fn standard(config: &SluiceConfig, signer: Arc<CsrfSigner>, limiter: Arc<RateLimiter>) -> Self {
        let security = &config.security;
        Self::new(vec![
            Arc::new(OriginPolicy::new(&security.allowed_origins)),
            Arc::new(SizeLimit::new(security.max_body_bytes)),
            Arc::new(RateLimit::new(limiter, &security.trusted_proxies)),
            Arc::new(ForgeryCheck::new(signer, security.exempt_paths.clone())),
        ])
    }

    pub fn kinds(&self) -> Vec<GateKind> {
        self.gates.iter().map(|g| g.kind()).collect()
    }

    pub fn validate_order(&self) -> Result<(), OrderViolation> {
        let kinds = self.kinds();
        for (i, kind) in kinds.iter().enumerate() {
            if kinds[..i].contains(kind) {
                return Err(OrderViolation::Duplicate(*kind));
            }
        }

        let position = |kind: GateKind| kinds.iter().position(|k| *k == kind);
        for (before, after) in ORDERING {
            if let (Some(b), Some(a)) = (position(before), position(after)) {
                if b > a {
                    return Err(OrderViolation::Misordered { before, after });
                }
            }
        }
        Ok(())
    }

    /// Run every gate in order, stopping at the first that does not admit.
    pub fn evaluate(&self, request: &GateRequest<'_>) -> Outcome {
        let mut headers = HeaderMap::new();
        for gate in &self.gates {
            match gate.inspect(request) {
                Verdict::Admit(extra) => headers.extend(extra),
                Verdict::Respond(response) => return Outcome::Respond(response),
                Verdict::Reject(rejection) => {
                    return Outcome::Reject {
                        rejection,
                        headers,
                        gate: gate.kind(),
                    }
                }
            }
        }
        Outcome::Admit(headers)
    }
}

impl std::fmt::Debug for GatePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePipeline")
            .field("gates", &self.kinds())
            .finish()
    }
}

pub async fn gate_middleware(
    State(pipeline): State<Arc<GatePipeline>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let outcome = pipeline.evaluate(&GateRequest {
        method: request.method(),
        path: request.uri().path(),
        headers: request.headers(),
        peer,
    });

    match outcome {
        Outcome::Admit(headers) => {
            let mut response = next.run(request).await;
            response.headers_mut().extend(headers);
            response
        }
        Outcome::Respond(response) => response,
        Outcome::Reject {
            rejection,
            headers,
            gate,
        } => {
            tracing::info!(
                gate = %gate,
                kind = %rejection.kind(),
                method = %request.method(),
                path = request.uri().path(),
                "request rejected"
            );
            let mut response = rejection.into_response();
            response.headers_mut().extend(headers);
            response
        }
    }
}
