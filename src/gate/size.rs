//! Payload ceiling, checked from `Content-Length` before any counting.

use axum::http::header;

use crate::gate::{GateKind, GateRejection, GateRequest, SecurityGate, Verdict};

#[derive(Debug, Clone)]
pub struct SizeLimit {
    max_bytes: u64,
}

impl SizeLimit {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }
}

impl SecurityGate for SizeLimit {
    fn kind(&self) -> GateKind {
        GateKind::SizeLimit
    }

    fn inspect(&self, request: &GateRequest<'_>) -> Verdict {
        let declared = request
            .header_str(header::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse::<u64>().ok());

        match declared {
            Some(size) if size > self.max_bytes => {
                tracing::debug!(size, limit = self.max_bytes, path = request.path, "oversized request");
                Verdict::Reject(GateRejection::SizeExceeded {
                    size,
                    limit: self.max_bytes,
                })
            }
            _ => Verdict::admit(),
        }
    }
}
