//! Signed, time-bounded anti-forgery tokens.
//!
//! A token is `base64url(payload) "." base64url(hmac_sha256(payload))` where
//! the payload is `"{expiry_unix}.{nonce}"`. Verification is stateless: any
//! token this process signed is good until its expiry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::SecurityConfig;
use crate::gate::{GateKind, GateRejection, GateRequest, SecurityGate, Verdict};
use crate::protocol::{TokenResponse, CSRF_HEADER};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFault {
    Invalid,
    Expired,
}

#[derive(Clone)]
pub struct CsrfSigner {
    mac: HmacSha256,
    ttl: Duration,
}

impl CsrfSigner {
    pub fn new(secret: &[u8], ttl: Duration) -> Result<Self> {
        ensure!(!secret.is_empty(), "csrf secret must not be empty");
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| anyhow::anyhow!("failed to initialize HMAC: {e}"))?;
        Ok(Self { mac, ttl })
    }

    /// Signer with a fresh random secret. Tokens die with the process.
    pub fn random(ttl: Duration) -> Result<Self> {
        let secret: [u8; 32] = rand::random();
        Self::new(&secret, ttl)
    }

    pub fn from_config(config: &SecurityConfig) -> Result<Self> {
        let ttl = Duration::from_secs(config.token_ttl_secs);
        match &config.csrf_secret {
            Some(secret) => Self::new(secret.as_bytes(), ttl),
            None => {
                tracing::info!("no csrf_secret configured, using a per-process random secret");
                Self::random(ttl)
            }
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self) -> TokenResponse {
        self.issue_at(Utc::now())
    }

    pub fn issue_at(&self, now: DateTime<Utc>) -> TokenResponse {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::hours(1));
        let expiry = now + ttl;
        let payload = format!("{}.{}", expiry.timestamp(), uuid::Uuid::new_v4().simple());
        let signature = self.sign(payload.as_bytes());
        TokenResponse {
            token: format!(
                "{}.{}",
                URL_SAFE_NO_PAD.encode(payload.as_bytes()),
                URL_SAFE_NO_PAD.encode(signature)
            ),
            expiry: Utc.timestamp_opt(expiry.timestamp(), 0).single().unwrap_or(expiry),
        }
    }

    pub fn verify(&self, token: &str) -> Result<(), TokenFault> {
        self.verify_at(token, Utc::now())
    }

    /// Signature is checked before expiry, so a forged token never reports
    /// as merely expired.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<(), TokenFault> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(TokenFault::Invalid)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenFault::Invalid)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenFault::Invalid)?;

        let mut mac = self.mac.clone();
        mac.update(&payload);
        mac.verify_slice(&signature).map_err(|_| TokenFault::Invalid)?;

        let payload = std::str::from_utf8(&payload).map_err(|_| TokenFault::Invalid)?;
        let (expiry, _nonce) = payload.split_once('.').ok_or(TokenFault::Invalid)?;
        let expiry: i64 = expiry.parse().map_err(|_| TokenFault::Invalid)?;
        if now.timestamp() >= expiry {
            return Err(TokenFault::Expired);
        }
        Ok(())
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

impl std::fmt::Debug for CsrfSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsrfSigner")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Requires a valid token on every non-safe request outside the exempt paths.
#[derive(Debug, Clone)]
pub struct ForgeryCheck {
    signer: Arc<CsrfSigner>,
    exempt_paths: Vec<String>,
}

impl ForgeryCheck {
    pub fn new(signer: Arc<CsrfSigner>, exempt_paths: Vec<String>) -> Self {
        Self {
            signer,
            exempt_paths,
        }
    }
}

impl SecurityGate for ForgeryCheck {
    fn kind(&self) -> GateKind {
        GateKind::ForgeryCheck
    }

    fn inspect(&self, request: &GateRequest<'_>) -> Verdict {
        if request.is_safe_method() || self.exempt_paths.iter().any(|p| p == request.path) {
            return Verdict::admit();
        }

        let token = request
            .headers
            .get(CSRF_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let Some(token) = token else {
            tracing::debug!(path = request.path, method = %request.method, "csrf token missing");
            return Verdict::Reject(GateRejection::ForgeryMissing);
        };

        match self.signer.verify(token) {
            Ok(()) => Verdict::admit(),
            Err(TokenFault::Expired) => Verdict::Reject(GateRejection::ForgeryExpired),
            Err(TokenFault::Invalid) => {
                tracing::warn!(path = request.path, "csrf token failed verification");
                Verdict::Reject(GateRejection::ForgeryInvalid)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, Method};

    fn signer() -> CsrfSigner {
        CsrfSigner::new(b"test-secret", Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn issued_token_verifies_until_expiry() {
        let signer = signer();
        let now = Utc::now();
        let issued = signer.issue_at(now);
        assert!(issued.expiry > now);
        assert_eq!(signer.verify_at(&issued.token, now), Ok(()));
        assert_eq!(
            signer.verify_at(&issued.token, now + chrono::Duration::seconds(61)),
            Err(TokenFault::Expired)
        );
    }

    #[test]
    fn tampered_or_foreign_tokens_are_invalid() {
        let signer = signer();
        let issued = signer.issue();

        let mut tampered = issued.token.clone();
        tampered.insert(0, 'A');
        assert_eq!(signer.verify(&tampered), Err(TokenFault::Invalid));

        let other = CsrfSigner::new(b"other-secret", Duration::from_secs(60)).unwrap();
        assert_eq!(other.verify(&issued.token), Err(TokenFault::Invalid));

        assert_eq!(signer.verify("garbage"), Err(TokenFault::Invalid));
        assert_eq!(signer.verify(""), Err(TokenFault::Invalid));
    }

    #[test]
    fn empty_secret_rejected() {
        assert!(CsrfSigner::new(b"", Duration::from_secs(1)).is_err());
    }

    #[test]
    fn gate_distinguishes_missing_invalid_expired() {
        let signer = Arc::new(signer());
        let gate = ForgeryCheck::new(Arc::clone(&signer), vec!["/api/csrf-token".into()]);

        let check = |method: &Method, path: &str, token: Option<&str>| {
            let mut headers = HeaderMap::new();
            if let Some(token) = token {
                headers.insert(CSRF_HEADER, HeaderValue::from_str(token).unwrap());
            }
            gate.inspect(&GateRequest {
                method,
                path,
                headers: &headers,
                peer: None,
            })
        };

        assert!(matches!(check(&Method::GET, "/anything", None), Verdict::Admit(_)));
        assert!(matches!(check(&Method::POST, "/api/csrf-token", None), Verdict::Admit(_)));
        assert!(matches!(
            check(&Method::POST, "/api/x", None),
            Verdict::Reject(GateRejection::ForgeryMissing)
        ));
        assert!(matches!(
            check(&Method::POST, "/api/x", Some("nope")),
            Verdict::Reject(GateRejection::ForgeryInvalid)
        ));

        let stale = signer.issue_at(Utc::now() - chrono::Duration::seconds(120));
        assert!(matches!(
            check(&Method::POST, "/api/x", Some(&stale.token)),
            Verdict::Reject(GateRejection::ForgeryExpired)
        ));

        let fresh = signer.issue();
        assert!(matches!(
            check(&Method::DELETE, "/api/x", Some(&fresh.token)),
            Verdict::Admit(_)
        ));
    }
}
