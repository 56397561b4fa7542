//! Client-side anti-forgery token lifecycle.
//!
//! [`CsrfTokenCache`] hands out a currently-valid token, fetching lazily (or
//! eagerly via [`CsrfTokenCache::preload`]) and collapsing concurrent fetches
//! into one. Tokens persist in a [`TokenStore`]: per-session storage that a
//! new session starts without and a restart of the same session reuses.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::transport::ChatTransport;
use crate::error::StreamError;

/// A short-lived anti-forgery credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrfToken {
    pub value: String,
    pub expiry: DateTime<Utc>,
}

impl CsrfToken {
    /// Usable at `now` if it stays valid for at least `margin` longer.
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        now + margin < self.expiry
    }
}

/// Ephemeral key-value slot holding the current token.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Option<CsrfToken>;
    fn save(&self, token: &CsrfToken);
    fn clear(&self);
}

/// Token slot that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    slot: Mutex<Option<CsrfToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CsrfToken) -> Self {
        Self {
            slot: Mutex::new(Some(token)),
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<CsrfToken> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save(&self, token: &CsrfToken) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
    }

    fn clear(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Token slot backed by a JSON file, so restarting the client within the
/// same session does not cost a round trip.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, token: &CsrfToken) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(token)?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self) -> Option<CsrfToken> {
        let bytes = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "discarding unreadable token file");
                None
            }
        }
    }

    fn save(&self, token: &CsrfToken) {
        if let Err(e) = self.write(token) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to persist csrf token");
        }
    }

    fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove token file")
            }
        }
    }
}

/// Shared, single-flight token cache for all mutating requests of a session.
pub struct CsrfTokenCache<T: ChatTransport> {
    transport: Arc<T>,
    store: Arc<dyn TokenStore>,
    refresh_margin: Duration,
    fetch_lock: tokio::sync::Mutex<()>,
    fetches: AtomicU64,
}

impl<T: ChatTransport> CsrfTokenCache<T> {
    pub fn new(transport: Arc<T>, store: Arc<dyn TokenStore>, refresh_margin: Duration) -> Self {
        Self {
            transport,
            store,
            refresh_margin,
            fetch_lock: tokio::sync::Mutex::new(()),
            fetches: AtomicU64::new(0),
        }
    }

    /// The stored token, if it is still usable.
    pub fn cached(&self) -> Option<CsrfToken> {
        self.store
            .load()
            .filter(|token| token.is_valid_at(Utc::now(), self.refresh_margin))
    }

    /// Number of tokens fetched from the server so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// A valid token, fetching one if the cache is empty or expired.
    pub async fn get_token(&self) -> Result<CsrfToken, StreamError> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let _guard = self.fetch_lock.lock().await;
        // Whoever held the lock before us may have refreshed already.
        if let Some(token) = self.cached() {
            return Ok(token);
        }
        self.fetch_locked().await
    }

    /// Fetch eagerly so the first mutating request does not wait.
    pub async fn preload(&self) -> Result<(), StreamError> {
        self.get_token().await.map(|_| ())
    }

    /// Drop the cached token.
    pub fn invalidate(&self) {
        self.store.clear();
    }

    /// Replace a token the server rejected.
    ///
    /// If a concurrent caller already swapped in a different valid token, that
    /// one is reused instead of fetching again.
    async fn refresh_rejected(&self, rejected: &CsrfToken) -> Result<CsrfToken, StreamError> {
        let _guard = self.fetch_lock.lock().await;
        if let Some(token) = self.cached() {
            if token.value != rejected.value {
                return Ok(token);
            }
        }
        self.store.clear();
        self.fetch_locked().await
    }

    async fn fetch_locked(&self) -> Result<CsrfToken, StreamError> {
        let token = self.transport.fetch_token().await?;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.store.save(&token);
        tracing::debug!(expiry = %token.expiry, "csrf token cached");
        Ok(token)
    }

    /// Run a mutating operation with a valid token.
    ///
    /// A token rejection invalidates the cache, fetches once and retries the
    /// operation once. A second failure is returned as-is.
    pub async fn with_token<F, Fut, R>(&self, mut op: F) -> Result<R, StreamError>
    where
        F: FnMut(CsrfToken) -> Fut,
        Fut: Future<Output = Result<R, StreamError>>,
    {
        let token = self.get_token().await?;
        match op(token.clone()).await {
            Err(err) if err.is_token_rejection() => {
                tracing::info!(error = %err, "csrf token rejected, refreshing once");
                let fresh = self.refresh_rejected(&token).await?;
                op(fresh).await
            }
            other => other,
        }
    }
}
