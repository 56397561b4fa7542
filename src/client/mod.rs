//! Streaming chat client.
//!
//! - [`session`]: the [`StreamController`](session::StreamController) state machine
//! - [`retry`]: reconnect policy, backoff table and cleanup latch
//! - [`csrf`]: anti-forgery token cache and per-session token stores
//! - [`transport`]: the network seam and its `reqwest` implementation
//! - [`sse`]: incremental server-sent-events decoding
//! - [`events`]: wire events in, session notifications out

pub mod csrf;
pub mod events;
pub mod retry;
pub mod session;
pub mod sse;
pub mod transport;

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::config::SluiceConfig;
use csrf::{CsrfTokenCache, FileTokenStore, MemoryTokenStore, TokenStore};
use events::SessionObserver;
use retry::RetryPolicy;
use session::StreamController;
use transport::HttpTransport;

/// Create the token store named by `client.token_store`.
pub fn create_token_store(config: &SluiceConfig) -> Result<Arc<dyn TokenStore>> {
    match config.client.token_store.as_str() {
        "memory" => Ok(Arc::new(MemoryTokenStore::new())),
        "file" => Ok(Arc::new(FileTokenStore::new(
            config.resolved_token_store_path(),
        ))),
        other => bail!("unknown token store: {other}. Supported: memory, file"),
    }
}

/// Wire an HTTP-backed controller from configuration.
pub fn http_controller(
    config: &SluiceConfig,
    observer: Arc<dyn SessionObserver>,
) -> Result<StreamController<HttpTransport>> {
    let transport = Arc::new(HttpTransport::new(&config.client)?);
    let store = create_token_store(config)?;
    let tokens = Arc::new(CsrfTokenCache::new(
        Arc::clone(&transport),
        store,
        config.client.token_refresh_margin(),
    ));
    let policy = RetryPolicy::from_config(&config.client)?;
    Ok(StreamController::new(transport, tokens, policy, observer))
}
