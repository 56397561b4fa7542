//! Completion backends that produce the fragments a chat stream relays.
//!
//! Inference itself lives outside this crate. [`EchoBackend`] stands in for it
//! so the server is runnable and testable end to end.

use std::time::Duration;

use anyhow::Result;
use futures_util::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

use crate::config::BackendConfig;
use crate::protocol::ConversationId;

#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("generation failed: {0}")]
    Generation(String),
}

/// Source of streamed completion fragments.
pub trait CompletionBackend: Send + Sync {
    /// Identifier reported in the committed message.
    fn model(&self) -> &str;

    /// Stream fragments answering `prompt`. The concatenation of all fragments
    /// is the full response.
    fn generate(
        &self,
        conversation_id: &ConversationId,
        prompt: &str,
    ) -> BoxStream<'static, Result<String, BackendError>>;
}

/// Create a completion backend from config.
///
/// Only the `echo-` model family is built in.
pub fn create_backend(config: &BackendConfig) -> Result<Box<dyn CompletionBackend>> {
    if config.model.starts_with("echo") {
        Ok(Box::new(EchoBackend::from_config(config)))
    } else {
        anyhow::bail!("unknown completion backend model: {}. Supported: echo-*", config.model)
    }
}

/// Streams the prompt back word by word.
#[derive(Debug, Clone)]
pub struct EchoBackend {
    model: String,
    delay: Duration,
}

impl EchoBackend {
    pub fn new(model: impl Into<String>, delay: Duration) -> Self {
        Self {
            model: model.into(),
            delay,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(&config.model, Duration::from_millis(config.fragment_delay_ms))
    }
}

impl CompletionBackend for EchoBackend {
    fn model(&self) -> &str {
        &self.model
    }

    fn generate(
        &self,
        _conversation_id: &ConversationId,
        prompt: &str,
    ) -> BoxStream<'static, Result<String, BackendError>> {
        let words: Vec<String> = prompt.split_inclusive(' ').map(str::to_owned).collect();
        let delay = self.delay;
        stream::iter(words)
            .then(move |word| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(word)
            })
            .boxed()
    }
}
