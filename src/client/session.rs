//! Streaming session controller.
//!
//! A [`StreamController`] owns one conversation's response stream end to end:
//!
//! ```text
//! Idle → Connecting → Streaming → Completing → Idle        success
//! Connecting | Streaming → (transport failure) → Connecting   bounded retry
//! any active state → Cancelled                              user cancel
//! ```
//!
//! Fragments accumulate in a scratch buffer kept apart from the message
//! history; the history only ever receives the authoritative message from the
//! `complete` event, in one update. All asynchronous work (token fetch, stream
//! open, each event, retry timers) re-checks the session latch under the
//! session lock before acting, so a cancellation always wins. Cancelling also
//! fires the run's [`CancellationToken`], which drops an open stream at once
//! instead of waiting for its next event.
//!
//! Observer callbacks run after the session and retry locks are released, so
//! an observer may call back into the controller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::client::csrf::CsrfTokenCache;
use crate::client::events::{SessionEvent, SessionObserver, StreamEvent};
use crate::client::retry::{Latch, RetryHandler, RetryPolicy};
use crate::client::transport::{ChatTransport, StreamRequest};
use crate::error::StreamError;
use crate::protocol::{ChatMessage, ConversationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Streaming,
    Completing,
    Cancelled,
    Failed,
}

impl SessionState {
    /// A stream is in flight (or waiting to reconnect).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Streaming | Self::Completing)
    }
}

#[derive(Debug)]
struct Session {
    request: Option<StreamRequest>,
    state: SessionState,
    accumulated: String,
    histories: HashMap<ConversationId, Vec<ChatMessage>>,
    /// Fired to tear down the current run's in-flight I/O.
    stop: CancellationToken,
}

struct Shared<T: ChatTransport> {
    transport: Arc<T>,
    tokens: Arc<CsrfTokenCache<T>>,
    observer: Arc<dyn SessionObserver>,
    latch: Arc<Latch>,
    // Lock order: session before retry.
    session: Mutex<Session>,
    retry: Mutex<RetryHandler>,
}

fn lock<S>(mutex: &Mutex<S>) -> MutexGuard<'_, S> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct StreamController<T: ChatTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: ChatTransport> StreamController<T> {
    pub fn new(
        transport: Arc<T>,
        tokens: Arc<CsrfTokenCache<T>>,
        policy: RetryPolicy,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let retry = RetryHandler::new(policy, Arc::clone(&observer));
        let latch = retry.latch();
        Self {
            shared: Arc::new(Shared {
                transport,
                tokens,
                observer,
                latch,
                session: Mutex::new(Session {
                    request: None,
                    state: SessionState::Idle,
                    accumulated: String::new(),
                    histories: HashMap::new(),
                    stop: CancellationToken::new(),
                }),
                retry: Mutex::new(retry),
            }),
        }
    }

    /// Send `text` to the selected conversation and start streaming the reply.
    ///
    /// The user message lands in history before any network I/O. Returns once
    /// the attempt is spawned; progress is reported to the observer.
    pub fn connect(
        &self,
        conversation_id: Option<ConversationId>,
        text: &str,
    ) -> Result<(), StreamError> {
        let conversation_id = conversation_id.ok_or(StreamError::NoActiveConversation)?;

        let (ticket, stop) = {
            let mut session = lock(&self.shared.session);
            if session.state.is_active() {
                return Err(StreamError::StreamInProgress);
            }
            let mut retry = lock(&self.shared.retry);
            // Retire anything still pending from a previous run, then rearm.
            retry.cleanup();
            retry.reset();
            let ticket = self.shared.latch.ticket();

            session
                .histories
                .entry(conversation_id.clone())
                .or_default()
                .push(ChatMessage::user(conversation_id.clone(), text));
            session.accumulated.clear();
            session.state = SessionState::Connecting;
            session.request = Some(StreamRequest {
                conversation_id: conversation_id.clone(),
                content: text.to_string(),
            });
            session.stop = CancellationToken::new();
            (ticket, session.stop.clone())
        };

        self.shared.observer.on_event(SessionEvent::Connecting);
        tracing::info!(conversation = %conversation_id, content_len = text.len(), "stream requested");
        tokio::spawn(run_attempt(Arc::clone(&self.shared), ticket, stop));
        Ok(())
    }

    /// Abandon the active stream. Returns `false` if nothing was active.
    pub fn cancel(&self) -> bool {
        {
            let mut session = lock(&self.shared.session);
            if !session.state.is_active() {
                return false;
            }
            lock(&self.shared.retry).cleanup();
            session.stop.cancel();
            session.state = SessionState::Cancelled;
            session.accumulated.clear();
        }
        self.shared.observer.on_event(SessionEvent::Cancelled);
        tracing::info!("stream cancelled");
        true
    }

    /// Acknowledge a cancelled or failed session, returning it to idle.
    pub fn dismiss(&self) {
        let mut session = lock(&self.shared.session);
        if matches!(
            session.state,
            SessionState::Cancelled | SessionState::Failed
        ) {
            session.state = SessionState::Idle;
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.shared.session).state
    }

    /// Text streamed so far for the active response.
    pub fn accumulated_text(&self) -> String {
        lock(&self.shared.session).accumulated.clone()
    }

    /// Committed messages of a conversation, oldest first.
    pub fn history(&self, conversation_id: &ConversationId) -> Vec<ChatMessage> {
        lock(&self.shared.session)
            .histories
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn retry_count(&self) -> u32 {
        lock(&self.shared.retry).retry_count()
    }

    pub fn tokens(&self) -> &CsrfTokenCache<T> {
        &self.shared.tokens
    }
}

impl<T: ChatTransport> Drop for StreamController<T> {
    fn drop(&mut self) {
        // Tasks outliving the controller see the latch and stand down.
        let session = lock(&self.shared.session);
        lock(&self.shared.retry).cleanup();
        session.stop.cancel();
    }
}

/// One connection attempt. Boxed because retries re-enter it from a timer.
fn run_attempt<T: ChatTransport>(
    shared: Arc<Shared<T>>,
    ticket: u64,
    stop: CancellationToken,
) -> BoxFuture<'static, ()> {
    async move {
        let request = {
            let session = lock(&shared.session);
            if !shared.latch.is_live(ticket) {
                return;
            }
            match &session.request {
                Some(request) => request.clone(),
                None => return,
            }
        };

        let open = shared.tokens.with_token(|token| {
            let shared = Arc::clone(&shared);
            let request = request.clone();
            async move {
                if !shared.latch.is_live(ticket) {
                    return Ok(None);
                }
                shared
                    .transport
                    .open_stream(&request, &token.value)
                    .await
                    .map(Some)
            }
        });
        let opened = tokio::select! {
            biased;
            _ = stop.cancelled() => return,
            opened = open => opened,
        };

        let mut events = match opened {
            Ok(Some(events)) => events,
            Ok(None) => return,
            Err(err) => {
                fail_or_retry(&shared, ticket, stop, err);
                return;
            }
        };

        if !shared.begin_streaming(ticket) {
            return;
        }

        loop {
            let item = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    tracing::debug!("stream torn down by cancel");
                    return;
                }
                item = events.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            if !shared.latch.is_live(ticket) {
                return;
            }
            match item {
                Ok(StreamEvent::Fragment(text)) => shared.apply_fragment(ticket, text),
                Ok(StreamEvent::Complete(message)) => {
                    shared.complete(ticket, message);
                    return;
                }
                Ok(StreamEvent::Error { kind, message }) => {
                    shared.fail(ticket, StreamError::ApplicationStreamError { kind, message });
                    return;
                }
                Err(err) => {
                    fail_or_retry(&shared, ticket, stop, err);
                    return;
                }
            }
        }

        fail_or_retry(
            &shared,
            ticket,
            stop,
            StreamError::TransportFailure("stream ended without completion".into()),
        );
    }
    .boxed()
}

/// Route a failure: transport failures reconnect while budget remains,
/// everything else is terminal.
fn fail_or_retry<T: ChatTransport>(
    shared: &Arc<Shared<T>>,
    ticket: u64,
    stop: CancellationToken,
    err: StreamError,
) {
    if !err.is_retryable() {
        shared.fail(ticket, err);
        return;
    }

    let event = {
        let mut session = lock(&shared.session);
        if !shared.latch.is_live(ticket) {
            return;
        }
        tracing::warn!(error = %err, "stream transport failure");
        session.state = SessionState::Connecting;

        let mut retry = lock(&shared.retry);
        let reconnect = Arc::clone(shared);
        match retry.arm_retry(move || run_attempt(reconnect, ticket, stop)) {
            Some(reconnecting) => reconnecting,
            None => {
                let attempts = retry.max_retries();
                retry.cleanup();
                session.stop.cancel();
                session.state = SessionState::Failed;
                session.accumulated.clear();
                tracing::error!(attempts, "giving up on stream after exhausting reconnects");
                SessionEvent::Failed(StreamError::MaxRetriesExceeded { attempts })
            }
        }
    };
    shared.observer.on_event(event);
}

impl<T: ChatTransport> Shared<T> {
    /// The stream is open again, so the reconnect budget starts over.
    fn begin_streaming(&self, ticket: u64) -> bool {
        let mut session = lock(&self.session);
        if !self.latch.is_live(ticket) {
            return false;
        }
        session.state = SessionState::Streaming;
        lock(&self.retry).reset_count();
        true
    }

    fn apply_fragment(&self, ticket: u64, text: String) {
        {
            let mut session = lock(&self.session);
            if !self.latch.is_live(ticket) {
                return;
            }
            session.accumulated.push_str(&text);
        }
        self.observer.on_event(SessionEvent::Fragment(text));
    }

    fn complete(&self, ticket: u64, message: ChatMessage) {
        {
            let mut session = lock(&self.session);
            if !self.latch.is_live(ticket) {
                return;
            }
            session.state = SessionState::Completing;
            if session.accumulated != message.content {
                tracing::debug!(
                    streamed_len = session.accumulated.len(),
                    final_len = message.content.len(),
                    "authoritative content differs from streamed text"
                );
            }

            let conversation_id = match session.request.take() {
                Some(request) => request.conversation_id,
                None => message.conversation_id.clone(),
            };
            session
                .histories
                .entry(conversation_id)
                .or_default()
                .push(message.clone());
            session.accumulated.clear();
            session.state = SessionState::Idle;
            lock(&self.retry).cleanup();
        }

        tracing::info!(
            message_id = %message.id,
            token_count = message.token_count,
            "stream completed"
        );
        self.observer.on_event(SessionEvent::Completed(message));
    }

    fn fail(&self, ticket: u64, err: StreamError) {
        {
            let mut session = lock(&self.session);
            if !self.latch.is_live(ticket) {
                return;
            }
            session.state = SessionState::Failed;
            session.accumulated.clear();
            lock(&self.retry).cleanup();
        }
        tracing::warn!(error = %err, "stream failed");
        self.observer.on_event(SessionEvent::Failed(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(SessionState::Connecting.is_active());
        assert!(SessionState::Streaming.is_active());
        assert!(SessionState::Completing.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(!SessionState::Cancelled.is_active());
        assert!(!SessionState::Failed.is_active());
    }
}
