#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use sluice::client::csrf::{CsrfToken, CsrfTokenCache, MemoryTokenStore, TokenStore};
use sluice::client::events::{SessionEvent, SessionObserver, StreamEvent};
use sluice::client::retry::RetryPolicy;
use sluice::client::session::StreamController;
use sluice::client::transport::{ChatTransport, EventStream, StreamRequest};
use sluice::error::StreamError;
use sluice::protocol::{ChatMessage, ConversationId, Role};

pub type EventSender = mpsc::UnboundedSender<Result<StreamEvent, StreamError>>;

/// What the next `open_stream` call does.
pub enum Script {
    /// Fail to open with this error.
    Fail(StreamError),
    /// Open and replay these items, then end.
    Events(Vec<Result<StreamEvent, StreamError>>),
    /// Open and relay whatever the test pushes into the paired sender.
    Channel(mpsc::UnboundedReceiver<Result<StreamEvent, StreamError>>),
}

/// In-process transport that plays back one [`Script`] per stream open and
/// issues sequential tokens (`token-1`, `token-2`, ...).
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    seen_tokens: Mutex<Vec<String>>,
    opens: AtomicUsize,
    token_fetches: AtomicUsize,
    fetch_delay: Duration,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        })
    }

    pub fn with_fetch_delay(scripts: Vec<Script>, fetch_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            fetch_delay,
            ..Default::default()
        })
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn token_fetches(&self) -> usize {
        self.token_fetches.load(Ordering::SeqCst)
    }

    /// Tokens presented to `open_stream`, in call order.
    pub fn seen_tokens(&self) -> Vec<String> {
        self.seen_tokens.lock().unwrap().clone()
    }
}

impl ChatTransport for ScriptedTransport {
    async fn fetch_token(&self) -> Result<CsrfToken, StreamError> {
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        let n = self.token_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CsrfToken {
            value: format!("token-{n}"),
            expiry: Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn open_stream(
        &self,
        _request: &StreamRequest,
        token: &str,
    ) -> Result<EventStream, StreamError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.seen_tokens.lock().unwrap().push(token.to_string());
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Fail(err)) => Err(err),
            Some(Script::Events(items)) => Ok(stream::iter(items).boxed()),
            Some(Script::Channel(rx)) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Err(StreamError::TransportFailure("no script left".into())),
        }
    }
}

pub fn conversation() -> ConversationId {
    ConversationId::new("conv-1")
}

pub fn transport_failure() -> StreamError {
    StreamError::TransportFailure("connection reset".into())
}

pub fn assistant(content: &str) -> ChatMessage {
    ChatMessage {
        id: uuid::Uuid::now_v7().to_string(),
        conversation_id: conversation(),
        role: Role::Assistant,
        content: content.into(),
        created_at: Utc::now(),
        token_count: 3,
        model: Some("echo-test".into()),
        latency_ms: Some(12),
    }
}

pub fn fragment(text: &str) -> Result<StreamEvent, StreamError> {
    Ok(StreamEvent::Fragment(text.into()))
}

pub fn complete(content: &str) -> Result<StreamEvent, StreamError> {
    Ok(StreamEvent::Complete(assistant(content)))
}

pub fn script_channel() -> (Script, EventSender) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Script::Channel(rx), tx)
}

/// Controller over `transport` with the default 1/2/4/8/16s retry table.
pub fn controller(
    transport: Arc<ScriptedTransport>,
    store: Arc<dyn TokenStore>,
) -> (
    StreamController<ScriptedTransport>,
    mpsc::UnboundedReceiver<SessionEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel::<SessionEvent>();
    (controller_with_observer(transport, store, Arc::new(tx)), rx)
}

pub fn controller_with_observer(
    transport: Arc<ScriptedTransport>,
    store: Arc<dyn TokenStore>,
    observer: Arc<dyn SessionObserver>,
) -> StreamController<ScriptedTransport> {
    let tokens = Arc::new(CsrfTokenCache::new(
        Arc::clone(&transport),
        store,
        Duration::from_secs(5),
    ));
    StreamController::new(transport, tokens, RetryPolicy::default(), observer)
}

pub fn memory_controller(
    transport: Arc<ScriptedTransport>,
) -> (
    StreamController<ScriptedTransport>,
    mpsc::UnboundedReceiver<SessionEvent>,
) {
    controller(transport, Arc::new(MemoryTokenStore::new()))
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(600), rx.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("observer channel closed")
}

pub fn is_terminal(event: &SessionEvent) -> bool {
    matches!(
        event,
        SessionEvent::Completed(_) | SessionEvent::Failed(_) | SessionEvent::Cancelled
    )
}

/// Collect events up to and including the first terminal one.
pub async fn until_terminal(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = is_terminal(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

pub fn reconnect_attempts(events: &[SessionEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Reconnecting { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect()
}
