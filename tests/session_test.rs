mod helpers;

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::mpsc;

use helpers::*;
use sluice::client::csrf::MemoryTokenStore;
use sluice::client::events::{SessionEvent, SessionObserver};
use sluice::client::session::{SessionState, StreamController};
use sluice::error::StreamError;
use sluice::protocol::{ErrorKind, Role};

#[tokio::test(start_paused = true)]
async fn complete_commits_authoritative_message_once() {
    let transport = ScriptedTransport::new(vec![Script::Events(vec![
        fragment("Hel"),
        fragment("lo "),
        complete("Hello"),
    ])]);
    let (controller, mut rx) = memory_controller(transport);

    controller.connect(Some(conversation()), "hi").unwrap();
    let events = until_terminal(&mut rx).await;

    assert_eq!(events[0], SessionEvent::Connecting);
    let streamed: String = events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::Fragment(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, "Hello ");

    let history = controller.history(&conversation());
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "hi");
    assert_eq!(history[1].role, Role::Assistant);
    // The committed text is the server's, not the accumulated fragments.
    assert_eq!(history[1].content, "Hello");

    assert_eq!(controller.accumulated_text(), "");
    assert_eq!(controller.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn two_transport_failures_then_success() {
    let transport = ScriptedTransport::new(vec![
        Script::Fail(transport_failure()),
        Script::Fail(transport_failure()),
        Script::Events(vec![fragment("ok"), complete("ok")]),
    ]);
    let (controller, mut rx) = memory_controller(transport.clone());

    controller.connect(Some(conversation()), "hi").unwrap();
    let events = until_terminal(&mut rx).await;

    assert_eq!(reconnect_attempts(&events), vec![1, 2]);
    let notices: Vec<String> = events.iter().filter_map(|e| e.status_line()).collect();
    assert!(notices.contains(&"reconnecting (1/5)".to_string()));
    assert!(notices.contains(&"reconnecting (2/5)".to_string()));
    assert!(matches!(events.last(), Some(SessionEvent::Completed(m)) if m.content == "ok"));

    assert_eq!(transport.opens(), 3);
    assert_eq!(controller.history(&conversation()).len(), 2);
    assert_eq!(controller.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn cancel_then_stale_failure_does_not_retry() {
    let (script, tx) = script_channel();
    let transport = ScriptedTransport::new(vec![script]);
    let (controller, mut rx) = memory_controller(transport.clone());

    controller.connect(Some(conversation()), "hi").unwrap();
    assert_eq!(next_event(&mut rx).await, SessionEvent::Connecting);

    tx.send(fragment("partial")).unwrap();
    assert_eq!(
        next_event(&mut rx).await,
        SessionEvent::Fragment("partial".into())
    );
    assert_eq!(controller.state(), SessionState::Streaming);

    assert!(controller.cancel());
    assert_eq!(next_event(&mut rx).await, SessionEvent::Cancelled);
    assert_eq!(controller.accumulated_text(), "");

    // The connection dies after the cancel; nothing may react to it.
    let _ = tx.send(Err(transport_failure()));
    drop(tx);
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(rx.try_recv().is_err());
    assert_eq!(transport.opens(), 1);
    assert_eq!(controller.state(), SessionState::Cancelled);
    assert_eq!(controller.history(&conversation()).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_tears_down_open_stream() {
    let (script, tx) = script_channel();
    let transport = ScriptedTransport::new(vec![script]);
    let (controller, mut rx) = memory_controller(transport);

    controller.connect(Some(conversation()), "hi").unwrap();
    assert_eq!(next_event(&mut rx).await, SessionEvent::Connecting);
    tx.send(fragment("partial")).unwrap();
    assert_eq!(
        next_event(&mut rx).await,
        SessionEvent::Fragment("partial".into())
    );

    assert!(controller.cancel());
    assert_eq!(next_event(&mut rx).await, SessionEvent::Cancelled);

    // No further event arrives, yet the stream must already be gone.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(tx.is_closed());
    assert_eq!(controller.state(), SessionState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_backoff_suppresses_reconnect() {
    let transport = ScriptedTransport::new(vec![
        Script::Fail(transport_failure()),
        Script::Events(vec![complete("never")]),
    ]);
    let (controller, mut rx) = memory_controller(transport.clone());

    controller.connect(Some(conversation()), "hi").unwrap();
    assert_eq!(next_event(&mut rx).await, SessionEvent::Connecting);
    assert!(matches!(
        next_event(&mut rx).await,
        SessionEvent::Reconnecting { attempt: 1, .. }
    ));

    assert!(controller.cancel());
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(next_event(&mut rx).await, SessionEvent::Cancelled);
    assert!(rx.try_recv().is_err());
    assert_eq!(transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausting_reconnects_fails_terminally() {
    let scripts = (0..6).map(|_| Script::Fail(transport_failure())).collect();
    let transport = ScriptedTransport::new(scripts);
    let (controller, mut rx) = memory_controller(transport.clone());

    controller.connect(Some(conversation()), "hi").unwrap();
    let events = until_terminal(&mut rx).await;

    assert_eq!(reconnect_attempts(&events), vec![1, 2, 3, 4, 5]);
    assert_eq!(
        events.last(),
        Some(&SessionEvent::Failed(StreamError::MaxRetriesExceeded {
            attempts: 5
        }))
    );
    assert_eq!(transport.opens(), 6);
    assert_eq!(controller.state(), SessionState::Failed);
}

#[tokio::test(start_paused = true)]
async fn application_error_is_not_retried() {
    let transport = ScriptedTransport::new(vec![Script::Events(vec![
        fragment("par"),
        Ok(sluice::client::events::StreamEvent::Error {
            kind: ErrorKind::ModelError,
            message: "model crashed".into(),
        }),
    ])]);
    let (controller, mut rx) = memory_controller(transport.clone());

    controller.connect(Some(conversation()), "hi").unwrap();
    let events = until_terminal(&mut rx).await;

    assert!(reconnect_attempts(&events).is_empty());
    assert!(matches!(
        events.last(),
        Some(SessionEvent::Failed(StreamError::ApplicationStreamError {
            kind: ErrorKind::ModelError,
            ..
        }))
    ));
    assert_eq!(transport.opens(), 1);
    assert_eq!(controller.accumulated_text(), "");
}

#[tokio::test(start_paused = true)]
async fn premature_end_of_stream_reconnects() {
    let transport = ScriptedTransport::new(vec![
        Script::Events(vec![fragment("cut")]),
        Script::Events(vec![complete("whole")]),
    ]);
    let (controller, mut rx) = memory_controller(transport.clone());

    controller.connect(Some(conversation()), "hi").unwrap();
    let events = until_terminal(&mut rx).await;

    assert_eq!(reconnect_attempts(&events), vec![1]);
    let history = controller.history(&conversation());
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "whole");
}

#[tokio::test(start_paused = true)]
async fn connect_requires_conversation_and_idle_session() {
    let (script, _tx) = script_channel();
    let transport = ScriptedTransport::new(vec![script]);
    let (controller, mut rx) = memory_controller(transport);

    assert_eq!(
        controller.connect(None, "hi"),
        Err(StreamError::NoActiveConversation)
    );
    assert!(controller.history(&conversation()).is_empty());

    controller.connect(Some(conversation()), "first").unwrap();
    assert_eq!(next_event(&mut rx).await, SessionEvent::Connecting);
    assert_eq!(
        controller.connect(Some(conversation()), "second"),
        Err(StreamError::StreamInProgress)
    );
    assert_eq!(controller.history(&conversation()).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn new_connect_after_cancel_starts_fresh() {
    let (script, tx) = script_channel();
    let transport = ScriptedTransport::new(vec![script, Script::Events(vec![complete("again")])]);
    let (controller, mut rx) = memory_controller(transport);

    controller.connect(Some(conversation()), "one").unwrap();
    assert_eq!(next_event(&mut rx).await, SessionEvent::Connecting);
    tx.send(fragment("o")).unwrap();
    assert_eq!(next_event(&mut rx).await, SessionEvent::Fragment("o".into()));
    assert!(controller.cancel());
    assert!(!controller.cancel());
    assert_eq!(next_event(&mut rx).await, SessionEvent::Cancelled);

    controller.connect(Some(conversation()), "two").unwrap();
    let events = until_terminal(&mut rx).await;
    assert!(matches!(events.last(), Some(SessionEvent::Completed(_))));
    assert_eq!(controller.retry_count(), 0);

    let history = controller.history(&conversation());
    let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["one", "two", "again"]);
}

#[tokio::test(start_paused = true)]
async fn recovered_drops_do_not_consume_reconnect_budget() {
    let mut scripts: Vec<Script> = (0..6)
        .map(|_| Script::Events(vec![fragment("a")]))
        .collect();
    scripts.push(Script::Events(vec![complete("done")]));
    let transport = ScriptedTransport::new(scripts);
    let (controller, mut rx) = memory_controller(transport.clone());

    controller.connect(Some(conversation()), "hi").unwrap();
    let events = until_terminal(&mut rx).await;

    // Every drop reopened successfully, so each reconnect is the first again.
    assert_eq!(reconnect_attempts(&events), vec![1; 6]);
    assert!(matches!(events.last(), Some(SessionEvent::Completed(m)) if m.content == "done"));
    assert_eq!(transport.opens(), 7);
    assert_eq!(controller.state(), SessionState::Idle);
}

/// Observer that reads controller state from inside its callback.
struct InspectingObserver {
    controller: OnceLock<Weak<StreamController<ScriptedTransport>>>,
    seen: mpsc::UnboundedSender<(SessionEvent, SessionState)>,
}

impl SessionObserver for InspectingObserver {
    fn on_event(&self, event: SessionEvent) {
        let Some(controller) = self.controller.get().and_then(Weak::upgrade) else {
            return;
        };
        let state = controller.state();
        let _ = controller.history(&conversation());
        let _ = controller.retry_count();
        let _ = self.seen.send((event, state));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observer_may_call_back_into_controller() {
    let transport = ScriptedTransport::new(vec![
        Script::Fail(transport_failure()),
        Script::Events(vec![fragment("ok"), complete("ok")]),
    ]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let observer = Arc::new(InspectingObserver {
        controller: OnceLock::new(),
        seen: tx,
    });
    let controller = Arc::new(controller_with_observer(
        transport,
        Arc::new(MemoryTokenStore::new()),
        observer.clone(),
    ));
    let _ = observer.controller.set(Arc::downgrade(&controller));

    controller.connect(Some(conversation()), "hi").unwrap();

    let mut seen = Vec::new();
    loop {
        let (event, state) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("observer stalled")
            .expect("observer dropped");
        let done = is_terminal(&event);
        seen.push((event, state));
        if done {
            break;
        }
    }

    assert_eq!(seen[0], (SessionEvent::Connecting, SessionState::Connecting));
    assert!(seen
        .iter()
        .any(|(e, _)| matches!(e, SessionEvent::Reconnecting { attempt: 1, .. })));
    assert!(matches!(
        seen.last(),
        Some((SessionEvent::Completed(_), SessionState::Idle))
    ));
}
