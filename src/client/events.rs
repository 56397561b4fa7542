//! Events flowing into and out of a streaming session.
//!
//! [`StreamEvent`] is what the transport decodes off the wire. [`SessionEvent`]
//! is what the controller reports to its [`SessionObserver`] (the UI layer).

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::StreamError;
use crate::protocol::{ChatMessage, ErrorKind};

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental piece of assistant text.
    Fragment(String),
    /// Terminal event carrying the authoritative message.
    Complete(ChatMessage),
    /// Application-level failure reported by the server mid-stream.
    Error { kind: ErrorKind, message: String },
}

/// User-visible session notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connecting,
    Fragment(String),
    /// A reconnect has been scheduled: attempt `attempt` of `max_retries`.
    Reconnecting {
        attempt: u32,
        max_retries: u32,
        delay: Duration,
    },
    Completed(ChatMessage),
    Cancelled,
    Failed(StreamError),
}

impl SessionEvent {
    /// Short status line for a terminal or banner display.
    pub fn status_line(&self) -> Option<String> {
        match self {
            Self::Connecting => Some("connecting".into()),
            Self::Reconnecting {
                attempt,
                max_retries,
                ..
            } => Some(format!("reconnecting ({attempt}/{max_retries})")),
            Self::Cancelled => Some("cancelled".into()),
            Self::Failed(err) => Some(format!("failed: {err}")),
            Self::Fragment(_) | Self::Completed(_) => None,
        }
    }
}

/// Receiver of session notifications.
pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

impl SessionObserver for mpsc::UnboundedSender<SessionEvent> {
    fn on_event(&self, event: SessionEvent) {
        // Receiver gone means nobody is watching; the session keeps running.
        let _ = self.send(event);
    }
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl SessionObserver for NullObserver {
    fn on_event(&self, _event: SessionEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnecting_status_shows_progress() {
        let event = SessionEvent::Reconnecting {
            attempt: 2,
            max_retries: 5,
            delay: Duration::from_secs(2),
        };
        assert_eq!(event.status_line().as_deref(), Some("reconnecting (2/5)"));
        assert!(SessionEvent::Fragment("x".into()).status_line().is_none());
    }

    #[test]
    fn channel_observer_forwards_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.on_event(SessionEvent::Cancelled);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::Cancelled);
    }
}
