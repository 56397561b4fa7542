//! Reconnect policy for a streaming session.
//!
//! [`RetryHandler`] counts reconnect attempts, picks the backoff delay from a
//! fixed ascending table, and arms tokio timers for the reconnect callback.
//! A [`Latch`] guards every timer: once [`RetryHandler::cleanup`] runs, timers
//! that were already pending wake up, see the latch, and do nothing.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::client::events::{SessionEvent, SessionObserver};
use crate::config::ClientConfig;

/// Delays used when no configuration is supplied.
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 5] = [1000, 2000, 4000, 8000, 16000];

pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("max_retries must be at least 1")]
    NoRetries,
    #[error("retry delay table has {len} entries but max_retries is {max_retries}")]
    TableTooShort { len: usize, max_retries: u32 },
    #[error("retry delays must be ascending")]
    NotAscending,
}

/// Validated reconnect policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delays: Vec<Duration>,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delays: Vec<Duration>) -> Result<Self, PolicyError> {
        if max_retries == 0 {
            return Err(PolicyError::NoRetries);
        }
        if delays.len() < max_retries as usize {
            return Err(PolicyError::TableTooShort {
                len: delays.len(),
                max_retries,
            });
        }
        if delays.windows(2).any(|w| w[0] > w[1]) {
            return Err(PolicyError::NotAscending);
        }
        Ok(Self {
            max_retries,
            delays,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, PolicyError> {
        Self::new(
            config.max_retries,
            config
                .retry_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            delays: DEFAULT_RETRY_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

/// One-way teardown flag shared between a session and its pending work.
///
/// Work captures a ticket (the current epoch) when it is armed. The ticket
/// stays live until the latch is tripped; tripping bumps the epoch, so work
/// armed before a trip stays dead even after [`Latch::rearm`].
#[derive(Debug, Default)]
pub struct Latch {
    tripped: AtomicBool,
    epoch: AtomicU64,
}

impl Latch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ticket for work armed now.
    pub fn ticket(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Whether work holding `ticket` may still act.
    pub fn is_live(&self, ticket: u64) -> bool {
        !self.tripped.load(Ordering::Acquire) && self.epoch.load(Ordering::Acquire) == ticket
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Trip the latch. Repeated calls are no-ops.
    pub fn trip(&self) {
        if !self.tripped.swap(true, Ordering::AcqRel) {
            self.epoch.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Clear the flag for a fresh run. Outstanding tickets stay stale.
    pub fn rearm(&self) {
        self.tripped.store(false, Ordering::Release);
    }
}

/// Reconnect bookkeeping for one streaming session.
pub struct RetryHandler {
    policy: RetryPolicy,
    retry_count: u32,
    latch: Arc<Latch>,
    observer: Arc<dyn SessionObserver>,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            policy,
            retry_count: 0,
            latch: Latch::new(),
            observer,
        }
    }

    /// The latch guarding this handler's timers; sessions share it to guard
    /// their own resumption points.
    pub fn latch(&self) -> Arc<Latch> {
        Arc::clone(&self.latch)
    }

    pub fn increment_retry(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    /// Reaching exactly `max_retries` is not exceeded; the attempt after is.
    pub fn is_max_retries_exceeded(&self) -> bool {
        self.retry_count > self.policy.max_retries
    }

    /// Backoff for the current attempt, `retry_delays[retry_count - 1]`.
    /// `None` before the first increment.
    pub fn retry_delay(&self) -> Option<Duration> {
        let index = self.retry_count.checked_sub(1)?;
        self.policy.delays.get(index as usize).copied()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.policy.max_retries
    }

    pub fn is_cleaned_up(&self) -> bool {
        self.latch.is_tripped()
    }

    /// Count an attempt and arm a timer for `retry_fn`, reporting the
    /// `Reconnecting` event to the observer.
    ///
    /// Returns `false` without arming anything once the budget is exhausted;
    /// the caller treats that as a terminal failure.
    pub fn schedule_retry<F, Fut>(&mut self, retry_fn: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        match self.arm_retry(retry_fn) {
            Some(event) => {
                self.observer.on_event(event);
                true
            }
            None => false,
        }
    }

    /// Like [`schedule_retry`](Self::schedule_retry) but hands the
    /// `Reconnecting` event back instead of emitting it, so a caller holding
    /// locks can report it after releasing them.
    pub fn arm_retry<F, Fut>(&mut self, retry_fn: F) -> Option<SessionEvent>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.increment_retry();
        if self.is_max_retries_exceeded() {
            tracing::warn!(
                retry_count = self.retry_count,
                max_retries = self.policy.max_retries,
                "reconnect budget exhausted"
            );
            return None;
        }

        // Within budget the table is long enough (checked by RetryPolicy).
        let delay = self.retry_delay()?;

        tracing::info!(
            attempt = self.retry_count,
            max_retries = self.policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        let latch = Arc::clone(&self.latch);
        let ticket = latch.ticket();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !latch.is_live(ticket) {
                tracing::debug!("reconnect timer fired after cleanup, skipping");
                return;
            }
            retry_fn().await;
        });

        Some(SessionEvent::Reconnecting {
            attempt: self.retry_count,
            max_retries: self.policy.max_retries,
            delay,
        })
    }

    /// Suppress any pending retry. Idempotent.
    pub fn cleanup(&mut self) {
        self.latch.trip();
    }

    /// Zero the counter once a reconnect has opened the stream again. The
    /// latch is left alone.
    pub fn reset_count(&mut self) {
        self.retry_count = 0;
    }

    /// Zero the counter and clear the latch for a fresh connection. Idempotent.
    pub fn reset(&mut self) {
        self.retry_count = 0;
        self.latch.rearm();
    }
}

impl std::fmt::Debug for RetryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryHandler")
            .field("policy", &self.policy)
            .field("retry_count", &self.retry_count)
            .field("cleaned_up", &self.is_cleaned_up())
            .finish()
    }
}
