//! Per-client, per-route fixed-window rate limiting.
//!
//! Counters are keyed by (client identity, [`RouteClass`]). Chat routes get a
//! tighter budget than everything else. Identity is the peer address, or the
//! nearest untrusted `X-Forwarded-For` hop when the peer is a trusted proxy, so
//! clients cannot spoof their way into a fresh budget.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::config::RateLimitConfig;
use crate::gate::{GateKind, GateRejection, GateRequest, SecurityGate, Verdict};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

const FORWARDED_FOR: &str = "x-forwarded-for";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    /// Expensive model-backed routes.
    Chat,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_after: Duration,
    },
    Limited {
        limit: u32,
        retry_after: Duration,
    },
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Shared counter table. One instance serves every request of the process.
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<(Option<IpAddr>, RouteClass), Window>>,
    window: Duration,
    chat_limit: u32,
    general_limit: u32,
    chat_prefixes: Vec<String>,
}

impl RateLimiter {
    pub fn new(window: Duration, chat_limit: u32, general_limit: u32, chat_prefixes: Vec<String>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window,
            chat_limit,
            general_limit,
            chat_prefixes,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            Duration::from_secs(config.window_secs.max(1)),
            config.chat_max_requests,
            config.general_max_requests,
            config.chat_path_prefixes.clone(),
        )
    }

    pub fn classify(&self, path: &str) -> RouteClass {
        if self.chat_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            RouteClass::Chat
        } else {
            RouteClass::General
        }
    }

    pub fn limit_for(&self, class: RouteClass) -> u32 {
        match class {
            RouteClass::Chat => self.chat_limit,
            RouteClass::General => self.general_limit,
        }
    }

    pub fn check(&self, client: Option<IpAddr>, class: RouteClass) -> Decision {
        self.check_at(client, class, Instant::now())
    }

    /// Count one request at `now`. The whole read-modify-write happens under
    /// the table lock.
    pub fn check_at(&self, client: Option<IpAddr>, class: RouteClass, now: Instant) -> Decision {
        let limit = self.limit_for(class);
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = windows.entry((client, class)).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }
        let reset_after = self
            .window
            .saturating_sub(now.saturating_duration_since(entry.started));

        if entry.count >= limit {
            return Decision::Limited {
                limit,
                retry_after: reset_after,
            };
        }
        entry.count += 1;
        Decision::Allowed {
            limit,
            remaining: limit - entry.count,
            reset_after,
        }
    }

    /// Drop windows that have fully elapsed. Returns how many were removed.
    pub fn prune_at(&self, now: Instant) -> usize {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let before = windows.len();
        windows.retain(|_, w| now.saturating_duration_since(w.started) < self.window);
        before - windows.len()
    }

    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    /// Number of (client, route) windows currently tracked.
    pub fn tracked(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Prune on a fixed interval, independent of traffic.
    pub fn spawn_cleanup(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = limiter.prune();
                if removed > 0 {
                    tracing::debug!(removed, remaining = limiter.tracked(), "pruned rate-limit windows");
                }
            }
        })
    }
}

/// Resolve the client a request should be charged to.
///
/// Forwarded headers are only believed when the peer is a trusted proxy; the
/// chain is then walked right to left and the first untrusted hop wins.
pub fn client_identity(peer: Option<IpAddr>, headers: &HeaderMap, trusted: &[IpAddr]) -> Option<IpAddr> {
    let peer = peer?;
    if !trusted.contains(&peer) {
        return Some(peer);
    }

    let forwarded = headers
        .get_all(FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
        .collect::<Vec<_>>();

    Some(
        forwarded
            .into_iter()
            .rev()
            .find(|hop| !trusted.contains(hop))
            .unwrap_or(peer),
    )
}

/// Gate wrapper around a shared [`RateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimit {
    limiter: Arc<RateLimiter>,
    trusted_proxies: Vec<IpAddr>,
}

impl RateLimit {
    pub fn new(limiter: Arc<RateLimiter>, trusted_proxies: &[String]) -> Self {
        let trusted_proxies = trusted_proxies
            .iter()
            .filter_map(|p| match p.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    tracing::warn!(proxy = %p, "ignoring unparseable trusted proxy address");
                    None
                }
            })
            .collect();
        Self {
            limiter,
            trusted_proxies,
        }
    }
}

fn header_pair(name: &'static str, value: u64) -> (HeaderName, HeaderValue) {
    (HeaderName::from_static(name), HeaderValue::from(value))
}

impl SecurityGate for RateLimit {
    fn kind(&self) -> GateKind {
        GateKind::RateLimit
    }

    fn inspect(&self, request: &GateRequest<'_>) -> Verdict {
        if request.is_preflight() {
            return Verdict::admit();
        }

        let client = client_identity(request.peer, request.headers, &self.trusted_proxies);
        let class = self.limiter.classify(request.path);

        match self.limiter.check(client, class) {
            Decision::Allowed {
                limit,
                remaining,
                reset_after,
            } => {
                let mut headers = HeaderMap::new();
                for (name, value) in [
                    header_pair(LIMIT_HEADER, u64::from(limit)),
                    header_pair(REMAINING_HEADER, u64::from(remaining)),
                    header_pair(RESET_HEADER, ceil_secs(reset_after)),
                ] {
                    headers.insert(name, value);
                }
                Verdict::Admit(headers)
            }
            Decision::Limited { limit, retry_after } => {
                tracing::warn!(
                    client = ?client,
                    route = ?class,
                    limit,
                    "rate limit exceeded"
                );
                Verdict::Reject(GateRejection::RateExceeded {
                    limit,
                    retry_after: ceil_secs(retry_after).max(1),
                })
            }
        }
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(
            Duration::from_secs(60),
            2,
            5,
            vec!["/api/conversations/".into()],
        )
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn chat_routes_get_tighter_budget() {
        let limiter = limiter();
        assert_eq!(limiter.classify("/api/conversations/x/stream"), RouteClass::Chat);
        assert_eq!(limiter.classify("/api/csrf-token"), RouteClass::General);

        let now = Instant::now();
        let client = Some(ip("10.0.0.1"));
        assert!(matches!(
            limiter.check_at(client, RouteClass::Chat, now),
            Decision::Allowed { remaining: 1, .. }
        ));
        assert!(matches!(
            limiter.check_at(client, RouteClass::Chat, now),
            Decision::Allowed { remaining: 0, .. }
        ));
        assert!(matches!(
            limiter.check_at(client, RouteClass::Chat, now),
            Decision::Limited { limit: 2, .. }
        ));
        // General budget is separate
        assert!(matches!(
            limiter.check_at(client, RouteClass::General, now),
            Decision::Allowed { remaining: 4, .. }
        ));
    }

    #[test]
    fn window_resets_after_expiry() {
        let limiter = limiter();
        let start = Instant::now();
        let client = Some(ip("10.0.0.2"));
        limiter.check_at(client, RouteClass::Chat, start);
        limiter.check_at(client, RouteClass::Chat, start);

        match limiter.check_at(client, RouteClass::Chat, start + Duration::from_secs(20)) {
            Decision::Limited { retry_after, .. } => assert_eq!(retry_after, Duration::from_secs(40)),
            other => panic!("expected limit, got {other:?}"),
        }
        assert!(matches!(
            limiter.check_at(client, RouteClass::Chat, start + Duration::from_secs(60)),
            Decision::Allowed { remaining: 1, .. }
        ));
    }

    #[test]
    fn prune_drops_elapsed_windows() {
        let limiter = limiter();
        let start = Instant::now();
        limiter.check_at(Some(ip("10.0.0.3")), RouteClass::General, start);
        limiter.check_at(
            Some(ip("10.0.0.4")),
            RouteClass::General,
            start + Duration::from_secs(30),
        );
        assert_eq!(limiter.tracked(), 2);
        assert_eq!(limiter.prune_at(start + Duration::from_secs(61)), 1);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn forwarded_header_ignored_from_untrusted_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static("1.2.3.4"));
        let trusted = [ip("127.0.0.1")];
        assert_eq!(
            client_identity(Some(ip("10.9.9.9")), &headers, &trusted),
            Some(ip("10.9.9.9"))
        );
    }

    #[test]
    fn forwarded_chain_resolved_through_trusted_proxies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static("6.6.6.6, 203.0.113.7, 10.0.0.1"),
        );
        let trusted = [ip("127.0.0.1"), ip("10.0.0.1")];
        assert_eq!(
            client_identity(Some(ip("127.0.0.1")), &headers, &trusted),
            Some(ip("203.0.113.7"))
        );
        // No usable hop falls back to the peer
        assert_eq!(
            client_identity(Some(ip("127.0.0.1")), &HeaderMap::new(), &trusted),
            Some(ip("127.0.0.1"))
        );
    }

    #[test]
    fn ceil_secs_rounds_up() {
        assert_eq!(ceil_secs(Duration::from_millis(1500)), 2);
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
    }
}
