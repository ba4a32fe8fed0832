use crate::config::ProtectionConfig;
use crate::errors::{AppError, Result};
use crate::observability::MetricsRecorder;
use crate::rate_limit::dedup::{fingerprint, FingerprintTable, RequestParams};
use crate::rate_limit::sliding_window::SlidingWindowTable;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Immutable limiter settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub dedup_window: Duration,
    pub max_tracked_clients: usize,
    pub max_tracked_fingerprints: usize,
}

impl LimiterConfig {
    pub fn new(max_requests: u32, window: Duration, dedup_window: Duration) -> Result<Self> {
        if max_requests == 0 {
            return Err(AppError::Configuration(
                "max_requests must be positive".to_string(),
            ));
        }
        if window.is_zero() || dedup_window.is_zero() {
            return Err(AppError::Configuration(
                "rate limit and dedup windows must be positive".to_string(),
            ));
        }

        Ok(Self {
            max_requests,
            window,
            dedup_window,
            max_tracked_clients: 100_000,
            max_tracked_fingerprints: 100_000,
        })
    }

    pub fn from_protection(config: &ProtectionConfig) -> Result<Self> {
        config.validate()?;
        let mut limiter = Self::new(config.max_requests, config.window(), config.dedup_window())?;
        limiter.max_tracked_clients = config.max_tracked_clients;
        limiter.max_tracked_fingerprints = config.max_tracked_fingerprints;
        Ok(limiter)
    }
}

/// Why the guard turned a request away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    RateLimit,
    Duplicate,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::RateLimit => "rate_limit",
            RejectReason::Duplicate => "duplicate",
        }
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// The rate limit (max requests)
    pub limit: u32,
    /// Number of requests remaining in the current window
    pub remaining: u32,
    /// Unix timestamp when the oldest counted request leaves the window
    pub reset: u64,
    /// Current number of requests in the window
    pub current: u32,
}

impl RateLimitResult {
    pub fn reason(&self) -> Option<RejectReason> {
        (!self.allowed).then_some(RejectReason::RateLimit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateCheck {
    pub is_duplicate: bool,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStats {
    pub requests_in_window: u32,
    pub max_requests: u32,
    pub window: Duration,
    pub remaining: u32,
    /// Unix timestamp (seconds)
    pub reset_at: u64,
}

/// In-process rate limiter and request deduplicator.
///
/// Construct one per process and share it behind an `Arc`. Rate limit state
/// and fingerprint state live behind independent locks; neither is held
/// longer than a prune-decide-record step.
#[derive(Debug)]
pub struct RequestGuard {
    config: LimiterConfig,
    windows: Mutex<SlidingWindowTable>,
    fingerprints: Mutex<FingerprintTable>,
}

impl RequestGuard {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            windows: Mutex::new(SlidingWindowTable::new(
                config.max_requests,
                config.window,
                config.max_tracked_clients,
            )),
            fingerprints: Mutex::new(FingerprintTable::new(
                config.dedup_window,
                config.max_tracked_fingerprints,
            )),
            config,
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Admit `client_id` if it has capacity left in the sliding window.
    pub fn is_allowed(&self, client_id: &str) -> RateLimitResult {
        let decision = {
            let mut windows = self.windows.lock();
            windows.check_and_record(client_id, Instant::now())
        };

        if decision.allowed {
            tracing::debug!(
                client_id = %client_id,
                current = decision.current,
                remaining = decision.remaining,
                "Request admitted"
            );
        }

        RateLimitResult {
            allowed: decision.allowed,
            limit: self.config.max_requests,
            remaining: decision.remaining,
            reset: unix_after(decision.resets_in),
            current: decision.current,
        }
    }

    /// Check `request_data` against recently seen fingerprints, recording it
    /// when it is new.
    pub fn is_duplicate(&self, request_data: &RequestParams) -> DuplicateCheck {
        let fingerprint = fingerprint(request_data);
        let is_duplicate = {
            let mut fingerprints = self.fingerprints.lock();
            fingerprints.check_and_record(&fingerprint, Instant::now())
        };

        DuplicateCheck {
            is_duplicate,
            fingerprint,
        }
    }

    /// Rate limit first, then deduplicate when `request_data` is non-empty.
    ///
    /// A request rejected as a duplicate has already consumed its rate limit
    /// slot.
    pub fn check_request(
        &self,
        client_id: &str,
        request_data: Option<&RequestParams>,
    ) -> std::result::Result<(), RejectReason> {
        if let Some(reason) = self.is_allowed(client_id).reason() {
            return Err(reason);
        }

        if let Some(data) = request_data.filter(|data| !data.is_empty()) {
            if self.is_duplicate(data).is_duplicate {
                return Err(RejectReason::Duplicate);
            }
        }

        Ok(())
    }

    pub fn get_stats(&self, client_id: &str) -> RateLimitStats {
        let (requests_in_window, resets_in) = {
            let mut windows = self.windows.lock();
            windows.snapshot(client_id, Instant::now())
        };

        RateLimitStats {
            requests_in_window,
            max_requests: self.config.max_requests,
            window: self.config.window,
            remaining: self.config.max_requests.saturating_sub(requests_in_window),
            reset_at: unix_after(resets_in),
        }
    }

    /// Forget the rate limit window for `client_id`
    pub fn reset(&self, client_id: &str) {
        if self.windows.lock().reset(client_id) {
            tracing::info!(client_id = %client_id, "Rate limit reset");
        }
    }

    /// Evict idle clients and expired fingerprints.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let clients = self.windows.lock().sweep(now);
        let fingerprints = self.fingerprints.lock().prune(now);
        clients + fingerprints
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn tracked_fingerprints(&self) -> usize {
        self.fingerprints.lock().len()
    }
}

/// Run [`RequestGuard::sweep`] every `every` until the guard is dropped.
pub fn spawn_sweeper(guard: &Arc<RequestGuard>, every: Duration) -> tokio::task::JoinHandle<()> {
    let guard: Weak<RequestGuard> = Arc::downgrade(guard);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(strong) = guard.upgrade() else {
                break;
            };

            let evicted = strong.sweep();
            if evicted > 0 {
                MetricsRecorder::record_evictions(evicted);
                tracing::debug!(
                    evicted,
                    clients = strong.tracked_clients(),
                    fingerprints = strong.tracked_fingerprints(),
                    "Swept protection tables"
                );
            }
        }
    })
}

fn unix_after(delay: Duration) -> u64 {
    (SystemTime::now() + delay)
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64().ceil() as u64)
        .unwrap_or_default()
}
