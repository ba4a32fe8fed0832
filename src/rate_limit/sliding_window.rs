use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Per-client sliding-window admission table.
///
/// Each client maps to the ordered timestamps of its admitted requests.
/// Timestamps at or before `now - window` are pruned whenever the client is
/// touched; `sweep` drops clients whose window has emptied out. Callers are
/// expected to hold a lock around the table and read `now` under that lock,
/// which keeps every deque sorted.
#[derive(Debug)]
pub struct SlidingWindowTable {
    max_requests: u32,
    window: Duration,
    max_clients: usize,
    clients: HashMap<String, VecDeque<Instant>>,
}

/// Outcome of a single admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    /// Requests counted in the window after this attempt
    pub current: u32,
    pub remaining: u32,
    /// Time until the oldest counted request leaves the window
    pub resets_in: Duration,
}

impl SlidingWindowTable {
    pub fn new(max_requests: u32, window: Duration, max_clients: usize) -> Self {
        Self {
            max_requests,
            window,
            max_clients,
            clients: HashMap::new(),
        }
    }

    /// Count the attempt against `client` if it fits in the window.
    ///
    /// Rejected attempts are never recorded.
    pub fn check_and_record(&mut self, client: &str, now: Instant) -> WindowDecision {
        if !self.clients.contains_key(client) && self.clients.len() >= self.max_clients {
            self.make_room(now);
        }

        let window = self.window;
        let max_requests = self.max_requests as usize;
        let timestamps = self.clients.entry(client.to_string()).or_default();
        prune(timestamps, now, window);

        let allowed = timestamps.len() < max_requests;
        if allowed {
            timestamps.push_back(now);
        }

        let current = timestamps.len() as u32;
        WindowDecision {
            allowed,
            current,
            remaining: self.max_requests.saturating_sub(current),
            resets_in: resets_in(timestamps, now, window),
        }
    }

    /// Prune `client` and report its in-window count and time to reset.
    pub fn snapshot(&mut self, client: &str, now: Instant) -> (u32, Duration) {
        match self.clients.get_mut(client) {
            Some(timestamps) => {
                prune(timestamps, now, self.window);
                (timestamps.len() as u32, resets_in(timestamps, now, self.window))
            }
            None => (0, Duration::ZERO),
        }
    }

    /// Forget everything recorded for `client`.
    pub fn reset(&mut self, client: &str) -> bool {
        self.clients.remove(client).is_some()
    }

    /// Drop every client whose window is empty after pruning.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let window = self.window;
        let before = self.clients.len();
        self.clients.retain(|_, timestamps| {
            prune(timestamps, now, window);
            !timestamps.is_empty()
        });
        before - self.clients.len()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn make_room(&mut self, now: Instant) {
        let swept = self.sweep(now);
        if swept > 0 || self.clients.len() < self.max_clients {
            return;
        }

        // Still full: evict the client that has been quiet the longest
        let stalest = self
            .clients
            .iter()
            .min_by_key(|(_, timestamps)| timestamps.back().copied())
            .map(|(client, _)| client.clone());

        if let Some(client) = stalest {
            tracing::debug!(client = %client, "Evicting stalest rate limit window");
            self.clients.remove(&client);
        }
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    let Some(cutoff) = now.checked_sub(window) else {
        return;
    };

    while timestamps.front().is_some_and(|ts| *ts <= cutoff) {
        timestamps.pop_front();
    }
}

fn resets_in(timestamps: &VecDeque<Instant>, now: Instant, window: Duration) -> Duration {
    timestamps
        .front()
        .map(|oldest| (*oldest + window).saturating_duration_since(now))
        .unwrap_or(Duration::ZERO)
}
