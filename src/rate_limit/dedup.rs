use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Semantically relevant parameters of a request, keyed by name.
pub type RequestParams = BTreeMap<String, Value>;

/// Table of recently seen request fingerprints.
///
/// An entry expires a fixed `window` after it was first seen; seeing the same
/// fingerprint again never extends it. Since entries are never refreshed,
/// insertion order is expiry order and the queue front is always the next
/// entry to expire.
#[derive(Debug)]
pub struct FingerprintTable {
    window: Duration,
    max_entries: usize,
    first_seen: HashMap<String, Instant>,
    order: VecDeque<(Instant, String)>,
}

impl FingerprintTable {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            window,
            max_entries,
            first_seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` if `fingerprint` was already seen inside the window,
    /// otherwise records it as first seen at `now`.
    pub fn check_and_record(&mut self, fingerprint: &str, now: Instant) -> bool {
        self.prune(now);

        if self.first_seen.contains_key(fingerprint) {
            return true;
        }

        if self.first_seen.len() >= self.max_entries {
            if let Some((_, oldest)) = self.order.pop_front() {
                tracing::debug!(fingerprint = %oldest, "Evicting oldest fingerprint");
                self.first_seen.remove(&oldest);
            }
        }

        self.first_seen.insert(fingerprint.to_string(), now);
        self.order.push_back((now, fingerprint.to_string()));
        false
    }

    /// Drop expired fingerprints, returning how many were removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return 0;
        };

        let mut removed = 0;
        while self.order.front().is_some_and(|(seen, _)| *seen <= cutoff) {
            if let Some((_, fingerprint)) = self.order.pop_front() {
                self.first_seen.remove(&fingerprint);
                removed += 1;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }
}

/// Deterministic SHA-256 fingerprint of a parameter set.
///
/// Keys are sorted at every nesting level and values keep their JSON type,
/// so `45` and `"45"` fingerprint differently.
pub fn fingerprint(params: &RequestParams) -> String {
    let mut canonical = String::new();
    canonical.push('{');
    for (i, (key, value)) in params.iter().enumerate() {
        if i > 0 {
            canonical.push(',');
        }
        write_json_string(&mut canonical, key);
        canonical.push(':');
        write_canonical(&mut canonical, value);
    }
    canonical.push('}');

    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, value)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(out, key);
                out.push(':');
                write_canonical(out, value);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_json_string(out: &mut String, s: &str) {
    out.push_str(&Value::String(s.to_string()).to_string());
}
