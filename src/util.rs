//! Shared helpers: request deadlines, keyword automata, stable digests and
//! the latency histogram backing the metrics endpoint.

use ahash::AHasher;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Wall-clock budget for one routing decision. Children derive their own
/// sub-budgets from `remaining()` so the whole pipeline shares one clock.
#[derive(Clone, Debug)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Deadline {
            start: Instant::now(),
            budget,
        }
    }

    pub fn from_ms(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    pub fn exceeded(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    /// Remaining budget; zero once exhausted.
    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    pub fn remaining_ms(&self) -> u64 {
        self.remaining().as_millis() as u64
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Memoised `AhoCorasick` construction keyed by a hash of the pattern list.
/// Keyword sets come from config and are stable for the process lifetime.
static AC_CACHE: Lazy<DashMap<u64, Arc<AhoCorasick>>> = Lazy::new(DashMap::new);

pub fn ac_for(patterns: &[String]) -> Arc<AhoCorasick> {
    let mut hasher = AHasher::default();
    for pat in patterns {
        pat.hash(&mut hasher);
    }
    let key = hasher.finish();
    if let Some(existing) = AC_CACHE.get(&key) {
        return existing.clone();
    }
    let ac = AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(patterns)
        .unwrap();
    let arc = Arc::new(ac);
    AC_CACHE.insert(key, arc.clone());
    arc
}

/// FNV-1a 64-bit. Used for every digest that must be identical across
/// processes: the fallback embedding buckets, decision fingerprints and
/// score-cache keys. Do not swap for a seeded hasher.
pub const FNV_OFFSET: u64 = 0xcbf29ce484222325;
pub const FNV_PRIME: u64 = 0x100000001b3;

pub fn fnv1a(bytes: &[u8]) -> u64 {
    fnv1a_continue(FNV_OFFSET, bytes)
}

/// Fold more bytes into an existing FNV-1a state.
pub fn fnv1a_continue(mut state: u64, bytes: &[u8]) -> u64 {
    for b in bytes {
        state ^= u64::from(*b);
        state = state.wrapping_mul(FNV_PRIME);
    }
    state
}

/// Fold a u64 into an FNV-1a state (little-endian bytes).
pub fn fnv1a_u64(state: u64, value: u64) -> u64 {
    fnv1a_continue(state, &value.to_le_bytes())
}

/// Fixed-bucket latency histogram in microseconds. Upper bounds chosen for a
/// ~25ms budget; the final implicit bucket is +Inf.
pub struct LatencyHistogram {
    bounds: Vec<u64>,
    counts: Vec<AtomicU64>,
    sum_us: AtomicU64,
    total: AtomicU64,
}

impl LatencyHistogram {
    pub fn new_request_scale() -> Self {
        Self::with_bounds(vec![
            50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000,
        ])
    }

    pub fn with_bounds(bounds: Vec<u64>) -> Self {
        let counts = bounds.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            bounds,
            counts,
            sum_us: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    pub fn record(&self, latency: Duration) {
        let us = latency.as_micros() as u64;
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        for (idx, ub) in self.bounds.iter().enumerate() {
            if us <= *ub {
                self.counts[idx].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn sum_us(&self) -> u64 {
        self.sum_us.load(Ordering::Relaxed)
    }

    pub fn bounds(&self) -> &[u64] {
        &self.bounds
    }

    pub fn count_at(&self, idx: usize) -> u64 {
        self.counts[idx].load(Ordering::Relaxed)
    }

    /// Approximate quantile from bucket upper bounds. Returns the upper
    /// bound of the bucket containing the quantile, in microseconds; 0 when
    /// nothing has been observed yet.
    pub fn quantile_us(&self, q: f64) -> u64 {
        let total = self.total();
        if total == 0 {
            return 0;
        }
        let rank = (q * total as f64).ceil() as u64;
        let mut cumulative = 0u64;
        for (idx, ub) in self.bounds.iter().enumerate() {
            cumulative += self.count_at(idx);
            if cumulative >= rank {
                return *ub;
            }
        }
        // Fell into the +Inf bucket; report the last finite bound.
        *self.bounds.last().unwrap_or(&0)
    }
}
