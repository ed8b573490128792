//! Whole-decision memoization keyed by a stable request fingerprint.
//!
//! Eviction is TTL first, then LRU by access time once the map is full.
//! Concurrent misses may compute the same decision twice; equal results
//! collapse on store, which is cheaper than per-key coordination on a 25ms
//! path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::features::TextStats;
use crate::util::{fnv1a_continue, fnv1a_u64, FNV_OFFSET};
use crate::RoutingDecision;

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

fn now_ms() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}

/// Stable fingerprint over the cheap scalar features, the caller's model
/// hint, a prefix of the normalized prompt and the producing artifact
/// version. Identical across processes for identical input.
pub fn fingerprint(stats: &TextStats, model_hint: Option<&str>, artifact_version: &str) -> u64 {
    let mut d = FNV_OFFSET;
    d = fnv1a_u64(d, (stats.token_estimate / 256) as u64);
    d = fnv1a_u64(d, stats.has_code as u64);
    d = fnv1a_u64(d, stats.has_math as u64);
    d = fnv1a_u64(d, (stats.ngram_entropy * 4.0).round() as u64);
    d = fnv1a_continue(d, model_hint.unwrap_or("").as_bytes());
    let prefix_len = stats.normalized.len().min(256);
    let mut cut = prefix_len;
    while cut > 0 && !stats.normalized.is_char_boundary(cut) {
        cut -= 1;
    }
    d = fnv1a_continue(d, stats.normalized[..cut].as_bytes());
    d = fnv1a_continue(d, artifact_version.as_bytes());
    d
}

struct Entry {
    decision: RoutingDecision,
    expires_at: Instant,
    last_access_ms: AtomicU64,
}

pub struct DecisionCache {
    map: DashMap<u64, Entry>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl DecisionCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            map: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a cached decision. Entries past their TTL or produced by a
    /// different artifact version than `current_version` count as absent.
    pub fn get(&self, key: u64, current_version: &str) -> Option<RoutingDecision> {
        if let Some(entry) = self.map.get(&key) {
            let fresh = entry.expires_at > Instant::now()
                && entry.decision.artifact_version == current_version;
            if fresh {
                entry.last_access_ms.store(now_ms(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.decision.clone());
            }
            drop(entry);
            self.map.remove(&key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: u64, decision: RoutingDecision) {
        if self.map.len() >= self.max_entries {
            self.evict();
        }
        self.map.insert(
            key,
            Entry {
                decision,
                expires_at: Instant::now() + self.ttl,
                last_access_ms: AtomicU64::new(now_ms()),
            },
        );
    }

    /// TTL pass first; if the map is still full, drop the least recently
    /// accessed entry.
    fn evict(&self) {
        let now = Instant::now();
        self.map.retain(|_, e| e.expires_at > now);
        while self.map.len() >= self.max_entries {
            let mut oldest: Option<(u64, u64)> = None;
            for entry in self.map.iter() {
                let access = entry.last_access_ms.load(Ordering::Relaxed);
                if oldest.map(|(_, a)| access < a).unwrap_or(true) {
                    oldest = Some((*entry.key(), access));
                }
            }
            match oldest {
                Some((key, _)) => {
                    self.map.remove(&key);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
