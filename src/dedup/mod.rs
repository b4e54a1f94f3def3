//! At-most-once claim guard keyed by transaction signature.
//!
//! A claim is a single `DashMap::entry` call: the shard lock is held across
//! the vacancy check and the insert, so of N concurrent callers with the same
//! signature exactly one wins. Entries remember the block time of the claimed
//! event and are evicted once they fall outside the retention window.

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct DedupGuard {
    /// signature → block time (ms) of the claimed event, or claim time when unknown
    claimed: DashMap<String, i64>,
}

impl DedupGuard {
    pub fn new() -> Self {
        Self {
            claimed: DashMap::new(),
        }
    }

    /// Claim `signature`, stamping it with the current time.
    pub fn try_claim(&self, signature: &str) -> bool {
        self.try_claim_at(signature, Utc::now().timestamp_millis())
    }

    /// Claim `signature` for an event produced at `seen_at_ms`.
    /// Returns true for exactly one caller per signature while the entry is retained.
    pub fn try_claim_at(&self, signature: &str, seen_at_ms: i64) -> bool {
        match self.claimed.entry(signature.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(seen_at_ms);
                true
            }
        }
    }

    pub fn is_claimed(&self, signature: &str) -> bool {
        self.claimed.contains_key(signature)
    }

    /// Drop every claim stamped before `cutoff_ms`. Returns how many were removed.
    pub fn evict_before(&self, cutoff_ms: i64) -> usize {
        let before = self.claimed.len();
        self.claimed.retain(|_, seen_at| *seen_at >= cutoff_ms);
        before.saturating_sub(self.claimed.len())
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }

    /// Periodically evict claims older than `retention`.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        retention: Duration,
        every: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let cutoff = Utc::now().timestamp_millis() - retention.as_millis() as i64;
                let evicted = self.evict_before(cutoff);
                if evicted > 0 {
                    debug!(evicted, retained = self.len(), "evicted expired signature claims");
                }
            }
        })
    }
}

impl Default for DedupGuard {
    fn default() -> Self {
        Self::new()
    }
}
