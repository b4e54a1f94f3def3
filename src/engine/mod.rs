//! Batch matching engine.
//!
//! For every batch handed over by the scheduler:
//! 1. decode each document into a `TransactionEvent` and stable-sort by
//!    block time, events without a usable time last
//! 2. skip events that carry an explicit failure flag
//! 3. test relevance: signer first, then token owners of the balance
//!    updates (only if the signer missed, and only for bounded lists)
//! 4. claim the signature in the `DedupGuard`; the winner is queued on the
//!    `Dispatcher` for enrichment
//! 5. record arrival latency for every event with a block time
//!
//! Nothing here returns an error: bad events are skipped with a log line
//! and counted in the `BatchReport`.

pub mod dispatch;

use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::dedup::DedupGuard;
use crate::enrich::{EnrichmentJob, SinkTargets};
use crate::event::{peek_block_time_ms, EventError, TimestampUnit, TransactionEvent};
use crate::metrics::LatencyAccumulator;
use crate::tracked::TrackedSetCache;

pub use dispatch::{
    BackpressurePolicy, DispatchError, DispatchSettings, DispatchStats, Dispatcher, Submitted,
};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Balance-update lists longer than this are not scanned for owners.
    pub max_balance_updates: usize,
    /// Unit of numeric upstream block timestamps.
    pub timestamp_unit: TimestampUnit,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_balance_updates: 256,
            timestamp_unit: TimestampUnit::Seconds,
        }
    }
}

/// Why an event was (or was not) considered relevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relevance {
    Signer,
    BalanceOwner,
    Irrelevant,
    /// Signer missed and the balance-update list was too long to scan.
    Oversized,
}

impl Relevance {
    pub fn is_match(self) -> bool {
        matches!(self, Relevance::Signer | Relevance::BalanceOwner)
    }
}

/// Per-batch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub visited: usize,
    pub malformed: usize,
    pub failed_skipped: usize,
    pub matched: usize,
    pub dispatched: usize,
    pub duplicates: usize,
    pub dropped: usize,
    pub rejected: usize,
    pub oversized: usize,
    pub recorded: usize,
}

/// A batch slot after decoding, ready for ordering.
enum Slot {
    Event(TransactionEvent),
    Malformed {
        position: usize,
        error: EventError,
        block_time_ms: Option<i64>,
    },
}

impl Slot {
    fn block_time_ms(&self) -> Option<i64> {
        match self {
            Slot::Event(ev) => ev.block_time_ms,
            Slot::Malformed { block_time_ms, .. } => *block_time_ms,
        }
    }
}

/// Ascending by time; missing times after all present ones.
fn by_block_time(a: Option<i64>, b: Option<i64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub struct MatchEngine {
    tracked: Arc<TrackedSetCache>,
    dedup: Arc<DedupGuard>,
    latency: Arc<LatencyAccumulator>,
    dispatcher: Dispatcher,
    targets: Arc<SinkTargets>,
    settings: EngineSettings,
}

impl MatchEngine {
    /// `latency` receives millisecond timestamps.
    pub fn new(
        tracked: Arc<TrackedSetCache>,
        dedup: Arc<DedupGuard>,
        latency: Arc<LatencyAccumulator>,
        dispatcher: Dispatcher,
        targets: SinkTargets,
        settings: EngineSettings,
    ) -> Self {
        Self {
            tracked,
            dedup,
            latency,
            dispatcher,
            targets: Arc::new(targets),
            settings,
        }
    }

    /// Decode and order a batch. Stable, so equal or missing times keep input order.
    fn order(&self, batch: Vec<Value>) -> Vec<Slot> {
        let unit = self.settings.timestamp_unit;
        let mut slots: Vec<Slot> = batch
            .into_iter()
            .enumerate()
            .map(|(position, raw)| {
                let block_time_ms = peek_block_time_ms(&raw, unit);
                match TransactionEvent::from_value(raw, unit) {
                    Ok(ev) => Slot::Event(ev),
                    Err(error) => Slot::Malformed {
                        position,
                        error,
                        block_time_ms,
                    },
                }
            })
            .collect();
        slots.sort_by(|a, b| by_block_time(a.block_time_ms(), b.block_time_ms()));
        slots
    }

    pub fn relevance(&self, event: &TransactionEvent) -> Relevance {
        let tracked = self.tracked.snapshot();
        relevance_in(&tracked, event, self.settings.max_balance_updates)
    }

    /// Process one batch to completion. Dispatch is queued, not awaited.
    pub async fn process_batch(&self, batch: Vec<Value>) -> BatchReport {
        let mut report = BatchReport::default();

        for slot in self.order(batch) {
            report.visited += 1;
            let event = match slot {
                Slot::Event(ev) => ev,
                Slot::Malformed {
                    position, error, ..
                } => {
                    report.malformed += 1;
                    debug!(position, error = %error, "skipping malformed event");
                    continue;
                }
            };

            if event.is_failed() {
                report.failed_skipped += 1;
                continue;
            }

            match self.relevance(&event) {
                Relevance::Irrelevant => {}
                Relevance::Oversized => {
                    report.oversized += 1;
                    debug!(
                        signature = %event.signature,
                        updates = event.balance_update_count(),
                        "balance update list too long to scan"
                    );
                }
                path => {
                    report.matched += 1;
                    self.claim_and_dispatch(&event, path, &mut report).await;
                }
            }

            if let Some(block_ms) = event.block_time_ms {
                self.latency.record(block_ms, Utc::now().timestamp_millis());
                report.recorded += 1;
            }
        }

        if report.malformed > 0 {
            warn!(
                malformed = report.malformed,
                visited = report.visited,
                "batch contained malformed events"
            );
        }
        if report.matched > 0 {
            debug!(?report, "batch processed");
        }
        report
    }

    async fn claim_and_dispatch(
        &self,
        event: &TransactionEvent,
        path: Relevance,
        report: &mut BatchReport,
    ) {
        let seen_at = event
            .block_time_ms
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        if !self.dedup.try_claim_at(&event.signature, seen_at) {
            report.duplicates += 1;
            debug!(signature = %event.signature, "signature already claimed");
            return;
        }

        info!(
            signature = %event.signature,
            signer = %event.signer,
            via = ?path,
            "tracked wallet match"
        );

        let job = EnrichmentJob {
            signature: event.signature.clone(),
            payload: event.raw.clone(),
            targets: self.targets.clone(),
        };
        match self.dispatcher.submit(job).await {
            Ok(Submitted::Queued) => report.dispatched += 1,
            Ok(Submitted::Dropped) => report.dropped += 1,
            Err(e) => {
                report.rejected += 1;
                warn!(signature = %event.signature, error = %e, "match not dispatched");
            }
        }
    }
}

fn relevance_in(tracked: &HashSet<String>, event: &TransactionEvent, max_updates: usize) -> Relevance {
    if tracked.contains(&event.signer) {
        return Relevance::Signer;
    }
    if event.balance_update_count() > max_updates {
        return Relevance::Oversized;
    }
    let owner_hit = event.token_owners().any(|owner| tracked.contains(owner));
    if owner_hit {
        Relevance::BalanceOwner
    } else {
        Relevance::Irrelevant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::{EnrichError, Enricher};
    use crate::identity::InstanceId;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingEnricher {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Enricher for RecordingEnricher {
        async fn enrich(&self, job: &EnrichmentJob) -> Result<(), EnrichError> {
            self.seen.lock().push(job.signature.clone());
            Ok(())
        }
    }

    struct Harness {
        engine: MatchEngine,
        dedup: Arc<DedupGuard>,
        latency: Arc<LatencyAccumulator>,
        enricher: Arc<RecordingEnricher>,
        pump: tokio::task::JoinHandle<()>,
    }

    impl Harness {
        fn new(tracked: &[&str], max_balance_updates: usize) -> Self {
            Self::with_dedup(tracked, max_balance_updates, Arc::new(DedupGuard::new()))
        }

        fn with_dedup(tracked: &[&str], max_balance_updates: usize, dedup: Arc<DedupGuard>) -> Self {
            let enricher = Arc::new(RecordingEnricher::default());
            let (dispatcher, pump) = Dispatcher::start(
                enricher.clone(),
                None,
                DispatchSettings {
                    queue_capacity: 64,
                    max_in_flight: 1,
                    policy: BackpressurePolicy::Block,
                },
            );
            let latency = Arc::new(LatencyAccumulator::new(TimestampUnit::Milliseconds));
            let engine = MatchEngine::new(
                Arc::new(TrackedSetCache::with_addresses(tracked.iter().copied())),
                dedup.clone(),
                latency.clone(),
                dispatcher,
                SinkTargets {
                    primary: "http://swap".to_string(),
                    fallback: "http://transfer".to_string(),
                    instance: InstanceId::from("test"),
                },
                EngineSettings {
                    max_balance_updates,
                    timestamp_unit: TimestampUnit::Seconds,
                },
            );
            Self {
                engine,
                dedup,
                latency,
                enricher,
                pump,
            }
        }

        /// Drop the engine and wait for every queued dispatch to finish.
        async fn finish(self) -> Vec<String> {
            drop(self.engine);
            self.pump.await.unwrap();
            let seen = self.enricher.seen.lock().clone();
            seen
        }
    }

    fn event(sig: &str, signer: &str, ts: Option<f64>, owners: &[&str]) -> Value {
        let updates: Vec<Value> = owners
            .iter()
            .map(|o| json!({ "BalanceUpdate": { "Account": { "Address": "acct", "Token": { "Owner": o } } } }))
            .collect();
        let mut ev = json!({
            "Transaction": { "Signer": signer, "Signature": sig },
            "BalanceUpdates": updates,
        });
        if let Some(ts) = ts {
            ev["Block"] = json!({ "Timestamp": ts });
        }
        ev
    }

    #[test]
    fn test_by_block_time_missing_last() {
        let mut times = vec![Some(5), None, Some(1), None, Some(3)];
        times.sort_by(|a, b| by_block_time(*a, *b));
        assert_eq!(times, vec![Some(1), Some(3), Some(5), None, None]);
    }

    #[tokio::test]
    async fn test_events_visited_in_block_time_order() {
        let h = Harness::new(&["W"], 16);
        let batch = vec![
            event("late-a", "W", None, &[]),
            event("t5", "W", Some(5.0), &[]),
            event("t1", "W", Some(1.0), &[]),
            event("late-b", "W", None, &[]),
            event("t3", "W", Some(3.0), &[]),
        ];
        let report = h.engine.process_batch(batch).await;
        assert_eq!(report.dispatched, 5);
        assert_eq!(report.recorded, 3);

        // One in-flight worker keeps dispatch order equal to visit order.
        assert_eq!(h.finish().await, vec!["t1", "t3", "t5", "late-a", "late-b"]);
    }

    #[tokio::test]
    async fn test_signer_and_owner_paths() {
        let h = Harness::new(&["Tracked"], 16);
        let batch = vec![
            event("by-signer", "Tracked", Some(1.0), &["nobody"]),
            event("by-owner", "someone", Some(2.0), &["x", "Tracked"]),
            event("no-match", "someone", Some(3.0), &["x", "y"]),
        ];
        let report = h.engine.process_batch(batch).await;
        assert_eq!(report.matched, 2);
        assert_eq!(report.dispatched, 2);
        assert!(!h.dedup.is_claimed("no-match"));
        assert_eq!(h.finish().await, vec!["by-signer", "by-owner"]);
    }

    #[tokio::test]
    async fn test_relevance_short_circuits_on_signer() {
        let h = Harness::new(&["Tracked"], 2);
        let owners = ["a", "b", "c", "Tracked"];
        let signer_hit = TransactionEvent::from_value(
            event("s1", "Tracked", None, &owners),
            TimestampUnit::Seconds,
        )
        .unwrap();
        assert_eq!(h.engine.relevance(&signer_hit), Relevance::Signer);

        let oversized = TransactionEvent::from_value(
            event("s2", "other", None, &owners),
            TimestampUnit::Seconds,
        )
        .unwrap();
        assert_eq!(h.engine.relevance(&oversized), Relevance::Oversized);
    }

    #[tokio::test]
    async fn test_failed_transactions_are_ignored() {
        let h = Harness::new(&["W"], 16);
        let mut failed = event("failed", "W", Some(1.0), &[]);
        failed["Transaction"]["Result"] = json!({ "Success": false });
        let mut ok = event("ok", "W", Some(2.0), &[]);
        ok["Transaction"]["Result"] = json!({ "Success": true });

        let report = h.engine.process_batch(vec![failed, ok]).await;
        assert_eq!(report.failed_skipped, 1);
        assert_eq!(report.recorded, 1);
        assert!(!h.dedup.is_claimed("failed"));
        assert_eq!(h.finish().await, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_malformed_events_do_not_abort_batch() {
        let h = Harness::new(&["W"], 16);
        let batch = vec![
            json!({ "Transaction": { "Signer": "W" } }),
            json!("not an object"),
            event("good", "W", Some(1.0), &[]),
        ];
        let report = h.engine.process_batch(batch).await;
        assert_eq!(report.visited, 3);
        assert_eq!(report.malformed, 2);
        assert_eq!(report.dispatched, 1);
        assert_eq!(h.finish().await, vec!["good"]);
    }

    #[tokio::test]
    async fn test_tracked_signer_matches_despite_odd_optional_fields() {
        let h = Harness::new(&["Tracked"], 16);
        let batch = vec![json!({
            "Block": { "Timestamp": 1.0, "Slot": "123" },
            "Transaction": { "Signer": "Tracked", "Signature": "odd" },
            "BalanceUpdates": [
                { "BalanceUpdate": { "Account": { "Token": { "Owner": 5 } } } }
            ]
        })];
        let report = h.engine.process_batch(batch).await;
        assert_eq!(report.malformed, 0);
        assert_eq!(report.dispatched, 1);
        assert_eq!(h.finish().await, vec!["odd"]);
    }

    #[tokio::test]
    async fn test_latency_recorded_for_unmatched_events() {
        let h = Harness::new(&["W"], 16);
        let batch = vec![
            event("m", "W", Some(1.0), &[]),
            event("u", "other", Some(2.0), &[]),
            event("n", "other", None, &[]),
        ];
        let report = h.engine.process_batch(batch).await;
        assert_eq!(report.recorded, 2);
        assert_eq!(h.latency.pending(), 2);
        h.finish().await;
    }

    #[tokio::test]
    async fn test_no_redispatch_across_batches() {
        let h = Harness::new(&["W"], 16);
        let first = h.engine.process_batch(vec![event("dup", "W", Some(1.0), &[])]).await;
        let second = h
            .engine
            .process_batch(vec![
                event("dup", "W", Some(1.0), &[]),
                event("fresh", "W", Some(2.0), &[]),
            ])
            .await;
        assert_eq!(first.dispatched, 1);
        assert_eq!(second.duplicates, 1);
        assert_eq!(second.dispatched, 1);
        assert_eq!(h.finish().await, vec!["dup", "fresh"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_batches_share_claims() {
        let dedup = Arc::new(DedupGuard::new());
        let a = Arc::new(Harness::with_dedup(&["W"], 16, dedup.clone()));
        let b = Arc::new(Harness::with_dedup(&["W"], 16, dedup.clone()));

        let batch: Vec<Value> = (0..200)
            .map(|i| event(&format!("sig-{}", i), "W", Some(i as f64), &[]))
            .collect();

        let (ra, rb) = tokio::join!(
            {
                let a = a.clone();
                let batch = batch.clone();
                tokio::spawn(async move { a.engine.process_batch(batch).await })
            },
            {
                let b = b.clone();
                let batch = batch.clone();
                tokio::spawn(async move { b.engine.process_batch(batch).await })
            }
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.dispatched + rb.dispatched, 200);
        assert_eq!(ra.duplicates + rb.duplicates, 200);

        let a = Arc::try_unwrap(a).ok().unwrap();
        let b = Arc::try_unwrap(b).ok().unwrap();
        let mut all = a.finish().await;
        all.extend(b.finish().await);
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 200);
        assert_eq!(unique.len(), 200);
    }
}
