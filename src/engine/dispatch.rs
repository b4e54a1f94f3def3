//! Bounded hand-off from the match loop to enrichment.
//!
//! Jobs go into a fixed-capacity queue. A single pump task pulls from the
//! queue and spawns one task per job, holding a semaphore permit for the
//! job's lifetime, so at most `max_in_flight` enrichments run at once and
//! at most `queue_capacity` wait. What happens when the queue is full is
//! decided by `BackpressurePolicy`.

use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::audit::MatchArchive;
use crate::enrich::{Enricher, EnrichmentJob};

/// Upper bound on concurrent enrichments.
pub const MAX_IN_FLIGHT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for queue space. Slows the batch loop instead of losing matches.
    #[default]
    Block,
    /// Drop the job that did not fit and carry on.
    DropNewest,
    /// Refuse the job and report `DispatchError::QueueFull` to the caller.
    Reject,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatch queue is full")]
    QueueFull,
    #[error("dispatcher has shut down")]
    Closed,
}

/// Outcome of a successful `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    Dropped,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub queue_capacity: usize,
    pub max_in_flight: usize,
    pub policy: BackpressurePolicy,
}

/// Counters for jobs that passed through the dispatcher.
#[derive(Debug, Default)]
pub struct DispatchStats {
    pub queued: AtomicU64,
    pub dropped: AtomicU64,
    pub rejected: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

impl DispatchStats {
    pub fn completed(&self) -> u64 {
        self.succeeded.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<EnrichmentJob>,
    policy: BackpressurePolicy,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Start the pump. The returned handle resolves once every clone of the
    /// dispatcher is dropped and all accepted jobs have finished.
    /// `max_in_flight` is clamped to `1..=MAX_IN_FLIGHT`.
    pub fn start(
        enricher: Arc<dyn Enricher>,
        archive: Option<MatchArchive>,
        settings: DispatchSettings,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let stats = Arc::new(DispatchStats::default());
        let workers = settings.max_in_flight.clamp(1, MAX_IN_FLIGHT) as u32;

        let handle = tokio::spawn(pump(rx, enricher, archive, workers, stats.clone()));

        let dispatcher = Self {
            tx,
            policy: settings.policy,
            stats,
        };
        (dispatcher, handle)
    }

    pub async fn submit(&self, job: EnrichmentJob) -> Result<Submitted, DispatchError> {
        match self.policy {
            BackpressurePolicy::Block => {
                self.tx.send(job).await.map_err(|_| DispatchError::Closed)?;
            }
            BackpressurePolicy::DropNewest => match self.tx.try_send(job) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(job)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(signature = %job.signature, "dispatch queue full, dropping match");
                    return Ok(Submitted::Dropped);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(DispatchError::Closed),
            },
            BackpressurePolicy::Reject => match self.tx.try_send(job) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(DispatchError::QueueFull);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(DispatchError::Closed),
            },
        }
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        Ok(Submitted::Queued)
    }

    pub fn stats(&self) -> Arc<DispatchStats> {
        self.stats.clone()
    }
}

async fn pump(
    mut rx: mpsc::Receiver<EnrichmentJob>,
    enricher: Arc<dyn Enricher>,
    archive: Option<MatchArchive>,
    workers: u32,
    stats: Arc<DispatchStats>,
) {
    let permits = Arc::new(Semaphore::new(workers as usize));

    while let Some(job) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let enricher = enricher.clone();
        let archive = archive.clone();
        let stats = stats.clone();
        tokio::spawn(async move {
            run_job(job, enricher.as_ref(), archive.as_ref(), &stats).await;
            drop(permit);
        });
    }

    // Wait for outstanding jobs before reporting shutdown.
    if permits.acquire_many(workers).await.is_ok() {
        debug!("dispatcher drained");
    }
}

async fn run_job(
    job: EnrichmentJob,
    enricher: &dyn Enricher,
    archive: Option<&MatchArchive>,
    stats: &DispatchStats,
) {
    if let Some(archive) = archive {
        if let Err(e) = archive.save(&job.signature, &job.payload).await {
            warn!(signature = %job.signature, error = %e, "failed to archive match");
        }
    }

    match enricher.enrich(&job).await {
        Ok(()) => {
            stats.succeeded.fetch_add(1, Ordering::SeqCst);
            info!(signature = %job.signature, "match enriched");
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::SeqCst);
            warn!(signature = %job.signature, error = %e, "enrichment failed");
        }
    }
}
