//! Timed batching of upstream messages.
//!
//! The bus consumer is not part of this crate; anything that can push JSON
//! messages into an mpsc channel can feed the engine. The scheduler
//! accumulates messages and, on every tick, hands the accumulated batch to
//! its own `process_batch` task, so a slow batch never holds up the next one.
//!
//! Shutdown closes the receiving side: senders blocked on a full channel are
//! released with an error and whatever is already buffered is still batched.

use serde_json::Value;
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::{BatchReport, MatchEngine};
use crate::event::split_message;

pub struct BatchScheduler {
    engine: Arc<MatchEngine>,
    rx: mpsc::Receiver<Value>,
    interval: Duration,
    shutdown: Option<oneshot::Receiver<()>>,
}

impl BatchScheduler {
    pub fn new(engine: Arc<MatchEngine>, rx: mpsc::Receiver<Value>, interval: Duration) -> Self {
        Self {
            engine,
            rx,
            interval,
            shutdown: None,
        }
    }

    /// Stop accepting messages once `shutdown` fires, even if senders are
    /// still alive. A dropped sender without a signal is ignored.
    pub fn with_shutdown(mut self, shutdown: oneshot::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Run until the sender side closes, then flush what is left and wait
    /// for in-flight batches. Returns the summed report of every batch.
    pub async fn run(mut self) -> BatchReport {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pending: Vec<Value> = Vec::new();
        let mut in_flight: JoinSet<BatchReport> = JoinSet::new();
        let mut total = BatchReport::default();
        let mut shutdown = self.shutdown.take();

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => pending.extend(split_message(msg)),
                    None => break,
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        let batch = std::mem::take(&mut pending);
                        debug!(events = batch.len(), "dispatching batch");
                        let engine = self.engine.clone();
                        in_flight.spawn(async move { engine.process_batch(batch).await });
                    }
                }
                Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                    absorb(&mut total, done);
                }
                signalled = async {
                    match shutdown.as_mut() {
                        Some(rx) => rx.await.is_ok(),
                        None => false,
                    }
                }, if shutdown.is_some() => {
                    shutdown = None;
                    if signalled {
                        info!(buffered = pending.len(), "ingest closing");
                        self.rx.close();
                    }
                }
            }
        }

        if !pending.is_empty() {
            let engine = self.engine.clone();
            in_flight.spawn(async move { engine.process_batch(pending).await });
        }
        while let Some(done) = in_flight.join_next().await {
            absorb(&mut total, done);
        }
        info!(
            visited = total.visited,
            matched = total.matched,
            dispatched = total.dispatched,
            "ingest finished"
        );
        total
    }

    pub fn start(self) -> tokio::task::JoinHandle<BatchReport> {
        tokio::spawn(self.run())
    }
}

fn absorb(total: &mut BatchReport, done: Result<BatchReport, tokio::task::JoinError>) {
    match done {
        Ok(r) => {
            total.visited += r.visited;
            total.malformed += r.malformed;
            total.failed_skipped += r.failed_skipped;
            total.matched += r.matched;
            total.dispatched += r.dispatched;
            total.duplicates += r.duplicates;
            total.dropped += r.dropped;
            total.rejected += r.rejected;
            total.oversized += r.oversized;
            total.recorded += r.recorded;
        }
        Err(e) => warn!(error = %e, "batch task failed"),
    }
}

/// Forward newline-delimited JSON messages from `reader` into `tx`.
/// Lines that are not JSON are logged and skipped. Returns the number forwarded.
///
/// Blocking: run it on its own thread, never on a runtime worker. It returns
/// early once the receiving side is closed.
pub fn forward_lines<R>(reader: R, tx: mpsc::Sender<Value>) -> std::io::Result<usize>
where
    R: BufRead,
{
    let mut forwarded = 0;
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(msg) => {
                if tx.blocking_send(msg).is_err() {
                    break;
                }
                forwarded += 1;
            }
            Err(e) => warn!(error = %e, "skipping undecodable message"),
        }
    }
    Ok(forwarded)
}

/// Forward stdin on a dedicated OS thread. The result arrives on the returned
/// channel when input ends or the scheduler stops receiving.
pub fn spawn_stdin_forwarder(tx: mpsc::Sender<Value>) -> oneshot::Receiver<std::io::Result<usize>> {
    let (done_tx, done_rx) = oneshot::channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let _ = done_tx.send(forward_lines(stdin.lock(), tx));
    });
    done_rx
}
