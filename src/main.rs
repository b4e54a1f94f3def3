use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use walletwatch::audit::MatchArchive;
use walletwatch::config::{Config, EnrichmentMode};
use walletwatch::dedup::DedupGuard;
use walletwatch::engine::{DispatchSettings, Dispatcher, EngineSettings, MatchEngine};
use walletwatch::enrich::{
    Enricher, ScriptEnricher, SinkTargets, SolPriceCache, SolPriceRefresher, WebhookEnricher,
};
use walletwatch::event::TimestampUnit;
use walletwatch::identity::InstanceId;
use walletwatch::ingest::{spawn_stdin_forwarder, BatchScheduler};
use walletwatch::metrics::{LatencyAccumulator, MetricsReporter};
use walletwatch::tracked::{HttpAddressSource, TrackedSetCache, TrackedSetRefresher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "walletwatch.toml".to_string());
    let config = if Path::new(&config_path).exists() {
        Config::load(Path::new(&config_path))?
    } else {
        Config::from_env()?
    };

    // Initialize logging
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    info!("walletwatch v{} starting", env!("CARGO_PKG_VERSION"));

    let instance = InstanceId::generate(&config.instance.uid_charset, config.instance.uid_len);
    info!(instance = %instance, "instance id assigned");

    // --- Tracked wallets ---
    let tracked = Arc::new(TrackedSetCache::new());
    let source = HttpAddressSource::new(
        config.tracked.url.clone(),
        Duration::from_secs(config.tracked.request_timeout_secs),
    )?;
    let refresher =
        TrackedSetRefresher::new(tracked.clone(), Arc::new(source), config.tracked.refresh_interval());
    refresher.prime().await;
    refresher.start();

    // --- SOL/USD rate ---
    let prices = Arc::new(SolPriceCache::new());
    if config.price.url.is_empty() {
        info!("price.url not set, enrichment runs without a SOL/USD rate");
    } else {
        SolPriceRefresher::new(
            prices.clone(),
            config.price.url.clone(),
            Duration::from_secs(config.price.min_interval_secs),
            Duration::from_secs(config.price.max_interval_secs),
        )
        .start();
    }

    // --- Dedup ---
    let dedup = Arc::new(DedupGuard::new());
    dedup
        .clone()
        .spawn_sweeper(config.dedup.retention(), config.dedup.sweep_interval());

    // --- Latency metrics ---
    let latency = Arc::new(LatencyAccumulator::new(TimestampUnit::Milliseconds));
    if config.metrics.endpoint.is_empty() {
        warn!("metrics.endpoint not set, latency windows are only logged");
    }
    let reporter = Arc::new(MetricsReporter::new(
        latency.clone(),
        instance.clone(),
        config.metrics.endpoint.clone(),
        Duration::from_secs(config.metrics.flush_interval_secs.max(1)),
    ));
    reporter.clone().start();

    // --- Enrichment + dispatch ---
    let enrich_timeout = Duration::from_secs(config.enrichment.timeout_secs);
    let enricher: Arc<dyn Enricher> = match config.enrichment.mode {
        EnrichmentMode::Script => Arc::new(ScriptEnricher::new(
            config.enrichment.interpreter.clone(),
            config.enrichment.script.clone(),
            enrich_timeout,
            prices.clone(),
        )),
        EnrichmentMode::Webhook => Arc::new(WebhookEnricher::new(enrich_timeout)?),
    };
    let archive = config.audit.save_matches.then(|| {
        let archive = MatchArchive::new(&config.audit.dir);
        info!(dir = %archive.dir().display(), "saving matched events");
        archive
    });
    let (dispatcher, dispatch_done) = Dispatcher::start(
        enricher,
        archive,
        DispatchSettings {
            queue_capacity: config.dispatch.queue_capacity,
            max_in_flight: config.dispatch.max_in_flight,
            policy: config.dispatch.backpressure,
        },
    );
    let dispatch_stats = dispatcher.stats();

    let engine = Arc::new(MatchEngine::new(
        tracked.clone(),
        dedup.clone(),
        latency,
        dispatcher,
        SinkTargets {
            primary: config.enrichment.primary_sink.clone(),
            fallback: config.enrichment.fallback_sink.clone(),
            instance: instance.clone(),
        },
        EngineSettings {
            max_balance_updates: config.engine.max_balance_updates,
            timestamp_unit: config.engine.timestamp_unit,
        },
    ));

    // Instance + wallet list heartbeat every 60s
    let tracked_for_log = tracked.clone();
    let dedup_for_log = dedup.clone();
    let instance_for_log = instance.clone();
    let stats_for_log = dispatch_stats.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            info!(
                instance = %instance_for_log,
                wallets = tracked_for_log.len(),
                claims = dedup_for_log.len(),
                queued = stats_for_log.queued.load(Ordering::Relaxed),
                completed = stats_for_log.completed(),
                failed = stats_for_log.failed.load(Ordering::Relaxed),
                dropped = stats_for_log.dropped.load(Ordering::Relaxed),
                rejected = stats_for_log.rejected.load(Ordering::Relaxed),
                "heartbeat"
            );
        }
    });

    // --- Ingest ---
    let (tx, rx) = mpsc::channel(config.ingest.channel_capacity.max(1));
    let (stop_tx, stop_rx) = oneshot::channel();
    let scheduler = BatchScheduler::new(
        engine,
        rx,
        Duration::from_millis(config.ingest.batch_interval_ms.max(1)),
    )
    .with_shutdown(stop_rx)
    .start();

    info!("reading newline-delimited event batches from stdin - press Ctrl+C to stop");
    // stdin is read on its own OS thread so a pending read never holds up exit.
    let input_done = spawn_stdin_forwarder(tx);

    tokio::select! {
        res = input_done => match res {
            Ok(Ok(n)) => info!(messages = n, "input closed"),
            Ok(Err(e)) => error!(error = %e, "failed reading input"),
            Err(_) => error!("input reader exited unexpectedly"),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            let _ = stop_tx.send(());
        }
    }

    // Let in-flight batches and enrichments finish, then ship the last window.
    let total = scheduler.await?;
    dispatch_done.await?;
    reporter.flush().await;
    info!(
        visited = total.visited,
        matched = total.matched,
        dispatched = total.dispatched,
        duplicates = total.duplicates,
        completed = dispatch_stats.completed(),
        "walletwatch stopped"
    );
    Ok(())
}
