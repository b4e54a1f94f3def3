use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::engine::dispatch::{BackpressurePolicy, MAX_IN_FLIGHT};
use crate::event::TimestampUnit;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub tracked: TrackedConfig,
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub price: PriceConfig,
    #[serde(default)]
    pub instance: InstanceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackedConfig {
    /// Endpoint returning a JSON array of wallet addresses.
    #[serde(default)]
    pub url: String,
    /// Seconds between wallet list refreshes.
    #[serde(default = "default_tracked_refresh")]
    pub refresh_interval_secs: u64,
    /// Per-request timeout for the wallet list fetch.
    #[serde(default = "default_http_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// How often accumulated upstream messages are handed to the engine.
    #[serde(default = "default_batch_interval_ms")]
    pub batch_interval_ms: u64,
    /// Capacity of the channel between the reader and the scheduler.
    #[serde(default = "default_ingest_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Events with more balance updates than this are not owner-scanned.
    #[serde(default = "default_max_balance_updates")]
    pub max_balance_updates: usize,
    /// Unit of numeric `Block.Timestamp` values upstream.
    #[serde(default)]
    pub timestamp_unit: TimestampUnit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// Claimed signatures older than this (by block time) are forgotten.
    #[serde(default = "default_dedup_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_dedup_sweep")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Pending enrichment jobs held before backpressure applies.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Enrichment jobs allowed to run at the same time.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default)]
    pub backpressure: BackpressurePolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentMode {
    #[default]
    Script,
    Webhook,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default)]
    pub mode: EnrichmentMode,
    /// Primary notification sink (swap webhook in the original deployment).
    #[serde(default)]
    pub primary_sink: String,
    /// Fallback sink (transfer webhook).
    #[serde(default)]
    pub fallback_sink: String,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_script")]
    pub script: String,
    #[serde(default = "default_enrich_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub save_matches: bool,
    #[serde(default = "default_audit_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Empty endpoint means the window is logged but not posted.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_metrics_flush")]
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceConfig {
    /// SOL/USD endpoint (`{"solana":{"usd":..}}`). Empty disables the refresher.
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_price_min")]
    pub min_interval_secs: u64,
    #[serde(default = "default_price_max")]
    pub max_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    #[serde(default = "default_uid_charset")]
    pub uid_charset: String,
    #[serde(default = "default_uid_len")]
    pub uid_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_tracked_refresh() -> u64 {
    60
}
fn default_http_timeout() -> u64 {
    10
}
fn default_batch_interval_ms() -> u64 {
    500
}
fn default_ingest_capacity() -> usize {
    1024
}
fn default_max_balance_updates() -> usize {
    256
}
fn default_dedup_retention() -> u64 {
    3600
}
fn default_dedup_sweep() -> u64 {
    60
}
fn default_queue_capacity() -> usize {
    1024
}
fn default_max_in_flight() -> usize {
    16
}
fn default_interpreter() -> String {
    "python3".to_string()
}
fn default_script() -> String {
    "scripts/swapdetector.py".to_string()
}
fn default_enrich_timeout() -> u64 {
    30
}
fn default_audit_dir() -> String {
    "matches".to_string()
}
fn default_metrics_flush() -> u64 {
    60
}
fn default_price_min() -> u64 {
    120
}
fn default_price_max() -> u64 {
    600
}
fn default_uid_charset() -> String {
    "abcdefghijklmnopqrstuvwxyz0123456789".to_string()
}
fn default_uid_len() -> usize {
    16
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TrackedConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            refresh_interval_secs: default_tracked_refresh(),
            request_timeout_secs: default_http_timeout(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: default_batch_interval_ms(),
            channel_capacity: default_ingest_capacity(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_balance_updates: default_max_balance_updates(),
            timestamp_unit: TimestampUnit::default(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_dedup_retention(),
            sweep_interval_secs: default_dedup_sweep(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_in_flight: default_max_in_flight(),
            backpressure: BackpressurePolicy::default(),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            mode: EnrichmentMode::default(),
            primary_sink: String::new(),
            fallback_sink: String::new(),
            interpreter: default_interpreter(),
            script: default_script(),
            timeout_secs: default_enrich_timeout(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            save_matches: false,
            dir: default_audit_dir(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            flush_interval_secs: default_metrics_flush(),
        }
    }
}

impl Default for PriceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            min_interval_secs: default_price_min(),
            max_interval_secs: default_price_max(),
        }
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            uid_charset: default_uid_charset(),
            uid_len: default_uid_len(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl TrackedConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

impl DedupConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Config {
    /// Load config from a TOML file, then overlay environment variables for endpoints.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Build a config from environment variables alone (no file needed).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config {
            tracked: TrackedConfig::default(),
            enrichment: EnrichmentConfig::default(),
            ingest: IngestConfig::default(),
            engine: EngineConfig::default(),
            dedup: DedupConfig::default(),
            dispatch: DispatchConfig::default(),
            audit: AuditConfig::default(),
            metrics: MetricsConfig::default(),
            price: PriceConfig::default(),
            instance: InstanceConfig::default(),
            logging: LoggingConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("WALLETWATCH_WALLET_LIST_URL") {
            self.tracked.url = url;
        }
        if let Ok(sink) = std::env::var("WALLETWATCH_PRIMARY_SINK") {
            self.enrichment.primary_sink = sink;
        }
        if let Ok(sink) = std::env::var("WALLETWATCH_FALLBACK_SINK") {
            self.enrichment.fallback_sink = sink;
        }
        if let Ok(endpoint) = std::env::var("WALLETWATCH_METRICS_ENDPOINT") {
            self.metrics.endpoint = endpoint;
        }
        if let Ok(url) = std::env::var("WALLETWATCH_PRICE_URL") {
            self.price.url = url;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tracked.url.is_empty() {
            return Err(ConfigError::Missing("tracked.url"));
        }
        if self.enrichment.primary_sink.is_empty() {
            return Err(ConfigError::Missing("enrichment.primary_sink"));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "dispatch.queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.dispatch.max_in_flight == 0 || self.dispatch.max_in_flight > MAX_IN_FLIGHT {
            return Err(ConfigError::Invalid {
                field: "dispatch.max_in_flight",
                reason: format!("must be between 1 and {}", MAX_IN_FLIGHT),
            });
        }
        if self.instance.uid_charset.is_empty() {
            return Err(ConfigError::Invalid {
                field: "instance.uid_charset",
                reason: "must not be empty".to_string(),
            });
        }
        if self.price.min_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "price.min_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.price.min_interval_secs > self.price.max_interval_secs {
            return Err(ConfigError::Invalid {
                field: "price.min_interval_secs",
                reason: "exceeds price.max_interval_secs".to_string(),
            });
        }
        Ok(())
    }
}
