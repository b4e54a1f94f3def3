use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::TrackedSetCache;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("wallet list request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("wallet list endpoint returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("wallet list is not a JSON array of strings: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Supplier of the full tracked wallet list.
#[async_trait]
pub trait AddressSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<String>, SourceError>;
}

/// Wallet list served as a JSON array of address strings.
pub struct HttpAddressSource {
    url: String,
    http: Client,
}

impl HttpAddressSource {
    pub fn new(url: String, timeout: Duration) -> Result<Self, SourceError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { url, http })
    }
}

#[async_trait]
impl AddressSource for HttpAddressSource {
    async fn fetch(&self) -> Result<Vec<String>, SourceError> {
        let resp = self.http.get(&self.url).send().await?;
        if resp.status() != reqwest::StatusCode::OK {
            return Err(SourceError::Status(resp.status()));
        }
        let body = resp.bytes().await?;
        let wallets: Vec<String> = serde_json::from_slice(&body)?;
        Ok(wallets)
    }
}

/// Polls an `AddressSource` and swaps fresh snapshots into the cache.
pub struct TrackedSetRefresher {
    cache: Arc<TrackedSetCache>,
    source: Arc<dyn AddressSource>,
    interval: Duration,
}

impl TrackedSetRefresher {
    pub fn new(
        cache: Arc<TrackedSetCache>,
        source: Arc<dyn AddressSource>,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            source,
            interval,
        }
    }

    /// Fetch once and swap on success. On failure the cache is left untouched.
    pub async fn refresh_once(&self) -> Result<usize, SourceError> {
        let wallets = self.source.fetch().await?;
        let len = self.cache.refresh(wallets);
        Ok(len)
    }

    /// Start the refresh loop in a background task. The first fetch runs immediately.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.refresh_once().await {
                    Ok(len) => debug!(wallets = len, "wallet list updated"),
                    Err(e) => warn!(
                        error = %e,
                        serving = self.cache.len(),
                        "wallet list refresh failed, keeping previous set"
                    ),
                }
            }
        })
    }

    /// Fetch the initial list before the engine starts, logging the outcome.
    pub async fn prime(&self) {
        match self.refresh_once().await {
            Ok(len) => info!(wallets = len, "tracked wallet list loaded"),
            Err(e) => warn!(error = %e, "initial wallet list fetch failed, starting empty"),
        }
    }
}
