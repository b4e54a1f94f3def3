use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Last known SOL/USD rate. Zero bits mean no rate yet.
#[derive(Debug, Default)]
pub struct SolPriceCache {
    bits: AtomicU64,
}

impl SolPriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, rate: f64) {
        if rate.is_finite() && rate > 0.0 {
            self.bits.store(rate.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn get(&self) -> Option<f64> {
        match self.bits.load(Ordering::Relaxed) {
            0 => None,
            bits => Some(f64::from_bits(bits)),
        }
    }
}

/// `{"solana": {"usd": 123.45}}`
#[derive(Debug, Deserialize)]
struct PriceResponse {
    #[serde(flatten)]
    coins: HashMap<String, HashMap<String, f64>>,
}

fn extract_rate(resp: &PriceResponse) -> Option<f64> {
    resp.coins.get("solana").and_then(|c| c.get("usd")).copied()
}

/// Refreshes the SOL/USD rate at a randomized interval to spread load on the price API.
pub struct SolPriceRefresher {
    cache: Arc<SolPriceCache>,
    url: String,
    min_interval: Duration,
    max_interval: Duration,
    http: Client,
}

impl SolPriceRefresher {
    pub fn new(
        cache: Arc<SolPriceCache>,
        url: String,
        min_interval: Duration,
        max_interval: Duration,
    ) -> Self {
        Self {
            cache,
            url,
            min_interval,
            max_interval: max_interval.max(min_interval),
            http: Client::new(),
        }
    }

    pub async fn refresh_once(&self) -> anyhow::Result<f64> {
        let resp = self.http.get(&self.url).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("price API returned status {}", resp.status());
        }
        let body: PriceResponse = resp.json().await?;
        let rate = extract_rate(&body)
            .ok_or_else(|| anyhow::anyhow!("SOL/USD rate missing from price response"))?;
        self.cache.set(rate);
        Ok(rate)
    }

    fn next_delay(&self) -> Duration {
        let min = self.min_interval.as_secs();
        let max = self.max_interval.as_secs();
        Duration::from_secs(rand::thread_rng().gen_range(min..=max))
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.refresh_once().await {
                    Ok(rate) => info!(rate = format!("{:.2}", rate), "SOL/USD rate updated"),
                    Err(e) => warn!(error = %e, "failed to refresh SOL/USD rate"),
                }
                let delay = self.next_delay();
                debug!(secs = delay.as_secs(), "next SOL/USD refresh");
                tokio::time::sleep(delay).await;
            }
        })
    }
}
