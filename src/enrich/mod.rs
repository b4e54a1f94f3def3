//! Downstream enrichment of matched events.
//!
//! The engine hands each claimed match to an `Enricher` through the
//! dispatcher. What enrichment does (swap/transfer classification, USD
//! valuation, notification) is owned by the implementation:
//! - `ScriptEnricher`: pipes the event into an external detector script
//! - `WebhookEnricher`: posts the event to the notification sinks directly

pub mod price;
pub mod script;
pub mod webhook;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::identity::InstanceId;

pub use price::{SolPriceCache, SolPriceRefresher};
pub use script::ScriptEnricher;
pub use webhook::WebhookEnricher;

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("failed to run enrichment script: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("enrichment script exited with {status}: {output}")]
    Script { status: String, output: String },
    #[error("enrichment timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sink request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink {sink} returned status {status}")]
    Status {
        sink: String,
        status: reqwest::StatusCode,
    },
}

/// Where a match goes and who sent it.
#[derive(Debug, Clone)]
pub struct SinkTargets {
    pub primary: String,
    pub fallback: String,
    pub instance: InstanceId,
}

/// One unit of enrichment work.
#[derive(Debug, Clone)]
pub struct EnrichmentJob {
    pub signature: String,
    pub payload: Arc<Value>,
    pub targets: Arc<SinkTargets>,
}

#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(&self, job: &EnrichmentJob) -> Result<(), EnrichError>;
}
