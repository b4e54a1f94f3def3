use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::LatencyAccumulator;
use crate::identity::InstanceId;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("metrics request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("metrics endpoint returned status {0}")]
    Status(reqwest::StatusCode),
}

/// Payload posted to the metrics endpoint once per window.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub instance_id: String,
    pub count: usize,
    pub avg_delay_seconds: f64,
}

/// Drains the accumulator on a fixed interval and ships the window.
pub struct MetricsReporter {
    accumulator: Arc<LatencyAccumulator>,
    instance: InstanceId,
    endpoint: String,
    interval: Duration,
    http: Client,
}

impl MetricsReporter {
    pub fn new(
        accumulator: Arc<LatencyAccumulator>,
        instance: InstanceId,
        endpoint: String,
        interval: Duration,
    ) -> Self {
        Self {
            accumulator,
            instance,
            endpoint,
            interval,
            http: Client::new(),
        }
    }

    /// Drain the current window into a report.
    pub fn collect(&self) -> MetricsReport {
        let (count, avg_delay_seconds) = self.accumulator.flush_and_reset();
        MetricsReport {
            instance_id: self.instance.to_string(),
            count,
            avg_delay_seconds,
        }
    }

    pub async fn send(&self, report: &MetricsReport) -> Result<(), ReportError> {
        let resp = self.http.post(&self.endpoint).json(report).send().await?;
        if !resp.status().is_success() {
            return Err(ReportError::Status(resp.status()));
        }
        Ok(())
    }

    /// Drain the window, log it and post it when an endpoint is configured.
    /// A failed post loses that window; samples are not put back.
    pub async fn flush(&self) -> MetricsReport {
        let report = self.collect();
        info!(
            instance = %report.instance_id,
            count = report.count,
            avg_delay = format!("{:.3}s", report.avg_delay_seconds),
            "latency window"
        );
        if !self.endpoint.is_empty() {
            if let Err(e) = self.send(&report).await {
                warn!(error = %e, count = report.count, "failed to report metrics");
            }
        }
        report
    }

    /// Start the reporting loop in a background task.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            // First tick fires immediately; skip it so the first window is full length.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.flush().await;
            }
        })
    }
}
