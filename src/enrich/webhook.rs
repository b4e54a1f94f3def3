use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{EnrichError, Enricher, EnrichmentJob};

/// Posts matches straight to the notification sinks.
///
/// The receiving side expects an event of the form `{"body": "<json>"}`,
/// so the event is encoded to a string and wrapped once more. The fallback
/// sink is tried when the primary fails.
pub struct WebhookEnricher {
    http: Client,
}

impl WebhookEnricher {
    pub fn new(timeout: Duration) -> Result<Self, EnrichError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    async fn post(&self, sink: &str, body: &Value) -> Result<(), EnrichError> {
        let resp = self.http.post(sink).json(body).send().await?;
        if !resp.status().is_success() {
            return Err(EnrichError::Status {
                sink: sink.to_string(),
                status: resp.status(),
            });
        }
        Ok(())
    }
}

/// Wrap the event as `{"body": "<event json with instanceUID>"}`.
pub(crate) fn double_encode(payload: &Value, instance: &str) -> Result<Value, EnrichError> {
    let mut inner = payload.clone();
    if let Value::Object(map) = &mut inner {
        map.insert("instanceUID".to_string(), Value::from(instance));
    }
    let encoded = serde_json::to_string(&inner)?;
    Ok(serde_json::json!({ "body": encoded }))
}

#[async_trait]
impl Enricher for WebhookEnricher {
    async fn enrich(&self, job: &EnrichmentJob) -> Result<(), EnrichError> {
        let body = double_encode(&job.payload, job.targets.instance.as_str())?;

        match self.post(&job.targets.primary, &body).await {
            Ok(()) => {
                debug!(signature = %job.signature, "match delivered to primary sink");
                Ok(())
            }
            Err(e) if !job.targets.fallback.is_empty() => {
                warn!(signature = %job.signature, error = %e, "primary sink failed, trying fallback");
                self.post(&job.targets.fallback, &body).await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::SinkTargets;
    use crate::identity::InstanceId;
    use crate::test_support::StubServer;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_double_encode() {
        let payload = json!({ "Transaction": { "Signature": "s1" } });
        let wrapped = double_encode(&payload, "inst").unwrap();
        let body = wrapped["body"].as_str().unwrap();
        let inner: Value = serde_json::from_str(body).unwrap();
        assert_eq!(inner["Transaction"]["Signature"], "s1");
        assert_eq!(inner["instanceUID"], "inst");
    }

    fn job(primary: &str, fallback: &str) -> EnrichmentJob {
        EnrichmentJob {
            signature: "s1".to_string(),
            payload: Arc::new(json!({ "Transaction": { "Signature": "s1" } })),
            targets: Arc::new(SinkTargets {
                primary: primary.to_string(),
                fallback: fallback.to_string(),
                instance: InstanceId::from("inst"),
            }),
        }
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let primary = StubServer::start(200, "{}").await;
        let fallback = StubServer::start(200, "{}").await;
        let enricher = WebhookEnricher::new(Duration::from_secs(5)).unwrap();

        enricher.enrich(&job(&primary.url, &fallback.url)).await.unwrap();
        assert_eq!(primary.hits(), 1);
        assert_eq!(fallback.hits(), 0);

        let posted: Value = serde_json::from_str(&primary.bodies()[0]).unwrap();
        let inner: Value = serde_json::from_str(posted["body"].as_str().unwrap()).unwrap();
        assert_eq!(inner["instanceUID"], "inst");
    }

    #[tokio::test]
    async fn test_primary_failure_falls_back_once() {
        let primary = StubServer::start(500, "{}").await;
        let fallback = StubServer::start(200, "{}").await;
        let enricher = WebhookEnricher::new(Duration::from_secs(5)).unwrap();

        enricher.enrich(&job(&primary.url, &fallback.url)).await.unwrap();
        assert_eq!(primary.hits(), 1);
        assert_eq!(fallback.hits(), 1);
        assert_eq!(primary.bodies(), fallback.bodies());
    }

    #[tokio::test]
    async fn test_failure_without_fallback_is_status_error() {
        let primary = StubServer::start(502, "{}").await;
        let enricher = WebhookEnricher::new(Duration::from_secs(5)).unwrap();

        let err = enricher.enrich(&job(&primary.url, "")).await.unwrap_err();
        assert!(matches!(err, EnrichError::Status { status, .. } if status.as_u16() == 502));
        assert_eq!(primary.hits(), 1);
    }

    #[tokio::test]
    async fn test_both_sinks_failing_reports_fallback_status() {
        let primary = StubServer::start(500, "{}").await;
        let fallback = StubServer::start(503, "{}").await;
        let enricher = WebhookEnricher::new(Duration::from_secs(5)).unwrap();

        let err = enricher.enrich(&job(&primary.url, &fallback.url)).await.unwrap_err();
        assert!(matches!(err, EnrichError::Status { status, .. } if status.as_u16() == 503));
        assert_eq!(fallback.hits(), 1);
    }
}
