use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{EnrichError, Enricher, EnrichmentJob, SolPriceCache};

/// Runs an external detector script per match.
///
/// The event is written to the script's stdin as JSON, augmented with
/// `solUsdRate` when a rate is known. The sinks and instance id are passed
/// as positional arguments: `<script> <primary> <fallback> <instance>`.
pub struct ScriptEnricher {
    interpreter: String,
    script: String,
    timeout: Duration,
    prices: Arc<SolPriceCache>,
}

impl ScriptEnricher {
    pub fn new(
        interpreter: String,
        script: String,
        timeout: Duration,
        prices: Arc<SolPriceCache>,
    ) -> Self {
        Self {
            interpreter,
            script,
            timeout,
            prices,
        }
    }

    fn stdin_payload(&self, payload: &Value) -> Result<Vec<u8>, EnrichError> {
        let mut body = payload.clone();
        if let (Value::Object(map), Some(rate)) = (&mut body, self.prices.get()) {
            map.insert("solUsdRate".to_string(), Value::from(rate));
        }
        Ok(serde_json::to_vec(&body)?)
    }

    async fn run(&self, job: &EnrichmentJob) -> Result<String, EnrichError> {
        let input = self.stdin_payload(&job.payload)?;

        let mut cmd = Command::new(&self.interpreter);
        if !self.script.is_empty() {
            cmd.arg(&self.script);
        }
        cmd.arg(&job.targets.primary)
            .arg(&job.targets.fallback)
            .arg(job.targets.instance.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            // A script that exits without reading its input is judged by its exit status.
            if let Err(e) = stdin.write_all(&input).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = child.wait_with_output().await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(EnrichError::Script {
                status: output.status.to_string(),
                output: text,
            });
        }
        Ok(text)
    }
}

#[async_trait]
impl Enricher for ScriptEnricher {
    async fn enrich(&self, job: &EnrichmentJob) -> Result<(), EnrichError> {
        let output = tokio::time::timeout(self.timeout, self.run(job))
            .await
            .map_err(|_| EnrichError::Timeout(self.timeout))??;
        debug!(signature = %job.signature, output = %output.trim(), "enrichment script finished");
        Ok(())
    }
}
