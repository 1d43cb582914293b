use async_nats::Client;
use futures::StreamExt;
use modelops_core::{ModelOpsError, PerformanceMonitor, PredictionSample};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Ground truth reported by downstream systems once the real outcome is known.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackMessage {
    pub model_id: String,
    pub input: Value,
    pub output: Value,
    #[serde(default)]
    pub ground_truth: Option<Value>,
    #[serde(default)]
    pub latency_ms: f64,
}

impl FeedbackMessage {
    pub fn into_sample(self) -> (String, PredictionSample) {
        let mut sample = PredictionSample::new(self.input, self.output, self.latency_ms);
        if let Some(truth) = self.ground_truth {
            sample = sample.with_ground_truth(truth);
        }
        (self.model_id, sample)
    }
}

/// Consumes `<prefix>.feedback` and records each message with the monitor.
pub struct FeedbackIngest {
    client: Client,
    subject: String,
    monitor: Arc<PerformanceMonitor>,
}

impl FeedbackIngest {
    pub fn new(client: Client, prefix: &str, monitor: Arc<PerformanceMonitor>) -> Self {
        Self {
            client,
            subject: format!("{}.feedback", prefix),
            monitor,
        }
    }

    pub async fn start(&self) -> modelops_core::Result<()> {
        let mut subscriber = self
            .client
            .subscribe(self.subject.clone())
            .await
            .map_err(|e| ModelOpsError::Validation(format!("NATS subscribe failed: {}", e)))?;

        tracing::info!("NATS feedback consumer started, subscribed to {}", self.subject);

        while let Some(msg) = subscriber.next().await {
            if let Err(e) = self.handle_payload(&msg.payload) {
                tracing::error!("Failed to handle feedback message: {}", e);
            }
        }
        Ok(())
    }

    fn handle_payload(&self, payload: &[u8]) -> modelops_core::Result<()> {
        let message: FeedbackMessage = serde_json::from_slice(payload)?;
        let (model_id, sample) = message.into_sample();
        let alerts = self.monitor.record_prediction(&model_id, sample)?;
        if !alerts.is_empty() {
            tracing::info!("feedback for {} raised {} alert(s)", model_id, alerts.len());
        }
        Ok(())
    }
}
