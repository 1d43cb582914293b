//! Inference request/response schema and the backend seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::instance::ModelInstance;
use crate::error::{ModelOpsError, Result};
use crate::monitor::ModelPerformance;
use crate::types::{ModelId, ModelVersion, Version};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceOptions {
    /// Milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub explain_prediction: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
    pub model_id: ModelId,
    #[serde(default)]
    pub model_version: Option<Version>,
    pub input: Value,
    #[serde(default)]
    pub metadata: Option<RequestMetadata>,
    #[serde(default)]
    pub options: Option<InferenceOptions>,
}

impl InferenceRequest {
    pub fn new(model_id: impl Into<String>, input: Value) -> Self {
        Self {
            model_id: model_id.into(),
            model_version: None,
            input,
            metadata: None,
            options: None,
        }
    }

    pub fn pinned(mut self, version: Version) -> Self {
        self.model_version = Some(version);
        self
    }

    pub fn with_options(mut self, options: InferenceOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn request_id(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.request_id.as_deref())
    }

    pub fn explain(&self) -> bool {
        self.options.as_ref().map_or(false, |o| o.explain_prediction)
    }
}

/// What a backend returns for one input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub value: Value,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub explanation: Option<Value>,
    /// Resident memory of the serving process, when the backend reports it.
    #[serde(default, alias = "memoryBytes")]
    pub memory_bytes: Option<u64>,
}

impl Prediction {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            confidence: None,
            explanation: None,
            memory_bytes: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    /// Milliseconds.
    pub processing_time: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub model_performance: Option<ModelPerformance>,
    #[serde(default)]
    pub instance_id: Option<uuid::Uuid>,
    #[serde(default)]
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    pub request_id: String,
    pub model_id: ModelId,
    pub model_version: Version,
    pub prediction: Value,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub explanation: Option<Value>,
    pub metadata: ResponseMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// A failed inference together with what is known about the request.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct InferenceError {
    #[source]
    pub source: ModelOpsError,
    pub request_id: String,
    pub model_id: ModelId,
    pub model_version: Option<Version>,
    pub processing_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl InferenceError {
    pub fn kind(&self) -> &'static str {
        self.source.kind()
    }

    /// JSON body describing the failure, for API responses.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "requestId": self.request_id,
            "modelId": self.model_id,
            "modelVersion": self.model_version,
            "error": self.source.to_string(),
            "kind": self.kind(),
            "metadata": {
                "processingTime": self.processing_time_ms,
                "timestamp": self.timestamp,
            }
        })
    }
}

/// Model-specific inference function, registered per model id.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    async fn predict(
        &self,
        version: &ModelVersion,
        instance: &ModelInstance,
        input: &Value,
        explain: bool,
    ) -> Result<Prediction>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_camel_case_schema() {
        let req: InferenceRequest = serde_json::from_value(json!({
            "modelId": "segment-model",
            "modelVersion": "2.1.0",
            "input": {"recency": 3},
            "metadata": {"requestId": "r-1", "userId": "u"},
            "options": {"timeout": 500, "explainPrediction": true}
        }))
        .unwrap();
        assert_eq!(req.model_version, Some(Version::new(2, 1, 0)));
        assert_eq!(req.request_id(), Some("r-1"));
        assert!(req.explain());
        assert_eq!(req.options.unwrap().timeout, Some(500));
    }

    #[test]
    fn minimal_request_parses() {
        let req: InferenceRequest = serde_json::from_value(json!({"modelId": "m", "input": 1})).unwrap();
        assert!(req.model_version.is_none());
        assert!(!req.explain());
    }

    #[test]
    fn failure_json_carries_metadata() {
        let err = InferenceError {
            source: ModelOpsError::ModelNotAvailable("m".into()),
            request_id: "r".into(),
            model_id: "m".into(),
            model_version: None,
            processing_time_ms: 1.5,
            timestamp: Utc::now(),
        };
        let body = err.to_json();
        assert_eq!(body["kind"], "model_not_available");
        assert_eq!(body["metadata"]["processingTime"], 1.5);
    }
}
