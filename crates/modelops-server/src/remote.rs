//! Collaborators that reach model runtimes and the training service over HTTP.

use async_trait::async_trait;
use modelops_core::{
    HealthProbe, InferenceBackend, ModelArtifact, ModelInstance, ModelMetrics, ModelOpsError, ModelVersion,
    Prediction, Trainer,
};
use serde_json::{json, Value};
use std::time::Duration;

fn instance_url(instance: &ModelInstance) -> Option<String> {
    instance.url.as_ref().map(|u| u.trim_end_matches('/').to_string())
}

/// GETs `<instance url><health_check_path>`. Instances without a URL run in
/// process and always pass.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, instance: &ModelInstance) -> modelops_core::Result<()> {
        let Some(base) = instance_url(instance) else {
            return Ok(());
        };
        let url = format!("{}{}", base, instance.health_check_path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ModelOpsError::Platform(format!("GET {}: {}", url, e)))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ModelOpsError::Platform(format!("GET {} returned {}", url, resp.status())))
        }
    }
}

/// Forwards predictions to `<instance url>/predict`.
///
/// The runtime receives `{modelId, version, input, explain}` and answers with
/// `{value, confidence?, explanation?}`.
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl InferenceBackend for HttpBackend {
    async fn predict(
        &self,
        version: &ModelVersion,
        instance: &ModelInstance,
        input: &Value,
        explain: bool,
    ) -> modelops_core::Result<Prediction> {
        let base = instance_url(instance)
            .ok_or_else(|| ModelOpsError::Inference(format!("instance {} has no url", instance.id)))?;
        let url = format!("{}/predict", base);
        let resp = self
            .client
            .post(&url)
            .json(&json!({
                "modelId": version.model_id,
                "version": version.version,
                "input": input,
                "explain": explain,
            }))
            .send()
            .await
            .map_err(|e| ModelOpsError::Inference(format!("POST {}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(ModelOpsError::Inference(format!("POST {} returned {}", url, resp.status())));
        }
        resp.json::<Prediction>()
            .await
            .map_err(|e| ModelOpsError::Inference(format!("malformed prediction from {}: {}", url, e)))
    }
}

/// Training service reached at `POST <url>/train` and `POST <url>/evaluate`.
pub struct HttpTrainer {
    client: reqwest::Client,
    base: String,
}

impl HttpTrainer {
    pub fn new(base: &str, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, path: &str, body: Value) -> modelops_core::Result<T> {
        let url = format!("{}{}", self.base, path);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelOpsError::Training(format!("POST {}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(ModelOpsError::Training(format!("POST {} returned {}", url, resp.status())));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ModelOpsError::Training(format!("malformed response from {}: {}", url, e)))
    }
}

#[async_trait]
impl Trainer for HttpTrainer {
    async fn train(&self, model_id: &str, config: &Value) -> modelops_core::Result<ModelArtifact> {
        self.call("/train", json!({"modelId": model_id, "config": config})).await
    }

    async fn evaluate(&self, model_id: &str, artifact: &ModelArtifact) -> modelops_core::Result<ModelMetrics> {
        self.call(
            "/evaluate",
            json!({"modelId": model_id, "config": artifact.config, "metrics": artifact.metrics}),
        )
        .await
    }
}
