//! Rust client for the ModelOps control plane.
//!
//! Thin wrapper over the HTTP API that unwraps the `{success, data, error}`
//! envelope into core types.
//!
//! # Example
//! ```rust,no_run
//! use modelops_client::{ModelOpsClient, PlanRequest};
//! use modelops_core::{Environment, Version};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = ModelOpsClient::new("http://localhost:9400");
//!
//!     let created = client
//!         .create_plan(&PlanRequest::new("churn", Version::new(1, 2, 0), Environment::Production))
//!         .await?;
//!     let outcome = client.approve(created.plan.id, "release-manager").await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use modelops_core::deploy::{DeploymentExecution, PlanView};
use modelops_core::{
    Alert, DeploymentPlan, DeploymentStrategy, Environment, InferenceRequest, InferenceResponse, ModelArtifact,
    ModelId, ModelPerformance, ModelVersion, PredictionSample, RetrainOutcome, ScheduleOutcome, Version,
    VersionStatus,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Response envelope used by every route.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

/// Body of `POST /deployments/plans`.
#[derive(Debug, Clone, Serialize)]
pub struct PlanRequest {
    pub model_id: String,
    pub version: Version,
    pub environment: Environment,
    pub strategy: DeploymentStrategy,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl PlanRequest {
    pub fn new(model_id: impl Into<String>, version: Version, environment: Environment) -> Self {
        Self {
            model_id: model_id.into(),
            version,
            environment,
            strategy: DeploymentStrategy::Immediate,
            reason: String::new(),
            scheduled_at: None,
        }
    }

    pub fn strategy(mut self, strategy: DeploymentStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(when);
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanCreated {
    pub plan: DeploymentPlan,
    pub outcome: ScheduleOutcome,
}

/// A ModelOps server reachable over HTTP.
#[derive(Clone)]
pub struct ModelOpsClient {
    http: reqwest::Client,
    base: String,
}

impl ModelOpsClient {
    /// `base` is the server root, e.g. `"http://localhost:9400"`.
    pub fn new(base: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base)
    }

    pub fn with_client(http: reqwest::Client, base: impl Into<String>) -> Self {
        Self {
            http,
            base: base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn unwrap<T: DeserializeOwned>(resp: reqwest::Response, what: &str) -> anyhow::Result<T> {
        let status = resp.status();
        let body: ApiResponse<T> = resp
            .json()
            .await
            .with_context(|| format!("{}: unreadable response (HTTP {})", what, status))?;
        if !body.success {
            let msg = body.error.unwrap_or_else(|| "unknown error".into());
            return Err(anyhow!("{} failed (HTTP {}): {}", what, status, msg));
        }
        body.data.ok_or_else(|| anyhow!("{}: response has no data", what))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .with_context(|| format!("GET {} failed. Is `modelops serve` running?", path))?;
        Self::unwrap(resp, &format!("GET {}", path)).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &impl Serialize) -> anyhow::Result<T> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed. Is `modelops serve` running?", path))?;
        Self::unwrap(resp, &format!("POST {}", path)).await
    }

    pub async fn health(&self) -> anyhow::Result<Value> {
        self.get("/health").await
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    pub async fn list_models(&self) -> anyhow::Result<Vec<ModelId>> {
        self.get("/models").await
    }

    pub async fn list_versions(&self, model_id: &str) -> anyhow::Result<Vec<ModelVersion>> {
        self.get(&format!("/models/{}/versions", model_id)).await
    }

    pub async fn get_version(&self, model_id: &str, version: &Version) -> anyhow::Result<ModelVersion> {
        self.get(&format!("/models/{}/versions/{}", model_id, version)).await
    }

    pub async fn register_version(
        &self,
        model_id: &str,
        artifact: &ModelArtifact,
        trainer: &str,
        tags: &[String],
    ) -> anyhow::Result<ModelVersion> {
        self.post(
            &format!("/models/{}/versions", model_id),
            &json!({"artifact": artifact, "trainer": trainer, "tags": tags}),
        )
        .await
    }

    pub async fn promote(&self, model_id: &str, version: &Version, status: VersionStatus) -> anyhow::Result<ModelVersion> {
        self.post(
            &format!("/models/{}/versions/{}/promote", model_id, version),
            &json!({ "status": status }),
        )
        .await
    }

    // ── Monitor & retrain ─────────────────────────────────────────────────────

    pub async fn record_prediction(&self, model_id: &str, sample: &PredictionSample) -> anyhow::Result<Vec<Alert>> {
        self.post(&format!("/models/{}/predictions", model_id), sample).await
    }

    pub async fn performance(&self, model_id: &str) -> anyhow::Result<ModelPerformance> {
        self.get(&format!("/models/{}/performance", model_id)).await
    }

    pub async fn trigger_retrain(&self, model_id: &str, force: bool) -> anyhow::Result<RetrainOutcome> {
        self.post(&format!("/models/{}/retrain", model_id), &json!({ "force": force }))
            .await
    }

    // ── Deployments ───────────────────────────────────────────────────────────

    pub async fn create_plan(&self, request: &PlanRequest) -> anyhow::Result<PlanCreated> {
        self.post("/deployments/plans", request).await
    }

    pub async fn list_plans(&self) -> anyhow::Result<Vec<PlanView>> {
        self.get("/deployments/plans").await
    }

    pub async fn get_plan(&self, plan_id: Uuid) -> anyhow::Result<PlanView> {
        self.get(&format!("/deployments/plans/{}", plan_id)).await
    }

    pub async fn approve(&self, plan_id: Uuid, approver: &str) -> anyhow::Result<ScheduleOutcome> {
        self.post(
            &format!("/deployments/plans/{}/approve", plan_id),
            &json!({ "approver": approver }),
        )
        .await
    }

    pub async fn reject(&self, plan_id: Uuid, approver: &str, reason: &str) -> anyhow::Result<DeploymentPlan> {
        self.post(
            &format!("/deployments/plans/{}/reject", plan_id),
            &json!({ "approver": approver, "reason": reason }),
        )
        .await
    }

    pub async fn execution(&self, execution_id: Uuid) -> anyhow::Result<DeploymentExecution> {
        self.get(&format!("/deployments/executions/{}", execution_id)).await
    }

    pub async fn cancel(&self, execution_id: Uuid, reason: &str) -> anyhow::Result<DeploymentExecution> {
        self.post(
            &format!("/deployments/executions/{}/cancel", execution_id),
            &json!({ "reason": reason }),
        )
        .await
    }

    pub async fn history(&self, limit: usize) -> anyhow::Result<Vec<DeploymentExecution>> {
        self.get(&format!("/deployments/history?limit={}", limit)).await
    }

    // ── Serving ───────────────────────────────────────────────────────────────

    pub async fn predict(&self, request: &InferenceRequest) -> anyhow::Result<InferenceResponse> {
        self.post("/predict", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, routing::post, Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn unwraps_success_envelope() {
        let app = Router::new().route(
            "/models",
            get(|| async { Json(json!({"success": true, "data": ["churn", "ltv-model"]})) }),
        );
        let client = ModelOpsClient::new(serve(app).await + "/");
        assert_eq!(client.list_models().await.unwrap(), vec!["churn", "ltv-model"]);
    }

    #[tokio::test]
    async fn surfaces_server_error_message() {
        let app = Router::new().route(
            "/deployments/plans",
            post(|| async {
                (
                    axum::http::StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({"success": false, "error": "Version not found: churn@9.0.0"})),
                )
            }),
        );
        let client = ModelOpsClient::new(serve(app).await);
        let err = client
            .create_plan(&PlanRequest::new("churn", Version::new(9, 0, 0), Environment::Staging))
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("422"), "{}", err);
        assert!(err.contains("churn@9.0.0"), "{}", err);
    }

    #[test]
    fn plan_request_serializes_strategy_tag() {
        let body = serde_json::to_value(
            PlanRequest::new("ltv-model", Version::new(2, 1, 0), Environment::Production)
                .strategy(DeploymentStrategy::Canary { percentage: 10 })
                .reason("monthly refresh"),
        )
        .unwrap();
        assert_eq!(body["version"], "2.1.0");
        assert_eq!(body["strategy"]["type"], "canary");
        assert_eq!(body["strategy"]["percentage"], 10);
        assert!(body.get("scheduled_at").is_none());
    }
}
