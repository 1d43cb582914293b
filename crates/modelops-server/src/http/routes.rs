use super::{events, status_for, AppResult, AppState, JsonResponse};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use modelops_core::deploy::{DeploymentExecution, PlanView};
use modelops_core::monitor::{extract_features, ReferenceDistribution, TimeRange};
use modelops_core::registry::DeploymentRecord;
use modelops_core::serving::{CanaryRoute, ModelEndpoint};
use modelops_core::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/events", get(events::stream))
        // Registry
        .route("/models", get(list_models))
        .route("/models/:model/versions", get(list_versions).post(register_version))
        .route("/models/:model/versions/:version", get(get_version))
        .route("/models/:model/versions/:version/promote", post(promote_version))
        .route("/models/:model/latest", get(latest_version))
        .route("/models/:model/cleanup", post(cleanup))
        .route("/models/:model/deployments/:environment", get(deployment_history))
        // Monitor
        .route("/models/:model/predictions", post(record_prediction))
        .route("/models/:model/performance", get(performance))
        .route("/models/:model/drift", get(drift))
        .route("/models/:model/alerts", get(alert_history))
        .route("/models/:model/alerts/config", get(get_alert_config).put(set_alert_config))
        .route("/models/:model/reference", put(set_reference))
        // Retrain
        .route("/models/:model/retrain", post(trigger_retrain))
        .route("/models/:model/retrain/policy", get(get_policy).put(set_policy))
        .route("/models/:model/retrain/history", get(retrain_history))
        // Deployments
        .route("/deployments/plans", get(list_plans).post(create_plan))
        .route("/deployments/plans/:id", get(get_plan))
        .route("/deployments/plans/:id/approve", post(approve_plan))
        .route("/deployments/plans/:id/reject", post(reject_plan))
        .route("/deployments/executions/:id", get(get_execution))
        .route("/deployments/executions/:id/cancel", post(cancel_execution))
        .route("/deployments/history", get(history))
        .route("/deployments/active", get(active))
        // Serving
        .route("/predict", post(predict))
        .route("/serve/*path", post(serve_path))
        .route("/endpoints", get(list_endpoints).post(register_endpoint))
        .route("/models/:model/instances", get(list_instances).post(add_instance))
        .route("/instances/:id", delete(remove_instance))
        .route("/models/:model/canary", put(set_canary).delete(clear_canary))
        .with_state(state)
}

// ── Health & metrics ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    version: String,
    uptime_seconds: u64,
    models: usize,
    instances: usize,
    healthy_instances: usize,
    active_deployments: usize,
}

async fn health(State(state): State<AppState>) -> Json<JsonResponse<HealthResponse>> {
    let instances = state.ops.router().all_instances();
    Json(JsonResponse::ok(HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        models: state.ops.registry().list_models().len(),
        instances: instances.len(),
        healthy_instances: instances.iter().filter(|i| i.is_healthy()).count(),
        active_deployments: state.ops.orchestrator().active_executions().len(),
    }))
}

async fn metrics(State(state): State<AppState>) -> AppResult<Response> {
    let body = state
        .metrics
        .render(&state.ops, state.start_time.elapsed().as_secs())?;
    Ok((
        [(header::CONTENT_TYPE, "application/openmetrics-text; version=1.0.0; charset=utf-8")],
        body,
    )
        .into_response())
}

// ── Registry ──────────────────────────────────────────────────────────────────

async fn list_models(State(state): State<AppState>) -> Json<JsonResponse<Vec<ModelId>>> {
    Json(JsonResponse::ok(state.ops.registry().list_models()))
}

async fn list_versions(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> AppResult<Json<JsonResponse<Vec<ModelVersion>>>> {
    Ok(Json(JsonResponse::ok(state.ops.registry().list_versions(&model)?)))
}

#[derive(Deserialize)]
struct RegisterBody {
    artifact: ModelArtifact,
    #[serde(default = "default_trainer")]
    trainer: String,
    #[serde(default)]
    tags: Vec<String>,
}

fn default_trainer() -> String {
    "api".to_string()
}

async fn register_version(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(body): Json<RegisterBody>,
) -> AppResult<(StatusCode, Json<JsonResponse<ModelVersion>>)> {
    let mut metadata = VersionMetadata::new(body.trainer);
    metadata.tags = body.tags;
    let registered = state.ops.registry().register(&model, body.artifact, metadata)?;
    Ok((StatusCode::CREATED, Json(JsonResponse::ok(registered))))
}

async fn get_version(
    State(state): State<AppState>,
    Path((model, version)): Path<(String, String)>,
) -> AppResult<Json<JsonResponse<ModelVersion>>> {
    let version: Version = version.parse()?;
    Ok(Json(JsonResponse::ok(state.ops.registry().get_version(&model, &version)?)))
}

#[derive(Deserialize)]
struct PromoteBody {
    status: VersionStatus,
}

async fn promote_version(
    State(state): State<AppState>,
    Path((model, version)): Path<(String, String)>,
    Json(body): Json<PromoteBody>,
) -> AppResult<Json<JsonResponse<ModelVersion>>> {
    let version: Version = version.parse()?;
    Ok(Json(JsonResponse::ok(
        state.ops.registry().promote(&model, &version, body.status)?,
    )))
}

#[derive(Deserialize)]
struct LatestQuery {
    status: Option<VersionStatus>,
}

async fn latest_version(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Query(q): Query<LatestQuery>,
) -> AppResult<Json<JsonResponse<ModelVersion>>> {
    let latest = state
        .ops
        .registry()
        .get_latest_version(&model, q.status)
        .ok_or_else(|| ModelOpsError::ModelNotFound(model.clone()))?;
    Ok(Json(JsonResponse::ok(latest)))
}

async fn cleanup(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> AppResult<Json<JsonResponse<Vec<ModelVersion>>>> {
    Ok(Json(JsonResponse::ok(state.ops.registry().cleanup(&model)?)))
}

async fn deployment_history(
    State(state): State<AppState>,
    Path((model, environment)): Path<(String, String)>,
) -> AppResult<Json<JsonResponse<Vec<DeploymentRecord>>>> {
    let environment: Environment = environment.parse()?;
    Ok(Json(JsonResponse::ok(
        state.ops.registry().deployment_history(&model, environment),
    )))
}

// ── Monitor ───────────────────────────────────────────────────────────────────

async fn record_prediction(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(sample): Json<PredictionSample>,
) -> AppResult<Json<JsonResponse<Vec<Alert>>>> {
    Ok(Json(JsonResponse::ok(state.ops.monitor().record_prediction(&model, sample)?)))
}

#[derive(Deserialize)]
struct RangeQuery {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

async fn performance(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Query(q): Query<RangeQuery>,
) -> AppResult<Json<JsonResponse<ModelPerformance>>> {
    let range = match (q.start, q.end) {
        (None, None) => None,
        (start, end) => {
            let end = end.unwrap_or_else(Utc::now);
            let start = start.unwrap_or(end - chrono::Duration::seconds(state.ops.config().monitor.rolling_window_secs as i64));
            if start > end {
                return Err(ModelOpsError::Validation("start is after end".into()).into());
            }
            Some(TimeRange::new(start, end))
        }
    };
    Ok(Json(JsonResponse::ok(
        state.ops.monitor().get_model_performance(&model, range),
    )))
}

async fn drift(State(state): State<AppState>, Path(model): Path<String>) -> Json<JsonResponse<Value>> {
    let monitor = state.ops.monitor();
    Json(JsonResponse::ok(json!({
        "score": monitor.get_data_drift(&model),
        "history": monitor.drift_history(&model),
        "reference": monitor.reference(&model),
    })))
}

async fn alert_history(State(state): State<AppState>, Path(model): Path<String>) -> Json<JsonResponse<Vec<Alert>>> {
    Json(JsonResponse::ok(state.ops.monitor().alerts(&model)))
}

async fn get_alert_config(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Json<JsonResponse<AlertConfig>> {
    Json(JsonResponse::ok(state.ops.monitor().alert_config(&model)))
}

async fn set_alert_config(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(config): Json<AlertConfig>,
) -> Json<JsonResponse<AlertConfig>> {
    state.ops.monitor().set_alert_config(&model, config.clone());
    Json(JsonResponse::ok(config))
}

#[derive(Deserialize)]
struct ReferenceBody {
    /// Raw model inputs; numeric fields become features.
    samples: Vec<Value>,
}

async fn set_reference(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(body): Json<ReferenceBody>,
) -> AppResult<Json<JsonResponse<ReferenceDistribution>>> {
    let vectors: Vec<_> = body
        .samples
        .iter()
        .map(extract_features)
        .filter(|f| !f.is_empty())
        .collect();
    if vectors.is_empty() {
        return Err(ModelOpsError::Validation("no sample has numeric features".into()).into());
    }
    let reference = ReferenceDistribution::from_samples(&vectors);
    state.ops.monitor().set_reference(&model, reference.clone());
    Ok(Json(JsonResponse::ok(reference)))
}

// ── Retrain ───────────────────────────────────────────────────────────────────

fn retrain(state: &AppState) -> AppResult<&std::sync::Arc<RetrainTrigger>> {
    state
        .ops
        .retrain()
        .ok_or_else(|| anyhow::anyhow!("retraining is disabled: no [trainer] url configured").into())
}

#[derive(Deserialize, Default)]
struct TriggerBody {
    #[serde(default)]
    force: bool,
}

async fn trigger_retrain(
    State(state): State<AppState>,
    Path(model): Path<String>,
    body: Option<Json<TriggerBody>>,
) -> AppResult<Json<JsonResponse<RetrainOutcome>>> {
    let force = body.map(|Json(b)| b.force).unwrap_or_default();
    let outcome = retrain(&state)?.trigger(&model, force).await?;
    Ok(Json(JsonResponse::ok(outcome)))
}

async fn get_policy(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> AppResult<Json<JsonResponse<RetrainPolicy>>> {
    let policy = retrain(&state)?
        .policy(&model)
        .ok_or_else(|| ModelOpsError::ModelNotFound(model.clone()))?;
    Ok(Json(JsonResponse::ok(policy)))
}

async fn set_policy(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(policy): Json<RetrainPolicy>,
) -> AppResult<Json<JsonResponse<Value>>> {
    let trigger = retrain(&state)?;
    trigger.register_config(&model, policy)?;
    Ok(Json(JsonResponse::ok(json!({ "next_run_at": trigger.next_run_at(&model) }))))
}

async fn retrain_history(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> AppResult<Json<JsonResponse<Vec<RetrainOutcome>>>> {
    Ok(Json(JsonResponse::ok(retrain(&state)?.history(&model))))
}

// ── Deployments ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreatePlanBody {
    model_id: String,
    version: Version,
    environment: Environment,
    #[serde(default = "default_strategy")]
    strategy: DeploymentStrategy,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    scheduled_at: Option<DateTime<Utc>>,
}

fn default_strategy() -> DeploymentStrategy {
    DeploymentStrategy::Immediate
}

#[derive(Serialize)]
struct PlanCreated {
    plan: DeploymentPlan,
    outcome: ScheduleOutcome,
}

async fn create_plan(
    State(state): State<AppState>,
    Json(body): Json<CreatePlanBody>,
) -> AppResult<(StatusCode, Json<JsonResponse<PlanCreated>>)> {
    let orchestrator = state.ops.orchestrator();
    let mut plan = orchestrator.create_deployment_plan(
        &body.model_id,
        body.version,
        body.environment,
        body.strategy,
        TriggerSource::Manual,
        body.reason,
    )?;
    plan.scheduled_at = body.scheduled_at;
    let outcome = orchestrator.schedule_deployment(&plan)?;
    Ok((StatusCode::CREATED, Json(JsonResponse::ok(PlanCreated { plan, outcome }))))
}

async fn list_plans(State(state): State<AppState>) -> Json<JsonResponse<Vec<PlanView>>> {
    Json(JsonResponse::ok(state.ops.orchestrator().list_plans()))
}

async fn get_plan(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<Json<JsonResponse<PlanView>>> {
    Ok(Json(JsonResponse::ok(state.ops.orchestrator().get_plan(id)?)))
}

#[derive(Deserialize)]
struct ApproveBody {
    approver: String,
}

async fn approve_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ApproveBody>,
) -> AppResult<Json<JsonResponse<ScheduleOutcome>>> {
    Ok(Json(JsonResponse::ok(
        state.ops.orchestrator().approve_and_schedule(id, &body.approver)?,
    )))
}

#[derive(Deserialize)]
struct RejectBody {
    approver: String,
    #[serde(default)]
    reason: String,
}

async fn reject_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<RejectBody>,
) -> AppResult<Json<JsonResponse<DeploymentPlan>>> {
    Ok(Json(JsonResponse::ok(
        state.ops.orchestrator().reject_deployment(id, &body.approver, &body.reason)?,
    )))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JsonResponse<DeploymentExecution>>> {
    Ok(Json(JsonResponse::ok(state.ops.orchestrator().get_execution(id)?)))
}

#[derive(Deserialize)]
struct CancelBody {
    #[serde(default = "default_cancel_reason")]
    reason: String,
}

fn default_cancel_reason() -> String {
    "cancelled via API".to_string()
}

async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> AppResult<Json<JsonResponse<DeploymentExecution>>> {
    let reason = body.map(|Json(b)| b.reason).unwrap_or_else(default_cancel_reason);
    Ok(Json(JsonResponse::ok(
        state.ops.orchestrator().cancel_deployment(id, &reason)?,
    )))
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    20
}

async fn history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Json<JsonResponse<Vec<DeploymentExecution>>> {
    Json(JsonResponse::ok(state.ops.orchestrator().history(q.limit)))
}

async fn active(State(state): State<AppState>) -> Json<JsonResponse<Vec<DeploymentExecution>>> {
    Json(JsonResponse::ok(state.ops.orchestrator().active_executions()))
}

// ── Serving ───────────────────────────────────────────────────────────────────

async fn run_inference(state: &AppState, request: InferenceRequest) -> Response {
    let model = request.model_id.clone();
    let started = std::time::Instant::now();
    let result = state.ops.predict(request).await;
    let seconds = started.elapsed().as_secs_f64();
    match result {
        Ok(response) => {
            state.metrics.record_inference(&model, "ok", seconds);
            (StatusCode::OK, Json(JsonResponse::ok(response))).into_response()
        }
        Err(e) => {
            state.metrics.record_inference(&model, e.kind(), seconds);
            let body = json!({
                "success": false,
                "error": e.to_string(),
                "data": e.to_json(),
            });
            (status_for(&e.source), Json(body)).into_response()
        }
    }
}

async fn predict(State(state): State<AppState>, Json(request): Json<InferenceRequest>) -> Response {
    run_inference(&state, request).await
}

/// Inference through a registered endpoint path. The path decides the model;
/// a `modelId` in the body is ignored.
async fn serve_path(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Json(mut body): Json<Value>,
) -> AppResult<Response> {
    let path = format!("/{}", path.trim_start_matches('/'));
    let endpoint = state
        .ops
        .router()
        .endpoint_for_path(&path)
        .ok_or_else(|| ModelOpsError::ModelNotFound(format!("no endpoint at {}", path)))?;
    if let Value::Object(map) = &mut body {
        map.insert("modelId".into(), Value::String(endpoint.model_id.clone()));
    }
    let request: InferenceRequest = serde_json::from_value(body).map_err(ModelOpsError::from)?;
    Ok(run_inference(&state, request).await)
}

async fn list_endpoints(State(state): State<AppState>) -> Json<JsonResponse<Vec<ModelEndpoint>>> {
    Json(JsonResponse::ok(state.ops.router().endpoints()))
}

async fn register_endpoint(
    State(state): State<AppState>,
    Json(config): Json<EndpointConfig>,
) -> AppResult<(StatusCode, Json<JsonResponse<ModelEndpoint>>)> {
    let endpoint = state.ops.router().register_endpoint(config)?;
    Ok((StatusCode::CREATED, Json(JsonResponse::ok(endpoint))))
}

async fn list_instances(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Json<JsonResponse<Vec<ModelInstance>>> {
    Json(JsonResponse::ok(state.ops.router().instances(&model)))
}

#[derive(Deserialize)]
struct AddInstanceBody {
    version: Version,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    health_check_path: Option<String>,
    #[serde(default)]
    weight: Option<u32>,
}

async fn add_instance(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(body): Json<AddInstanceBody>,
) -> AppResult<(StatusCode, Json<JsonResponse<ModelInstance>>)> {
    let mut new = NewInstance::new(model, body.version);
    if let Some(target) = body.target {
        new = new.on_target(target);
    }
    if let Some(url) = body.url {
        new = new.with_url(url);
    }
    if let Some(path) = body.health_check_path {
        new.health_check_path = path;
    }
    if let Some(weight) = body.weight {
        new = new.with_weight(weight);
    }
    let router = state.ops.router();
    let instance = router.add_instance(new)?;
    // First probe right away so the instance does not wait a full sweep.
    router.probe_instances(&[instance.id]).await;
    let instance = router
        .instances(&instance.model_id)
        .into_iter()
        .find(|i| i.id == instance.id)
        .unwrap_or(instance);
    Ok((StatusCode::CREATED, Json(JsonResponse::ok(instance))))
}

async fn remove_instance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JsonResponse<ModelInstance>>> {
    Ok(Json(JsonResponse::ok(state.ops.router().remove_instance(id)?)))
}

#[derive(Deserialize)]
struct CanaryBody {
    version: Version,
    percentage: u8,
}

async fn set_canary(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(body): Json<CanaryBody>,
) -> AppResult<Json<JsonResponse<Option<ModelEndpoint>>>> {
    let router = state.ops.router();
    router.set_canary(&model, &body.version, body.percentage)?;
    Ok(Json(JsonResponse::ok(router.endpoint(&model))))
}

async fn clear_canary(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Json<JsonResponse<Option<CanaryRoute>>> {
    Json(JsonResponse::ok(state.ops.router().clear_canary(&model)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ModelOpsMetrics;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct Constant;

    #[async_trait]
    impl InferenceBackend for Constant {
        async fn predict(
            &self,
            _version: &ModelVersion,
            _instance: &ModelInstance,
            _input: &Value,
            _explain: bool,
        ) -> modelops_core::Result<Prediction> {
            Ok(Prediction::new(json!("loyal")).with_confidence(0.9))
        }
    }

    fn state() -> AppState {
        let ops = ModelOps::builder(ModelOpsConfig::default()).build().unwrap();
        ops.router().register_backend("segment-model", Arc::new(Constant));
        AppState::new(Arc::new(ops), Arc::new(ModelOpsMetrics::new()))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(b) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(b.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn artifact(accuracy: f64) -> Value {
        json!({
            "artifact": {
                "config": {"depth": 4},
                "weights": [1, 2, 3],
                "metrics": {"accuracy": accuracy, "loss": 0.2, "f1": 0.9}
            },
            "trainer": "ci"
        })
    }

    async fn wait_completed(app: &Router, plan_id: &str) {
        for _ in 0..200 {
            let (_, body) = send(app, "GET", &format!("/deployments/plans/{}", plan_id), None).await;
            if body["data"]["state"] == "completed" {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("plan {} did not complete", plan_id);
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let app = create_router(state());
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["models"], 0);
    }

    #[tokio::test]
    async fn register_then_promote_respects_thresholds() {
        let app = create_router(state());
        let (status, body) = send(&app, "POST", "/models/churn/versions", Some(artifact(0.88))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["version"], "1.0.0");
        assert_eq!(body["data"]["status"], "experimental");

        let (status, _) = send(
            &app,
            "POST",
            "/models/churn/versions/1.0.0/promote",
            Some(json!({"status": "staging"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(
            &app,
            "POST",
            "/models/churn/versions/1.0.0/promote",
            Some(json!({"status": "production"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["success"], false);

        let (status, _) = send(&app, "GET", "/models/churn/versions/9.9.9", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn production_plan_waits_for_approval_then_serves() {
        let app = create_router(state());
        send(&app, "POST", "/models/segment-model/versions", Some(artifact(0.95))).await;

        let (status, body) = send(&app, "POST", "/predict", Some(json!({"modelId": "segment-model", "input": {}}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["data"]["kind"], "model_not_available");

        let (status, body) = send(
            &app,
            "POST",
            "/deployments/plans",
            Some(json!({
                "model_id": "segment-model",
                "version": "1.0.0",
                "environment": "production",
                "reason": "first release"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["outcome"]["outcome"], "awaiting_approval");
        let plan_id = body["data"]["plan"]["id"].as_str().unwrap().to_string();

        let (_, body) = send(&app, "GET", &format!("/deployments/plans/{}", plan_id), None).await;
        assert!(body["data"]["wait_reason"].as_str().unwrap().contains("approval"));

        let (status, body) = send(
            &app,
            "POST",
            &format!("/deployments/plans/{}/approve", plan_id),
            Some(json!({"approver": "release-manager"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["outcome"], "started");
        wait_completed(&app, &plan_id).await;

        let (status, body) = send(
            &app,
            "POST",
            "/predict",
            Some(json!({"modelId": "segment-model", "input": {"recency": 2}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["modelVersion"], "1.0.0");
        assert_eq!(body["data"]["prediction"], "loyal");

        // Approving twice is a state conflict.
        let (status, _) = send(
            &app,
            "POST",
            &format!("/deployments/plans/{}/approve", plan_id),
            Some(json!({"approver": "release-manager"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn endpoint_paths_route_to_their_model() {
        let app = create_router(state());
        send(&app, "POST", "/models/segment-model/versions", Some(artifact(0.95))).await;
        let (status, _) = send(
            &app,
            "POST",
            "/endpoints",
            Some(json!({"model_id": "segment-model", "path": "/segments/score"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = send(
            &app,
            "POST",
            "/models/segment-model/instances",
            Some(json!({"version": "1.0.0"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            &app,
            "POST",
            "/serve/segments/score",
            Some(json!({"modelVersion": "1.0.0", "input": {"recency": 1}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["data"]["modelId"], "segment-model");

        let (status, _) = send(&app, "POST", "/serve/nowhere", Some(json!({"input": 1}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn retrain_routes_need_a_trainer() {
        let app = create_router(state());
        let (status, body) = send(&app, "POST", "/models/churn/retrain", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("disabled"));
    }

    #[tokio::test]
    async fn metrics_are_exposed_as_text() {
        let st = state();
        let app = create_router(st.clone());
        send(&app, "POST", "/predict", Some(json!({"modelId": "segment-model", "input": {}}))).await;
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = String::from_utf8(to_bytes(resp.into_body(), 1 << 20).await.unwrap().to_vec()).unwrap();
        assert!(text.contains("modelops_inference_requests_total"));
        assert!(text.contains("model_not_available"));
    }
}
