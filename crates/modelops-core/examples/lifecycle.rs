//! Example: register, release, serve, and watch a model
//!
//! Run with: cargo run --example lifecycle

use async_trait::async_trait;
use modelops_core::serving::InferenceRequest;
use modelops_core::{
    DeploymentStrategy, Environment, InferenceBackend, ModelArtifact, ModelInstance, ModelMetrics, ModelOps,
    ModelOpsConfig, ModelVersion, Prediction, PredictionSample, VersionMetadata,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Scores a customer by recency and frequency.
struct RfmScorer;

#[async_trait]
impl InferenceBackend for RfmScorer {
    async fn predict(
        &self,
        version: &ModelVersion,
        _instance: &ModelInstance,
        input: &Value,
        explain: bool,
    ) -> modelops_core::Result<Prediction> {
        let recency = input["recency"].as_f64().unwrap_or(0.0);
        let frequency = input["frequency"].as_f64().unwrap_or(0.0);
        let score = (frequency / (1.0 + recency)).min(1.0);
        let mut prediction = Prediction::new(json!({"segment": if score > 0.5 { "loyal" } else { "at-risk" }}))
            .with_confidence(0.6 + score * 0.4);
        if explain {
            prediction.explanation = Some(json!({"score": score, "version": version.version.to_string()}));
        }
        Ok(prediction)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("=== ModelOps Lifecycle Example ===\n");

    let ops = ModelOps::builder(ModelOpsConfig::default()).build()?;
    let tasks = ops.spawn_background();
    ops.router().register_backend("segment-model", Arc::new(RfmScorer));

    println!("1. Registering a trained version...");
    let v1 = ops.registry().register(
        "segment-model",
        ModelArtifact {
            config: json!({"features": ["recency", "frequency"]}),
            weights: vec![0u8; 1024],
            metrics: ModelMetrics::new(0.93, 0.18, 0.91),
        },
        VersionMetadata::new("example"),
    )?;
    println!("   ✓ {} registered as {}\n", v1.key(), v1.status);

    println!("2. Releasing to production...");
    let (plan, outcome) = ops.deploy(
        "segment-model",
        v1.version,
        Environment::Production,
        DeploymentStrategy::Immediate,
        "first release",
    )?;
    println!("   plan {} -> {:?}", plan.id, outcome);
    ops.orchestrator().approve_and_schedule(plan.id, "example")?;
    for _ in 0..100 {
        if ops.registry().current_deployment("segment-model", Environment::Production).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    println!("   ✓ {} instance(s) serving\n", ops.router().instances("segment-model").len());

    println!("3. Serving predictions...");
    for (recency, frequency) in [(1.0, 12.0), (30.0, 2.0), (4.0, 9.0)] {
        let mut request = InferenceRequest::new("segment-model", json!({"recency": recency, "frequency": frequency}));
        request.options = Some(modelops_core::serving::InferenceOptions {
            explain_prediction: true,
            ..Default::default()
        });
        match ops.predict(request).await {
            Ok(response) => println!(
                "   {} -> {} (confidence {:?})",
                response.request_id, response.prediction, response.confidence
            ),
            Err(e) => println!("   ✗ {}", e),
        }
    }

    println!("\n4. Feeding ground truth to the monitor...");
    for i in 0..20 {
        let sample = PredictionSample::new(json!({"recency": i, "frequency": 5}), json!(1), 12.0)
            .with_ground_truth(json!(if i % 4 == 0 { 0 } else { 1 }));
        ops.monitor().record_prediction("segment-model", sample)?;
    }
    let perf = ops.monitor().get_model_performance("segment-model", None);
    println!(
        "   accuracy {:.2} over {} samples, drift {:.3}",
        perf.accuracy, perf.sample_count, perf.drift_score
    );

    for task in tasks {
        task.abort();
    }
    println!("\n=== Done ===");
    Ok(())
}
