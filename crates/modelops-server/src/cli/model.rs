use super::{PredictArgs, PromoteArgs, RetrainArgs, VersionsArgs};
use anyhow::{Context, Result};
use modelops_client::ModelOpsClient;
use modelops_core::serving::InferenceOptions;
use modelops_core::InferenceRequest;

pub async fn versions(args: VersionsArgs, server: &str) -> Result<()> {
    let client = ModelOpsClient::new(server);
    let Some(model) = args.model else {
        let models = client.list_models().await?;
        if args.format == "json" {
            println!("{}", serde_json::to_string_pretty(&models)?);
        } else if models.is_empty() {
            println!("(no models registered)");
        } else {
            for model in &models {
                println!("{}", model);
            }
        }
        return Ok(());
    };

    let versions = client.list_versions(&model).await?;
    if args.format == "json" {
        println!("{}", serde_json::to_string_pretty(&versions)?);
        return Ok(());
    }
    if versions.is_empty() {
        println!("(no versions of {})", model);
        return Ok(());
    }

    println!(
        "{:<9}  {:<12}  {:>8}  {:>8}  {:>8}  {:<16}  {}",
        "VERSION", "STATUS", "ACCURACY", "LOSS", "F1", "TRAINER", "CREATED"
    );
    println!("{}", "─".repeat(90));
    for v in &versions {
        println!(
            "{:<9}  {:<12}  {:>8.4}  {:>8.4}  {:>8.4}  {:<16}  {}",
            v.version.to_string(),
            v.status.to_string(),
            v.metrics.accuracy,
            v.metrics.loss,
            v.metrics.f1,
            v.metadata.trainer,
            v.metadata.created_at.format("%Y-%m-%d %H:%M"),
        );
    }
    Ok(())
}

pub async fn promote(args: PromoteArgs, server: &str) -> Result<()> {
    let client = ModelOpsClient::new(server);
    let updated = client.promote(&args.model, &args.version, args.status).await?;
    println!("✅ {} is now {}", updated.key(), updated.status);
    Ok(())
}

pub async fn predict(args: PredictArgs, server: &str) -> Result<()> {
    let input: serde_json::Value =
        serde_json::from_str(&args.input).context("input must be a JSON document")?;
    let mut request = InferenceRequest::new(&args.model, input);
    if let Some(version) = args.version {
        request = request.pinned(version);
    }
    if args.explain {
        request = request.with_options(InferenceOptions {
            explain_prediction: true,
            ..InferenceOptions::default()
        });
    }

    let client = ModelOpsClient::new(server);
    let response = client.predict(&request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    for warning in &response.warnings {
        eprintln!("warning: {}", warning);
    }
    Ok(())
}

pub async fn retrain(args: RetrainArgs, server: &str) -> Result<()> {
    let client = ModelOpsClient::new(server);
    let outcome = client.trigger_retrain(&args.model, args.force).await?;
    println!("Retrain of {}: {}", outcome.model_id, outcome.status.as_str());
    if !outcome.triggers.is_empty() {
        println!("  triggers: {}", outcome.triggers.join(", "));
    }
    if let Some(reason) = &outcome.reason {
        println!("  reason:   {}", reason);
    }
    if let Some(version) = &outcome.version {
        println!("  version:  {}@{}", outcome.model_id, version);
    }
    Ok(())
}
