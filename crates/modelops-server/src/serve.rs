use crate::config::AppConfig;
use crate::http::{self, AppState, ModelOpsMetrics};
use crate::nats::{EventBridge, FeedbackIngest, NatsNotifier};
use crate::remote::{HttpBackend, HttpHealthProbe, HttpTrainer};
use modelops_core::{topics, FanoutNotifier, LogNotifier, ModelOps, ModelOpsEvent, Notifier};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let errors = config.validate();
    if !errors.is_empty() {
        anyhow::bail!("invalid configuration: {}", errors.join("; "));
    }
    let addr = config.http_addr()?;

    info!("Starting ModelOps server v{}", env!("CARGO_PKG_VERSION"));
    info!("HTTP: {}", addr);

    // Optionally connect to NATS
    let nats = if config.server.nats_enabled {
        info!("Connecting to NATS at {}...", config.server.nats_url);
        match async_nats::connect(&config.server.nats_url).await {
            Ok(client) => {
                info!("NATS connected");
                Some(client)
            }
            Err(e) => {
                error!("Failed to connect to NATS: {}", e);
                error!("Continuing without NATS bridge");
                None
            }
        }
    } else {
        info!("NATS bridge disabled");
        None
    };
    let prefix = config.server.subject_prefix.clone();

    let notifier: Arc<dyn Notifier> = match &nats {
        Some(client) => Arc::new(FanoutNotifier::new(vec![
            Arc::new(LogNotifier),
            Arc::new(NatsNotifier::new(client.clone(), prefix.clone())),
        ])),
        None => Arc::new(LogNotifier),
    };

    let mut builder = ModelOps::builder(config.engine.clone())
        .notifier(notifier)
        .probe(Arc::new(HttpHealthProbe::new(Duration::from_millis(config.probe.timeout_ms))?));
    match &config.trainer.url {
        Some(url) => {
            info!("Retraining via {}", url);
            builder = builder.trainer(Arc::new(HttpTrainer::new(
                url,
                Duration::from_secs(config.trainer.timeout_secs),
            )?));
        }
        None => warn!("No [trainer] url configured; retraining disabled"),
    }
    let ops = Arc::new(builder.build()?);
    let mut tasks = ops.spawn_background();

    let metrics = Arc::new(ModelOpsMetrics::new());
    tasks.push(tokio::spawn(observe_events(metrics.clone(), ops.events().subscribe_all())));

    if config.server.remote_backends {
        tasks.push(tokio::spawn(attach_backends(
            ops.clone(),
            ops.events().subscribe(topics::VERSION_REGISTERED),
        )));
    }

    if let Some(client) = nats {
        let bridge = EventBridge::new(client.clone(), prefix.clone());
        tasks.push(tokio::spawn(bridge.run(ops.events().subscribe_all())));

        let ingest = FeedbackIngest::new(client, &prefix, ops.monitor().clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = ingest.start().await {
                error!("NATS feedback consumer failed: {}", e);
            }
        }));
    }

    // Start HTTP server
    let http_task = {
        let app = http::create_router(AppState::new(ops.clone(), metrics))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive());
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tokio::spawn(async move {
            info!("Starting HTTP server on {}", addr);
            if let Err(e) = axum::serve(listener, app).await {
                error!("HTTP server failed: {}", e);
            }
        })
    };

    info!("ModelOps server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, terminating...");

    http_task.abort();
    for task in tasks {
        task.abort();
    }
    let active = ops.orchestrator().active_executions();
    if !active.is_empty() {
        warn!("{} deployment(s) were still running at shutdown", active.len());
    }

    Ok(())
}

async fn observe_events(metrics: Arc<ModelOpsMetrics>, mut rx: broadcast::Receiver<modelops_core::Envelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => metrics.observe(&envelope),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("metrics observer lagged by {} event(s)", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Models get the HTTP backend the first time one of their versions is registered.
async fn attach_backends(ops: Arc<ModelOps>, mut rx: broadcast::Receiver<modelops_core::Envelope>) {
    let backend = Arc::new(HttpBackend::new());
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if let ModelOpsEvent::VersionRegistered { model_id, .. } = &envelope.event {
                    if !ops.router().has_backend(model_id) {
                        info!("attaching HTTP inference backend to {}", model_id);
                        ops.router().register_backend(model_id, backend.clone());
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("backend attacher lagged by {} event(s)", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
