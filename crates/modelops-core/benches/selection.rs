use chrono::Utc;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use modelops_core::monitor::{MonitorConfig, PerformanceMonitor, PredictionSample};
use modelops_core::serving::{
    least_connections, pick_weighted, InstanceHealth, InstanceSelector, ModelInstance, RequestStats,
    RoundRobinSelector, WeightedSelector,
};
use modelops_core::{ServiceContext, Version};
use serde_json::json;
use uuid::Uuid;

fn pool(n: usize) -> Vec<ModelInstance> {
    (0..n)
        .map(|i| ModelInstance {
            id: Uuid::now_v7(),
            model_id: "bench".to_string(),
            version: Version::INITIAL,
            target: "local".to_string(),
            url: None,
            health_check_path: "/health".to_string(),
            weight: (i % 5 + 1) as u32,
            health: InstanceHealth::Healthy,
            active_connections: (i * 7 % 13) as u32,
            stats: RequestStats::default(),
            started_at: Utc::now(),
            last_probe_at: None,
            last_probe_error: None,
        })
        .collect()
}

fn bench_selectors(c: &mut Criterion) {
    let instances = pool(64);
    let refs: Vec<&ModelInstance> = instances.iter().collect();

    let rr = RoundRobinSelector::new();
    c.bench_function("round robin select (64)", |b| {
        b.iter(|| rr.select(Version::INITIAL, &refs))
    });

    c.bench_function("weighted select (64)", |b| {
        b.iter(|| WeightedSelector.select(Version::INITIAL, &refs))
    });

    let connections: Vec<u32> = instances.iter().map(|i| i.active_connections).collect();
    c.bench_function("least connections (64)", |b| b.iter(|| least_connections(&connections)));

    let weights: Vec<u32> = instances.iter().map(|i| i.weight).collect();
    c.bench_function("pick weighted (64)", |b| b.iter(|| pick_weighted(&weights, 0.73)));
}

fn bench_record_prediction(c: &mut Criterion) {
    c.bench_function("record prediction", |b| {
        b.iter_batched(
            || PerformanceMonitor::new(MonitorConfig::default(), ServiceContext::default()),
            |monitor| {
                for i in 0..100 {
                    let sample = PredictionSample::new(
                        json!({"recency": i, "frequency": i % 7}),
                        json!(i % 2),
                        12.5,
                    )
                    .with_ground_truth(json!(1));
                    monitor.record_prediction("bench", sample).ok();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_selectors, bench_record_prediction);
criterion_main!(benches);
