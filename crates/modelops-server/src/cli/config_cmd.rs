use super::{ConfigCommands, ConfigShowArgs};
use crate::config::AppConfig;
use anyhow::{bail, Context, Result};
use modelops_core::Environment;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Top-level sections of `modelops.toml`, in display order.
pub const SECTIONS: [&str; 9] = [
    "server",
    "probe",
    "trainer",
    "registry",
    "monitor",
    "retrain",
    "orchestrator",
    "serving",
    "reactions",
];

pub async fn run(cmd: ConfigCommands, config_path: &Path) -> Result<()> {
    match cmd {
        ConfigCommands::Validate => validate(config_path),
        ConfigCommands::Show(args) => show(args, config_path),
    }
}

fn validate(config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let problems = config.validate();
    print!("{}", report(&problems));
    if !problems.is_empty() {
        bail!("{} problem(s) in {}", problems.len(), config_path.display());
    }
    println!("{} is valid", config_path.display());
    Ok(())
}

fn show(args: ConfigShowArgs, config_path: &Path) -> Result<()> {
    let config = AppConfig::load_or_default(config_path)?;
    println!("{}", render(&config, args.section.as_deref(), &args.format)?);
    Ok(())
}

/// Section a validation message belongs to.
fn section_of(problem: &str) -> &'static str {
    if problem.starts_with("target ") || problem.contains("deployment target") {
        return "orchestrator";
    }
    SECTIONS
        .iter()
        .copied()
        .find(|s| problem.contains(&format!("{}.", s)))
        .unwrap_or("general")
}

pub fn group_problems(problems: &[String]) -> BTreeMap<&'static str, Vec<String>> {
    let mut grouped: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for p in problems {
        grouped.entry(section_of(p)).or_default().push(p.clone());
    }
    grouped
}

/// One line per section, followed by its problems.
pub fn report(problems: &[String]) -> String {
    let grouped = group_problems(problems);
    let mut out = String::new();
    for section in SECTIONS.iter().copied().chain(["general"]) {
        match grouped.get(section) {
            Some(list) => {
                out.push_str(&format!("{:<14} {} problem(s)\n", section, list.len()));
                for p in list {
                    out.push_str(&format!("  - {}\n", p));
                }
            }
            None if section != "general" => out.push_str(&format!("{:<14} ok\n", section)),
            None => {}
        }
    }
    out
}

/// Snake-case name a value serializes to.
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => "?".to_string(),
    }
}

fn pct(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

fn list(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

type Rows = Vec<(String, String)>;

fn rows<const N: usize>(pairs: [(&str, String); N]) -> Rows {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Effective values of every section, in display order.
pub fn summary(config: &AppConfig) -> Vec<(&'static str, Rows)> {
    let server = &config.server;
    let engine = &config.engine;
    let registry = &engine.registry;
    let monitor = &engine.monitor;
    let alerts = &monitor.default_alerts;
    let retrain = &engine.retrain;
    let orch = &engine.orchestrator;
    let serving = &engine.serving;
    let reactions = &engine.reactions;

    let mut orchestrator = rows([
        ("scan_interval", format!("{}s", orch.scan_interval_secs)),
        ("canary_percentage", format!("{}%", orch.canary_percentage)),
        (
            "step_retries",
            format!("{} (backoff {}ms)", orch.step_retries, orch.retry_backoff_ms),
        ),
        ("step_timeout", format!("{}s", orch.step_timeout_secs)),
        ("history_limit", orch.history_limit.to_string()),
        ("approval_channels", list(&orch.approval_channels)),
        ("notification_channels", list(&orch.notification_channels)),
    ]);
    for env in Environment::ALL {
        let targets: Vec<String> = orch
            .targets
            .iter()
            .filter(|t| t.environment == env)
            .map(|t| {
                format!(
                    "{} ({} replica(s), rollback above {})",
                    t.name,
                    t.resources.replicas,
                    pct(t.rollback_error_rate)
                )
            })
            .collect();
        orchestrator.push((format!("targets.{}", env), list(&targets)));
    }

    vec![
        (
            "server",
            rows([
                ("http_addr", server.http_addr.clone()),
                (
                    "nats",
                    if server.nats_enabled {
                        server.nats_url.clone()
                    } else {
                        "disabled".to_string()
                    },
                ),
                ("subject_prefix", server.subject_prefix.clone()),
                ("remote_backends", server.remote_backends.to_string()),
            ]),
        ),
        ("probe", rows([("timeout", format!("{}ms", config.probe.timeout_ms))])),
        (
            "trainer",
            rows([
                (
                    "url",
                    config.trainer.url.clone().unwrap_or_else(|| "(retraining disabled)".into()),
                ),
                ("timeout", format!("{}s", config.trainer.timeout_secs)),
            ]),
        ),
        (
            "registry",
            rows([
                ("staging_threshold", format!("{:.2}", registry.staging_threshold)),
                ("production_threshold", format!("{:.2}", registry.production_threshold)),
                ("retain_versions", registry.retain_versions.to_string()),
                ("increment", label(&registry.increment)),
            ]),
        ),
        (
            "monitor",
            rows([
                ("rolling_window", format!("{}s", monitor.rolling_window_secs)),
                (
                    "retention",
                    format!("{} day(s), swept every {}s", monitor.retention_days, monitor.retention_sweep_secs),
                ),
                ("max_samples_per_model", monitor.max_samples_per_model.to_string()),
                (
                    "drift",
                    format!(
                        "window {}, reference after {} input(s)",
                        monitor.drift_window, monitor.reference_sample_size
                    ),
                ),
                (
                    "alerts",
                    format!(
                        "accuracy >= {:.2}, loss <= {:.2}, drift <= {:.2}, errors <= {}, latency {}",
                        alerts.thresholds.min_accuracy,
                        alerts.thresholds.max_loss,
                        alerts.thresholds.max_drift,
                        pct(alerts.thresholds.max_error_rate),
                        alerts
                            .thresholds
                            .max_latency_ms
                            .map(|ms| format!("<= {:.0}ms", ms))
                            .unwrap_or_else(|| "unchecked".into()),
                    ),
                ),
                (
                    "alert_delivery",
                    format!(
                        "{} after {} sample(s), cooldown {}s",
                        list(&alerts.channels),
                        monitor.min_samples_for_alert,
                        alerts.cooldown_secs
                    ),
                ),
            ]),
        ),
        (
            "retrain",
            rows([
                ("tick", format!("{}s", retrain.tick_secs)),
                ("history_limit", retrain.history_limit.to_string()),
                ("trainer_name", retrain.trainer_name.clone()),
            ]),
        ),
        ("orchestrator", orchestrator),
        (
            "serving",
            rows([
                ("default_strategy", label(&serving.default_strategy)),
                ("health_interval", format!("{}s", serving.health_interval_secs)),
                ("warmup_grace", format!("{}s", serving.warmup_grace_secs)),
                ("default_timeout", format!("{}ms", serving.default_timeout_ms)),
                ("max_retries", serving.max_retries.to_string()),
                (
                    "warnings",
                    format!(
                        "errors above {} after {} request(s), latency above {:.0}ms, confidence below {:.2}",
                        pct(serving.warn_error_rate),
                        serving.min_requests_for_error_warning,
                        serving.warn_latency_ms,
                        serving.low_confidence
                    ),
                ),
            ]),
        ),
        (
            "reactions",
            rows([
                ("rollback_on_degradation", reactions.rollback_on_degradation.to_string()),
                ("retrain_on_alert", reactions.retrain_on_alert.to_string()),
                (
                    "deploy_after_retrain",
                    if reactions.deploy_after_retrain {
                        format!("to {} via {}", reactions.retrain_environment, reactions.retrain_strategy)
                    } else {
                        "false".to_string()
                    },
                ),
            ]),
        ),
    ]
}

/// TOML has no null; drop unset options before serializing.
fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

/// The configuration (or one section of it) as `table`, `toml` or `json`.
pub fn render(config: &AppConfig, section: Option<&str>, format: &str) -> Result<String> {
    if let Some(name) = section {
        if !SECTIONS.contains(&name) {
            bail!("unknown section '{}' (one of: {})", name, SECTIONS.join(", "));
        }
    }
    match format {
        "table" => {
            let mut out = String::new();
            for (name, rows) in summary(config) {
                if section.map_or(false, |s| s != name) {
                    continue;
                }
                out.push_str(&format!("[{}]\n", name));
                for (key, value) in rows {
                    out.push_str(&format!("  {:<24} {}\n", key, value));
                }
            }
            Ok(out.trim_end().to_string())
        }
        "toml" | "json" => {
            let mut value = serde_json::to_value(config).context("failed to serialize config")?;
            if let Some(name) = section {
                let mut only = serde_json::Map::new();
                only.insert(name.to_string(), value.get(name).cloned().unwrap_or(Value::Null));
                value = Value::Object(only);
            }
            if format == "json" {
                return Ok(serde_json::to_string_pretty(&value)?);
            }
            strip_nulls(&mut value);
            toml::to_string_pretty(&value).context("failed to serialize config as TOML")
        }
        other => bail!("unknown format '{}' (table, toml or json)", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn problems_are_grouped_by_section() {
        let mut config = AppConfig::default();
        config.server.http_addr = "nowhere".into();
        config.engine.registry.staging_threshold = 0.99;
        config.engine.orchestrator.targets[0].rollback_error_rate = 2.0;
        let grouped = group_problems(&config.validate());

        assert_eq!(grouped.keys().copied().collect::<Vec<_>>(), vec!["orchestrator", "registry", "server"]);
        assert!(grouped["registry"][0].contains("exceeds"));

        let text = report(&config.validate());
        assert!(text.contains("monitor        ok"));
        assert!(text.contains("registry       1 problem(s)"));
    }

    #[test]
    fn clean_config_reports_every_section_ok() {
        let text = report(&AppConfig::default().validate());
        assert_eq!(text.lines().count(), SECTIONS.len());
        assert!(text.lines().all(|l| l.ends_with(" ok")));
    }

    #[test]
    fn summary_shows_effective_engine_values() {
        let mut config = AppConfig::default();
        config.engine.registry.production_threshold = 0.97;
        let summary = summary(&config);
        let names: Vec<&str> = summary.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, SECTIONS.to_vec());

        let table = render(&config, None, "table").unwrap();
        assert!(table.contains("production_threshold     0.97"));
        assert!(table.contains("prod-east (3 replica(s), rollback above 2.0%)"));
        assert!(table.contains("round_robin"));
        assert!(table.contains("(retraining disabled)"));
    }

    #[test]
    fn single_section_renders_as_toml() {
        let text = render(&AppConfig::default(), Some("trainer"), "toml").unwrap();
        let back: toml::Value = toml::from_str(&text).unwrap();
        assert_eq!(back["trainer"]["timeout_secs"].as_integer(), Some(3600));
        assert!(back["trainer"].get("url").is_none());
        assert!(back.get("server").is_none());

        let table = render(&AppConfig::default(), Some("registry"), "table").unwrap();
        assert!(table.starts_with("[registry]"));
        assert!(!table.contains("[monitor]"));
    }

    #[test]
    fn full_toml_reloads_into_same_config() {
        let text = render(&AppConfig::default(), None, "toml").unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.engine.orchestrator.targets.len(), AppConfig::default().engine.orchestrator.targets.len());
        assert!(back.validate().is_empty());
    }

    #[test]
    fn unknown_section_or_format_is_rejected() {
        assert!(render(&AppConfig::default(), Some("cache"), "table").is_err());
        assert!(render(&AppConfig::default(), None, "yaml").is_err());
    }
}
