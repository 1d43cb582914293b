use crate::cli::ServeArgs;
use modelops_core::ModelOpsConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Contents of `modelops.toml`. Engine sections (`[registry]`, `[monitor]`,
/// `[orchestrator]`, ...) sit at the top level next to `[server]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub probe: ProbeSection,
    pub trainer: TrainerSection,
    #[serde(flatten)]
    pub engine: ModelOpsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub http_addr: String,
    pub nats_enabled: bool,
    pub nats_url: String,
    /// Prefix for every subject the server publishes or consumes.
    pub subject_prefix: String,
    /// Register the HTTP inference backend for every model that gets a version.
    pub remote_backends: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:9400".to_string(),
            nats_enabled: false,
            nats_url: "nats://localhost:4222".to_string(),
            subject_prefix: "modelops".to_string(),
            remote_backends: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub timeout_ms: u64,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

/// External training service. Retraining is disabled when `url` is unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSection {
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for TrainerSection {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 3600,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Missing file means defaults; a file that does not parse is still an error.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("{} not found, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Command-line and environment values win over the file.
    pub fn apply_overrides(&mut self, args: &ServeArgs) {
        if let Some(addr) = &args.http_addr {
            self.server.http_addr = addr.clone();
        }
        if let Some(url) = &args.nats_url {
            self.server.nats_url = url.clone();
            self.server.nats_enabled = true;
        }
        if let Some(url) = &args.trainer_url {
            self.trainer.url = Some(url.clone());
        }
    }

    pub fn http_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server
            .http_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.http_addr '{}': {}", self.server.http_addr, e))
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.engine.problems();
        if let Err(e) = self.http_addr() {
            errors.push(e.to_string());
        }
        if self.server.subject_prefix.is_empty() || self.server.subject_prefix.contains(char::is_whitespace) {
            errors.push("server.subject_prefix must be a non-empty token".into());
        }
        if self.probe.timeout_ms == 0 {
            errors.push("probe.timeout_ms must be positive".into());
        }
        if let Some(url) = &self.trainer.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("trainer.url must be an http(s) URL, got '{}'", url));
            }
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_sections_sit_at_top_level() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            http_addr = "127.0.0.1:8080"

            [registry]
            production_threshold = 0.95

            [orchestrator]
            canary_percentage = 25
            "#,
        )
        .unwrap();
        assert_eq!(config.http_addr().unwrap().port(), 8080);
        assert_eq!(config.engine.registry.production_threshold, 0.95);
        assert_eq!(config.engine.orchestrator.canary_percentage, 25);
        assert_eq!(config.engine.registry.staging_threshold, 0.85);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn defaults_round_trip_through_toml() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let back: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.server.http_addr, "0.0.0.0:9400");
        assert_eq!(back.engine.orchestrator.targets.len(), AppConfig::default().engine.orchestrator.targets.len());
    }

    #[test]
    fn nats_override_turns_the_bridge_on() {
        let mut config = AppConfig::default();
        config.apply_overrides(&ServeArgs {
            nats_url: Some("nats://bus:4222".into()),
            ..ServeArgs::default()
        });
        assert!(config.server.nats_enabled);
        assert_eq!(config.server.nats_url, "nats://bus:4222");
        assert_eq!(config.server.http_addr, "0.0.0.0:9400");
    }

    #[test]
    fn bad_values_are_reported_together() {
        let mut config = AppConfig::default();
        config.server.http_addr = "nowhere".into();
        config.engine.registry.staging_threshold = 0.99;
        config.trainer.url = Some("ftp://trainer".into());
        let errors = config.validate();
        assert_eq!(errors.len(), 3, "{:?}", errors);
    }
}
