pub mod config_cmd;
pub mod model;
pub mod plan;

use clap::{Args, Parser, Subcommand};
use modelops_core::{Environment, Version, VersionStatus};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "modelops")]
#[command(version, about = "Model lifecycle control plane: registry, monitoring, retraining, deployment and serving")]
pub struct Cli {
    /// Path to modelops.toml
    #[arg(long, global = true, env = "MODELOPS_CONFIG", default_value = "modelops.toml")]
    pub config: PathBuf,

    /// ModelOps server address for client commands
    #[arg(long, global = true, env = "MODELOPS_ADDR", default_value = "http://localhost:9400")]
    pub server: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server and background schedulers
    Serve(ServeArgs),
    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Deployment plans
    #[command(subcommand)]
    Plan(PlanCommands),
    /// Approve a plan that is waiting for sign-off
    Approve(ApproveArgs),
    /// Reject a plan that is waiting for sign-off
    Reject(RejectArgs),
    /// Cancel a running execution
    Cancel(CancelArgs),
    /// Show one execution and its steps
    Status(StatusArgs),
    /// Recent deployment executions
    History(HistoryArgs),
    /// List registered models, or the versions of one model
    Versions(VersionsArgs),
    /// Change the lifecycle status of a version
    Promote(PromoteArgs),
    /// Send one inference request
    Predict(PredictArgs),
    /// Trigger retraining of a model
    Retrain(RetrainArgs),
}

/// Overrides applied on top of the config file.
#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    #[arg(long, env = "MODELOPS_HTTP_ADDR")]
    pub http_addr: Option<String>,
    /// Enables the NATS bridge at this URL
    #[arg(long, env = "MODELOPS_NATS_URL")]
    pub nats_url: Option<String>,
    #[arg(long, env = "MODELOPS_TRAINER_URL")]
    pub trainer_url: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Check the file and list problems per section
    Validate,
    /// Print the effective configuration, defaults filled in
    Show(ConfigShowArgs),
}

#[derive(Args, Debug)]
pub struct ConfigShowArgs {
    /// Only this section, e.g. registry or orchestrator
    #[arg(long)]
    pub section: Option<String>,
    /// table, toml or json
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Subcommand, Debug)]
pub enum PlanCommands {
    /// Create a plan and schedule it
    Create(PlanCreateArgs),
    List(PlanListArgs),
    Show(PlanShowArgs),
}

#[derive(Args, Debug)]
pub struct PlanCreateArgs {
    pub model: String,
    pub version: Version,
    /// development, staging or production
    #[arg(long, default_value = "staging")]
    pub env: Environment,
    /// immediate, rolling, blue-green or canary:<percent>
    #[arg(long, default_value = "immediate")]
    pub strategy: String,
    #[arg(long, default_value = "")]
    pub reason: String,
    /// RFC 3339 timestamp to run at instead of now
    #[arg(long)]
    pub at: Option<String>,
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct PlanListArgs {
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct PlanShowArgs {
    pub id: Uuid,
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct ApproveArgs {
    pub plan_id: Uuid,
    #[arg(long, env = "USER", default_value = "cli")]
    pub approver: String,
}

#[derive(Args, Debug)]
pub struct RejectArgs {
    pub plan_id: Uuid,
    #[arg(long, env = "USER", default_value = "cli")]
    pub approver: String,
    #[arg(long, default_value = "")]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct CancelArgs {
    pub execution_id: Uuid,
    #[arg(long, default_value = "cancelled from CLI")]
    pub reason: String,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    pub execution_id: Uuid,
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[arg(long, default_value = "20")]
    pub limit: usize,
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct VersionsArgs {
    /// Omit to list model ids
    pub model: Option<String>,
    #[arg(long, default_value = "table")]
    pub format: String,
}

#[derive(Args, Debug)]
pub struct PromoteArgs {
    pub model: String,
    pub version: Version,
    /// experimental, staging, production or archived
    pub status: VersionStatus,
}

#[derive(Args, Debug)]
pub struct PredictArgs {
    pub model: String,
    /// JSON input document
    pub input: String,
    /// Pin a version instead of the production one
    #[arg(long)]
    pub version: Option<Version>,
    #[arg(long)]
    pub explain: bool,
}

#[derive(Args, Debug)]
pub struct RetrainArgs {
    pub model: String,
    /// Skip the trigger criteria
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn plan_create_parses_typed_arguments() {
        let cli = Cli::try_parse_from([
            "modelops", "plan", "create", "churn", "1.2.0", "--env", "prod", "--strategy", "canary:10",
        ])
        .unwrap();
        match cli.command {
            Commands::Plan(PlanCommands::Create(args)) => {
                assert_eq!(args.version, Version::new(1, 2, 0));
                assert_eq!(args.env, Environment::Production);
                assert_eq!(args.strategy, "canary:10");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn serve_accepts_overrides() {
        let cli = Cli::try_parse_from(["modelops", "serve", "--http-addr", "127.0.0.1:9500"]).unwrap();
        match cli.command {
            Commands::Serve(args) => assert_eq!(args.http_addr.as_deref(), Some("127.0.0.1:9500")),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn config_show_takes_section_and_format() {
        let cli = Cli::try_parse_from(["modelops", "config", "show", "--section", "monitor", "--format", "toml"]).unwrap();
        match cli.command {
            Commands::Config(ConfigCommands::Show(args)) => {
                assert_eq!(args.section.as_deref(), Some("monitor"));
                assert_eq!(args.format, "toml");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn bad_version_is_a_usage_error() {
        assert!(Cli::try_parse_from(["modelops", "promote", "churn", "one", "staging"]).is_err());
    }
}
