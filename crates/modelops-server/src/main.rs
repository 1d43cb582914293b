mod cli;
mod config;
mod http;
mod nats;
mod remote;
mod serve;

use clap::Parser;
use cli::{Cli, Commands};
use config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let mut config = AppConfig::load_or_default(&cli.config)?;
            config.apply_overrides(&args);
            serve::run(config).await
        }
        Commands::Config(cmd) => cli::config_cmd::run(cmd, &cli.config).await,
        Commands::Plan(cmd) => cli::plan::run(cmd, &cli.server).await,
        Commands::Approve(args) => cli::plan::approve(args, &cli.server).await,
        Commands::Reject(args) => cli::plan::reject(args, &cli.server).await,
        Commands::Cancel(args) => cli::plan::cancel(args, &cli.server).await,
        Commands::Status(args) => cli::plan::status(args, &cli.server).await,
        Commands::History(args) => cli::plan::history(args, &cli.server).await,
        Commands::Versions(args) => cli::model::versions(args, &cli.server).await,
        Commands::Promote(args) => cli::model::promote(args, &cli.server).await,
        Commands::Predict(args) => cli::model::predict(args, &cli.server).await,
        Commands::Retrain(args) => cli::model::retrain(args, &cli.server).await,
    }
}
