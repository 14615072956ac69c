//! Server binary: load configuration, build the orchestrator, serve HTTP.

use anyhow::Context;
use clap::{Parser, Subcommand};
use conductor::config::{ConfigBundle, ConfigPaths};
use conductor::{ApiServer, Orchestrator};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "conductor", version, about = "Multi-agent request orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server.
    Serve {
        /// Orchestrator config file.
        #[arg(long, default_value = "config/orchestrator.yaml")]
        config: PathBuf,
        /// Agents config file.
        #[arg(long)]
        agents: Option<PathBuf>,
        /// Rules config file.
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Evaluators config file.
        #[arg(long)]
        evaluators: Option<PathBuf>,
        /// Output-schema catalogue file.
        #[arg(long)]
        schemas: Option<PathBuf>,
    },
    /// Load and validate the configuration, then exit.
    Check {
        #[arg(long, default_value = "config/orchestrator.yaml")]
        config: PathBuf,
        #[arg(long)]
        agents: Option<PathBuf>,
        #[arg(long)]
        rules: Option<PathBuf>,
        #[arg(long)]
        evaluators: Option<PathBuf>,
        #[arg(long)]
        schemas: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            config,
            agents,
            rules,
            evaluators,
            schemas,
        } => {
            let bundle = load_bundle(config, agents, rules, evaluators, schemas)?;
            let orchestrator = Arc::new(
                Orchestrator::builder(bundle)
                    .build()
                    .context("failed to build orchestrator")?,
            );
            tracing::info!(
                agents = orchestrator.registry().len(),
                provider = orchestrator.reasoning_provider().unwrap_or("none"),
                "orchestrator ready"
            );
            ApiServer::new(orchestrator).serve().await?;
        }
        Command::Check {
            config,
            agents,
            rules,
            evaluators,
            schemas,
        } => {
            let bundle = load_bundle(config, agents, rules, evaluators, schemas)?;
            println!(
                "configuration OK: {} agent(s), {} rule(s), {} evaluator(s), {} schema(s)",
                bundle.agents.len(),
                bundle.rules.len(),
                bundle.evaluators.len(),
                bundle.schema_files.len()
            );
        }
    }
    Ok(())
}

fn load_bundle(
    config: PathBuf,
    agents: Option<PathBuf>,
    rules: Option<PathBuf>,
    evaluators: Option<PathBuf>,
    schemas: Option<PathBuf>,
) -> anyhow::Result<ConfigBundle> {
    ConfigBundle::load(&ConfigPaths {
        orchestrator: config,
        agents,
        rules,
        evaluators,
        schemas,
    })
    .context("failed to load configuration")
}
