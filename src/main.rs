//! wasmpipe CLI entry point.
//!
//! Loads the pipeline configuration, provisions every stage, and runs the
//! HTTP server until shutdown.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wasmpipe_common::ConfigFile;
use wasmpipe_server::PipelineServer;

/// HTTP middleware host executing WebAssembly modules as pipeline stages.
#[derive(Debug, Parser)]
#[command(name = "wasmpipe", version, about)]
struct Cli {
    /// Path to the pipeline configuration file.
    #[arg(short, long, env = "WASMPIPE_CONFIG", default_value = "wasmpipe.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wasmpipe=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    info!(config = %cli.config.display(), "Starting wasmpipe");

    let config = ConfigFile::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let server = PipelineServer::new(&config).context("pipeline provisioning failed")?;

    info!(
        stages = server.state().stages().len(),
        "Pipeline provisioned"
    );

    server.run().await.context("server failed")?;

    Ok(())
}
