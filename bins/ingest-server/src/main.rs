mod backends;
mod error;

use std::process::ExitCode;

use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use error::ServerError;
use ingest_api_server::ApiState;
use ingest_config_hcl::HclParser;
use ingest_engine::{Health, IngestConfig, Pipeline, TomlParser};

#[derive(Parser)]
#[command(name = "ingest-server", about = "Market-data ingestion and batching server")]
struct Cli {
    /// Path to the configuration file (`.toml` or `.hcl`).
    #[arg(long, default_value = "config.toml", env = "INGEST_CONFIG")]
    config: String,
}

fn load_config(path: &str) -> Result<IngestConfig, ServerError> {
    Ok(IngestConfig::load_with(path, &[&TomlParser, &HclParser])?)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "ingest-server stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), ServerError> {
    tracing::info!(config = %cli.config, "loading configuration");
    let config = load_config(&cli.config)?;

    let backends = backends::build(&config).await?;
    let api_port = config.api_port;
    let topic = config.topic.clone();
    tracing::info!(
        topic = %topic,
        partitions = ?config.partitions,
        schemas = config.schemas.len(),
        "starting pipeline"
    );
    let mut pipeline = Pipeline::start(config, backends.deps).await?;

    let api_token = CancellationToken::new();
    let state = ApiState {
        metrics: pipeline.metrics(),
        health: pipeline.health(),
        publisher: backends.publisher,
        topic,
    };
    let mut api = Some(tokio::spawn(ingest_api_server::run(api_port, state, api_token.clone())));

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut health = pipeline.health();

    tracing::info!("ingest-server started, press Ctrl+C to stop");

    let outcome = loop {
        tokio::select! {
            _ = sighup.recv() => {
                tracing::info!(config = %cli.config, "SIGHUP received, reloading configuration");
                let reloaded = match load_config(&cli.config) {
                    Ok(new) => pipeline.reload(new).await.map_err(ServerError::from),
                    Err(e) => Err(e),
                };
                match reloaded {
                    Ok(()) => tracing::info!("configuration reloaded"),
                    Err(e) => tracing::error!(error = %e, "configuration reload failed (keeping old config)"),
                }
            }
            _ = tokio::signal::ctrl_c() => break Ok(()),
            _ = sigterm.recv() => break Ok(()),
            changed = health.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let fatal = match &*health.borrow_and_update() {
                    Health::Fatal(reason) => Some(reason.clone()),
                    Health::Healthy => None,
                };
                if let Some(reason) = fatal {
                    break Err(ServerError::Fatal(reason));
                }
            }
            res = async { api.as_mut()?.await.ok() }, if api.is_some() => {
                api = None;
                if let Some(Err(e)) = res {
                    break Err(ServerError::Api(e));
                }
            }
        }
    };

    tracing::info!("shutting down");
    pipeline.shutdown().await;
    api_token.cancel();
    if let Some(handle) = api {
        match handle.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "api server error during shutdown"),
            Err(e) => tracing::warn!(error = %e, "api server task failed"),
            Ok(Ok(())) => {}
        }
    }
    outcome
}
