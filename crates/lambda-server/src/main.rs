//! Function runner server
//!
//! Loads the engine configuration, warms the container pools in the
//! background and serves the execution API until Ctrl+C or SIGTERM, after
//! which every pooled container is removed.

use anyhow::Result;
use clap::Parser;
use lambda_core::{ConfigLoader, Engine};
use lambda_server::{shutdown_signal, LambdaServer, ServerConfig};
use log::LevelFilter;
use std::path::Path;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Lambda Server - Run code in warm containers over HTTP")]
struct Cli {
    #[clap(long, short, default_value = "lambda.yaml", help = "Configuration file; built-in defaults are used if it does not exist")]
    config: String,

    #[clap(long, default_value = "127.0.0.1:3001")]
    bind_addr: String,

    #[clap(long, short, default_value = "info")]
    log_level: String,

    #[clap(long, help = "Skip pre-starting containers; the first requests spawn them on demand")]
    no_warmup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let config = if Path::new(&cli.config).exists() {
        log::info!("Loading configuration from file: {}", cli.config);
        ConfigLoader::from_file(&cli.config).await?
    } else {
        log::warn!(
            "Configuration file {} not found, using defaults and environment",
            cli.config
        );
        ConfigLoader::from_env()?
    };
    log::info!(
        "Configuration loaded: pool size {}, timeout {}s, gVisor {}",
        config.pool.max_size,
        config.execution.timeout_secs,
        if config.runtimes.gvisor.enabled { "enabled" } else { "disabled" }
    );

    let engine = Arc::new(Engine::from_config(&config)?);

    if cli.no_warmup {
        log::info!("Warm-up skipped");
    } else {
        engine.start_warm_up();
    }
    let reaper = engine.start_reaper();

    let server_config = ServerConfig::default()
        .with_bind_addr_str(&cli.bind_addr)?
        .with_logging(true);

    log::info!("Starting lambda server on {}...", server_config.bind_addr);
    let server = LambdaServer::with_config(engine.clone(), server_config);

    let served = server.serve_with_shutdown(shutdown_signal()).await;

    reaper.abort();
    engine.shutdown().await;

    if let Err(e) = served {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }

    log::info!("Lambda server shut down gracefully.");
    Ok(())
}
