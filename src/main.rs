// src/main.rs

//! The main entry point for the shardd control-plane binary.

use anyhow::Result;
use shardd::central;
use shardd::central::config::CentralConfig;
use shardd::config::Config;
use shardd::supervisor;
use std::env;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    // Define version information.
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    // Collect command-line arguments to decide the execution mode.
    let args: Vec<String> = env::args().collect();

    // Handle the --version flag.
    if args.contains(&"--version".to_string()) {
        println!("shardd version {VERSION}");
        return Ok(());
    }

    // Check if the --central flag is present to run as the cluster head.
    if args.len() > 1 && args[1] == "--central" {
        // --- Cluster Head Mode ---

        if args.len() < 3 {
            eprintln!("Usage: shardd --central /path/to/central.toml [--cluster-name NAME]");
            std::process::exit(1);
        }
        let config_path = &args[2];

        let mut config = match CentralConfig::from_file(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{config_path}\": {e}");
                std::process::exit(1);
            }
        };

        // The spawning supervisor passes the fleet's cluster name on the
        // command line; it overrides whatever the file says.
        if let Some(index) = args.iter().position(|arg| arg == "--cluster-name") {
            match args.get(index + 1) {
                Some(name) => config.cluster_name = name.clone(),
                None => {
                    eprintln!("--cluster-name flag requires a value");
                    std::process::exit(1);
                }
            }
        }

        // Initialize logging for cluster-head mode, defaulting to a more
        // verbose level for the head's own modules.
        let log_level = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| format!("{},shardd::central=debug", config.log_level));
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .with_ansi(true)
            .init();

        if let Err(e) = central::run(config).await {
            error!("Cluster head runtime error: {}", e);
            return Err(e);
        }
    } else {
        // --- Supervisor Mode ---

        // Determine the configuration path. It can be provided via a
        // --config flag; otherwise, it defaults to "shardd.toml".
        let config_path = args
            .iter()
            .position(|arg| arg == "--config")
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
            .unwrap_or("shardd.toml");

        let mut config = match Config::from_file(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{config_path}\": {e}");
                std::process::exit(1);
            }
        };

        // Override the node label if provided as a command-line argument.
        if let Some(index) = args.iter().position(|arg| arg == "--node-label") {
            match args.get(index + 1) {
                Some(label) => config.node_label = Some(label.clone()),
                None => {
                    eprintln!("--node-label flag requires a value");
                    std::process::exit(1);
                }
            }
        }

        // Setup logging with reloading capabilities.
        let initial_log_level =
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
        let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .compact() // Use the compact, single-line format.
                    .with_ansi(true), // Enable ANSI color codes for log levels.
            )
            .init();

        // The supervisor's console `logLevel` command swaps the filter
        // through this handle at runtime.
        let reload_handle = std::sync::Arc::new(reload_handle);

        if let Err(e) = supervisor::run(config, reload_handle).await {
            error!("Supervisor runtime error: {}", e);
            return Err(e);
        }
    }

    Ok(())
}
