// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.

//! BantayBike relay server

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use bantaybike::{build_info, Config, Runtime, NAME, VERSION};

/// BantayBike - telemetry relay and theft-alert engine
#[derive(Parser, Debug)]
#[command(name = "bantaybike")]
#[command(version = VERSION)]
#[command(about = "MQTT relay and alert engine for the BantayBike lock unit")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable trace-level logging
    #[arg(long)]
    trace: bool,

    /// MQTT broker host
    #[arg(long)]
    broker: Option<String>,

    /// HTTP ingress port
    #[arg(long)]
    http_port: Option<u16>,

    /// Directory for the database and signal log
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging before anything that may warn
    let cli_level = if args.trace {
        Some(LevelFilter::TRACE)
    } else if args.debug {
        Some(LevelFilter::DEBUG)
    } else {
        None
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(cli_level.unwrap_or(LevelFilter::INFO).to_string()))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(args.debug)
        .with_line_number(args.debug)
        .with_filter_reloading();
    let log_filter = builder.reload_handle();
    tracing::subscriber::set_global_default(builder.finish())?;

    let build = build_info();
    info!("{} v{} ({}/{})", NAME, VERSION, build.os, build.target);

    // Load or create configuration, then layer env and CLI on top
    let config_path = args.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_create(&config_path)?;
    config.apply_env();

    if cli_level.is_none() {
        match config_level(&config.log_level) {
            Some(level) => {
                if let Err(e) = log_filter.reload(EnvFilter::new(level.to_string())) {
                    warn!("Could not apply log_level '{}': {}", config.log_level, e);
                }
            }
            None => warn!("Ignoring invalid log_level '{}'", config.log_level),
        }
    }

    if let Some(broker) = args.broker {
        config.broker.host = broker;
    }
    if let Some(port) = args.http_port {
        config.http.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.set_data_dir(data_dir);
    }
    config.validate()?;

    info!("Configuration loaded from {:?}", config_path);
    info!(
        "Broker {}:{} (tls: {}), HTTP port {}",
        config.broker.host, config.broker.port, config.broker.use_tls, config.http.port
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(Runtime::new(config).run())?;

    info!("{} shutdown complete", NAME);
    Ok(())
}

/// Level named by the `log_level` config value
fn config_level(value: &str) -> Option<LevelFilter> {
    value.trim().parse().ok()
}
