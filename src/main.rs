//! Configuration preflight for the MQTT agent gateway.
//!
//! Loads the configuration the way the broker-embedded gateway does (TOML
//! file plus environment overrides) and builds the gateway against a null
//! broker so that every issuer key parses. Run it before rolling a config
//! change out.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use mqtt_agent_gateway::{Config, Gateway, NullBroker};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// MQTT agent gateway configuration preflight
#[derive(Parser, Debug)]
#[command(name = "mqtt-agent-gateway")]
#[command(version)]
#[command(about = "Validate the gateway configuration", long_about = None)]
struct Args {
    /// Configuration file path (TOML); defaults to $APP_CONFIG, then App.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON log format
    #[arg(long)]
    json_logs: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.json_logs {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let config = Arc::new(config);

    // Building the gateway parses every verification key.
    Gateway::new(config.clone(), Arc::new(NullBroker))?;

    info!(
        id = %config.id,
        authn = config.authn.is_some(),
        authz = config.authz.is_some(),
        stat = config.stat.enabled,
        "configuration OK"
    );
    Ok(())
}
