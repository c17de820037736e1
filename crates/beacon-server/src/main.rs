//! # Beacon Server
//!
//! Realtime presence and message routing server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! JWT_SECRET=change-me beacon
//!
//! # Run with custom config
//! beacon --config /path/to/beacon.toml
//!
//! # Print the effective configuration
//! beacon --print-config
//!
//! # Run with environment variables
//! BEACON_PORT=8080 BEACON_HOST=0.0.0.0 beacon
//! ```

use anyhow::Result;
use beacon_server::{config::Config, handlers, metrics};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Realtime presence and message routing server.
#[derive(Debug, Parser)]
#[command(name = "beacon", version)]
struct Args {
    /// Config file to load instead of the default search paths.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Load configuration
    let config = match args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    tracing::info!("Starting Beacon server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args() {
        let args = Args::try_parse_from(["beacon", "-c", "/etc/beacon/beacon.toml", "--print-config"])
            .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/beacon/beacon.toml")));
        assert!(args.print_config);

        let args = Args::try_parse_from(["beacon"]).unwrap();
        assert!(args.config.is_none());
        assert!(!args.print_config);

        assert!(Args::try_parse_from(["beacon", "--bogus"]).is_err());
        assert!(Args::try_parse_from(["beacon", "--config"]).is_err());
    }
}
