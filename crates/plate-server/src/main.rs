//! # plategate
//!
//! Messaging gateway that lets vehicles talk to each other by plate number.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! plategate
//!
//! # Run with a specific config file
//! plategate /path/to/plategate.toml
//!
//! # Run with environment variables
//! PLATEGATE_PORT=8080 PLATEGATE_SECRET=... plategate
//! ```

mod config;
mod error;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plategate=debug,plate_core=debug,plate_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting plategate on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
