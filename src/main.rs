//! Tagweld - diagram annotation orchestration for asset graphs.
//!
//! A tool for linking engineering diagrams to the equipment they depict:
//! it drives text detection over diagram pages and welds the findings
//! into reviewed edges in the asset graph.

mod cache;
mod cli;
mod config;
mod detect;
mod models;
mod services;
mod store;
mod text;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();

    // Initialize logging based on verbosity
    let default_filter = if cli::is_verbose() {
        "tagweld=info"
    } else {
        "tagweld=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Run CLI
    cli::run().await
}
