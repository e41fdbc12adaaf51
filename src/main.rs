//! Arbor - federated directory node

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arbor::config::Args;
use arbor::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("arbor={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Arbor - Federated Thing Directory");
    info!("======================================");
    info!("Directory: {}", args.node_name);
    info!("Listen: {}", args.listen);
    match args.parent_link()? {
        Some((name, url)) => info!("Parent: {} ({})", name, url),
        None => info!("Parent: none (root directory)"),
    }
    let children = args.child_links()?;
    info!("Children: {}", children.len());
    for (name, url) in &children {
        info!("  {}: {}", name, url);
    }
    info!("======================================");

    let state = Arc::new(AppState::new(args)?);
    info!("Claim token verifying key: {}", state.tokens.verifying_key());

    server::run(state).await?;
    Ok(())
}
