//! Cartwheel maintenance CLI
//!
//! Operates on the file-backed cart store outside the application:
//! `cartwheel cleanup` sweeps expired and unreadable envelopes,
//! `cartwheel show <project_id>` prints a persisted cart.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cartwheel::{
    config::AppConfig,
    models::CartSnapshot,
    persist::EnvelopeManager,
    registry,
    storage::FileStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("cartwheel={}", config.logging.level).into());

    let subscriber = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }

    let store = Arc::new(FileStore::new(&config.persist.data_dir));
    let manager = Arc::new(EnvelopeManager::new(store, config.persist_options())?);
    registry::register("cartwheel-cli", manager.clone());

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_default();
    let result = match command.as_str() {
        "cleanup" => cleanup(&manager).await,
        "show" => match args.next() {
            Some(project_id) => show(&manager, &project_id).await,
            None => {
                eprintln!("Usage: cartwheel show <project_id>");
                std::process::exit(2);
            }
        },
        _ => {
            eprintln!("Usage: cartwheel <cleanup | show <project_id>>");
            std::process::exit(2);
        }
    };

    registry::shutdown_all();
    result
}

/// Sweep expired and unreadable envelopes from the data directory.
async fn cleanup(manager: &EnvelopeManager) -> anyhow::Result<()> {
    let removed = manager.cleanup().await;
    tracing::info!(removed, "Cleanup sweep finished");
    println!("Removed {} stale cart envelope(s)", removed);
    Ok(())
}

/// Print the persisted cart for a project.
async fn show(manager: &EnvelopeManager, project_id: &str) -> anyhow::Result<()> {
    match manager.load_state::<CartSnapshot>(project_id).await {
        Some(snapshot) => {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            let total_units: u64 = snapshot
                .items
                .values()
                .map(|item| u64::from(item.quantity))
                .sum();
            println!(
                "{} item(s), {} unit(s) in cart for project '{}'",
                snapshot.items.len(),
                total_units,
                project_id
            );
        }
        None => println!("No valid persisted cart for project '{}'", project_id),
    }
    Ok(())
}
