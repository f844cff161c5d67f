use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use channel_crawler::api;
use channel_crawler::config::Config;
use channel_crawler::crawler::TelegramSource;
use channel_crawler::db::Database;
use channel_crawler::dispatcher::Dispatcher;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting channel-crawler");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    info!(
        feed_base_url = %config.feed_base_url,
        database = %config.database_path.display(),
        run_dispatcher = config.run_dispatcher,
        run_api = config.run_api,
        "Configuration loaded"
    );

    if let Some(parent) = config.database_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create database directory: {}", parent.display())
        })?;
    }

    let db = Database::with_keys(&config.database_path, config.store_keys.clone())
        .await
        .context("Failed to initialize database")?;

    if db.init_capacity(config.default_capacity).await? {
        info!(capacity = config.default_capacity, "Initialized worker capacity");
    }

    info!("Database initialized");

    let shutdown = CancellationToken::new();

    let dispatcher_handle = if config.run_dispatcher {
        let source = TelegramSource::from_config(&config)?;
        let dispatcher = Dispatcher::new(
            Arc::new(db.clone()),
            Arc::new(source),
            config.crawl_settings(),
            config.dispatch_interval,
        )
        .with_lease(config.lease_timeout);
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            dispatcher.run(token).await;
        }))
    } else {
        info!("Dispatcher disabled");
        None
    };

    let api_handle = if config.run_api {
        let api_config = config.clone();
        let api_db = db.clone();
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(api_config, api_db, token).await {
                error!("API server error: {e:#}");
            }
        }))
    } else {
        info!("API server disabled");
        None
    };

    shutdown_signal().await;

    info!("Shutting down...");
    shutdown.cancel();

    // The dispatcher requeues its in-flight windows before it returns.
    if let Some(handle) = dispatcher_handle {
        if let Err(e) = handle.await {
            error!("Dispatcher task failed: {e}");
        }
    }
    if let Some(handle) = api_handle {
        let _ = handle.await;
    }

    info!("Shutdown complete");

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,channel_crawler=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
