//! # Event Reader Server
//!
//! Runs the reader registry as a standalone process. Settings come from
//! defaults, `server_ers.conf` and CLI/env values; the reader configuration
//! is a separate JSON document reloaded on SIGHUP.

use std::sync::Arc;

use anyhow::{Context, Result};
use lib_ingest::loggers::{init_tracing, LogOptions};
use lib_ingest::{load_config, DefaultReaderFactory, ReaderService};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod ers_logic;
use ers_logic::{backend::LoggingBackend, config, signals};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let (settings, notes) = config::load_settings();
    let _log_guard = init_tracing(&LogOptions {
        dir: settings.log_dir(),
        prefix: "server_ers".to_string(),
        level: settings.log_level(),
        json: settings.log_json.unwrap_or(false),
    })
    .context("failed to initialize logging")?;
    config::log_notes(&notes);

    let config_path = settings.config_path();
    let ers = load_config(&config_path)
        .with_context(|| format!("failed to load reader configuration {}", config_path.display()))?;
    if !ers.enabled {
        info!("reader service disabled, nothing to do");
        return Ok(());
    }

    let service = ReaderService::new(&ers, Arc::new(DefaultReaderFactory), Arc::new(LoggingBackend))?;
    service.start(&ers).await.context("failed to start readers")?;

    let shutdown = CancellationToken::new();
    let (reload_tx, reload_rx) = mpsc::channel(1);
    let watcher = tokio::spawn(signals::watch(config_path, shutdown.clone(), reload_tx));

    let served = service.serve(shutdown.clone(), reload_rx).await;
    shutdown.cancel();
    signals::join(watcher).await;

    match served {
        Ok(()) => {
            info!("Shutdown complete.");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "reader service stopped on a source failure");
            Err(e.into())
        }
    }
}
