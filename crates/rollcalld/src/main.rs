use anyhow::{Context, Result};
use rollcall_core::{CatalogHandle, CatalogOptions, EmbeddingCatalog};
use rollcall_hw::V4lOpener;
use rollcall_store::{sessions, spawn_writer, Store, WriterOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod capture;
mod config;
mod dbus_interface;
mod manager;
mod session;
mod snapshot;

use config::{BusKind, Config};
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use manager::{ManagerOptions, SessionManager, SidecarFactory};

/// SIGINT from a terminal or SIGTERM from the service manager; either one
/// reconciles open sessions before exit.
struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        device = %config.camera_device,
        db = %config.db_path.display(),
        tolerance = config.tolerance,
        "configuration loaded"
    );

    let store = Store::open(&config.db_path)
        .with_context(|| format!("failed to open {}", config.db_path.display()))?;
    let interrupted = sessions::interrupt_stale_sessions(store.connection(), chrono::Local::now())?;
    for row in &interrupted {
        tracing::warn!(session = %row.id, class = %row.class_id, "marked interrupted session");
    }

    let ledger = spawn_writer(
        store,
        WriterOptions {
            queue_capacity: config.ledger_queue_capacity,
            retries: config.ledger_retries,
            ..WriterOptions::default()
        },
    )?;

    let catalog_options = CatalogOptions {
        group_size: config.group_size,
        ..CatalogOptions::default()
    };
    let loader = ledger.clone();
    let catalog = match tokio::task::spawn_blocking(move || {
        EmbeddingCatalog::load(&loader, catalog_options)
    })
    .await?
    {
        Ok(catalog) => catalog,
        Err(err) => {
            tracing::warn!(error = %err, "catalog not loaded; sessions will retry");
            EmbeddingCatalog::empty()
        }
    };

    let manager = Arc::new(SessionManager::new(
        ManagerOptions {
            device: config.camera_device.clone(),
            tolerance: config.tolerance,
            catalog: catalog_options,
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
            max_consecutive_failures: config.max_consecutive_failures,
            preview_quality: config.preview.then_some(config.preview_quality),
        },
        ledger,
        CatalogHandle::new(catalog),
        Arc::new(V4lOpener {
            width: config.width,
            height: config.height,
            warmup_frames: config.warmup_frames,
        }),
        Arc::new(SidecarFactory {
            command: config.provider_command.clone(),
        }),
    ));

    let builder = match config.bus {
        BusKind::System => zbus::connection::Builder::system()?,
        BusKind::Session => zbus::connection::Builder::session()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, AttendanceService::new(Arc::clone(&manager)))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    let mut signals = ShutdownSignals::install().context("failed to install signal handlers")?;
    let received = signals.recv().await;
    tracing::info!(signal = received, "rollcalld shutting down");
    manager.shutdown().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sigterm_requests_shutdown() {
        let mut signals = ShutdownSignals::install().unwrap();
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let received = tokio::time::timeout(Duration::from_secs(5), signals.recv())
            .await
            .unwrap();
        assert_eq!(received, "SIGTERM");
    }
}
