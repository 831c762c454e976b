//! Daemon lifecycle: store startup, device enrollment, crash recovery,
//! scheduler, graceful shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use vellum_core::config::VellumConfig;
use vellum_store::{DeviceRegistry, LogPolicy, OperationLog, VersionStore};
use vellum_sync::{DirRemote, Scheduler, SyncEngine};

pub async fn run(config: VellumConfig) -> Result<()> {
    info!("daemon starting");

    let data_dir = &config.storage.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir: {}", data_dir.display()))?;

    // ── Device identity ──────────────────────────────────────────────────
    let device_name = config
        .sync
        .device_name
        .clone()
        .unwrap_or_else(default_device_name);

    let mut registry = DeviceRegistry::open(&data_dir.join("devices.json"))
        .context("opening device registry")?;
    let device_id = match registry.find(&device_name) {
        Some(device) => {
            info!(device = %device_name, id = %device.device_id, "device identity loaded");
            device.device_id.clone()
        }
        None => {
            let id = registry.register(&device_name)?;
            info!(device = %device_name, id = %id, "device auto-enrolled");
            id
        }
    };

    // ── Durable stores ───────────────────────────────────────────────────
    let log = OperationLog::open(
        &data_dir.join("operations.log"),
        LogPolicy::from(&config.sync),
    )
    .context("opening operation log")?;
    let notes = VersionStore::open(&data_dir.join("notes.json"))
        .context("opening version store")?;

    // ── Remote replica ───────────────────────────────────────────────────
    let Some(remote_dir) = config.storage.remote_dir.clone() else {
        anyhow::bail!("no [storage] remote_dir configured; nothing to sync against");
    };
    let remote = Arc::new(DirRemote::open(&remote_dir).context("opening remote replica")?);
    info!(remote = %remote_dir.display(), "remote replica ready");

    let engine = SyncEngine::new(log, notes, registry, remote, config.sync.clone(), device_id);

    // Resolve operations left in flight by a crash before doing anything else
    let recovered = engine.recover().await?;
    if recovered > 0 {
        info!(recovered, "crash recovery: in-flight operations reconciled");
    }

    notify_ready();

    // ── Scheduler ────────────────────────────────────────────────────────
    let scheduler = Scheduler::new(engine);
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let runner = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    let _ = shutdown_tx.send(());
    runner.await.context("joining scheduler task")??;

    info!("daemon exiting cleanly");
    Ok(())
}

/// Default device name: the machine's hostname.
fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-device".into())
}

fn notify_ready() {
    // Send sd_notify(READY=1) to systemd if running as a service
    // Uses $NOTIFY_SOCKET env var; no-op if not set
    if let Ok(socket) = std::env::var("NOTIFY_SOCKET") {
        use std::os::unix::net::UnixDatagram;
        if let Ok(sock) = UnixDatagram::unbound() {
            let _ = sock.send_to(b"READY=1\n", &socket);
            tracing::debug!(notify_socket = %socket, "sent systemd READY=1");
        }
    }
}
