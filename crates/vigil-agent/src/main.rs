use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use vigil_agent::backup::BackupCoordinator;
use vigil_agent::config;
use vigil_agent::launch::ProcessSpawner;
use vigil_agent::lifecycle::ServerLifecycle;
use vigil_agent::probe::ProcProbe;
use vigil_agent::rcon_link::TcpRconConnector;
use vigil_state::Notification;

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::from_default_env();

    // With VIGIL_LOG_DIR set, the supervisor's own log goes to a file the
    // same way the shell would persist it; otherwise plain stdout.
    if let Ok(dir) = std::env::var("VIGIL_LOG_DIR") {
        let appender = tracing_appender::rolling::never(dir, "vigil.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

fn log_notification(notification: &Notification) {
    match notification {
        Notification::StatusChanged(state) => tracing::info!(?state, "server status changed"),
        Notification::LogLine(text) => tracing::debug!(target: "server_log", "{text}"),
        Notification::ModLoaded { name, id } => tracing::info!(%name, %id, "mod loaded"),
        Notification::RconConnected => tracing::info!("RCON connected"),
        Notification::RconDisconnected => tracing::info!("RCON disconnected"),
        Notification::StartupFailed { reason } => tracing::warn!(%reason, "startup failed"),
        Notification::StartupTimeout => tracing::warn!("startup timed out"),
        Notification::ProcessLost => tracing::warn!("server process lost"),
        Notification::StopTimeoutWarning => {
            tracing::warn!("server did not stop in time; manual intervention may be required");
        }
        Notification::BackupStarted { name, .. } => tracing::info!(%name, "backup started"),
        Notification::BackupProgress { message, .. } => tracing::debug!(%message, "backup progress"),
        Notification::BackupFinished {
            success, message, ..
        } => tracing::info!(success, %message, "backup finished"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("configs").join("server_config.json"));
    let cfg = config::load(&config_path)?;
    config::validate(&cfg)?;
    tracing::info!(config = %config_path.display(), server = %cfg.server_path.display(), "vigil agent starting");

    let (lifecycle, mut notifications) = ServerLifecycle::new(
        cfg.clone(),
        Arc::new(ProcProbe),
        Arc::new(ProcessSpawner),
        Arc::new(TcpRconConnector),
    );

    let backups = BackupCoordinator::new(&cfg, lifecycle.notifier());
    if cfg.backup.auto_backup {
        backups.spawn_auto_backup(Duration::from_secs(cfg.backup.interval_minutes * 60));
    }

    // Adopt a server that is already running from a previous session.
    let status = lifecycle.attach().await?;
    if status.state.is_active() {
        tracing::info!(?status.state, worker_pid = ?status.worker_pid, "attached to running server");
    } else if let Err(err) = lifecycle.start().await {
        tracing::warn!(%err, "initial start failed; supervisor stays up for manual control");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notification = notifications.recv() => match notification {
                Some(n) => log_notification(&n),
                None => break,
            },
        }
    }

    tracing::info!("shutting down");
    lifecycle.shutdown().await;
    Ok(())
}
