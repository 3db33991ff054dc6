use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use vigil_rcon::{ConnectError, ExecError};
use vigil_state::{Notification, ServerState, ServerStatus};

use crate::config::ServerConfig;
use crate::launch::{self, ServerLauncher};
use crate::log_watch::{LogEvent, LogTailWatcher};
use crate::policy;
use crate::probe::ProcessProbe;
use crate::rcon_link::{RconConnector, RconControl, RconEndpoint};

/// Supervises one dedicated server: drives start/stop/restart workflows and
/// decides the authoritative state from three signals — process existence,
/// log markers, and the RCON channel.
///
/// All state transitions funnel through the one mutex-guarded [`Inner`];
/// background tasks (worker discovery, log tail, liveness monitor) carry the
/// run generation that spawned them and retire silently once it changes, so
/// a superseded episode can never mutate a newer one.
#[derive(Clone)]
pub struct ServerLifecycle {
    config: Arc<ServerConfig>,
    inner: Arc<Mutex<Inner>>,
    probe: Arc<dyn ProcessProbe>,
    launcher: Arc<dyn ServerLauncher>,
    connector: Arc<dyn RconConnector>,
    rcon: Arc<Mutex<Option<Box<dyn RconControl>>>>,
    notify: mpsc::UnboundedSender<Notification>,
}

#[derive(Debug)]
struct Inner {
    state: ServerState,
    /// Bumped on every episode boundary; stale background tasks compare and
    /// retire.
    run_id: u64,
    launcher_pid: Option<u32>,
    worker_pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    started_mono: Option<Instant>,
    /// Set while the worker is absent from the process table; cleared the
    /// moment it reappears. Only its expiry means the server is gone.
    missing_since: Option<Instant>,
    shutting_down: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: ServerState::Offline,
            run_id: 0,
            launcher_pid: None,
            worker_pid: None,
            started_at: None,
            started_mono: None,
            missing_since: None,
            shutting_down: false,
        }
    }

    /// Closes the current episode: back to Offline, all per-run fields
    /// cleared, every outstanding background task invalidated.
    fn end_run(&mut self) {
        self.state = ServerState::Offline;
        self.run_id += 1;
        self.launcher_pid = None;
        self.worker_pid = None;
        self.started_at = None;
        self.started_mono = None;
        self.missing_since = None;
    }
}

impl ServerLifecycle {
    pub fn new(
        config: ServerConfig,
        probe: Arc<dyn ProcessProbe>,
        launcher: Arc<dyn ServerLauncher>,
        connector: Arc<dyn RconConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let lifecycle = Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner::new())),
            probe,
            launcher,
            connector,
            rcon: Arc::new(Mutex::new(None)),
            notify: tx,
        };
        (lifecycle, rx)
    }

    /// A clone of the notification sender, for sibling components (backups)
    /// that report through the same channel.
    pub fn notifier(&self) -> mpsc::UnboundedSender<Notification> {
        self.notify.clone()
    }

    fn emit(&self, notification: Notification) {
        // Fire-and-forget: a shell that went away must never block or fail
        // the lifecycle.
        let _ = self.notify.send(notification);
    }

    pub async fn status(&self) -> ServerStatus {
        let (state, launcher_pid, worker_pid, started_at, started_mono) = {
            let inner = self.inner.lock().await;
            (
                inner.state,
                inner.launcher_pid,
                inner.worker_pid,
                inner.started_at,
                inner.started_mono,
            )
        };

        let rcon_connected = self.rcon.lock().await.is_some();
        let worker_rss_bytes = worker_pid.and_then(|pid| self.probe.memory_of(pid).ok());
        let uptime_secs = match (state, started_mono) {
            (ServerState::Online | ServerState::Starting, Some(t)) => Some(t.elapsed().as_secs()),
            _ => None,
        };

        ServerStatus {
            state,
            launcher_pid,
            worker_pid,
            started_at,
            uptime_secs,
            rcon_connected,
            worker_rss_bytes,
        }
    }

    /// Launches the server and begins supervision.
    ///
    /// `Starting` is reported immediately, before the worker process is even
    /// confirmed to exist; callers must not read it as "worker confirmed".
    pub async fn start(&self) -> anyhow::Result<()> {
        let run = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                anyhow::bail!("supervisor is shutting down");
            }
            if inner.state != ServerState::Offline {
                anyhow::bail!("server is not offline (state: {:?})", inner.state);
            }
            inner.run_id += 1;
            inner.state = ServerState::Starting;
            inner.worker_pid = None;
            inner.missing_since = None;
            inner.started_at = Some(Utc::now());
            inner.started_mono = Some(Instant::now());
            inner.run_id
        };
        self.emit(Notification::StatusChanged(ServerState::Starting));

        let spec = match launch::build_launch_spec(&self.config) {
            Ok(spec) => spec,
            Err(err) => return self.fail_startup(run, err.to_string()).await,
        };
        tracing::info!(command = %launch::display_spec(&spec), "launching server");

        let launcher_pid = match self.launcher.spawn_server(&spec) {
            Ok(pid) => pid,
            Err(err) => return self.fail_startup(run, err.to_string()).await,
        };
        tracing::info!(launcher_pid, "launcher process spawned; waiting for the worker");

        {
            let mut inner = self.inner.lock().await;
            if inner.run_id != run {
                return Ok(());
            }
            inner.launcher_pid = Some(launcher_pid);
        }

        self.spawn_discovery(run);
        self.spawn_monitor(run);
        Ok(())
    }

    async fn fail_startup(&self, run: u64, reason: String) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.run_id != run {
                return Ok(());
            }
            inner.end_run();
        }
        self.emit(Notification::StartupFailed {
            reason: reason.clone(),
        });
        self.emit(Notification::StatusChanged(ServerState::Offline));
        anyhow::bail!("startup failed: {reason}")
    }

    /// Reconciliation at supervisor (re)attach: a worker already running with
    /// no lifecycle record is trusted as Online without a fresh startup
    /// marker. The marker has usually scrolled far past the tail window by
    /// then, so insisting on it would mislabel a healthy server. This is the
    /// single exception to marker-only promotion.
    pub async fn attach(&self) -> anyhow::Result<ServerStatus> {
        let found = self
            .probe
            .find_by_name(&self.config.worker_exe)
            .into_iter()
            .next();

        let adopted = {
            let mut inner = self.inner.lock().await;
            if inner.state != ServerState::Offline {
                anyhow::bail!("attach is only valid while offline (state: {:?})", inner.state);
            }
            match &found {
                Some(info) => {
                    inner.run_id += 1;
                    inner.state = ServerState::Online;
                    inner.worker_pid = Some(info.pid);
                    inner.started_at = Some(info.created_at);
                    inner.started_mono = Some(Instant::now());
                    inner.missing_since = None;
                    Some(inner.run_id)
                }
                None => None,
            }
        };

        match adopted {
            Some(run) => {
                let pid = found.map(|i| i.pid).unwrap_or_default();
                tracing::info!(pid, "existing worker process adopted as online");
                self.emit(Notification::StatusChanged(ServerState::Online));
                // The tail replays from the top of the log, which recovers
                // the mod-load history for the shell.
                self.spawn_log_poll(run);
                self.spawn_monitor(run);
            }
            None => {
                tracing::info!("no existing worker process found");
                self.emit(Notification::StatusChanged(ServerState::Offline));
            }
        }

        Ok(self.status().await)
    }

    /// Polls the process table until the real worker appears, then starts
    /// the log tail. The worker is usually a child of the thin bootstrap
    /// executable we spawned, so its own creation time replaces the launch
    /// time.
    fn spawn_discovery(&self, run: u64) {
        let lc = self.clone();
        tokio::spawn(async move {
            let interval = policy::worker_poll_interval();
            let attempts = policy::worker_poll_attempts();

            for attempt in 1..=attempts {
                if !lc.run_is_current(run).await {
                    return;
                }

                let found = lc
                    .probe
                    .find_by_name(&lc.config.worker_exe)
                    .into_iter()
                    .next();

                if let Some(info) = found {
                    let mut inner = lc.inner.lock().await;
                    if inner.run_id != run || inner.state != ServerState::Starting {
                        return;
                    }
                    inner.worker_pid = Some(info.pid);
                    inner.started_at = Some(info.created_at);
                    drop(inner);

                    tracing::info!(
                        pid = info.pid,
                        attempt,
                        "worker process found; tailing the server log"
                    );
                    lc.spawn_log_poll(run);
                    return;
                }

                tracing::debug!(attempt, attempts, "worker process not found yet");
                tokio::time::sleep(interval).await;
            }

            {
                let mut inner = lc.inner.lock().await;
                if inner.run_id != run || inner.state != ServerState::Starting {
                    return;
                }
                inner.end_run();
            }
            let reason = format!(
                "worker process {} not found within {} attempts",
                lc.config.worker_exe, attempts
            );
            tracing::warn!(%reason, "startup failed");
            lc.emit(Notification::StartupFailed { reason });
            lc.emit(Notification::StatusChanged(ServerState::Offline));
        });
    }

    /// Tails the server log, forwarding lines and mod loads to the shell.
    /// The startup-complete marker is the sole promotion path to Online.
    fn spawn_log_poll(&self, run: u64) {
        let lc = self.clone();
        tokio::spawn(async move {
            let mut watcher = LogTailWatcher::new(
                lc.config.log_file_path(),
                lc.config.startup_marker.clone(),
            );
            let interval = policy::log_poll_interval();

            loop {
                if !lc.run_is_current(run).await {
                    return;
                }

                for event in watcher.poll().await {
                    match event {
                        LogEvent::Raw { text } => lc.emit(Notification::LogLine(text)),
                        LogEvent::ModLoaded { name, id } => {
                            tracing::info!(%name, %id, "mod loaded");
                            lc.emit(Notification::ModLoaded { name, id });
                        }
                        LogEvent::StartupComplete { marker } => {
                            tracing::info!(%marker, "startup marker observed");
                            lc.promote_online(run).await;
                        }
                    }
                }

                tokio::time::sleep(interval).await;
            }
        });
    }

    async fn promote_online(&self, run: u64) {
        {
            let mut inner = self.inner.lock().await;
            // Also guards double promotion: once Online, further marker
            // events fall through here.
            if inner.run_id != run || inner.state != ServerState::Starting {
                return;
            }
            inner.state = ServerState::Online;
            inner.missing_since = None;
        }
        tracing::info!("server is online");
        self.emit(Notification::StatusChanged(ServerState::Online));

        if self.config.rcon.enabled && self.config.rcon.auto_connect {
            self.spawn_auto_connect(run);
        }
    }

    /// One delayed connect attempt plus a single bounded retry. Any further
    /// retrying is the operator's explicit choice.
    fn spawn_auto_connect(&self, run: u64) {
        let lc = self.clone();
        tokio::spawn(async move {
            let delay = policy::rcon_connect_delay();
            for attempt in 1..=2u32 {
                tokio::time::sleep(delay).await;
                if !lc.run_is_current(run).await {
                    return;
                }
                match lc.connect_rcon().await {
                    Ok(()) => return,
                    Err(err) => {
                        tracing::warn!(%err, attempt, "automatic RCON connect failed");
                    }
                }
            }
        });
    }

    /// Watches the episode: enforces the startup timeout while Starting and
    /// runs the missing-process grace logic while Online.
    fn spawn_monitor(&self, run: u64) {
        let lc = self.clone();
        tokio::spawn(async move {
            let interval = policy::liveness_interval();
            let grace = policy::process_missing_grace();
            let startup_limit = policy::startup_timeout();

            loop {
                tokio::time::sleep(interval).await;

                let observe = {
                    let inner = lc.inner.lock().await;
                    if inner.run_id != run {
                        return;
                    }
                    match inner.state {
                        ServerState::Starting => {
                            if inner
                                .started_mono
                                .is_some_and(|t| t.elapsed() >= startup_limit)
                            {
                                Observation::StartupExpired
                            } else {
                                Observation::Idle
                            }
                        }
                        ServerState::Online => Observation::CheckWorker,
                        // stop() owns this phase; nothing to watch.
                        ServerState::StoppingRequested => Observation::Idle,
                        ServerState::Offline => return,
                    }
                };

                match observe {
                    Observation::Idle => {}
                    Observation::StartupExpired => {
                        {
                            let mut inner = lc.inner.lock().await;
                            if inner.run_id != run || inner.state != ServerState::Starting {
                                continue;
                            }
                            inner.end_run();
                        }
                        tracing::warn!(
                            timeout_secs = startup_limit.as_secs(),
                            "no startup marker within the startup timeout"
                        );
                        lc.emit(Notification::StartupTimeout);
                        lc.emit(Notification::StatusChanged(ServerState::Offline));
                        return;
                    }
                    Observation::CheckWorker => {
                        let present = !lc.probe.find_by_name(&lc.config.worker_exe).is_empty();

                        let lost = {
                            let mut inner = lc.inner.lock().await;
                            if inner.run_id != run || inner.state != ServerState::Online {
                                continue;
                            }
                            if present {
                                if inner.missing_since.take().is_some() {
                                    tracing::info!("worker process reappeared; grace cancelled");
                                }
                                false
                            } else {
                                let since = *inner.missing_since.get_or_insert_with(|| {
                                    tracing::warn!(
                                        grace_secs = grace.as_secs(),
                                        "worker process missing; grace period started"
                                    );
                                    Instant::now()
                                });
                                if since.elapsed() >= grace {
                                    inner.end_run();
                                    true
                                } else {
                                    false
                                }
                            }
                        };

                        if lost {
                            tracing::warn!("worker process missing past the grace period");
                            lc.drop_rcon().await;
                            lc.emit(Notification::ProcessLost);
                            lc.emit(Notification::StatusChanged(ServerState::Offline));
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Clean shutdown through RCON: establish a session if none is live,
    /// send the configured shutdown command, then wait for the worker to
    /// leave the process table.
    ///
    /// A stop window expiring is an operator-visible caveat, not a failure:
    /// the state machine still settles Offline. Only failing to establish
    /// RCON at all makes `stop` return an error, with the previous state
    /// restored.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let previous = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                ServerState::Offline => anyhow::bail!("server is already offline"),
                ServerState::StoppingRequested => anyhow::bail!("stop already in progress"),
                state @ (ServerState::Starting | ServerState::Online) => {
                    inner.state = ServerState::StoppingRequested;
                    state
                }
            }
        };
        self.emit(Notification::StatusChanged(ServerState::StoppingRequested));

        if !self.rcon_ready().await {
            if let Err(err) = self.connect_rcon().await {
                {
                    let mut inner = self.inner.lock().await;
                    if inner.state == ServerState::StoppingRequested {
                        inner.state = previous;
                    }
                }
                self.emit(Notification::StatusChanged(previous));
                return Err(anyhow::Error::new(err)
                    .context("cannot stop: RCON session could not be established"));
            }
        }

        match self.execute_command(&self.config.shutdown_command).await {
            Ok(reply) => tracing::info!(%reply, "shutdown command acknowledged"),
            Err(err) => {
                // The command may still have landed; fall through to the
                // disappearance wait either way.
                tracing::warn!(%err, "shutdown command failed; waiting for the process anyway");
            }
        }

        let gone = self.wait_worker_gone(policy::stop_wait()).await;
        if !gone {
            tracing::warn!(
                wait_secs = policy::stop_wait().as_secs(),
                "server still running after the stop window; manual intervention may be required"
            );
            self.emit(Notification::StopTimeoutWarning);
        }

        self.finish_offline().await;
        Ok(())
    }

    /// Forceful termination: signal the worker and launcher directly,
    /// escalating to a kill if the stop window expires. A last resort, never
    /// the first attempted action — reachable from [`Self::restart`] when no
    /// RCON session can be established at all.
    pub async fn force_stop(&self) {
        let (launcher_pid, worker_pid, announce) = {
            let mut inner = self.inner.lock().await;
            if inner.state == ServerState::Offline {
                return;
            }
            let announce = inner.state != ServerState::StoppingRequested;
            inner.state = ServerState::StoppingRequested;
            (inner.launcher_pid, inner.worker_pid, announce)
        };
        if announce {
            self.emit(Notification::StatusChanged(ServerState::StoppingRequested));
        }

        for pid in [worker_pid, launcher_pid].into_iter().flatten() {
            if self.launcher.terminate(pid, false) {
                tracing::warn!(pid, "sent termination signal");
            }
        }

        if !self.wait_worker_gone(policy::stop_wait()).await {
            for pid in [worker_pid, launcher_pid].into_iter().flatten() {
                if self.launcher.terminate(pid, true) {
                    tracing::warn!(pid, "escalated to kill");
                }
            }
        }

        self.finish_offline().await;
    }

    /// Stop, cool down, start again. When a clean stop is impossible because
    /// RCON cannot be established, falls back to forceful termination before
    /// relaunching.
    pub async fn restart(&self) -> anyhow::Result<()> {
        tracing::info!("restart requested");
        match self.stop().await {
            Ok(()) => {}
            Err(err) => {
                tracing::warn!(%err, "graceful stop failed; falling back to forceful termination");
                self.force_stop().await;
            }
        }

        tokio::time::sleep(policy::restart_cooldown()).await;
        self.start().await
    }

    async fn wait_worker_gone(&self, limit: std::time::Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.probe.find_by_name(&self.config.worker_exe).is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }

    async fn finish_offline(&self) {
        self.drop_rcon().await;
        {
            let mut inner = self.inner.lock().await;
            inner.end_run();
        }
        tracing::info!("server is offline");
        self.emit(Notification::StatusChanged(ServerState::Offline));
    }

    /// Connects (or replaces) the RCON session. Replacement is
    /// disconnect-then-reconnect; two live sessions against the same server
    /// never coexist.
    pub async fn connect_rcon(&self) -> Result<(), ConnectError> {
        self.drop_rcon().await;

        let endpoint = RconEndpoint {
            host: self.config.rcon.addr.clone(),
            port: self.config.rcon.port,
            password: self.config.rcon.password.clone(),
        };
        let handle = self
            .connector
            .connect(endpoint, policy::rcon_io_timeout())
            .await?;

        *self.rcon.lock().await = Some(handle);
        self.emit(Notification::RconConnected);
        Ok(())
    }

    pub async fn disconnect_rcon(&self) {
        self.drop_rcon().await;
    }

    async fn drop_rcon(&self) {
        let mut guard = self.rcon.lock().await;
        if let Some(mut session) = guard.take() {
            if session.disconnect().await {
                self.emit(Notification::RconDisconnected);
            }
        }
    }

    /// Runs one command over the live session. Commands are strictly
    /// serialized; a second call waits for the first to resolve. Session
    /// errors other than a rejected command body tear the session down —
    /// reconnecting is the caller's explicit choice.
    pub async fn execute_command(&self, command: &str) -> Result<String, ExecError> {
        let mut guard = self.rcon.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(ExecError::NotConnected);
        };

        match session
            .execute(command.to_string(), policy::rcon_io_timeout())
            .await
        {
            Ok(body) => Ok(body),
            Err(err) => {
                if !matches!(err, ExecError::Encode(_)) {
                    if let Some(mut session) = guard.take() {
                        session.disconnect().await;
                        self.emit(Notification::RconDisconnected);
                    }
                }
                Err(err)
            }
        }
    }

    async fn rcon_ready(&self) -> bool {
        self.rcon.lock().await.is_some()
    }

    /// Cancels all background polling and closes the RCON session. The
    /// server process itself is left running; in-flight commands are allowed
    /// to reach their own timeouts rather than being cut mid-frame.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().await;
            inner.shutting_down = true;
            inner.run_id += 1;
        }
        self.drop_rcon().await;
        tracing::info!("lifecycle monitor shut down; the server process is left running");
    }

    async fn run_is_current(&self, run: u64) -> bool {
        self.inner.lock().await.run_id == run
    }
}

enum Observation {
    Idle,
    StartupExpired,
    CheckWorker,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use futures_util::future::BoxFuture;

    use crate::config;
    use crate::launch::LaunchSpec;
    use crate::probe::{ProbeError, ProcessInfo};

    const WORKER_PID: u32 = 4242;
    const LAUNCHER_PID: u32 = 4141;

    struct FakeProbe {
        appear_after: u32,
        calls: AtomicU32,
        vanished: AtomicBool,
    }

    impl FakeProbe {
        fn new(appear_after: u32) -> Arc<Self> {
            Arc::new(Self {
                appear_after,
                calls: AtomicU32::new(0),
                vanished: AtomicBool::new(false),
            })
        }

        fn set_vanished(&self, vanished: bool) {
            self.vanished.store(vanished, Ordering::SeqCst);
        }
    }

    impl ProcessProbe for FakeProbe {
        fn find_by_name(&self, exe_name: &str) -> Vec<ProcessInfo> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.vanished.load(Ordering::SeqCst) || n < self.appear_after {
                return Vec::new();
            }
            vec![ProcessInfo {
                pid: WORKER_PID,
                name: exe_name.to_string(),
                created_at: Utc::now(),
            }]
        }

        fn memory_of(&self, _pid: u32) -> Result<u64, ProbeError> {
            Ok(512 * 1024 * 1024)
        }
    }

    #[derive(Default)]
    struct FakeLauncher {
        spawns: AtomicU32,
        terminations: StdMutex<Vec<(u32, bool)>>,
        kill_effect: Option<Arc<FakeProbe>>,
    }

    impl ServerLauncher for FakeLauncher {
        fn spawn_server(&self, _spec: &LaunchSpec) -> anyhow::Result<u32> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            Ok(LAUNCHER_PID)
        }

        fn terminate(&self, pid: u32, force: bool) -> bool {
            self.terminations.lock().unwrap().push((pid, force));
            if let Some(probe) = &self.kill_effect {
                probe.set_vanished(true);
            }
            true
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        refuse: bool,
        commands: Arc<StdMutex<Vec<String>>>,
        stop_effect: Option<Arc<FakeProbe>>,
    }

    struct FakeControl {
        commands: Arc<StdMutex<Vec<String>>>,
        stop_effect: Option<Arc<FakeProbe>>,
        connected: bool,
    }

    impl RconConnector for FakeConnector {
        fn connect(
            &self,
            _endpoint: RconEndpoint,
            _timeout: Duration,
        ) -> BoxFuture<'static, Result<Box<dyn RconControl>, ConnectError>> {
            let refuse = self.refuse;
            let commands = self.commands.clone();
            let stop_effect = self.stop_effect.clone();
            Box::pin(async move {
                if refuse {
                    return Err(ConnectError::Refused {
                        endpoint: "127.0.0.1:25575".to_string(),
                    });
                }
                Ok(Box::new(FakeControl {
                    commands,
                    stop_effect,
                    connected: true,
                }) as Box<dyn RconControl>)
            })
        }
    }

    impl RconControl for FakeControl {
        fn execute(
            &mut self,
            command: String,
            _timeout: Duration,
        ) -> BoxFuture<'_, Result<String, ExecError>> {
            self.commands.lock().unwrap().push(command);
            if let Some(probe) = &self.stop_effect {
                probe.set_vanished(true);
            }
            Box::pin(async move { Ok("ok".to_string()) })
        }

        fn disconnect(&mut self) -> BoxFuture<'_, bool> {
            let was = self.connected;
            self.connected = false;
            Box::pin(async move { was })
        }
    }

    fn test_config(dir: &Path) -> ServerConfig {
        let cfg = ServerConfig {
            server_path: dir.to_path_buf(),
            ..ServerConfig::default()
        };
        std::fs::write(cfg.server_exe_path(), b"").unwrap();
        std::fs::create_dir_all(cfg.log_file_path().parent().unwrap()).unwrap();
        cfg
    }

    fn write_log(cfg: &ServerConfig, line: &str) {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(cfg.log_file_path())
            .unwrap();
        writeln!(f, "{line}").unwrap();
    }

    fn build(
        cfg: ServerConfig,
        probe: Arc<FakeProbe>,
        launcher: Arc<FakeLauncher>,
        connector: Arc<FakeConnector>,
    ) -> (ServerLifecycle, mpsc::UnboundedReceiver<Notification>) {
        ServerLifecycle::new(cfg, probe, launcher, connector)
    }

    /// Receives until `pred` matches, panicking if virtual time runs dry.
    async fn wait_for(
        rx: &mut mpsc::UnboundedReceiver<Notification>,
        seen: &mut Vec<Notification>,
        pred: impl Fn(&Notification) -> bool,
    ) {
        loop {
            let n = tokio::time::timeout(Duration::from_secs(3600), rx.recv())
                .await
                .expect("expected notification never arrived")
                .expect("notification channel closed");
            let done = pred(&n);
            seen.push(n);
            if done {
                return;
            }
        }
    }

    async fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>, seen: &mut Vec<Notification>) {
        while let Ok(n) = rx.try_recv() {
            seen.push(n);
        }
    }

    fn count_online(seen: &[Notification]) -> usize {
        seen.iter()
            .filter(|n| matches!(n, Notification::StatusChanged(ServerState::Online)))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn successful_start_reaches_online_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        write_log(&cfg, config::DEFAULT_STARTUP_MARKER);

        let probe = FakeProbe::new(3);
        let launcher = Arc::new(FakeLauncher::default());
        let (lc, mut rx) = build(
            cfg,
            probe,
            launcher.clone(),
            Arc::new(FakeConnector::default()),
        );

        lc.start().await.unwrap();

        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, |n| {
            matches!(n, Notification::StatusChanged(ServerState::Online))
        })
        .await;

        assert_eq!(
            seen.first(),
            Some(&Notification::StatusChanged(ServerState::Starting))
        );
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 1);

        // Let the machinery idle a while: Online must not repeat and no
        // failure may surface.
        tokio::time::sleep(Duration::from_secs(120)).await;
        drain(&mut rx, &mut seen).await;
        assert_eq!(count_online(&seen), 1);
        assert!(!seen.iter().any(|n| matches!(
            n,
            Notification::StartupFailed { .. }
                | Notification::StartupTimeout
                | Notification::ProcessLost
        )));

        let status = lc.status().await;
        assert_eq!(status.state, ServerState::Online);
        assert_eq!(status.worker_pid, Some(WORKER_PID));
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_exhaustion_reports_startup_failed_and_never_online() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let probe = FakeProbe::new(u32::MAX);
        let (lc, mut rx) = build(
            cfg,
            probe,
            Arc::new(FakeLauncher::default()),
            Arc::new(FakeConnector::default()),
        );

        lc.start().await.unwrap();

        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, |n| {
            matches!(n, Notification::StartupFailed { .. })
        })
        .await;
        wait_for(&mut rx, &mut seen, |n| {
            matches!(n, Notification::StatusChanged(ServerState::Offline))
        })
        .await;

        assert_eq!(count_online(&seen), 0);
        assert_eq!(lc.status().await.state, ServerState::Offline);

        // Offline again means a fresh start is permitted.
        lc.start().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn a_running_worker_alone_never_promotes_and_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        // The log exists but never carries the startup marker.
        write_log(&cfg, "LogInit: Display: Engine is initializing");

        let probe = FakeProbe::new(1);
        let (lc, mut rx) = build(
            cfg,
            probe,
            Arc::new(FakeLauncher::default()),
            Arc::new(FakeConnector::default()),
        );

        lc.start().await.unwrap();

        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, |n| {
            matches!(n, Notification::StartupTimeout)
        })
        .await;
        wait_for(&mut rx, &mut seen, |n| {
            matches!(n, Notification::StatusChanged(ServerState::Offline))
        })
        .await;

        assert_eq!(count_online(&seen), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_process_miss_within_grace_does_not_flap() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let probe = FakeProbe::new(1);
        let (lc, mut rx) = build(
            cfg,
            probe.clone(),
            Arc::new(FakeLauncher::default()),
            Arc::new(FakeConnector::default()),
        );

        let status = lc.attach().await.unwrap();
        assert_eq!(status.state, ServerState::Online);

        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, |n| {
            matches!(n, Notification::StatusChanged(ServerState::Online))
        })
        .await;

        // Miss shorter than the grace period, then reappear.
        probe.set_vanished(true);
        tokio::time::sleep(Duration::from_secs(15)).await;
        probe.set_vanished(false);
        tokio::time::sleep(Duration::from_secs(60)).await;

        drain(&mut rx, &mut seen).await;
        assert!(!seen.iter().any(|n| matches!(n, Notification::ProcessLost)));
        assert_eq!(lc.status().await.state, ServerState::Online);

        // A miss outlasting the grace period is a real loss.
        probe.set_vanished(true);
        wait_for(&mut rx, &mut seen, |n| {
            matches!(n, Notification::ProcessLost)
        })
        .await;
        wait_for(&mut rx, &mut seen, |n| {
            matches!(n, Notification::StatusChanged(ServerState::Offline))
        })
        .await;
        assert_eq!(lc.status().await.state, ServerState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_sends_shutdown_command_and_settles_offline() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let probe = FakeProbe::new(1);
        let connector = Arc::new(FakeConnector {
            stop_effect: Some(probe.clone()),
            ..FakeConnector::default()
        });
        let (lc, mut rx) = build(
            cfg,
            probe,
            Arc::new(FakeLauncher::default()),
            connector.clone(),
        );

        lc.attach().await.unwrap();
        lc.stop().await.unwrap();

        let commands = connector.commands.lock().unwrap().clone();
        assert_eq!(commands, vec!["close 10".to_string()]);

        let mut seen = Vec::new();
        drain(&mut rx, &mut seen).await;
        assert!(seen.contains(&Notification::StatusChanged(
            ServerState::StoppingRequested
        )));
        assert!(seen.contains(&Notification::RconConnected));
        assert!(seen.contains(&Notification::RconDisconnected));
        assert_eq!(
            seen.last(),
            Some(&Notification::StatusChanged(ServerState::Offline))
        );
        assert!(!seen.contains(&Notification::StopTimeoutWarning));
        assert_eq!(lc.status().await.state, ServerState::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_window_expiry_warns_but_still_settles_offline() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        // The command is acknowledged but the process never leaves.
        let probe = FakeProbe::new(1);
        let connector = Arc::new(FakeConnector::default());
        let (lc, mut rx) = build(
            cfg,
            probe,
            Arc::new(FakeLauncher::default()),
            connector.clone(),
        );

        lc.attach().await.unwrap();
        lc.stop().await.unwrap();

        let mut seen = Vec::new();
        drain(&mut rx, &mut seen).await;
        assert!(seen.contains(&Notification::StopTimeoutWarning));
        assert_eq!(
            seen.last(),
            Some(&Notification::StatusChanged(ServerState::Offline))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_rcon_restores_the_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let probe = FakeProbe::new(1);
        let connector = Arc::new(FakeConnector {
            refuse: true,
            ..FakeConnector::default()
        });
        let (lc, mut rx) = build(cfg, probe, Arc::new(FakeLauncher::default()), connector);

        lc.attach().await.unwrap();
        let err = lc.stop().await.unwrap_err();
        assert!(err.to_string().contains("RCON"));

        let mut seen = Vec::new();
        drain(&mut rx, &mut seen).await;
        assert_eq!(
            seen.last(),
            Some(&Notification::StatusChanged(ServerState::Online))
        );
        assert_eq!(lc.status().await.state, ServerState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_falls_back_to_forceful_termination() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let probe = FakeProbe::new(1);
        let launcher = Arc::new(FakeLauncher {
            kill_effect: Some(probe.clone()),
            ..FakeLauncher::default()
        });
        let connector = Arc::new(FakeConnector {
            refuse: true,
            ..FakeConnector::default()
        });
        let (lc, mut rx) = build(cfg, probe.clone(), launcher.clone(), connector);

        lc.attach().await.unwrap();

        // Let the relaunch's discovery find a worker again.
        let restart = {
            let lc = lc.clone();
            let probe = probe.clone();
            tokio::spawn(async move {
                let result = lc.restart().await;
                probe.set_vanished(false);
                result
            })
        };
        restart.await.unwrap().unwrap();

        let terminations = launcher.terminations.lock().unwrap().clone();
        assert!(
            terminations.contains(&(WORKER_PID, false)),
            "worker should have been signalled"
        );
        assert_eq!(launcher.spawns.load(Ordering::SeqCst), 1);

        let mut seen = Vec::new();
        drain(&mut rx, &mut seen).await;
        assert!(seen.contains(&Notification::StatusChanged(
            ServerState::StoppingRequested
        )));
        assert!(
            seen.contains(&Notification::StatusChanged(ServerState::Starting)),
            "restart must relaunch after the forced stop"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn attach_without_worker_reports_offline() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let probe = FakeProbe::new(u32::MAX);
        let (lc, mut rx) = build(
            cfg,
            probe,
            Arc::new(FakeLauncher::default()),
            Arc::new(FakeConnector::default()),
        );

        let status = lc.attach().await.unwrap();
        assert_eq!(status.state, ServerState::Offline);

        let mut seen = Vec::new();
        drain(&mut rx, &mut seen).await;
        assert_eq!(
            seen,
            vec![Notification::StatusChanged(ServerState::Offline)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn auto_connect_follows_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.rcon.auto_connect = true;
        write_log(&cfg, config::DEFAULT_STARTUP_MARKER);

        let probe = FakeProbe::new(1);
        let connector = Arc::new(FakeConnector::default());
        let (lc, mut rx) = build(
            cfg,
            probe,
            Arc::new(FakeLauncher::default()),
            connector.clone(),
        );

        lc.start().await.unwrap();

        let mut seen = Vec::new();
        wait_for(&mut rx, &mut seen, |n| {
            matches!(n, Notification::RconConnected)
        })
        .await;

        assert!(lc.status().await.rcon_connected);
        assert_eq!(count_online(&seen), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_command_requires_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let (lc, _rx) = build(
            cfg,
            FakeProbe::new(1),
            Arc::new(FakeLauncher::default()),
            Arc::new(FakeConnector::default()),
        );

        let err = lc.execute_command("lp").await.unwrap_err();
        assert!(matches!(err, ExecError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_rejected_while_already_active() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let probe = FakeProbe::new(1);
        let (lc, _rx) = build(
            cfg,
            probe,
            Arc::new(FakeLauncher::default()),
            Arc::new(FakeConnector::default()),
        );

        lc.attach().await.unwrap();
        let err = lc.start().await.unwrap_err();
        assert!(err.to_string().contains("not offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_monitoring_but_keeps_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let probe = FakeProbe::new(1);
        let (lc, mut rx) = build(
            cfg,
            probe.clone(),
            Arc::new(FakeLauncher::default()),
            Arc::new(FakeConnector::default()),
        );

        lc.attach().await.unwrap();
        lc.shutdown().await;

        // The worker going away after shutdown must not be reported: the
        // monitors are gone.
        probe.set_vanished(true);
        tokio::time::sleep(Duration::from_secs(120)).await;

        let mut seen = Vec::new();
        drain(&mut rx, &mut seen).await;
        assert!(!seen.iter().any(|n| matches!(n, Notification::ProcessLost)));
    }
}
