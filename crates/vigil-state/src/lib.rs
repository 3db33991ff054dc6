use chrono::{DateTime, Utc};

/// Authoritative lifecycle status of the managed server.
///
/// NOTE: `Online` is only ever reached through a startup-marker log event or
/// the attach-time reconciliation path; process existence alone never
/// promotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ServerState {
    Offline,
    Starting,
    Online,
    StoppingRequested,
}

impl ServerState {
    pub fn is_active(self) -> bool {
        !matches!(self, ServerState::Offline)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BackupId(pub String);

impl BackupId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for BackupId {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot handed to the shell; cheap to clone and serialize.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerStatus {
    pub state: ServerState,
    pub launcher_pid: Option<u32>,
    pub worker_pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_secs: Option<u64>,
    pub rcon_connected: bool,
    pub worker_rss_bytes: Option<u64>,
}

/// Fire-and-forget events for the shell and the log sink.
///
/// Delivery is over an unbounded channel; emitting never blocks and a closed
/// receiver is ignored. Background-detected conditions (process loss, startup
/// timeout) arrive here, not as errors.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Notification {
    StatusChanged(ServerState),
    LogLine(String),
    ModLoaded { name: String, id: String },
    RconConnected,
    RconDisconnected,
    StartupFailed { reason: String },
    StartupTimeout,
    ProcessLost,
    StopTimeoutWarning,
    BackupStarted { id: BackupId, name: String },
    BackupProgress { id: BackupId, message: String },
    BackupFinished { id: BackupId, success: bool, message: String },
}
