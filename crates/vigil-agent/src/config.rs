use std::path::{Path, PathBuf};

use anyhow::Context;

pub const DEFAULT_SERVER_EXE: &str = "WSServer.exe";
pub const DEFAULT_WORKER_EXE: &str = "WSServer-Win64-Shipping.exe";
pub const DEFAULT_STARTUP_MARKER: &str = "Create Dungeon Successed: DiXiaChengLv50, Index = 2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Pve,
    Pvp,
}

impl GameMode {
    pub fn flag(self) -> &'static str {
        match self {
            GameMode::Pve => "-pve",
            GameMode::Pvp => "-pvp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RconConfig {
    pub enabled: bool,
    pub addr: String,
    pub port: u16,
    pub password: String,
    /// Connect automatically a few seconds after the server comes online.
    pub auto_connect: bool,
}

impl Default for RconConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: "127.0.0.1".to_string(),
            port: 25575,
            password: "admin".to_string(),
            auto_connect: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub auto_backup: bool,
    pub interval_minutes: u64,
    pub keep_count: usize,
    pub backup_dir: PathBuf,
    pub include_logs: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            auto_backup: false,
            interval_minutes: 30,
            keep_count: 10,
            backup_dir: PathBuf::from("backups"),
            include_logs: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Install directory holding the server executable and the WS data tree.
    pub server_path: PathBuf,
    pub server_name: String,
    pub map_name: String,
    pub max_players: u32,
    pub port: u16,
    /// Bind address handed to the server via `-MULTIHOME`.
    pub multihome: String,
    pub game_mode: GameMode,
    /// Raw user-supplied arguments, split on whitespace and appended before
    /// the RCON flags.
    pub extra_args: String,
    pub server_exe: String,
    pub worker_exe: String,
    pub startup_marker: String,
    pub shutdown_command: String,
    pub rcon: RconConfig,
    pub backup: BackupConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_path: PathBuf::new(),
            server_name: "Soulmask Server".to_string(),
            map_name: "Level01_Main".to_string(),
            max_players: 20,
            port: 7777,
            multihome: "0.0.0.0".to_string(),
            game_mode: GameMode::Pve,
            extra_args: String::new(),
            server_exe: DEFAULT_SERVER_EXE.to_string(),
            worker_exe: DEFAULT_WORKER_EXE.to_string(),
            startup_marker: DEFAULT_STARTUP_MARKER.to_string(),
            // Asks the server to shut down after a 10-second grace delay.
            shutdown_command: "close 10".to_string(),
            rcon: RconConfig::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn server_exe_path(&self) -> PathBuf {
        self.server_path.join(&self.server_exe)
    }

    /// The live server log the lifecycle tails for startup and mod events.
    pub fn log_file_path(&self) -> PathBuf {
        self.server_path
            .join("WS")
            .join("Saved")
            .join("Logs")
            .join("WS.log")
    }

    /// World saves and server settings; this is what backups archive.
    pub fn saved_dir(&self) -> PathBuf {
        self.server_path.join("WS").join("Saved")
    }
}

/// Loads the config, falling back to defaults when the file does not exist
/// yet (first run).
pub fn load(path: &Path) -> anyhow::Result<ServerConfig> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no config file; using defaults");
            return Ok(ServerConfig::default());
        }
        Err(e) => return Err(e).with_context(|| format!("read config {}", path.display())),
    };
    serde_json::from_str(&data).with_context(|| format!("parse config {}", path.display()))
}

/// Persists atomically: write a sibling tmp file, then rename over the
/// target.
pub fn save(path: &Path, config: &ServerConfig) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create config dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(config).context("serialize config")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &data).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

pub fn validate(config: &ServerConfig) -> anyhow::Result<()> {
    if config.server_path.as_os_str().is_empty() {
        anyhow::bail!("server_path must be set");
    }
    if config.server_name.trim().is_empty() {
        anyhow::bail!("server_name must be non-empty");
    }
    if config.port < 1024 {
        anyhow::bail!("port out of range: {}", config.port);
    }
    if !(1..=100).contains(&config.max_players) {
        anyhow::bail!("max_players out of range: {}", config.max_players);
    }
    if config.rcon.enabled {
        if config.rcon.password.is_empty() {
            anyhow::bail!("rcon password must be non-empty when RCON is enabled");
        }
        if config.rcon.port < 1024 {
            anyhow::bail!("rcon port out of range: {}", config.rcon.port);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ServerConfig {
        ServerConfig {
            server_path: PathBuf::from("/srv/soulmask"),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn defaults_validate_once_path_is_set() {
        validate(&valid_config()).unwrap();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(&dir.path().join("server_config.json")).unwrap();
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs").join("server_config.json");

        let mut cfg = valid_config();
        cfg.max_players = 42;
        cfg.game_mode = GameMode::Pvp;
        cfg.rcon.auto_connect = true;

        save(&path, &cfg).unwrap();
        let back = load(&path).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn unknown_fields_do_not_break_older_configs() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"port": 7878}"#).unwrap();
        assert_eq!(cfg.port, 7878);
        assert_eq!(cfg.max_players, 20);
    }

    #[test]
    fn empty_rcon_password_is_rejected() {
        let mut cfg = valid_config();
        cfg.rcon.password.clear();
        let err = validate(&cfg).unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn low_port_is_rejected() {
        let mut cfg = valid_config();
        cfg.port = 80;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn log_file_path_follows_the_ws_tree() {
        let cfg = valid_config();
        assert!(
            cfg.log_file_path()
                .ends_with(Path::new("WS/Saved/Logs/WS.log"))
        );
    }
}
