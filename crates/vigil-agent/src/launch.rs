use std::path::PathBuf;

use anyhow::Context;

use crate::config::ServerConfig;

/// Fully resolved spawn request: program, literal argv, working directory.
///
/// This is the one place untrusted configuration reaches process arguments.
/// Arguments are always passed as a literal array, never through a shell, so
/// nothing in them is ever interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Builds the server's argument vector.
///
/// The order matters to the server's own parser: map name first, fixed
/// engine flags, network/session parameters, game mode, user extras, and
/// the RCON flags last.
pub fn build_launch_spec(config: &ServerConfig) -> anyhow::Result<LaunchSpec> {
    let program = config.server_exe_path();
    if !program.is_file() {
        anyhow::bail!("server executable not found: {}", program.display());
    }

    let mut args = vec![
        config.map_name.clone(),
        "-server".to_string(),
        "-log".to_string(),
        "-UTF8Output".to_string(),
        format!("-MULTIHOME={}", config.multihome),
        "-EchoPort=18888".to_string(),
        "-forcepassthrough".to_string(),
        format!("-PORT={}", config.port),
        format!("-MaxPlayers={}", config.max_players),
        format!("-SteamServerName={}", config.server_name),
        "-QueryPort=27015".to_string(),
        config.game_mode.flag().to_string(),
    ];

    // User extras carry mod lists and the like; whitespace-split, verbatim.
    args.extend(config.extra_args.split_whitespace().map(str::to_string));

    if config.rcon.enabled {
        args.push(format!("-rconpsw={}", config.rcon.password));
        args.push(format!("-rconport={}", config.rcon.port));
        args.push(format!("-rconaddr={}", config.rcon.addr));
    }

    Ok(LaunchSpec {
        program,
        args,
        cwd: config.server_path.clone(),
    })
}

/// Renders the command line for logging, with the RCON password elided.
pub fn display_spec(spec: &LaunchSpec) -> String {
    let mut parts = vec![spec.program.display().to_string()];
    for arg in &spec.args {
        if arg.starts_with("-rconpsw=") {
            parts.push("-rconpsw=<redacted>".to_string());
        } else {
            parts.push(arg.clone());
        }
    }
    parts.join(" ")
}

/// Spawns and signals server processes. The trait seam keeps the lifecycle
/// free of real process side effects.
pub trait ServerLauncher: Send + Sync {
    /// Starts the server and returns the launcher pid. The spawned process
    /// must not die with the supervisor.
    fn spawn_server(&self, spec: &LaunchSpec) -> anyhow::Result<u32>;

    /// Best-effort signal delivery; `force` escalates from a polite
    /// termination request to a kill.
    fn terminate(&self, pid: u32, force: bool) -> bool;
}

#[derive(Debug, Default, Clone)]
pub struct ProcessSpawner;

impl ServerLauncher for ProcessSpawner {
    fn spawn_server(&self, spec: &LaunchSpec) -> anyhow::Result<u32> {
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        #[cfg(unix)]
        {
            // New session: the server must outlive the supervisor and must
            // not receive the supervisor's terminal signals.
            unsafe {
                cmd.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn server: {}", spec.program.display()))?;
        let pid = child
            .id()
            .context("spawned server has no pid (already reaped?)")?;

        // Reap in the background so a dead launcher never lingers as a
        // zombie. Liveness is judged by the process probe, not by this wait.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(pid)
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32, force: bool) -> bool {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        unsafe { libc::kill(pid as i32, sig) == 0 }
    }

    #[cfg(not(unix))]
    fn terminate(&self, _pid: u32, _force: bool) -> bool {
        false
    }
}
