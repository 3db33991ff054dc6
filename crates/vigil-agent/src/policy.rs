//! Timing policy for the lifecycle machinery. Every knob has a production
//! default and a `VIGIL_*` environment override, clamped to a sane range.

use std::time::Duration;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

/// Interval between worker-process discovery probes after launch.
pub fn worker_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("VIGIL_WORKER_POLL_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(5_000),
    )
}

/// How many discovery probes to run before declaring the launch failed.
pub fn worker_poll_attempts() -> u32 {
    env_u64("VIGIL_WORKER_POLL_ATTEMPTS")
        .map(|v| v.clamp(1, 240) as u32)
        .unwrap_or(12)
}

/// Wall-clock bound on the whole Starting phase; without the startup marker
/// by then, the launch is declared timed out.
pub fn startup_timeout() -> Duration {
    Duration::from_secs(
        env_u64("VIGIL_STARTUP_TIMEOUT_SEC")
            .map(|v| v.clamp(10, 7_200))
            .unwrap_or(600),
    )
}

/// Interval of the liveness monitor while the server is online.
pub fn liveness_interval() -> Duration {
    Duration::from_millis(
        env_u64("VIGIL_LIVENESS_POLL_MS")
            .map(|v| v.clamp(250, 60_000))
            .unwrap_or(5_000),
    )
}

/// How long a missing worker process is tolerated before the server is
/// declared lost. Process-table reads flap; a single miss means nothing.
pub fn process_missing_grace() -> Duration {
    Duration::from_secs(
        env_u64("VIGIL_PROCESS_GRACE_SEC")
            .map(|v| v.clamp(1, 600))
            .unwrap_or(30),
    )
}

/// How long `stop` waits for the worker to disappear after the shutdown
/// command before warning the operator.
pub fn stop_wait() -> Duration {
    Duration::from_secs(
        env_u64("VIGIL_STOP_WAIT_SEC")
            .map(|v| v.clamp(1, 600))
            .unwrap_or(30),
    )
}

/// Pause between a confirmed stop and the relaunch during restart.
pub fn restart_cooldown() -> Duration {
    Duration::from_secs(
        env_u64("VIGIL_RESTART_COOLDOWN_SEC")
            .map(|v| v.clamp(0, 300))
            .unwrap_or(10),
    )
}

/// Delay before the post-startup automatic RCON connect, giving the listener
/// socket time to bind.
pub fn rcon_connect_delay() -> Duration {
    Duration::from_millis(
        env_u64("VIGIL_RCON_CONNECT_DELAY_MS")
            .map(|v| v.clamp(0, 60_000))
            .unwrap_or(3_000),
    )
}

/// Per-call RCON I/O deadline.
pub fn rcon_io_timeout() -> Duration {
    Duration::from_millis(
        env_u64("VIGIL_RCON_TIMEOUT_MS")
            .map(|v| v.clamp(100, 120_000))
            .unwrap_or(5_000),
    )
}

/// Interval between log-tail polls.
pub fn log_poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("VIGIL_LOG_POLL_MS")
            .map(|v| v.clamp(100, 60_000))
            .unwrap_or(1_000),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        assert_eq!(worker_poll_interval(), Duration::from_secs(5));
        assert_eq!(worker_poll_attempts(), 12);
        assert_eq!(startup_timeout(), Duration::from_secs(600));
        assert_eq!(process_missing_grace(), Duration::from_secs(30));
        assert_eq!(stop_wait(), Duration::from_secs(30));
        assert_eq!(restart_cooldown(), Duration::from_secs(10));
        assert_eq!(rcon_connect_delay(), Duration::from_secs(3));
        assert_eq!(rcon_io_timeout(), Duration::from_secs(5));
    }
}
