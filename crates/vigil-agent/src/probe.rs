use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("process {pid} not found")]
    NotFound { pid: u32 },
    #[error("access to process {pid} denied")]
    AccessDenied { pid: u32 },
}

/// Read-only view of the OS process table.
///
/// A process vanishing mid-query is ordinary churn: it is reported as simply
/// absent, never as an error.
pub trait ProcessProbe: Send + Sync {
    fn find_by_name(&self, exe_name: &str) -> Vec<ProcessInfo>;
    fn memory_of(&self, pid: u32) -> Result<u64, ProbeError>;
}

/// Probe backed by the `/proc` filesystem.
#[derive(Debug, Default, Clone)]
pub struct ProcProbe;

impl ProcessProbe for ProcProbe {
    #[cfg(target_os = "linux")]
    fn find_by_name(&self, exe_name: &str) -> Vec<ProcessInfo> {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for entry in entries.flatten() {
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            // The process can exit between the directory scan and these
            // reads; every helper returns None in that case.
            let Some(name) = process_name(pid) else {
                continue;
            };
            if name != exe_name {
                continue;
            }
            let created_at = process_start_time(pid).unwrap_or_else(Utc::now);
            out.push(ProcessInfo {
                pid,
                name,
                created_at,
            });
        }
        out
    }

    #[cfg(not(target_os = "linux"))]
    fn find_by_name(&self, _exe_name: &str) -> Vec<ProcessInfo> {
        Vec::new()
    }

    #[cfg(target_os = "linux")]
    fn memory_of(&self, pid: u32) -> Result<u64, ProbeError> {
        let statm = match std::fs::read_to_string(format!("/proc/{pid}/statm")) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(ProbeError::AccessDenied { pid });
            }
            Err(_) => return Err(ProbeError::NotFound { pid }),
        };

        let mut it = statm.split_whitespace();
        let _size_pages = it.next();
        let resident_pages: u64 = it
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or(ProbeError::NotFound { pid })?;
        Ok(resident_pages.saturating_mul(page_size()))
    }

    #[cfg(not(target_os = "linux"))]
    fn memory_of(&self, pid: u32) -> Result<u64, ProbeError> {
        Err(ProbeError::NotFound { pid })
    }
}

/// Executable name as the process table knows it. `/proc/<pid>/comm`
/// truncates to 15 bytes, which would cut long server binary names, so
/// argv[0] is preferred and comm is the fallback.
#[cfg(target_os = "linux")]
fn process_name(pid: u32) -> Option<String> {
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if let Some(argv0) = cmdline.split(|&b| b == 0).next()
        && !argv0.is_empty()
    {
        let s = String::from_utf8_lossy(argv0);
        let name = s.rsplit(['/', '\\']).next().unwrap_or_default();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }

    let comm = std::fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    let comm = comm.trim_end();
    if comm.is_empty() {
        None
    } else {
        Some(comm.to_string())
    }
}

#[cfg(target_os = "linux")]
fn process_start_time(pid: u32) -> Option<DateTime<Utc>> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Skip past the parenthesized comm; fields after it are stable.
    let end = stat.rfind(')')?;
    let rest = stat.get((end + 2)..)?;
    // starttime is field 22 of stat, the 20th after comm, in clock ticks
    // since boot.
    let start_ticks: u64 = rest.split_whitespace().nth(19)?.parse().ok()?;
    let secs = boot_time_secs().checked_add(start_ticks / ticks_per_sec())?;
    DateTime::from_timestamp(secs as i64, 0)
}

#[cfg(target_os = "linux")]
fn boot_time_secs() -> u64 {
    use std::sync::OnceLock;
    static BOOT: OnceLock<u64> = OnceLock::new();
    *BOOT.get_or_init(|| {
        std::fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|s| {
                s.lines()
                    .find_map(|l| l.strip_prefix("btime").map(|v| v.trim().to_string()))
            })
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    })
}

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    use std::sync::OnceLock;
    static TICKS: OnceLock<u64> = OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    use std::sync::OnceLock;
    static PAGE: OnceLock<u64> = OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}
