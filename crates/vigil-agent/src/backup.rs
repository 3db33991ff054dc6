use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use zip::write::SimpleFileOptions;

use vigil_state::{BackupId, Notification};

use crate::config::ServerConfig;

/// Archives the server's save-data tree (`WS/Saved`) into timestamped zip
/// files and reports progress over the shared notification channel.
///
/// Archival runs on a blocking worker; a failed backup is reported and
/// otherwise isolated — it never touches lifecycle state.
#[derive(Clone)]
pub struct BackupCoordinator {
    server_path: PathBuf,
    backup_dir: PathBuf,
    keep_count: usize,
    include_logs: bool,
    notify: mpsc::UnboundedSender<Notification>,
}

impl BackupCoordinator {
    pub fn new(config: &ServerConfig, notify: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            server_path: config.server_path.clone(),
            backup_dir: config.backup.backup_dir.clone(),
            keep_count: config.backup.keep_count.max(1),
            include_logs: config.backup.include_logs,
            notify,
        }
    }

    /// Starts one backup and returns its handle immediately; completion
    /// arrives as a `BackupFinished` notification.
    pub fn create_backup(&self, name: Option<String>) -> anyhow::Result<BackupId> {
        let saved_dir = self.server_path.join("WS").join("Saved");
        if !saved_dir.is_dir() {
            anyhow::bail!("save directory not found: {}", saved_dir.display());
        }
        std::fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("create backup dir {}", self.backup_dir.display()))?;

        let name =
            name.unwrap_or_else(|| format!("backup_{}", chrono::Utc::now().format("%Y%m%d_%H%M%S")));
        let id = BackupId::new();
        let archive_path = self.backup_dir.join(format!("{name}.zip"));

        self.emit(Notification::BackupStarted {
            id: id.clone(),
            name: name.clone(),
        });
        tracing::info!(%name, archive = %archive_path.display(), "backup started");

        let this = self.clone();
        let job_id = id.clone();
        tokio::task::spawn_blocking(move || {
            let result = this.write_archive(&saved_dir, &archive_path, &job_id);
            match result {
                Ok(bytes) => {
                    this.prune_old_backups();
                    let message = format!(
                        "{} written ({:.2} MiB)",
                        archive_path.display(),
                        bytes as f64 / (1024.0 * 1024.0)
                    );
                    tracing::info!(%message, "backup finished");
                    this.emit(Notification::BackupFinished {
                        id: job_id,
                        success: true,
                        message,
                    });
                }
                Err(err) => {
                    // Leave no half-written archive behind.
                    let _ = std::fs::remove_file(&archive_path);
                    tracing::warn!(%err, "backup failed");
                    this.emit(Notification::BackupFinished {
                        id: job_id,
                        success: false,
                        message: err.to_string(),
                    });
                }
            }
        });

        Ok(id)
    }

    /// Periodic automatic backups; the task runs until the coordinator's
    /// channel closes with the application.
    pub fn spawn_auto_backup(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tracing::info!(interval_secs = interval.as_secs(), "automatic backups enabled");
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = this.create_backup(None) {
                    tracing::warn!(%err, "automatic backup could not start");
                }
            }
        })
    }

    fn emit(&self, notification: Notification) {
        let _ = self.notify.send(notification);
    }

    fn write_archive(
        &self,
        saved_dir: &Path,
        archive_path: &Path,
        id: &BackupId,
    ) -> anyhow::Result<u64> {
        let file = std::fs::File::create(archive_path)
            .with_context(|| format!("create {}", archive_path.display()))?;
        let mut zip = zip::ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        self.emit(Notification::BackupProgress {
            id: id.clone(),
            message: "archiving save data".to_string(),
        });

        let mut stack = vec![saved_dir.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir)
                .with_context(|| format!("read dir {}", dir.display()))?;
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !self.include_logs && path.extension().is_some_and(|e| e == "log") {
                    continue;
                }

                // Archive paths stay relative to the install root so a
                // restore lands files where the server expects them.
                let arc_path = path
                    .strip_prefix(&self.server_path)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                zip.start_file(arc_path, options)
                    .with_context(|| format!("add {}", path.display()))?;

                let mut src = std::fs::File::open(&path)
                    .with_context(|| format!("open {}", path.display()))?;
                std::io::copy(&mut src, &mut zip)
                    .with_context(|| format!("compress {}", path.display()))?;

                if path.extension().is_some_and(|e| e == "sav" || e == "db") {
                    self.emit(Notification::BackupProgress {
                        id: id.clone(),
                        message: format!("archived {}", entry.file_name().to_string_lossy()),
                    });
                }
            }
        }

        zip.finish().context("finalize archive")?;
        let bytes = std::fs::metadata(archive_path).map(|m| m.len()).unwrap_or(0);
        Ok(bytes)
    }

    /// Keeps only the newest archives, by modification time.
    fn prune_old_backups(&self) {
        let Ok(entries) = std::fs::read_dir(&self.backup_dir) else {
            return;
        };

        let mut archives: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                if path.extension().is_some_and(|ext| ext == "zip") {
                    let modified = e.metadata().ok()?.modified().ok()?;
                    Some((modified, path))
                } else {
                    None
                }
            })
            .collect();

        if archives.len() <= self.keep_count {
            return;
        }

        archives.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, path) in archives.split_off(self.keep_count) {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::info!(path = %path.display(), "pruned old backup"),
                Err(err) => tracing::warn!(%err, path = %path.display(), "failed to prune backup"),
            }
        }
    }
}
