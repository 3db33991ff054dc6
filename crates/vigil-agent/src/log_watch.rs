use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// A classified line from the live server log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    ModLoaded { name: String, id: String },
    StartupComplete { marker: String },
    Raw { text: String },
}

fn mod_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"LoadModulesForEnabledPluginsBegin: ModName:([^,]+), ModID:(\d+)")
            .expect("mod-load pattern is valid")
    })
}

/// Incrementally tails one growing text file that another process is
/// actively writing.
///
/// Each poll opens the file read-only, picks up where the last poll left
/// off, and only ever consumes complete newline-terminated lines; a
/// partially written trailing line stays unread until the writer finishes
/// it. A fresh watcher always starts at offset 0; an instance never rewinds,
/// except that a file shrinking below the remembered offset (rotation or
/// truncation by the writer) restarts it from the top.
pub struct LogTailWatcher {
    path: PathBuf,
    startup_marker: String,
    offset: u64,
    startup_fired: bool,
}

impl LogTailWatcher {
    pub fn new(path: PathBuf, startup_marker: String) -> Self {
        Self {
            path,
            startup_marker,
            offset: 0,
            startup_fired: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads any newly appended complete lines and classifies them.
    ///
    /// Transient access failures (file missing, locked by the writer) are
    /// expected under a concurrent writer: they yield an empty batch and
    /// leave the offset alone, so the next poll retries the same range.
    pub async fn poll(&mut self) -> Vec<LogEvent> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let len = match file.metadata().await {
            Ok(m) => m.len(),
            Err(_) => return Vec::new(),
        };

        if len < self.offset {
            tracing::info!(path = %self.path.display(), "log file shrank; restarting tail from the top");
            self.offset = 0;
        }
        if len == self.offset {
            return Vec::new();
        }

        if file
            .seek(std::io::SeekFrom::Start(self.offset))
            .await
            .is_err()
        {
            return Vec::new();
        }

        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        if file.read_to_end(&mut buf).await.is_err() {
            return Vec::new();
        }

        // Only bytes belonging to complete lines move the offset forward;
        // a truncated trailing write must not be classified.
        let consumed = match buf.iter().rposition(|&b| b == b'\n') {
            Some(i) => i + 1,
            None => return Vec::new(),
        };
        self.offset += consumed as u64;

        let text = String::from_utf8_lossy(&buf[..consumed]);
        let mut events = Vec::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            events.push(self.classify(line));
        }
        events
    }

    /// First match wins: mod-load pattern, then the startup marker, then raw.
    /// The marker string can legitimately reappear later (in-place world
    /// reloads); only its first occurrence per watcher becomes an event.
    fn classify(&mut self, line: &str) -> LogEvent {
        if let Some(caps) = mod_line_regex().captures(line) {
            return LogEvent::ModLoaded {
                name: caps[1].trim().to_string(),
                id: caps[2].to_string(),
            };
        }

        if !self.startup_fired && line.contains(&self.startup_marker) {
            self.startup_fired = true;
            return LogEvent::StartupComplete {
                marker: self.startup_marker.clone(),
            };
        }

        LogEvent::Raw {
            text: line.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MARKER: &str = "Create Dungeon Successed: DiXiaChengLv50, Index = 2";

    fn append(path: &std::path::Path, data: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    fn watcher(path: &std::path::Path) -> LogTailWatcher {
        LogTailWatcher::new(path.to_path_buf(), MARKER.to_string())
    }

    #[tokio::test]
    async fn missing_file_polls_empty_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = watcher(&dir.path().join("WS.log"));
        assert!(w.poll().await.is_empty());
        assert_eq!(w.offset(), 0);
    }

    #[tokio::test]
    async fn complete_lines_are_classified_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("WS.log");
        append(
            &path,
            "LogInit: Build: ++UE4\nLogUGCRegistry: Display: LoadModulesForEnabledPluginsBegin: ModName: BetterUI, ModID:123456.\n",
        );

        let mut w = watcher(&path);
        let events = w.poll().await;
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            LogEvent::Raw {
                text: "LogInit: Build: ++UE4".to_string()
            }
        );
        assert_eq!(
            events[1],
            LogEvent::ModLoaded {
                name: "BetterUI".to_string(),
                id: "123456".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn partial_trailing_line_is_left_for_the_next_poll() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("WS.log");
        append(&path, "first line\nsecond li");

        let mut w = watcher(&path);
        let events = w.poll().await;
        assert_eq!(events.len(), 1);
        assert_eq!(w.offset(), "first line\n".len() as u64);

        // A re-poll with no new bytes must not consume the partial line.
        assert!(w.poll().await.is_empty());

        append(&path, "ne\n");
        let events = w.poll().await;
        assert_eq!(
            events,
            vec![LogEvent::Raw {
                text: "second line".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn startup_marker_fires_exactly_once_per_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("WS.log");
        append(&path, &format!("{MARKER}\n"));

        let mut w = watcher(&path);
        let events = w.poll().await;
        assert_eq!(
            events,
            vec![LogEvent::StartupComplete {
                marker: MARKER.to_string()
            }]
        );

        // The same marker again: still visible, but only as a raw line.
        append(&path, &format!("{MARKER}\n"));
        let events = w.poll().await;
        assert_eq!(
            events,
            vec![LogEvent::Raw {
                text: MARKER.to_string()
            }]
        );
    }

    #[tokio::test]
    async fn marker_seen_twice_in_one_batch_fires_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("WS.log");
        append(&path, &format!("{MARKER}\n{MARKER}\n"));

        let mut w = watcher(&path);
        let events = w.poll().await;
        let fired = events
            .iter()
            .filter(|e| matches!(e, LogEvent::StartupComplete { .. }))
            .count();
        assert_eq!(fired, 1);
    }

    #[tokio::test]
    async fn a_fresh_instance_replays_from_the_top() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("WS.log");
        append(&path, "old line\n");

        let mut first = watcher(&path);
        assert_eq!(first.poll().await.len(), 1);

        let mut second = watcher(&path);
        assert_eq!(second.poll().await.len(), 1);
    }

    #[tokio::test]
    async fn truncation_restarts_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("WS.log");
        append(&path, "line one\nline two\n");

        let mut w = watcher(&path);
        assert_eq!(w.poll().await.len(), 2);

        // The writer rotated the file in place.
        std::fs::write(&path, "fresh\n").unwrap();
        let events = w.poll().await;
        assert_eq!(
            events,
            vec![LogEvent::Raw {
                text: "fresh".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn crlf_lines_are_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("WS.log");
        append(&path, "windows line\r\n");

        let mut w = watcher(&path);
        assert_eq!(
            w.poll().await,
            vec![LogEvent::Raw {
                text: "windows line".to_string()
            }]
        );
    }

    #[test]
    fn mod_pattern_requires_both_fields() {
        assert!(
            mod_line_regex()
                .captures("LoadModulesForEnabledPluginsBegin: ModName: X")
                .is_none()
        );
    }
}
