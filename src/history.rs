//! Append-only command history log.
//!
//! Every executed command is recorded as a block of text delimited by
//! `=` rules. The layout is consumed by external tooling, so it must not
//! change. Each entry is built in memory and written with a single append
//! so concurrent writers never interleave.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::warn;

/// Directory under `$HOME` holding the default log.
pub const HISTORY_DIR_NAME: &str = "EFDBUI";
/// Default log file name.
pub const HISTORY_FILE_NAME: &str = "command_history.log";

const SEPARATOR_WIDTH: usize = 80;

/// One executed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub command: String,
    pub output: String,
    pub error: Option<String>,
}

impl HistoryEntry {
    pub fn new(command: impl Into<String>, output: impl Into<String>, error: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            command: command.into(),
            output: output.into(),
            error,
        }
    }

    /// Renders the entry exactly as it is appended to the log.
    pub fn render(&self) -> String {
        let separator = "=".repeat(SEPARATOR_WIDTH);
        let timestamp = self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
        let error_block = match &self.error {
            Some(error) => format!("\n{separator}\nERROR:\n{error}"),
            None => String::new(),
        };
        format!(
            "\n{separator}\nTIMESTAMP: {timestamp}\nCOMMAND: {}\n{separator}\nOUTPUT:\n{}\n{error_block}\n{separator}\n",
            self.command, self.output
        )
    }
}

/// Default location: `~/EFDBUI/command_history.log`.
pub fn default_history_path() -> Option<PathBuf> {
    dirs_next::home_dir().map(|home| home.join(HISTORY_DIR_NAME).join(HISTORY_FILE_NAME))
}

/// Writer for the history log file.
#[derive(Debug)]
pub struct HistoryLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry, creating the file and its directory if needed.
    pub fn append(&self, entry: &HistoryEntry) -> io::Result<()> {
        let rendered = entry.render();
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(rendered.as_bytes())?;
        file.flush()
    }

    /// Appends an entry, logging instead of failing. History is a sink; a
    /// write failure must not change the outcome of the command.
    pub fn record(&self, command: &str, output: &str, error: Option<&str>) {
        let entry = HistoryEntry::new(command, output, error.map(str::to_string));
        if let Err(err) = self.append(&entry) {
            warn!(path = %self.path.display(), "failed to write command history: {err}");
        }
    }

    /// Like [`HistoryLog::record`], but performs the file I/O on the
    /// blocking pool. Completes once the entry is written.
    pub async fn record_async(
        self: Arc<Self>,
        command: String,
        output: String,
        error: Option<String>,
    ) {
        let writer = self.clone();
        let written = tokio::task::spawn_blocking(move || {
            writer.record(&command, &output, error.as_deref());
        })
        .await;
        if let Err(err) = written {
            warn!(path = %self.path.display(), "history writer task failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn fixed_entry(error: Option<&str>) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            command: "efdb cluster pause c1".into(),
            output: "paused".into(),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn renders_entry_without_error() {
        let sep = "=".repeat(80);
        let expected = format!(
            "\n{sep}\nTIMESTAMP: 2024-05-01T12:30:00Z\nCOMMAND: efdb cluster pause c1\n{sep}\nOUTPUT:\npaused\n\n{sep}\n"
        );
        assert_eq!(fixed_entry(None).render(), expected);
    }

    #[test]
    fn renders_entry_with_error() {
        let sep = "=".repeat(80);
        let expected = format!(
            "\n{sep}\nTIMESTAMP: 2024-05-01T12:30:00Z\nCOMMAND: efdb cluster pause c1\n{sep}\nOUTPUT:\npaused\n\n{sep}\nERROR:\nboom\n{sep}\n"
        );
        assert_eq!(fixed_entry(Some("boom")).render(), expected);
    }

    #[test]
    fn appends_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = HistoryLog::new(dir.path().join("nested").join("history.log"));
        for n in 1..=3 {
            log.record(&format!("cmd {n}"), &format!("out {n}"), None);
        }
        let contents = fs::read_to_string(log.path()).unwrap();
        let commands: Vec<&str> = contents
            .lines()
            .filter(|line| line.starts_with("COMMAND: "))
            .collect();
        assert_eq!(commands, vec!["COMMAND: cmd 1", "COMMAND: cmd 2", "COMMAND: cmd 3"]);
        assert_eq!(contents.matches("TIMESTAMP: ").count(), 3);
    }

    #[tokio::test]
    async fn async_record_writes_before_returning() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(HistoryLog::new(dir.path().join("history.log")));
        log.clone()
            .record_async("cmd 1".into(), "out".into(), Some("bad".into()))
            .await;
        log.clone().record_async("cmd 2".into(), "".into(), None).await;
        let contents = fs::read_to_string(log.path()).unwrap();
        let commands: Vec<&str> = contents
            .lines()
            .filter(|line| line.starts_with("COMMAND: "))
            .collect();
        assert_eq!(commands, vec!["COMMAND: cmd 1", "COMMAND: cmd 2"]);
        assert!(contents.contains("\nERROR:\nbad\n"));
    }

    #[test]
    fn concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(HistoryLog::new(dir.path().join("history.log")));
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let log = log.clone();
                std::thread::spawn(move || log.record(&format!("cmd {n}"), &"x".repeat(4096), None))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let contents = fs::read_to_string(log.path()).unwrap();
        let sep = "=".repeat(80);
        let entries: Vec<&str> = contents
            .split(&format!("\n{sep}\nTIMESTAMP: "))
            .skip(1)
            .collect();
        assert_eq!(entries.len(), 8);
        for entry in entries {
            assert!(entry.contains(&format!("\nOUTPUT:\n{}\n", "x".repeat(4096))));
        }
    }
}
