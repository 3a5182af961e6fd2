use std::collections::VecDeque;
use std::panic;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;

/// Bounded ring of recent log lines plus a panic hook, so a crash carries
/// the last ~100 lines of context the way `original_source/crash_logger.py`
/// does. Rust-ified: no POSIX signal field (the process either panics or
/// exits via an explicit error path, never a caught signal), no
/// test-harness-specific fields (`test_name`/`test_args` — this is the
/// production binary, not a test runner).
const MAX_CONTEXT_LINES: usize = 100;

#[derive(Clone)]
pub struct CrashLog {
    session_dir: PathBuf,
    session_id: String,
    recent_lines: Arc<Mutex<VecDeque<String>>>,
}

#[derive(Serialize)]
struct CrashRecord<'a> {
    session_id: &'a str,
    crashed_at: String,
    reason: &'a str,
    last_output_lines: Vec<String>,
}

impl CrashLog {
    pub fn new(session_dir: impl AsRef<Path>) -> Self {
        let session_id = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        Self {
            session_dir: session_dir.as_ref().join("crash_logs"),
            session_id,
            recent_lines: Arc::new(Mutex::new(VecDeque::with_capacity(MAX_CONTEXT_LINES))),
        }
    }

    /// Record one line of context (typically mirrored from a `log::Record`
    /// via a custom logger, or pushed directly at call sites that already
    /// hold a human-readable summary).
    pub fn push_line(&self, line: impl Into<String>) {
        let mut lines = self.recent_lines.lock().unwrap();
        if lines.len() >= MAX_CONTEXT_LINES {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Install a panic hook that writes a crash record before re-invoking
    /// the default hook (which still prints the usual backtrace to
    /// stderr). Mirrors `main.rs`'s `panic::set_hook` wrapper exactly,
    /// plus the structured JSON record `crash_logger.py::log_crash` wrote.
    pub fn install_panic_hook(self) {
        let original_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            let location = panic_info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_else(|| "unknown location".to_string());
            let reason = format!("{message} at {location}");

            log::error!("panic: {reason}");
            if let Err(e) = self.write_record(&reason) {
                log::error!("failed to write crash log: {e}");
            }

            original_hook(panic_info);
        }));
    }

    /// Write the crash record now, without panicking — used for
    /// unrecoverable child-process failures that exit cleanly rather than
    /// through a Rust panic (spec.md 4.A's "unrecoverable child-process
    /// failure" error class).
    pub fn write_record(&self, reason: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.session_dir)?;
        let record = CrashRecord {
            session_id: &self.session_id,
            crashed_at: Utc::now().to_rfc3339(),
            reason,
            last_output_lines: self.recent_lines.lock().unwrap().iter().cloned().collect(),
        };
        let path = self
            .session_dir
            .join(format!("session_{}.json", self.session_id));
        let json = serde_json::to_string_pretty(&record)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_record_creates_session_dir_and_json_file() {
        let dir = tempdir().unwrap();
        let crash_log = CrashLog::new(dir.path());
        crash_log.push_line("line one");
        crash_log.push_line("line two");
        crash_log.write_record("test failure").unwrap();

        let crash_dir = dir.path().join("crash_logs");
        let entries: Vec<_> = std::fs::read_dir(&crash_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn recent_lines_are_bounded_to_max_context() {
        let dir = tempdir().unwrap();
        let crash_log = CrashLog::new(dir.path());
        for i in 0..150 {
            crash_log.push_line(format!("line {i}"));
        }
        assert_eq!(crash_log.recent_lines.lock().unwrap().len(), MAX_CONTEXT_LINES);
    }
}
