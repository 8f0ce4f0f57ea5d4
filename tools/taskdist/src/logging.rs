use crate::errors::TaskdistError;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 50 * 1024 * 1024;
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4096;

static RUN_LOG: OnceLock<Mutex<Option<JsonlLogger>>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), TaskdistError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| TaskdistError::Io(e.to_string()))?;
        }
        self.rotate_if_over_budget()?;

        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| TaskdistError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TaskdistError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| TaskdistError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| TaskdistError::Io(e.to_string()))?;
        Ok(())
    }

    fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".1");
        PathBuf::from(name)
    }

    /// Keeps at most one previous generation next to the live file.
    fn rotate_if_over_budget(&self) -> Result<(), TaskdistError> {
        let Ok(meta) = fs::metadata(&self.path) else {
            return Ok(());
        };
        if meta.len() < self.budget_bytes / 2 {
            return Ok(());
        }
        fs::rename(&self.path, self.rotated_path()).map_err(|e| TaskdistError::Io(e.to_string()))
    }
}

/// Installs the process-wide run log. Later calls replace the sink.
pub fn init_run_log(logger: JsonlLogger) {
    let slot = RUN_LOG.get_or_init(|| Mutex::new(None));
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(logger);
    }
}

/// Appends a structured event to the run log. A no-op until `init_run_log`
/// has been called; write failures are dropped so logging never fails a
/// caller.
pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let Some(slot) = RUN_LOG.get() else {
        return;
    };
    let Ok(guard) = slot.lock() else {
        return;
    };
    if let Some(logger) = guard.as_ref() {
        let _ = logger.append(&LogEvent {
            level,
            event_type,
            payload,
        });
    }
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{truncate_json, JsonlLogger, LogEvent};
    use serde_json::json;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;

        logger
            .append(&LogEvent {
                level: "info",
                event_type: "lock.acquired",
                payload: json!({"holder": "abcdefghijklmnopqrstuvwxyz"}),
            })
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"lock.acquired\""));
        assert!(text.contains("..."));
    }

    #[test]
    fn logger_rotates_once_budget_is_reached() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.budget_bytes = 64;

        for idx in 0..4 {
            logger
                .append(&LogEvent {
                    level: "debug",
                    event_type: "stamp.written",
                    payload: json!({ "task_id": idx }),
                })
                .expect("append");
        }

        assert!(dir.path().join("run.jsonl.1").exists());
        let live = std::fs::read_to_string(&path).expect("read live");
        assert!(live.lines().count() < 4);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let value = truncate_json(json!({ "name": "ééééééééééé" }), 12);
        let text = value.as_str().expect("string payload");
        assert!(text.ends_with("..."));
    }
}
