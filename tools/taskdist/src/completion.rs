use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::TaskdistError;
use crate::logging::append_run_log;
use crate::types::{ProjectId, TaskId, TaskResult};

pub const TASK_COMPLETED_EVENT: &str = "task_completed";

/// UTC, second precision, as webhook receivers expect it.
const FIRED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Emitted once per ongoing-to-completed transition of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompleted {
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub project_short_name: String,
    pub result_id: i64,
    pub completed_at: i64,
}

impl TaskCompleted {
    pub fn from_result(result: &TaskResult, project_short_name: &str, completed_at: i64) -> Self {
        Self {
            task_id: result.task_id,
            project_id: result.project_id,
            project_short_name: project_short_name.to_string(),
            result_id: result.id,
            completed_at,
        }
    }
}

/// Body posted to a project's webhook for a completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub project_short_name: String,
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub result_id: i64,
    pub fired_at: String,
}

impl From<&TaskCompleted> for WebhookPayload {
    fn from(event: &TaskCompleted) -> Self {
        Self {
            event: TASK_COMPLETED_EVENT.to_string(),
            project_short_name: event.project_short_name.clone(),
            project_id: event.project_id,
            task_id: event.task_id,
            result_id: event.result_id,
            fired_at: format_fired_at(event.completed_at),
        }
    }
}

fn format_fired_at(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|at| at.format(FIRED_AT_FORMAT).to_string())
        .unwrap_or_default()
}

pub trait CompletionListener: Send + Sync {
    fn on_task_completed(&self, event: &TaskCompleted) -> Result<(), TaskdistError>;
}

/// Calls every listener; failures are logged and never propagate.
pub fn notify_all(listeners: &[Box<dyn CompletionListener>], event: &TaskCompleted) {
    for (idx, listener) in listeners.iter().enumerate() {
        match listener.on_task_completed(event) {
            Ok(()) => append_run_log(
                "info",
                "completion.notified",
                json!({ "listener": idx, "task_id": event.task_id, "result_id": event.result_id }),
            ),
            Err(e) => append_run_log(
                "error",
                "completion.listener_failed",
                json!({ "listener": idx, "task_id": event.task_id, "error": e.to_string() }),
            ),
        }
    }
}

/// Appends one webhook payload per line for a delivery worker to pick up.
pub struct JsonlWebhookOutbox {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlWebhookOutbox {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> Result<Vec<WebhookPayload>, TaskdistError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(TaskdistError::Io(e.to_string())),
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    TaskdistError::Io(format!("malformed outbox line in {}: {e}", self.path.display()))
                })
            })
            .collect()
    }
}

impl CompletionListener for JsonlWebhookOutbox {
    fn on_task_completed(&self, event: &TaskCompleted) -> Result<(), TaskdistError> {
        let line = serde_json::to_string(&WebhookPayload::from(event))
            .map_err(|e| TaskdistError::Io(e.to_string()))?;
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| TaskdistError::Io("outbox lock poisoned".to_string()))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| TaskdistError::Io(e.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| TaskdistError::Io(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| TaskdistError::Io(e.to_string()))
    }
}

/// Keeps events in memory; used where completions are inspected in-process.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<TaskCompleted>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<TaskCompleted> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl CompletionListener for RecordingListener {
    fn on_task_completed(&self, event: &TaskCompleted) -> Result<(), TaskdistError> {
        self.events
            .lock()
            .map_err(|_| TaskdistError::Io("listener lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

impl<T: CompletionListener + ?Sized> CompletionListener for std::sync::Arc<T> {
    fn on_task_completed(&self, event: &TaskCompleted) -> Result<(), TaskdistError> {
        (**self).on_task_completed(event)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::{
        notify_all, CompletionListener, JsonlWebhookOutbox, RecordingListener, TaskCompleted,
        WebhookPayload,
    };
    use crate::errors::TaskdistError;

    struct FailingListener;

    impl CompletionListener for FailingListener {
        fn on_task_completed(&self, _event: &TaskCompleted) -> Result<(), TaskdistError> {
            Err(TaskdistError::Io("webhook endpoint refused".to_string()))
        }
    }

    fn event() -> TaskCompleted {
        TaskCompleted {
            task_id: 4,
            project_id: 2,
            project_short_name: "birds".to_string(),
            result_id: 9,
            completed_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn webhook_payload_matches_wire_shape() {
        let payload = serde_json::to_value(WebhookPayload::from(&event())).expect("encode");
        assert_eq!(
            payload,
            json!({
                "event": "task_completed",
                "project_short_name": "birds",
                "project_id": 2,
                "task_id": 4,
                "result_id": 9,
                "fired_at": "2023-11-14 22:13:20",
            })
        );
    }

    #[test]
    fn fired_at_is_utc_with_second_precision() {
        let mut late = event();
        late.completed_at = 1_700_000_000_999;
        assert_eq!(WebhookPayload::from(&late).fired_at, "2023-11-14 22:13:20");
        late.completed_at = 0;
        assert_eq!(WebhookPayload::from(&late).fired_at, "1970-01-01 00:00:00");
    }

    #[test]
    fn outbox_appends_one_line_per_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outbox = JsonlWebhookOutbox::new(dir.path().join("hooks/outbox.jsonl"));
        assert!(outbox.read_all().expect("empty").is_empty());

        outbox.on_task_completed(&event()).expect("first");
        let mut second = event();
        second.task_id = 5;
        outbox.on_task_completed(&second).expect("second");

        let lines = outbox.read_all().expect("read");
        assert_eq!(lines.iter().map(|p| p.task_id).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn failing_listener_does_not_stop_the_others() {
        let recorder = Arc::new(RecordingListener::default());
        let listeners: Vec<Box<dyn CompletionListener>> =
            vec![Box::new(FailingListener), Box::new(Arc::clone(&recorder))];
        notify_all(&listeners, &event());
        assert_eq!(recorder.events(), vec![event()]);
    }
}
