use crate::errors::TaskdistError;
use crate::quiz::QuizConfig;
use crate::scheduler::SchedulerPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub type ProjectId = i64;
pub type TaskId = i64;
pub type UserId = i64;

pub const DEFAULT_N_ANSWERS: i64 = 30;

/// Whoever asks for or submits work: an authenticated user or, failing that,
/// the (possibly anonymized) address the request came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Contributor {
    User(UserId),
    Ip(String),
}

impl Contributor {
    pub fn from_parts(user_id: Option<UserId>, user_ip: Option<&str>) -> Result<Self, TaskdistError> {
        match (user_id, user_ip) {
            (Some(id), None) => Ok(Self::User(id)),
            (None, Some(ip)) if !ip.trim().is_empty() => Ok(Self::Ip(ip.trim().to_string())),
            (Some(_), Some(_)) => Err(TaskdistError::InvalidInput(
                "contributor must be a user id or an ip, not both".to_string(),
            )),
            _ => Err(TaskdistError::InvalidInput(
                "contributor requires a user id or an ip".to_string(),
            )),
        }
    }

    /// Parses the `user:<id>` / `ip:<addr>` form produced by [`Contributor::key`].
    pub fn parse(value: &str) -> Result<Self, TaskdistError> {
        if let Some(id) = value.strip_prefix("user:") {
            let id = id.parse::<UserId>().map_err(|_| {
                TaskdistError::InvalidInput(format!("invalid user id in contributor `{value}`"))
            })?;
            return Ok(Self::User(id));
        }
        if let Some(ip) = value.strip_prefix("ip:") {
            return Self::from_parts(None, Some(ip));
        }
        Err(TaskdistError::InvalidInput(format!(
            "contributor must look like user:<id> or ip:<addr>, got `{value}`"
        )))
    }

    pub fn key(&self) -> String {
        match self {
            Self::User(id) => format!("user:{id}"),
            Self::Ip(ip) => format!("ip:{ip}"),
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::User(id) => Some(*id),
            Self::Ip(_) => None,
        }
    }

    pub fn user_ip(&self) -> Option<&str> {
        match self {
            Self::User(_) => None,
            Self::Ip(ip) => Some(ip.as_str()),
        }
    }
}

impl fmt::Display for Contributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Ongoing,
    Completed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ongoing => "ongoing",
            Self::Completed => "completed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "ongoing" => Some(Self::Ongoing),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub short_name: String,
    pub scheduler: SchedulerPolicy,
    pub lock_timeout_seconds: Option<u64>,
    pub quiz: QuizConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewProject {
    pub short_name: String,
    pub scheduler: SchedulerPolicy,
    pub lock_timeout_seconds: Option<u64>,
    pub quiz: QuizConfig,
}

impl NewProject {
    pub fn named(short_name: &str) -> Self {
        Self {
            short_name: short_name.to_string(),
            scheduler: SchedulerPolicy::Default,
            lock_timeout_seconds: None,
            quiz: QuizConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub n_answers: i64,
    pub priority: f64,
    pub state: TaskState,
    pub calibration: bool,
    pub gold_answers: Option<Value>,
    pub user_pref: Option<Value>,
    pub info: Value,
    pub created: i64,
}

impl Task {
    pub fn is_gold(&self) -> bool {
        self.calibration
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub project_id: ProjectId,
    pub n_answers: i64,
    pub priority: f64,
    pub calibration: bool,
    pub gold_answers: Option<Value>,
    pub user_pref: Option<Value>,
    pub info: Value,
}

impl NewTask {
    pub fn for_project(project_id: ProjectId) -> Self {
        Self {
            project_id,
            n_answers: DEFAULT_N_ANSWERS,
            priority: 0.0,
            calibration: false,
            gold_answers: None,
            user_pref: None,
            info: Value::Object(Default::default()),
        }
    }
}

/// A schedulable task together with the number of runs already accepted for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub task: Task,
    pub accepted_count: i64,
}

impl Candidate {
    /// Redundancy still open; zero or negative means the task is saturated.
    pub fn remaining(&self) -> i64 {
        self.task.n_answers - self.accepted_count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: i64,
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub contributor: Contributor,
    pub info: Value,
    pub created: i64,
    pub finish_time: i64,
}

/// Submission as received from a contributor, before the guard has vouched
/// for it and timestamps are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTaskRun {
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub contributor: Contributor,
    pub info: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: i64,
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub task_run_ids: Vec<i64>,
    pub last_version: i64,
    pub created: i64,
}

#[cfg(test)]
mod tests {
    use super::{Candidate, Contributor, NewTask, Task, TaskState};
    use crate::errors::TaskdistError;

    #[test]
    fn contributor_requires_exactly_one_identity() {
        assert_eq!(
            Contributor::from_parts(Some(7), None).expect("user"),
            Contributor::User(7)
        );
        assert_eq!(
            Contributor::from_parts(None, Some("10.0.0.1")).expect("ip"),
            Contributor::Ip("10.0.0.1".to_string())
        );
        assert!(matches!(
            Contributor::from_parts(Some(7), Some("10.0.0.1")),
            Err(TaskdistError::InvalidInput(_))
        ));
        assert!(matches!(
            Contributor::from_parts(None, Some("  ")),
            Err(TaskdistError::InvalidInput(_))
        ));
    }

    #[test]
    fn contributor_key_round_trips_through_parse() {
        for contributor in [Contributor::User(42), Contributor::Ip("127.0.0.1".to_string())] {
            assert_eq!(Contributor::parse(&contributor.key()).expect("parse"), contributor);
        }
        assert!(Contributor::parse("user:abc").is_err());
        assert!(Contributor::parse("127.0.0.1").is_err());
    }

    #[test]
    fn task_state_db_names() {
        assert_eq!(TaskState::from_db("ongoing"), Some(TaskState::Ongoing));
        assert_eq!(TaskState::from_db("completed"), Some(TaskState::Completed));
        assert_eq!(TaskState::from_db("done"), None);
        assert_eq!(TaskState::Completed.as_str(), "completed");
    }

    #[test]
    fn candidate_remaining_can_go_negative_when_over_assigned() {
        let new_task = NewTask::for_project(1);
        let task = Task {
            id: 1,
            project_id: 1,
            n_answers: 2,
            priority: new_task.priority,
            state: TaskState::Ongoing,
            calibration: false,
            gold_answers: None,
            user_pref: None,
            info: new_task.info,
            created: 0,
        };
        let candidate = Candidate {
            task,
            accepted_count: 3,
        };
        assert_eq!(candidate.remaining(), -1);
    }
}
