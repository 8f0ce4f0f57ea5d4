use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::TaskdistError;
use crate::lock_manager::LockManager;
use crate::logging::append_run_log;
use crate::preferences::{self, Preference};
use crate::task_store::{CandidateOrder, CandidateQuery, TaskStore};
use crate::types::{Candidate, Contributor, Project, Task, TaskRun};

/// Largest `offset` a requester may ask for.
pub const MAX_OFFSET: usize = 2;

/// Upper bound on candidates pulled per request.
const CANDIDATE_LIMIT: usize = 10_000;

/// A selection strategy that works on a candidate list directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasePolicy {
    Default,
    DepthFirst,
    BreadthFirst,
    /// Random pick, served with the task's latest answer attached.
    Incremental,
    Locked,
}

impl BasePolicy {
    pub fn as_name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::DepthFirst => "depth_first",
            Self::BreadthFirst => "breadth_first",
            Self::Incremental => "incremental",
            Self::Locked => "locked_scheduler",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::Default),
            "depth_first" => Some(Self::DepthFirst),
            "breadth_first" => Some(Self::BreadthFirst),
            "incremental" => Some(Self::Incremental),
            "locked_scheduler" | "locked" => Some(Self::Locked),
            _ => None,
        }
    }

    fn candidate_query(self, gold: bool) -> CandidateQuery {
        CandidateQuery {
            gold,
            // Gold tasks are answered by every quiz taker, so they never run out.
            require_capacity: !gold && self != Self::BreadthFirst,
            order: match self {
                Self::BreadthFirst => CandidateOrder::FewestAnswersThenId,
                _ => CandidateOrder::PriorityThenId,
            },
            limit: CANDIDATE_LIMIT,
        }
    }
}

/// Scheduler stored on a project, addressed by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SchedulerPolicy {
    Default,
    DepthFirst,
    BreadthFirst,
    Incremental,
    Locked,
    UserPreference { inner: BasePolicy },
}

impl SchedulerPolicy {
    pub fn parse(name: &str) -> Result<Self, TaskdistError> {
        let name = name.trim();
        if name == "user_pref_scheduler" {
            return Ok(Self::UserPreference {
                inner: BasePolicy::Locked,
            });
        }
        if let Some(inner) = name.strip_prefix("user_pref:") {
            let inner = BasePolicy::parse(inner).ok_or_else(|| unknown_policy(name))?;
            return Ok(Self::UserPreference { inner });
        }
        BasePolicy::parse(name)
            .map(Self::from_base)
            .ok_or_else(|| unknown_policy(name))
    }

    pub fn as_name(&self) -> String {
        match self {
            Self::UserPreference {
                inner: BasePolicy::Locked,
            } => "user_pref_scheduler".to_string(),
            Self::UserPreference { inner } => format!("user_pref:{}", inner.as_name()),
            other => other.base().as_name().to_string(),
        }
    }

    pub fn base(&self) -> BasePolicy {
        match self {
            Self::Default => BasePolicy::Default,
            Self::DepthFirst => BasePolicy::DepthFirst,
            Self::BreadthFirst => BasePolicy::BreadthFirst,
            Self::Incremental => BasePolicy::Incremental,
            Self::Locked => BasePolicy::Locked,
            Self::UserPreference { inner } => *inner,
        }
    }

    /// Whether submissions under this policy require a held lock.
    pub fn uses_locks(&self) -> bool {
        self.base() == BasePolicy::Locked
    }

    pub fn filters_by_preference(&self) -> bool {
        matches!(self, Self::UserPreference { .. })
    }

    fn from_base(base: BasePolicy) -> Self {
        match base {
            BasePolicy::Default => Self::Default,
            BasePolicy::DepthFirst => Self::DepthFirst,
            BasePolicy::BreadthFirst => Self::BreadthFirst,
            BasePolicy::Incremental => Self::Incremental,
            BasePolicy::Locked => Self::Locked,
        }
    }
}

impl fmt::Display for SchedulerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_name())
    }
}

impl TryFrom<String> for SchedulerPolicy {
    type Error = TaskdistError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SchedulerPolicy> for String {
    fn from(value: SchedulerPolicy) -> Self {
        value.as_name()
    }
}

fn unknown_policy(name: &str) -> TaskdistError {
    TaskdistError::InvalidInput(format!("unknown scheduler `{name}`"))
}

pub fn validate_offset(offset: usize) -> Result<(), TaskdistError> {
    if offset > MAX_OFFSET {
        return Err(TaskdistError::InvalidInput(format!(
            "offset must be between 0 and {MAX_OFFSET}, got {offset}"
        )));
    }
    Ok(())
}

/// What the scheduler is asked to do for one request.
#[derive(Debug, Clone, Copy)]
pub struct SelectionRequest<'a> {
    pub project: &'a Project,
    pub contributor: &'a Contributor,
    pub offset: usize,
    /// Serve calibration tasks instead of the normal pool.
    pub gold: bool,
    pub contributor_pref: Option<&'a Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub candidate: Candidate,
    pub locked: bool,
}

/// Runs a project's policy against the task store and lock manager.
pub struct Scheduler {
    store: Arc<TaskStore>,
    locks: Arc<LockManager>,
}

impl Scheduler {
    pub fn new(store: Arc<TaskStore>, locks: Arc<LockManager>) -> Self {
        Self { store, locks }
    }

    pub fn select(&self, request: SelectionRequest<'_>) -> Result<Option<Selection>, TaskdistError> {
        validate_offset(request.offset)?;
        let policy = request.project.scheduler;
        let base = policy.base();
        let mut candidates = self.store.candidate_tasks(
            request.project.id,
            request.contributor,
            base.candidate_query(request.gold),
        )?;
        if policy.filters_by_preference() {
            candidates = filter_by_preference(candidates, request.contributor_pref);
        }
        let pool_size = candidates.len();

        let mut selection = match base {
            BasePolicy::Locked => {
                walk_locked(candidates, request.offset, |candidate| {
                    self.lock_candidate(request.project, candidate, request.contributor, request.gold)
                })?
                .map(|candidate| Selection {
                    candidate,
                    locked: true,
                })
            }
            unlocked => choose_unlocked(unlocked, candidates, request.offset, &mut rand::thread_rng())
                .map(|candidate| Selection {
                    candidate,
                    locked: false,
                }),
        };
        if base == BasePolicy::Incremental {
            if let Some(selection) = selection.as_mut() {
                let runs = self.store.list_task_runs(selection.candidate.task.id)?;
                attach_last_answer(&mut selection.candidate.task, &runs);
            }
        }

        append_run_log(
            if selection.is_some() { "info" } else { "debug" },
            "scheduler.selected",
            json!({
                "project_id": request.project.id,
                "contributor": request.contributor.key(),
                "policy": policy.as_name(),
                "gold": request.gold,
                "offset": request.offset,
                "pool_size": pool_size,
                "task_id": selection.as_ref().map(|s| s.candidate.task.id),
            }),
        );
        Ok(selection)
    }

    /// Acquires a lock on one candidate, bounded by the redundancy the
    /// candidate read still showed open.
    ///
    /// That read can predate a submission which consumed a slot and freed its
    /// holder, so a fresh lock is checked again against the task's current
    /// answers and withdrawn if the task would end up over-committed.
    pub fn lock_candidate(
        &self,
        project: &Project,
        candidate: &Candidate,
        contributor: &Contributor,
        gold: bool,
    ) -> Result<bool, TaskdistError> {
        let ttl = project.lock_timeout_seconds.map(Duration::from_secs);
        if gold {
            return self
                .locks
                .acquire(project.id, candidate.task.id, contributor, i64::MAX, ttl);
        }
        if !self.locks.acquire(
            project.id,
            candidate.task.id,
            contributor,
            candidate.remaining(),
            ttl,
        )? {
            return Ok(false);
        }
        match self.within_capacity(project, &candidate.task) {
            Ok(true) => Ok(true),
            Ok(false) => {
                append_run_log(
                    "warn",
                    "scheduler.lock_overcommitted",
                    json!({
                        "project_id": project.id,
                        "task_id": candidate.task.id,
                        "contributor": contributor.key(),
                        "stale_remaining": candidate.remaining(),
                    }),
                );
                self.locks.withdraw(project.id, candidate.task.id, contributor)?;
                Ok(false)
            }
            Err(e) => {
                if let Err(withdraw_err) =
                    self.locks.withdraw(project.id, candidate.task.id, contributor)
                {
                    append_run_log(
                        "warn",
                        "scheduler.lock_recheck_withdraw_failed",
                        json!({ "task_id": candidate.task.id, "error": withdraw_err.to_string() }),
                    );
                }
                Err(e)
            }
        }
    }

    /// Whether the holders that have not answered yet fit in the task's
    /// current open redundancy.
    fn within_capacity(&self, project: &Project, task: &Task) -> Result<bool, TaskdistError> {
        let runs = self.store.list_task_runs(task.id)?;
        let answered = runs
            .iter()
            .map(|run| run.contributor.key())
            .collect::<HashSet<_>>();
        let pending = self
            .locks
            .holders(project.id, task.id)?
            .into_iter()
            .filter(|holder| !answered.contains(&holder.contributor))
            .count();
        let open = task.n_answers - i64::try_from(runs.len()).unwrap_or(i64::MAX);
        Ok(i64::try_from(pending).unwrap_or(i64::MAX) <= open)
    }
}

/// Copies the most recently finished run's answer into the offered task as
/// `info.last_answer`. Only the offered copy changes; tasks whose `info` is
/// neither an object nor null are served as stored.
pub fn attach_last_answer(task: &mut Task, runs: &[TaskRun]) {
    let Some(latest) = runs.iter().max_by_key(|run| (run.finish_time, run.id)) else {
        return;
    };
    if task.info.is_null() {
        task.info = json!({});
    }
    if let Some(info) = task.info.as_object_mut() {
        info.insert("last_answer".to_string(), latest.info.clone());
    }
}

/// Keeps tasks whose `user_pref` filter admits the contributor. Tasks with a
/// filter that no longer parses are dropped.
pub fn filter_by_preference(
    candidates: Vec<Candidate>,
    contributor_pref: Option<&Value>,
) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|candidate| {
            let raw = candidate.task.user_pref.as_ref().unwrap_or(&Value::Null);
            match Preference::parse(raw) {
                Ok(task_pref) => preferences::task_matches(&task_pref, contributor_pref),
                Err(_) => false,
            }
        })
        .collect()
}

/// Picks among candidates already ordered and capacity-filtered for `base`.
pub fn choose_unlocked<R: Rng + ?Sized>(
    base: BasePolicy,
    candidates: Vec<Candidate>,
    offset: usize,
    rng: &mut R,
) -> Option<Candidate> {
    let mut remaining = candidates.into_iter().skip(offset).collect::<Vec<_>>();
    if remaining.is_empty() {
        return None;
    }
    let idx = match base {
        BasePolicy::Default | BasePolicy::Incremental => rng.gen_range(0..remaining.len()),
        BasePolicy::DepthFirst | BasePolicy::BreadthFirst | BasePolicy::Locked => 0,
    };
    Some(remaining.swap_remove(idx))
}

/// Walks candidates in order, acquiring a lock on each. The first `offset`
/// successful acquisitions are skipped and their locks left to expire. A busy
/// coordination store makes a candidate unlockable rather than failing the walk.
pub fn walk_locked(
    candidates: Vec<Candidate>,
    offset: usize,
    mut acquire: impl FnMut(&Candidate) -> Result<bool, TaskdistError>,
) -> Result<Option<Candidate>, TaskdistError> {
    let mut skipped = 0;
    for candidate in candidates {
        match acquire(&candidate) {
            Ok(true) if skipped == offset => return Ok(Some(candidate)),
            Ok(true) => skipped += 1,
            Ok(false) => {}
            Err(TaskdistError::TransientUnavailable(reason)) => {
                append_run_log(
                    "warn",
                    "scheduler.lock_unavailable",
                    json!({ "task_id": candidate.task.id, "reason": reason }),
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}
