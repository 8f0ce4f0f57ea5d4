use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::active_users::{ActiveUsers, DEFAULT_ACTIVE_USER_TTL};
use crate::completion::{notify_all, CompletionListener, TaskCompleted};
use crate::config::AppConfig;
use crate::contributions_guard::{ContributionsGuard, DEFAULT_STAMP_TTL};
use crate::coordination::CoordinationStore;
use crate::errors::TaskdistError;
use crate::lock_manager::{LockManager, DEFAULT_RELEASE_GRACE};
use crate::logging::append_run_log;
use crate::quiz::{QuizProgress, QuizStatus, TaskPool};
use crate::runtime::Clock;
use crate::scheduler::{validate_offset, Scheduler, SelectionRequest};
use crate::task_store::{
    PendingTaskRun, QuizAction, RedundancyChange, StateChange, TaskStore,
};
use crate::types::{
    Contributor, NewTaskRun, Project, ProjectId, Task, TaskId, TaskResult, TaskRun, TaskState,
    UserId,
};

/// `created` recorded for a run whose offer time is not before its finish
/// time (1900-01-01T00:00:00Z in unix millis).
pub const DEFAULT_CREATED: i64 = -2_208_988_800_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub stamp_ttl: Duration,
    pub lock_ttl: Duration,
    pub release_grace: Duration,
    pub active_user_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stamp_ttl: DEFAULT_STAMP_TTL,
            lock_ttl: DEFAULT_STAMP_TTL,
            release_grace: DEFAULT_RELEASE_GRACE,
            active_user_ttl: DEFAULT_ACTIVE_USER_TTL,
        }
    }
}

impl EngineSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            stamp_ttl: cfg.stamp_ttl(),
            lock_ttl: cfg.lock_ttl(),
            release_grace: cfg.release_grace(),
            active_user_ttl: cfg.active_user_ttl(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub task_run: TaskRun,
    /// The result written when this run completed its task.
    pub completion: Option<TaskResult>,
    /// Quiz standing after a gold answer was scored.
    pub quiz: Option<QuizProgress>,
}

/// Entry point for requesters: hands out tasks and accepts submissions.
pub struct TaskDistributor {
    store: Arc<TaskStore>,
    guard: ContributionsGuard,
    locks: Arc<LockManager>,
    scheduler: Scheduler,
    active_users: ActiveUsers,
    clock: Arc<dyn Clock>,
    listeners: Vec<Box<dyn CompletionListener>>,
}

impl TaskDistributor {
    pub fn new(
        store: Arc<TaskStore>,
        coordination: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        let locks = Arc::new(LockManager::new(
            Arc::clone(&coordination),
            Arc::clone(&clock),
            settings.lock_ttl,
            settings.release_grace,
        ));
        Self {
            guard: ContributionsGuard::new(
                Arc::clone(&coordination),
                Arc::clone(&clock),
                settings.stamp_ttl,
            ),
            scheduler: Scheduler::new(Arc::clone(&store), Arc::clone(&locks)),
            active_users: ActiveUsers::new(coordination, settings.active_user_ttl),
            store,
            locks,
            clock,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Box<dyn CompletionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Picks, stamps and returns the next task for `contributor`, or `None`
    /// when nothing is available to them.
    pub fn next_task(
        &self,
        project_id: ProjectId,
        contributor: &Contributor,
        offset: usize,
    ) -> Result<Option<Task>, TaskdistError> {
        validate_offset(offset)?;
        let project = self.project(project_id)?;
        self.register_active(&project, contributor);

        let gold = match self.task_pool(&project, contributor)? {
            TaskPool::Normal => false,
            TaskPool::Gold => true,
            TaskPool::Closed => {
                append_run_log(
                    "info",
                    "distributor.next_task.quiz_failed",
                    json!({ "project_id": project_id, "contributor": contributor.key() }),
                );
                return Ok(None);
            }
        };

        let contributor_pref = match contributor {
            Contributor::User(user_id) if project.scheduler.filters_by_preference() => {
                self.store.get_user_pref(*user_id)?
            }
            _ => None,
        };

        let Some(selection) = self.scheduler.select(SelectionRequest {
            project: &project,
            contributor,
            offset,
            gold,
            contributor_pref: contributor_pref.as_ref(),
        })?
        else {
            return Ok(None);
        };
        let task = selection.candidate.task;

        if let Err(e) = self.guard.stamp(task.id, contributor) {
            if selection.locked {
                if let Err(release_err) = self.locks.withdraw(project.id, task.id, contributor) {
                    append_run_log(
                        "warn",
                        "distributor.next_task.withdraw_release_failed",
                        json!({ "task_id": task.id, "error": release_err.to_string() }),
                    );
                }
            }
            if let TaskdistError::TransientUnavailable(reason) = e {
                append_run_log(
                    "warn",
                    "distributor.next_task.withdrawn",
                    json!({
                        "project_id": project.id,
                        "task_id": task.id,
                        "contributor": contributor.key(),
                        "reason": reason,
                    }),
                );
                return Ok(None);
            }
            return Err(e);
        }

        append_run_log(
            "info",
            "distributor.next_task.offered",
            json!({
                "project_id": project.id,
                "task_id": task.id,
                "contributor": contributor.key(),
                "policy": project.scheduler.as_name(),
                "gold": gold,
                "offset": offset,
            }),
        );
        Ok(Some(task))
    }

    /// Accepts a submission that answers a live offer.
    pub fn submit_task_run(&self, submission: NewTaskRun) -> Result<SubmitOutcome, TaskdistError> {
        let NewTaskRun {
            project_id,
            task_id,
            contributor,
            info,
        } = submission;
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| TaskdistError::NotFound(format!("task {task_id} does not exist")))?;
        if task.project_id != project_id {
            return Err(self.reject(task_id, &contributor, "Invalid project_id"));
        }
        let project = self.project(project_id)?;

        let Some(stamped_at) = self.guard.retrieve_timestamp(task_id, &contributor)? else {
            return Err(self.reject(task_id, &contributor, "You must request a task first!"));
        };
        let uses_locks = project.scheduler.uses_locks();
        if uses_locks && !self.locks.has_lock(project_id, task_id, &contributor)? {
            return Err(self.reject(
                task_id,
                &contributor,
                "You must hold a lock on this task to submit!",
            ));
        }

        let finish_time = self.clock.now_millis();
        let created = if stamped_at < finish_time {
            stamped_at
        } else {
            DEFAULT_CREATED
        };
        let recorded = self.store.insert_task_run(PendingTaskRun {
            project_id,
            task_id,
            contributor: contributor.clone(),
            info,
            created,
            finish_time,
        })?;

        if let Err(e) = self.guard.remove_stamp(task_id, &contributor) {
            append_run_log(
                "warn",
                "distributor.submit.stamp_cleanup_failed",
                json!({ "task_id": task_id, "error": e.to_string() }),
            );
        }
        if uses_locks {
            if let Err(e) = self.locks.release(project_id, task_id, &contributor) {
                append_run_log(
                    "warn",
                    "distributor.submit.lock_release_failed",
                    json!({ "task_id": task_id, "error": e.to_string() }),
                );
            }
        }

        let quiz = self.score_gold_answer(&project, &task, &recorded.task_run);
        if let Some(result) = &recorded.completion {
            self.notify(&project, result);
        }

        append_run_log(
            "info",
            "distributor.submit.accepted",
            json!({
                "project_id": project_id,
                "task_id": task_id,
                "task_run_id": recorded.task_run.id,
                "contributor": contributor.key(),
                "completed": recorded.completion.is_some(),
            }),
        );
        Ok(SubmitOutcome {
            task_run: recorded.task_run,
            completion: recorded.completion,
            quiz,
        })
    }

    /// Returns the task if `contributor` may see its content: under a locking
    /// policy only while holding the task's lock.
    pub fn authorize_task_read(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        contributor: &Contributor,
    ) -> Result<Task, TaskdistError> {
        let task = self
            .store
            .get_task(task_id)?
            .filter(|task| task.project_id == project_id)
            .ok_or_else(|| TaskdistError::NotFound("Task does not exist".to_string()))?;
        let project = self.project(project_id)?;
        if project.scheduler.uses_locks() && !self.locks.has_lock(project_id, task_id, contributor)? {
            append_run_log(
                "warn",
                "distributor.read.forbidden",
                json!({ "task_id": task_id, "contributor": contributor.key() }),
            );
            return Err(TaskdistError::Forbidden(format!(
                "{contributor} holds no lock on task {task_id}"
            )));
        }
        Ok(task)
    }

    /// Seconds left on the contributor's lock; `None` when the project does
    /// not lock or no lock is held.
    pub fn lock_seconds_remaining(
        &self,
        task_id: TaskId,
        contributor: &Contributor,
    ) -> Result<Option<i64>, TaskdistError> {
        let task = self
            .store
            .get_task(task_id)?
            .ok_or_else(|| TaskdistError::NotFound(format!("task {task_id} does not exist")))?;
        let project = self.project(task.project_id)?;
        if !project.scheduler.uses_locks() {
            return Ok(None);
        }
        self.locks
            .seconds_to_expiry(task.project_id, task_id, contributor)
    }

    /// Puts a user back at the start of the project's quiz and drops every
    /// lock they hold there.
    pub fn reset_quiz(
        &self,
        project_id: ProjectId,
        user_id: UserId,
    ) -> Result<QuizProgress, TaskdistError> {
        let project = self.project(project_id)?;
        let progress = self
            .store
            .apply_quiz(project_id, user_id, project.quiz, QuizAction::Reset)?;
        let released = self
            .locks
            .release_all_for_contributor(project_id, &Contributor::User(user_id))?;
        append_run_log(
            "info",
            "distributor.quiz.reset",
            json!({
                "project_id": project_id,
                "user_id": user_id,
                "status": progress.status.as_str(),
                "released_locks": released.len(),
            }),
        );
        Ok(progress)
    }

    pub fn active_user_count(&self, project_id: ProjectId) -> Result<usize, TaskdistError> {
        self.project(project_id)?;
        self.active_users.count(project_id)
    }

    pub fn update_task_redundancy(
        &self,
        task_id: TaskId,
        n_answers: i64,
    ) -> Result<RedundancyChange, TaskdistError> {
        let change = self.store.update_task_redundancy(task_id, n_answers)?;
        if let Some(result) = &change.completion {
            let project = self.project(change.task.project_id)?;
            self.notify(&project, result);
        }
        Ok(change)
    }

    /// Re-evaluates completion of a task. Idempotent: a task that is already
    /// completed, or still short of answers, is left alone.
    pub fn recheck_completion(&self, task_id: TaskId) -> Result<StateChange, TaskdistError> {
        let change = self.store.update_task_state(task_id, TaskState::Completed)?;
        if let Some(result) = &change.completion {
            let project = self.project(result.project_id)?;
            self.notify(&project, result);
        }
        Ok(change)
    }

    fn project(&self, project_id: ProjectId) -> Result<Project, TaskdistError> {
        self.store
            .get_project(project_id)?
            .ok_or_else(|| TaskdistError::NotFound(format!("project {project_id} does not exist")))
    }

    fn register_active(&self, project: &Project, contributor: &Contributor) {
        if let Err(e) = self.active_users.register(project.id, contributor) {
            append_run_log(
                "warn",
                "distributor.active_users.register_failed",
                json!({
                    "project_id": project.id,
                    "contributor": contributor.key(),
                    "error": e.to_string(),
                }),
            );
        }
    }

    fn task_pool(
        &self,
        project: &Project,
        contributor: &Contributor,
    ) -> Result<TaskPool, TaskdistError> {
        let Contributor::User(user_id) = contributor else {
            return Ok(TaskPool::Normal);
        };
        if !project.quiz.enabled {
            return Ok(TaskPool::Normal);
        }
        let progress = match self.store.get_quiz_progress(project.id, *user_id)? {
            Some(progress) if progress.status != QuizStatus::NotStarted => progress,
            _ => self
                .store
                .apply_quiz(project.id, *user_id, project.quiz, QuizAction::Start)?,
        };
        Ok(progress.pool(&project.quiz))
    }

    fn score_gold_answer(
        &self,
        project: &Project,
        task: &Task,
        task_run: &TaskRun,
    ) -> Option<QuizProgress> {
        let Contributor::User(user_id) = task_run.contributor else {
            return None;
        };
        if !task.is_gold() || !project.quiz.enabled {
            return None;
        }
        let standing = match self.store.get_quiz_progress(project.id, user_id) {
            Ok(standing) => standing,
            Err(e) => {
                append_run_log(
                    "error",
                    "distributor.quiz.lookup_failed",
                    json!({ "project_id": project.id, "user_id": user_id, "error": e.to_string() }),
                );
                return None;
            }
        };
        if standing.map(|p| p.status) != Some(QuizStatus::InProgress) {
            return standing;
        }
        let correct = task.gold_answers.as_ref() == Some(&task_run.info);
        match self.store.apply_quiz(
            project.id,
            user_id,
            project.quiz,
            QuizAction::Answer { correct },
        ) {
            Ok(progress) => Some(progress),
            Err(e) => {
                append_run_log(
                    "error",
                    "distributor.quiz.answer_failed",
                    json!({ "project_id": project.id, "user_id": user_id, "error": e.to_string() }),
                );
                None
            }
        }
    }

    fn notify(&self, project: &Project, result: &TaskResult) {
        let event = TaskCompleted::from_result(result, &project.short_name, self.clock.now_millis());
        append_run_log(
            "info",
            "distributor.task_completed",
            json!({
                "project_id": event.project_id,
                "task_id": event.task_id,
                "result_id": event.result_id,
                "last_version": result.last_version,
            }),
        );
        notify_all(&self.listeners, &event);
    }

    fn reject(&self, task_id: TaskId, contributor: &Contributor, message: &str) -> TaskdistError {
        append_run_log(
            "warn",
            "distributor.submit.forbidden",
            json!({ "task_id": task_id, "contributor": contributor.key(), "reason": message }),
        );
        TaskdistError::Forbidden(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{json, Value};
    use tempfile::TempDir;

    use super::{EngineSettings, TaskDistributor, DEFAULT_CREATED};
    use crate::completion::RecordingListener;
    use crate::coordination::{CoordinationStore, MemberEntry, SetMode, SqliteCoordinationStore};
    use crate::errors::TaskdistError;
    use crate::quiz::{QuizConfig, QuizStatus};
    use crate::runtime::{Clock, FakeClock};
    use crate::lock_manager::DEFAULT_RELEASE_GRACE;
    use crate::scheduler::{BasePolicy, SchedulerPolicy};
    use crate::task_store::{CandidateQuery, TaskStore};
    use crate::types::{Contributor, NewProject, NewTask, NewTaskRun, TaskState};

    /// Coordination store whose writes can be switched to report contention.
    struct FlakyStore {
        inner: SqliteCoordinationStore,
        busy_sets: AtomicBool,
    }

    impl FlakyStore {
        fn busy(&self) -> TaskdistError {
            TaskdistError::TransientUnavailable("database is locked".to_string())
        }
    }

    impl CoordinationStore for FlakyStore {
        fn set(&self, key: &str, value: &str, ttl: Duration, mode: SetMode) -> Result<bool, TaskdistError> {
            if self.busy_sets.load(Ordering::SeqCst) {
                return Err(self.busy());
            }
            self.inner.set(key, value, ttl, mode)
        }
        fn get(&self, key: &str) -> Result<Option<String>, TaskdistError> {
            self.inner.get(key)
        }
        fn del(&self, key: &str) -> Result<bool, TaskdistError> {
            self.inner.del(key)
        }
        fn add_member_under_capacity(
            &self,
            key: &str,
            member: &str,
            ttl: Duration,
            capacity: i64,
        ) -> Result<bool, TaskdistError> {
            self.inner.add_member_under_capacity(key, member, ttl, capacity)
        }
        fn member_expiry(&self, key: &str, member: &str) -> Result<Option<i64>, TaskdistError> {
            self.inner.member_expiry(key, member)
        }
        fn expire_member(&self, key: &str, member: &str, after: Duration) -> Result<bool, TaskdistError> {
            self.inner.expire_member(key, member, after)
        }
        fn remove_member(&self, key: &str, member: &str) -> Result<bool, TaskdistError> {
            self.inner.remove_member(key, member)
        }
        fn members(&self, key: &str) -> Result<Vec<MemberEntry>, TaskdistError> {
            self.inner.members(key)
        }
        fn keys_with_member(&self, prefix: &str, member: &str) -> Result<Vec<String>, TaskdistError> {
            self.inner.keys_with_member(prefix, member)
        }
    }

    struct Harness {
        engine: TaskDistributor,
        coordination: Arc<FlakyStore>,
        clock: FakeClock,
        recorder: Arc<RecordingListener>,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        harness_with(EngineSettings::default())
    }

    fn harness_with(settings: EngineSettings) -> Harness {
        let dir = TempDir::new().expect("tempdir");
        let clock = FakeClock::default();
        let store = Arc::new(
            TaskStore::open(dir.path().join("tasks.sqlite"), Arc::new(clock.clone()))
                .expect("task store"),
        );
        let coordination = Arc::new(FlakyStore {
            inner: SqliteCoordinationStore::open(
                dir.path().join("coordination.sqlite"),
                Arc::new(clock.clone()),
                Duration::from_millis(250),
            )
            .expect("coordination"),
            busy_sets: AtomicBool::new(false),
        });
        let recorder = Arc::new(RecordingListener::default());
        let engine = TaskDistributor::new(
            store,
            coordination.clone(),
            Arc::new(clock.clone()),
            settings,
        )
        .with_listener(Box::new(Arc::clone(&recorder)));
        Harness {
            engine,
            coordination,
            clock,
            recorder,
            _dir: dir,
        }
    }

    fn project(h: &Harness, name: &str, scheduler: SchedulerPolicy) -> i64 {
        h.engine
            .store()
            .create_project(NewProject {
                scheduler,
                ..NewProject::named(name)
            })
            .expect("project")
            .id
    }

    fn task(h: &Harness, project_id: i64, n_answers: i64, priority: f64) -> i64 {
        h.engine
            .store()
            .insert_task(NewTask {
                n_answers,
                priority,
                ..NewTask::for_project(project_id)
            })
            .expect("task")
            .id
    }

    fn gold(h: &Harness, project_id: i64, answer: Value) -> i64 {
        h.engine
            .store()
            .insert_task(NewTask {
                n_answers: 1,
                calibration: true,
                gold_answers: Some(answer),
                ..NewTask::for_project(project_id)
            })
            .expect("gold task")
            .id
    }

    fn submit(
        h: &Harness,
        project_id: i64,
        task_id: i64,
        contributor: &Contributor,
        info: Value,
    ) -> Result<super::SubmitOutcome, TaskdistError> {
        h.engine.submit_task_run(NewTaskRun {
            project_id,
            task_id,
            contributor: contributor.clone(),
            info,
        })
    }

    #[test]
    fn request_then_submit_completes_after_redundancy_is_met() {
        let h = harness();
        let p = project(&h, "birds", SchedulerPolicy::DepthFirst);
        let t = task(&h, p, 2, 1.0);
        let a = Contributor::User(1);
        let b = Contributor::Ip("10.0.0.2".to_string());

        let offered_at = h.clock.now_millis();
        assert_eq!(h.engine.next_task(p, &a, 0).expect("a").map(|t| t.id), Some(t));
        h.clock.advance(Duration::from_secs(5));
        let first = submit(&h, p, t, &a, json!({"answer": 1})).expect("first");
        assert_eq!(first.task_run.created, offered_at);
        assert_eq!(first.task_run.finish_time, offered_at + 5_000);
        assert!(first.completion.is_none());
        assert!(h.recorder.events().is_empty());

        assert_eq!(h.engine.next_task(p, &b, 0).expect("b").map(|t| t.id), Some(t));
        h.clock.advance(Duration::from_secs(1));
        let second = submit(&h, p, t, &b, json!({"answer": 1})).expect("second");
        let result = second.completion.expect("completed");
        assert_eq!(
            h.engine.store().get_task(t).expect("get").expect("task").state,
            TaskState::Completed
        );

        let events = h.recorder.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].task_id, t);
        assert_eq!(events[0].result_id, result.id);
        assert_eq!(events[0].project_short_name, "birds");

        assert!(!h.engine.recheck_completion(t).expect("recheck").changed);
        assert_eq!(h.recorder.events().len(), 1);
    }

    #[test]
    fn submissions_need_a_live_stamp_and_cannot_be_replayed() {
        let h = harness();
        let p = project(&h, "p", SchedulerPolicy::Default);
        let t = task(&h, p, 5, 0.0);
        let user = Contributor::User(9);

        let err = submit(&h, p, t, &user, json!({})).expect_err("no stamp");
        assert!(matches!(err, TaskdistError::Forbidden(ref m) if m == "You must request a task first!"));

        h.engine.next_task(p, &user, 0).expect("offer").expect("task");
        h.clock.advance(Duration::from_secs(3600));
        assert!(matches!(
            submit(&h, p, t, &user, json!({})),
            Err(TaskdistError::Forbidden(_))
        ));

        h.engine.next_task(p, &user, 0).expect("offer again").expect("task");
        submit(&h, p, t, &user, json!({})).expect("accepted");
        assert!(matches!(
            submit(&h, p, t, &user, json!({})),
            Err(TaskdistError::Forbidden(_))
        ));
        assert_eq!(h.engine.store().count_accepted_task_runs(t).expect("count"), 1);
    }

    #[test]
    fn submission_for_another_project_is_forbidden() {
        let h = harness();
        let p = project(&h, "p", SchedulerPolicy::Default);
        let other = project(&h, "other", SchedulerPolicy::Default);
        let t = task(&h, p, 1, 0.0);
        let user = Contributor::User(1);
        h.engine.next_task(p, &user, 0).expect("offer");

        let err = submit(&h, other, t, &user, json!({})).expect_err("mismatch");
        assert!(matches!(err, TaskdistError::Forbidden(ref m) if m == "Invalid project_id"));
        assert!(matches!(
            submit(&h, p, 404, &user, json!({})),
            Err(TaskdistError::NotFound(_))
        ));
    }

    #[test]
    fn stamp_at_or_after_finish_time_uses_default_created() {
        let h = harness();
        let p = project(&h, "p", SchedulerPolicy::Default);
        let t = task(&h, p, 1, 0.0);
        let user = Contributor::User(1);
        h.engine.next_task(p, &user, 0).expect("offer");
        let outcome = submit(&h, p, t, &user, json!({})).expect("same instant");
        assert_eq!(outcome.task_run.created, DEFAULT_CREATED);
    }

    #[test]
    fn locked_single_slot_goes_to_one_requester() {
        let h = harness();
        let p = project(&h, "p", SchedulerPolicy::Locked);
        let t = task(&h, p, 1, 0.0);
        let a = Contributor::User(1);
        let b = Contributor::User(2);

        assert_eq!(h.engine.next_task(p, &a, 0).expect("a").map(|t| t.id), Some(t));
        assert_eq!(h.engine.next_task(p, &b, 0).expect("b"), None);
        assert_eq!(h.engine.next_task(p, &a, 0).expect("a again").map(|t| t.id), Some(t));

        submit(&h, p, t, &a, json!({})).expect("a submits");
        assert_eq!(h.engine.lock_seconds_remaining(t, &a).expect("grace"), Some(5));
        h.clock.advance(DEFAULT_RELEASE_GRACE);
        assert!(!h.engine.locks().has_lock(p, t, &a).expect("released"));
        assert_eq!(h.engine.next_task(p, &b, 0).expect("b after completion"), None);
    }

    #[test]
    fn lock_from_a_stale_candidate_read_never_overcommits_the_task() {
        for grace in [Duration::ZERO, DEFAULT_RELEASE_GRACE] {
            let h = harness_with(EngineSettings {
                release_grace: grace,
                ..EngineSettings::default()
            });
            let p = project(&h, "p", SchedulerPolicy::Locked);
            let t = task(&h, p, 2, 0.0);
            let a = Contributor::User(1);
            let b = Contributor::User(2);
            let c = Contributor::User(3);

            h.engine.next_task(p, &a, 0).expect("a").expect("task");
            h.engine.next_task(p, &b, 0).expect("b").expect("task");
            let stale = h
                .engine
                .store()
                .candidate_tasks(p, &c, CandidateQuery::normal(10))
                .expect("candidates");
            assert_eq!(stale[0].remaining(), 2);

            h.clock.advance(Duration::from_secs(1));
            submit(&h, p, t, &a, json!("answer")).expect("a submits");

            let project = h.engine.store().get_project(p).expect("get").expect("project");
            let locked = h
                .engine
                .scheduler
                .lock_candidate(&project, &stale[0], &c, false)
                .expect("lock attempt");
            assert!(!locked, "grace {grace:?}");
            assert!(!h.engine.locks().has_lock(p, t, &c).expect("c holds nothing"));
            let answered = h.engine.store().count_accepted_task_runs(t).expect("count");
            let pending = h
                .engine
                .locks()
                .holders(p, t)
                .expect("holders")
                .into_iter()
                .filter(|holder| holder.contributor != a.key())
                .count();
            assert_eq!(pending, 1);
            assert!(i64::try_from(pending).expect("fits") <= 2 - answered);
        }
    }

    #[test]
    fn incremental_offers_carry_the_latest_answer_without_storing_it() {
        let h = harness();
        let p = project(&h, "p", SchedulerPolicy::Incremental);
        let t = task(&h, p, 3, 0.0);
        let first = Contributor::User(1);
        let second = Contributor::User(2);

        let offered = h.engine.next_task(p, &first, 0).expect("first").expect("task");
        assert!(offered.info.get("last_answer").is_none());
        h.clock.advance(Duration::from_secs(1));
        submit(&h, p, t, &first, json!({"text": "draft one"})).expect("submit");

        let offered = h.engine.next_task(p, &second, 0).expect("second").expect("task");
        assert_eq!(offered.info["last_answer"], json!({"text": "draft one"}));
        let stored = h.engine.store().get_task(t).expect("get").expect("task");
        assert!(stored.info.get("last_answer").is_none());
    }

    #[test]
    fn locked_submission_requires_a_live_lock() {
        let h = harness();
        let p = h
            .engine
            .store()
            .create_project(NewProject {
                scheduler: SchedulerPolicy::Locked,
                lock_timeout_seconds: Some(60),
                ..NewProject::named("short-locks")
            })
            .expect("project")
            .id;
        let t = task(&h, p, 1, 0.0);
        let a = Contributor::User(1);
        let b = Contributor::User(2);

        h.engine.next_task(p, &a, 0).expect("a").expect("task");
        assert_eq!(h.engine.lock_seconds_remaining(t, &a).expect("ttl"), Some(60));
        h.engine.authorize_task_read(p, t, &a).expect("a may read");
        assert!(matches!(
            h.engine.authorize_task_read(p, t, &b),
            Err(TaskdistError::Forbidden(_))
        ));

        h.clock.advance(Duration::from_secs(61));
        assert_eq!(h.engine.lock_seconds_remaining(t, &a).expect("ttl"), None);
        assert!(matches!(
            submit(&h, p, t, &a, json!({})),
            Err(TaskdistError::Forbidden(_))
        ));
        assert_eq!(h.engine.next_task(p, &b, 0).expect("b").map(|t| t.id), Some(t));
    }

    #[test]
    fn locked_offset_skips_acquired_candidates() {
        let h = harness();
        let p = project(&h, "p", SchedulerPolicy::Locked);
        let high = task(&h, p, 1, 0.9);
        let mid = task(&h, p, 1, 0.5);
        let low = task(&h, p, 1, 0.1);
        let a = Contributor::User(1);

        assert_eq!(h.engine.next_task(p, &a, 2).expect("offset 2").map(|t| t.id), Some(low));
        assert!(h.engine.locks().has_lock(p, high, &a).expect("skipped lock kept"));
        assert!(h.engine.locks().has_lock(p, mid, &a).expect("skipped lock kept"));
        assert!(matches!(h.engine.next_task(p, &a, 3), Err(TaskdistError::InvalidInput(_))));
    }

    #[test]
    fn unknown_project_and_bad_offset_are_rejected_before_any_work() {
        let h = harness();
        let user = Contributor::User(1);
        assert!(matches!(h.engine.next_task(77, &user, 0), Err(TaskdistError::NotFound(_))));
        let p = project(&h, "p", SchedulerPolicy::Default);
        task(&h, p, 1, 0.0);
        assert!(matches!(h.engine.next_task(p, &user, 3), Err(TaskdistError::InvalidInput(_))));
        assert_eq!(h.engine.active_user_count(p).expect("count"), 0);
    }

    #[test]
    fn busy_store_while_stamping_withdraws_the_offer() {
        let h = harness();
        let p = project(&h, "p", SchedulerPolicy::Locked);
        let t = task(&h, p, 1, 0.0);
        let a = Contributor::User(1);

        h.coordination.busy_sets.store(true, Ordering::SeqCst);
        assert_eq!(h.engine.next_task(p, &a, 0).expect("withdrawn"), None);
        assert!(!h.engine.locks().has_lock(p, t, &a).expect("lock released"));

        h.coordination.busy_sets.store(false, Ordering::SeqCst);
        assert_eq!(h.engine.next_task(p, &a, 0).expect("offered").map(|t| t.id), Some(t));
    }

    #[test]
    fn user_preference_scheduler_filters_by_stored_preference() {
        let h = harness();
        let p = project(
            &h,
            "p",
            SchedulerPolicy::UserPreference {
                inner: BasePolicy::DepthFirst,
            },
        );
        let german = h
            .engine
            .store()
            .insert_task(NewTask {
                n_answers: 1,
                priority: 1.0,
                user_pref: Some(json!({"languages": ["de"]})),
                ..NewTask::for_project(p)
            })
            .expect("german task")
            .id;
        let open = task(&h, p, 1, 0.0);

        h.engine
            .store()
            .set_user_pref(1, json!({"languages": ["de"]}))
            .expect("pref");
        assert_eq!(
            h.engine.next_task(p, &Contributor::User(1), 0).expect("de").map(|t| t.id),
            Some(german)
        );
        assert_eq!(
            h.engine.next_task(p, &Contributor::User(2), 0).expect("no pref").map(|t| t.id),
            Some(open)
        );
        assert_eq!(
            h.engine
                .next_task(p, &Contributor::Ip("10.0.0.1".to_string()), 0)
                .expect("ip")
                .map(|t| t.id),
            Some(open)
        );
    }

    #[test]
    fn quiz_routes_users_through_gold_tasks() {
        let h = harness();
        let p = project(&h, "quiz", SchedulerPolicy::DepthFirst);
        let quiz = QuizConfig {
            enabled: true,
            questions: 2,
            passing: 1,
            short_circuit: true,
        };
        assert!(h.engine.store().set_project_quiz(p, quiz).expect("quiz"));
        let normal = task(&h, p, 1, 1.0);
        let gold_a = gold(&h, p, json!({"answer": "cat"}));
        let gold_b = gold(&h, p, json!({"answer": "dog"}));

        let passer = Contributor::User(1);
        assert_eq!(h.engine.next_task(p, &passer, 0).expect("gold").map(|t| t.id), Some(gold_a));
        h.clock.advance(Duration::from_secs(1));
        let outcome = submit(&h, p, gold_a, &passer, json!({"answer": "cat"})).expect("answer");
        assert_eq!(outcome.quiz.map(|q| q.status), Some(QuizStatus::Passed));
        assert_eq!(h.engine.next_task(p, &passer, 0).expect("normal").map(|t| t.id), Some(normal));

        let failer = Contributor::User(2);
        for gold_id in [gold_a, gold_b] {
            assert_eq!(
                h.engine.next_task(p, &failer, 0).expect("gold").map(|t| t.id),
                Some(gold_id)
            );
            h.clock.advance(Duration::from_secs(1));
            submit(&h, p, gold_id, &failer, json!({"answer": "wrong"})).expect("answer");
        }
        assert_eq!(
            h.engine.store().get_quiz_progress(p, 2).expect("progress").map(|q| q.status),
            Some(QuizStatus::Failed)
        );
        assert_eq!(h.engine.next_task(p, &failer, 0).expect("closed"), None);

        let reset = h.engine.reset_quiz(p, 2).expect("reset");
        assert_eq!(reset.status, QuizStatus::InProgress);
        assert_eq!((reset.right, reset.wrong), (0, 0));

        let anonymous = Contributor::Ip("10.9.9.9".to_string());
        assert_eq!(
            h.engine.next_task(p, &anonymous, 0).expect("ip skips quiz").map(|t| t.id),
            Some(normal)
        );
        assert_eq!(
            h.engine.store().get_task(gold_a).expect("get").expect("gold").state,
            TaskState::Ongoing
        );
    }

    #[test]
    fn reset_quiz_releases_the_users_locks() {
        let h = harness();
        let p = project(&h, "p", SchedulerPolicy::Locked);
        let t = task(&h, p, 1, 0.0);
        let user = Contributor::User(4);
        h.engine.next_task(p, &user, 0).expect("offer").expect("task");
        assert!(h.engine.locks().has_lock(p, t, &user).expect("locked"));

        h.engine.reset_quiz(p, 4).expect("reset");
        assert!(!h.engine.locks().has_lock(p, t, &user).expect("released"));
        assert!(matches!(h.engine.reset_quiz(99, 4), Err(TaskdistError::NotFound(_))));
    }

    #[test]
    fn redundancy_change_notifies_on_completion() {
        let h = harness();
        let p = project(&h, "p", SchedulerPolicy::Default);
        let t = task(&h, p, 3, 0.0);
        let user = Contributor::User(1);
        h.engine.next_task(p, &user, 0).expect("offer");
        h.clock.advance(Duration::from_secs(1));
        submit(&h, p, t, &user, json!({})).expect("run");

        let change = h.engine.update_task_redundancy(t, 1).expect("lower");
        assert_eq!(change.task.state, TaskState::Completed);
        assert_eq!(h.recorder.events().len(), 1);

        let change = h.engine.update_task_redundancy(t, 2).expect("raise");
        assert!(change.reopened);
        assert_eq!(h.recorder.events().len(), 1);
    }

    #[test]
    fn active_users_are_counted_per_project() {
        let h = harness();
        let p = project(&h, "p", SchedulerPolicy::Default);
        let other = project(&h, "other", SchedulerPolicy::Default);
        for user in 1..=3 {
            h.engine
                .next_task(p, &Contributor::User(user), 0)
                .expect("request");
        }
        h.engine
            .next_task(other, &Contributor::User(1), 0)
            .expect("request");
        assert_eq!(h.engine.active_user_count(p).expect("count"), 3);
        assert_eq!(h.engine.active_user_count(other).expect("count"), 1);
        assert!(matches!(h.engine.active_user_count(42), Err(TaskdistError::NotFound(_))));
    }

    #[test]
    fn non_locking_projects_report_no_lock_and_allow_reads() {
        let h = harness();
        let p = project(&h, "p", SchedulerPolicy::BreadthFirst);
        let t = task(&h, p, 1, 0.0);
        let user = Contributor::User(1);
        assert_eq!(h.engine.lock_seconds_remaining(t, &user).expect("none"), None);
        assert_eq!(h.engine.authorize_task_read(p, t, &user).expect("read").id, t);
        assert!(matches!(
            h.engine.authorize_task_read(p + 1, t, &user),
            Err(TaskdistError::NotFound(_))
        ));
    }
}
