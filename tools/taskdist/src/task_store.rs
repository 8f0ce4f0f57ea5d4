use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::errors::TaskdistError;
use crate::logging::append_run_log;
use crate::preferences::Preference;
use crate::quiz::{QuizConfig, QuizProgress, QuizStatus};
use crate::runtime::Clock;
use crate::scheduler::SchedulerPolicy;
use crate::types::{
    Candidate, Contributor, NewProject, NewTask, Project, ProjectId, Task, TaskId, TaskResult,
    TaskRun, TaskState, UserId,
};

const READ_POOL_SIZE: usize = 4;

const TASK_COLUMNS: &str = "t.id, t.project_id, t.n_answers, t.priority, t.state, t.calibration, \
                            t.gold_answers, t.user_pref, t.info, t.created";

type StoreResult<T> = Result<T, TaskdistError>;

/// A submission the guard has accepted, with its timestamps settled.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTaskRun {
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub contributor: Contributor,
    pub info: Value,
    pub created: i64,
    pub finish_time: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedTaskRun {
    pub task_run: TaskRun,
    /// Set only for the submission whose insert moved the task to completed.
    pub completion: Option<TaskResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub changed: bool,
    pub completion: Option<TaskResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedundancyChange {
    pub task: Task,
    pub reopened: bool,
    pub completion: Option<TaskResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrder {
    PriorityThenId,
    FewestAnswersThenId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateQuery {
    pub gold: bool,
    pub require_capacity: bool,
    pub order: CandidateOrder,
    pub limit: usize,
}

impl CandidateQuery {
    pub fn normal(limit: usize) -> Self {
        Self {
            gold: false,
            require_capacity: false,
            order: CandidateOrder::PriorityThenId,
            limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuizAction {
    Start,
    Answer { correct: bool },
    Reset,
}

#[derive(Debug)]
enum WriteCmd {
    CreateProject {
        project: NewProject,
        now: i64,
        reply: oneshot::Sender<StoreResult<Project>>,
    },
    SetScheduler {
        project_id: ProjectId,
        policy: SchedulerPolicy,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    SetQuiz {
        project_id: ProjectId,
        quiz: QuizConfig,
        reply: oneshot::Sender<StoreResult<bool>>,
    },
    InsertTask {
        task: NewTask,
        now: i64,
        reply: oneshot::Sender<StoreResult<Task>>,
    },
    UpdateState {
        task_id: TaskId,
        state: TaskState,
        now: i64,
        reply: oneshot::Sender<StoreResult<StateChange>>,
    },
    UpdateRedundancy {
        task_id: TaskId,
        n_answers: i64,
        now: i64,
        reply: oneshot::Sender<StoreResult<RedundancyChange>>,
    },
    InsertTaskRun {
        run: PendingTaskRun,
        reply: oneshot::Sender<StoreResult<RecordedTaskRun>>,
    },
    SetUserPref {
        user_id: UserId,
        user_pref: Value,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    ApplyQuiz {
        project_id: ProjectId,
        user_id: UserId,
        config: QuizConfig,
        action: QuizAction,
        reply: oneshot::Sender<StoreResult<QuizProgress>>,
    },
}

/// Relational home of projects, tasks, task runs and results.
///
/// Writes funnel through one writer thread so that the task-run insert and
/// the completion transition it may trigger share one transaction; reads go
/// through a small pool of read-only connections.
pub struct TaskStore {
    write_tx: Option<mpsc::Sender<WriteCmd>>,
    read_pool: ReadPool,
    writer_join: Option<thread::JoinHandle<()>>,
    db_path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl Drop for TaskStore {
    fn drop(&mut self) {
        // Closing the sender ends the writer loop; joining flushes queued writes.
        drop(self.write_tx.take());
        if let Some(handle) = self.writer_join.take() {
            let _ = handle.join();
        }
    }
}

impl TaskStore {
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        append_run_log(
            "info",
            "task_store.open",
            json!({ "path": path.display().to_string() }),
        );
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TaskdistError::Database(e.to_string()))?;
        }

        let existed_before_open = path.exists();
        if existed_before_open {
            let meta =
                std::fs::metadata(&path).map_err(|e| TaskdistError::Database(e.to_string()))?;
            if meta.len() == 0 {
                return Err(TaskdistError::Database(format!(
                    "task database is 0 bytes (corrupt): {}",
                    path.display()
                )));
            }
        }

        let mut write_conn = Connection::open(&path).map_err(db_err)?;
        configure_write_connection(&write_conn)?;

        if existed_before_open {
            let integrity: String = write_conn
                .pragma_query_value(None, "quick_check", |row| row.get(0))
                .map_err(db_err)?;
            if integrity != "ok" {
                return Err(TaskdistError::Database(format!(
                    "task database failed integrity check: {integrity}"
                )));
            }
        }

        run_migrations(&mut write_conn, clock.now_millis())?;

        let (write_tx, mut write_rx) = mpsc::channel(128);
        let writer_join = thread::spawn(move || {
            while let Some(cmd) = write_rx.blocking_recv() {
                handle_write(&mut write_conn, cmd);
            }
        });

        let read_pool = ReadPool::open(&path, READ_POOL_SIZE)?;
        append_run_log(
            "info",
            "task_store.opened",
            json!({ "path": path.display().to_string() }),
        );
        Ok(Self {
            write_tx: Some(write_tx),
            read_pool,
            writer_join: Some(writer_join),
            db_path: path,
            clock,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn sender(&self) -> StoreResult<&mpsc::Sender<WriteCmd>> {
        self.write_tx
            .as_ref()
            .ok_or_else(|| TaskdistError::Database("store is closed".to_string()))
    }

    fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<StoreResult<T>>) -> WriteCmd,
    ) -> StoreResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender()?
            .blocking_send(build(reply_tx))
            .map_err(|e| TaskdistError::Database(e.to_string()))?;
        reply_rx
            .blocking_recv()
            .map_err(|e| TaskdistError::Database(e.to_string()))?
    }

    pub fn create_project(&self, project: NewProject) -> StoreResult<Project> {
        project.quiz.validate()?;
        if project.short_name.trim().is_empty() {
            return Err(TaskdistError::InvalidInput(
                "project short_name must not be empty".to_string(),
            ));
        }
        let short_name = project.short_name.clone();
        let now = self.clock.now_millis();
        let result = self.request(|reply| WriteCmd::CreateProject {
            project,
            now,
            reply,
        });
        match &result {
            Ok(row) => append_run_log(
                "info",
                "task_store.project.created",
                json!({
                    "project_id": row.id,
                    "short_name": row.short_name,
                    "scheduler": row.scheduler.as_name(),
                    "quiz_enabled": row.quiz.enabled,
                }),
            ),
            Err(e) => append_run_log(
                "error",
                "task_store.project.create_failed",
                json!({ "short_name": short_name, "error": e.to_string() }),
            ),
        }
        result
    }

    pub fn set_project_scheduler(
        &self,
        project_id: ProjectId,
        policy: SchedulerPolicy,
    ) -> StoreResult<bool> {
        let name = policy.as_name();
        let result = self.request(|reply| WriteCmd::SetScheduler {
            project_id,
            policy,
            reply,
        });
        log_bool_outcome(
            "task_store.project.scheduler_set",
            &result,
            json!({ "project_id": project_id, "scheduler": name }),
        );
        result
    }

    pub fn set_project_quiz(&self, project_id: ProjectId, quiz: QuizConfig) -> StoreResult<bool> {
        quiz.validate()?;
        let result = self.request(|reply| WriteCmd::SetQuiz {
            project_id,
            quiz,
            reply,
        });
        log_bool_outcome(
            "task_store.project.quiz_set",
            &result,
            json!({
                "project_id": project_id,
                "enabled": quiz.enabled,
                "questions": quiz.questions,
                "passing": quiz.passing,
            }),
        );
        result
    }

    pub fn get_project(&self, project_id: ProjectId) -> StoreResult<Option<Project>> {
        self.read_pool.with_conn(|conn| {
            conn.query_row(
                "SELECT id, short_name, scheduler, lock_timeout_seconds, quiz
                 FROM projects WHERE id = ?1",
                [project_id],
                row_to_project,
            )
            .optional()
            .map_err(db_err)
        })
    }

    pub fn get_project_by_short_name(&self, short_name: &str) -> StoreResult<Option<Project>> {
        self.read_pool.with_conn(|conn| {
            conn.query_row(
                "SELECT id, short_name, scheduler, lock_timeout_seconds, quiz
                 FROM projects WHERE short_name = ?1",
                [short_name],
                row_to_project,
            )
            .optional()
            .map_err(db_err)
        })
    }

    pub fn insert_task(&self, task: NewTask) -> StoreResult<Task> {
        validate_new_task(&task)?;
        let project_id = task.project_id;
        let now = self.clock.now_millis();
        let result = self.request(|reply| WriteCmd::InsertTask { task, now, reply });
        match &result {
            Ok(row) => append_run_log(
                "info",
                "task_store.task.inserted",
                json!({
                    "task_id": row.id,
                    "project_id": row.project_id,
                    "n_answers": row.n_answers,
                    "priority": row.priority,
                    "calibration": row.calibration,
                }),
            ),
            Err(e) => append_run_log(
                "error",
                "task_store.task.insert_failed",
                json!({ "project_id": project_id, "error": e.to_string() }),
            ),
        }
        result
    }

    pub fn get_task(&self, task_id: TaskId) -> StoreResult<Option<Task>> {
        self.read_pool.with_conn(|conn| fetch_task(conn, task_id))
    }

    /// Tasks of a project in the given state, highest priority first, ties by id.
    pub fn tasks_with_state(
        &self,
        project_id: ProjectId,
        state: TaskState,
    ) -> StoreResult<Vec<Task>> {
        self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare(&format!(
                    "SELECT {TASK_COLUMNS} FROM tasks t
                     WHERE t.project_id = ?1 AND t.state = ?2
                     ORDER BY t.priority DESC, t.id ASC"
                ))
                .map_err(db_err)?;
            let rows = statement
                .query_map(params![project_id, state.as_str()], row_to_task)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    /// Ongoing tasks of one pool the contributor has not answered yet, each
    /// with its accepted run count.
    pub fn candidate_tasks(
        &self,
        project_id: ProjectId,
        contributor: &Contributor,
        query: CandidateQuery,
    ) -> StoreResult<Vec<Candidate>> {
        let order = match query.order {
            CandidateOrder::PriorityThenId => "c.priority DESC, c.id ASC",
            CandidateOrder::FewestAnswersThenId => "c.accepted ASC, c.id ASC",
        };
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare(&format!(
                    "SELECT c.* FROM (
                        SELECT {TASK_COLUMNS},
                               (SELECT COUNT(*) FROM task_runs r WHERE r.task_id = t.id) AS accepted
                        FROM tasks t
                        WHERE t.project_id = ?1
                          AND t.state = 'ongoing'
                          AND t.calibration = ?2
                          AND NOT EXISTS (
                              SELECT 1 FROM task_runs mine
                              WHERE mine.task_id = t.id
                                AND (mine.user_id = ?3 OR mine.user_ip = ?4)
                          )
                     ) c
                     WHERE ?5 = 0 OR c.calibration = 1 OR c.accepted < c.n_answers
                     ORDER BY {order}
                     LIMIT ?6"
                ))
                .map_err(db_err)?;
            let rows = statement
                .query_map(
                    params![
                        project_id,
                        query.gold,
                        contributor.user_id(),
                        contributor.user_ip(),
                        query.require_capacity,
                        limit,
                    ],
                    |row| {
                        Ok(Candidate {
                            task: row_to_task(row)?,
                            accepted_count: row.get(10)?,
                        })
                    },
                )
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    pub fn count_accepted_task_runs(&self, task_id: TaskId) -> StoreResult<i64> {
        self.read_pool.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM task_runs WHERE task_id = ?1",
                [task_id],
                |row| row.get(0),
            )
            .map_err(db_err)
        })
    }

    /// Conditionally moves a task to `state`. Completing only applies to a
    /// non-gold task whose accepted runs reach `n_answers`; reopening only to
    /// a task whose runs fall short of it.
    pub fn update_task_state(&self, task_id: TaskId, state: TaskState) -> StoreResult<StateChange> {
        let now = self.clock.now_millis();
        let result = self.request(|reply| WriteCmd::UpdateState {
            task_id,
            state,
            now,
            reply,
        });
        match &result {
            Ok(change) => append_run_log(
                if change.changed { "info" } else { "debug" },
                "task_store.task.state_updated",
                json!({
                    "task_id": task_id,
                    "state": state.as_str(),
                    "changed": change.changed,
                }),
            ),
            Err(e) => append_run_log(
                "error",
                "task_store.task.state_update_failed",
                json!({ "task_id": task_id, "state": state.as_str(), "error": e.to_string() }),
            ),
        }
        result
    }

    /// Changes a task's redundancy and brings its state in line with it.
    pub fn update_task_redundancy(
        &self,
        task_id: TaskId,
        n_answers: i64,
    ) -> StoreResult<RedundancyChange> {
        if n_answers < 1 {
            return Err(TaskdistError::InvalidInput(format!(
                "n_answers must be at least 1, got {n_answers}"
            )));
        }
        let now = self.clock.now_millis();
        let result = self.request(|reply| WriteCmd::UpdateRedundancy {
            task_id,
            n_answers,
            now,
            reply,
        });
        match &result {
            Ok(change) => append_run_log(
                "info",
                "task_store.task.redundancy_updated",
                json!({
                    "task_id": task_id,
                    "n_answers": n_answers,
                    "state": change.task.state.as_str(),
                    "reopened": change.reopened,
                    "completed": change.completion.is_some(),
                }),
            ),
            Err(e) => append_run_log(
                "error",
                "task_store.task.redundancy_update_failed",
                json!({ "task_id": task_id, "n_answers": n_answers, "error": e.to_string() }),
            ),
        }
        result
    }

    /// Persists an accepted run and, in the same transaction, completes the
    /// task if this run satisfied its redundancy.
    pub fn insert_task_run(&self, run: PendingTaskRun) -> StoreResult<RecordedTaskRun> {
        let task_id = run.task_id;
        let contributor = run.contributor.key();
        let result = self.request(|reply| WriteCmd::InsertTaskRun { run, reply });
        match &result {
            Ok(recorded) => append_run_log(
                "info",
                "task_store.task_run.inserted",
                json!({
                    "task_run_id": recorded.task_run.id,
                    "task_id": task_id,
                    "contributor": contributor,
                    "completed": recorded.completion.is_some(),
                }),
            ),
            Err(TaskdistError::Conflict(message)) => append_run_log(
                "warn",
                "task_store.task_run.rejected",
                json!({ "task_id": task_id, "contributor": contributor, "reason": message }),
            ),
            Err(e) => append_run_log(
                "error",
                "task_store.task_run.insert_failed",
                json!({ "task_id": task_id, "contributor": contributor, "error": e.to_string() }),
            ),
        }
        result
    }

    pub fn list_task_runs(&self, task_id: TaskId) -> StoreResult<Vec<TaskRun>> {
        self.read_pool.with_conn(|conn| {
            let mut statement = conn
                .prepare(
                    "SELECT id, task_id, project_id, user_id, user_ip, info, created, finish_time
                     FROM task_runs WHERE task_id = ?1 ORDER BY id ASC",
                )
                .map_err(db_err)?;
            let rows = statement
                .query_map([task_id], row_to_task_run)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            Ok(rows)
        })
    }

    pub fn get_result(&self, task_id: TaskId) -> StoreResult<Option<TaskResult>> {
        self.read_pool.with_conn(|conn| fetch_result(conn, task_id))
    }

    pub fn set_user_pref(&self, user_id: UserId, user_pref: Value) -> StoreResult<()> {
        let result = self.request(|reply| WriteCmd::SetUserPref {
            user_id,
            user_pref,
            reply,
        });
        if let Err(e) = &result {
            append_run_log(
                "error",
                "task_store.user_pref.set_failed",
                json!({ "user_id": user_id, "error": e.to_string() }),
            );
        }
        result
    }

    /// Stored preference of a user, exactly as it was saved.
    pub fn get_user_pref(&self, user_id: UserId) -> StoreResult<Option<Value>> {
        self.read_pool.with_conn(|conn| {
            let raw = conn
                .query_row(
                    "SELECT user_pref FROM contributor_profiles WHERE user_id = ?1",
                    [user_id],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .map_err(db_err)?;
            raw.map(|text| {
                serde_json::from_str(&text).map_err(|e| TaskdistError::Database(e.to_string()))
            })
            .transpose()
        })
    }

    pub fn get_quiz_progress(
        &self,
        project_id: ProjectId,
        user_id: UserId,
    ) -> StoreResult<Option<QuizProgress>> {
        self.read_pool
            .with_conn(|conn| fetch_quiz_progress(conn, project_id, user_id))
    }

    pub fn apply_quiz(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        config: QuizConfig,
        action: QuizAction,
    ) -> StoreResult<QuizProgress> {
        let result = self.request(|reply| WriteCmd::ApplyQuiz {
            project_id,
            user_id,
            config,
            action,
            reply,
        });
        match &result {
            Ok(progress) => append_run_log(
                "info",
                "task_store.quiz.updated",
                json!({
                    "project_id": project_id,
                    "user_id": user_id,
                    "action": format!("{action:?}"),
                    "status": progress.status.as_str(),
                    "right": progress.right,
                    "wrong": progress.wrong,
                }),
            ),
            Err(e) => append_run_log(
                "error",
                "task_store.quiz.update_failed",
                json!({ "project_id": project_id, "user_id": user_id, "error": e.to_string() }),
            ),
        }
        result
    }
}

fn log_bool_outcome(event: &str, result: &StoreResult<bool>, payload: Value) {
    match result {
        Ok(true) => append_run_log("info", event, payload),
        Ok(false) => append_run_log("warn", &format!("{event}.missing"), payload),
        Err(e) => append_run_log(
            "error",
            &format!("{event}.failed"),
            json!({ "context": payload, "error": e.to_string() }),
        ),
    }
}

fn handle_write(conn: &mut Connection, cmd: WriteCmd) {
    match cmd {
        WriteCmd::CreateProject {
            project,
            now,
            reply,
        } => {
            let _ = reply.send(create_project(conn, &project, now));
        }
        WriteCmd::SetScheduler {
            project_id,
            policy,
            reply,
        } => {
            let result = conn
                .execute(
                    "UPDATE projects SET scheduler = ?2 WHERE id = ?1",
                    params![project_id, policy.as_name()],
                )
                .map(|changed| changed > 0)
                .map_err(db_err);
            let _ = reply.send(result);
        }
        WriteCmd::SetQuiz {
            project_id,
            quiz,
            reply,
        } => {
            let result = serde_json::to_string(&quiz)
                .map_err(|e| TaskdistError::Database(e.to_string()))
                .and_then(|encoded| {
                    conn.execute(
                        "UPDATE projects SET quiz = ?2 WHERE id = ?1",
                        params![project_id, encoded],
                    )
                    .map(|changed| changed > 0)
                    .map_err(db_err)
                });
            let _ = reply.send(result);
        }
        WriteCmd::InsertTask { task, now, reply } => {
            let _ = reply.send(insert_task(conn, &task, now));
        }
        WriteCmd::UpdateState {
            task_id,
            state,
            now,
            reply,
        } => {
            let _ = reply.send(update_state(conn, task_id, state, now));
        }
        WriteCmd::UpdateRedundancy {
            task_id,
            n_answers,
            now,
            reply,
        } => {
            let _ = reply.send(update_redundancy(conn, task_id, n_answers, now));
        }
        WriteCmd::InsertTaskRun { run, reply } => {
            let _ = reply.send(insert_task_run(conn, &run));
        }
        WriteCmd::SetUserPref {
            user_id,
            user_pref,
            reply,
        } => {
            let result = conn
                .execute(
                    "INSERT INTO contributor_profiles (user_id, user_pref) VALUES (?1, ?2)
                     ON CONFLICT(user_id) DO UPDATE SET user_pref = excluded.user_pref",
                    params![user_id, user_pref.to_string()],
                )
                .map(|_| ())
                .map_err(db_err);
            let _ = reply.send(result);
        }
        WriteCmd::ApplyQuiz {
            project_id,
            user_id,
            config,
            action,
            reply,
        } => {
            let _ = reply.send(apply_quiz(conn, project_id, user_id, &config, action));
        }
    }
}

#[derive(Clone)]
struct ReadPool {
    conns: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl ReadPool {
    fn open(path: &Path, size: usize) -> StoreResult<Self> {
        let mut conns = Vec::with_capacity(size);
        for _ in 0..size {
            let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
                .map_err(db_err)?;
            conn.busy_timeout(std::time::Duration::from_secs(3))
                .map_err(db_err)?;
            conns.push(Mutex::new(conn));
        }

        Ok(Self {
            conns: Arc::new(conns),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        let guard = self.conns[idx]
            .lock()
            .map_err(|_| TaskdistError::Database("read connection lock poisoned".to_string()))?;
        f(&guard)
    }
}

fn configure_write_connection(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(db_err)?;
    conn.pragma_update(None, "synchronous", "FULL")
        .map_err(db_err)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(db_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(db_err)?;
    Ok(())
}

fn run_migrations(conn: &mut Connection, now: i64) -> StoreResult<()> {
    let migrations = [(1_i64, include_str!("../migrations/0001_taskdist.sql"))];

    conn.execute_batch("BEGIN IMMEDIATE; CREATE TABLE IF NOT EXISTS schema_migrations (version INTEGER PRIMARY KEY, applied_at INTEGER NOT NULL); COMMIT;")
        .map_err(db_err)?;

    for (version, sql) in migrations {
        let exists = conn
            .query_row(
                "SELECT 1 FROM schema_migrations WHERE version = ?1 LIMIT 1",
                [version],
                |_| Ok(()),
            )
            .optional()
            .map_err(db_err)?
            .is_some();
        if exists {
            continue;
        }

        append_run_log(
            "info",
            "task_store.migration.applying",
            json!({ "version": version }),
        );
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(sql).map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![version, now],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
    }

    Ok(())
}

fn validate_new_task(task: &NewTask) -> StoreResult<()> {
    if task.n_answers < 1 {
        return Err(TaskdistError::InvalidInput(format!(
            "n_answers must be at least 1, got {}",
            task.n_answers
        )));
    }
    if !task.priority.is_finite() {
        return Err(TaskdistError::InvalidInput(
            "priority must be a finite number".to_string(),
        ));
    }
    if let Some(user_pref) = &task.user_pref {
        Preference::parse(user_pref)?;
    }
    if task.calibration && task.gold_answers.is_none() {
        return Err(TaskdistError::InvalidInput(
            "gold tasks need gold_answers".to_string(),
        ));
    }
    Ok(())
}

fn create_project(conn: &Connection, project: &NewProject, now: i64) -> StoreResult<Project> {
    let quiz = serde_json::to_string(&project.quiz).map_err(|e| TaskdistError::Database(e.to_string()))?;
    let lock_timeout = project
        .lock_timeout_seconds
        .map(|secs| i64::try_from(secs).unwrap_or(i64::MAX));
    conn.execute(
        "INSERT INTO projects (short_name, scheduler, lock_timeout_seconds, quiz, created)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            project.short_name.trim(),
            project.scheduler.as_name(),
            lock_timeout,
            quiz,
            now
        ],
    )
    .map_err(|e| match constraint_kind(&e) {
        Some(ConstraintKind::Unique) => TaskdistError::Conflict(format!(
            "project `{}` already exists",
            project.short_name.trim()
        )),
        _ => db_err(e),
    })?;
    let id = conn.last_insert_rowid();
    conn.query_row(
        "SELECT id, short_name, scheduler, lock_timeout_seconds, quiz FROM projects WHERE id = ?1",
        [id],
        row_to_project,
    )
    .map_err(db_err)
}

fn insert_task(conn: &mut Connection, task: &NewTask, now: i64) -> StoreResult<Task> {
    let tx = conn.transaction().map_err(db_err)?;
    let project_exists = tx
        .query_row("SELECT 1 FROM projects WHERE id = ?1", [task.project_id], |_| Ok(()))
        .optional()
        .map_err(db_err)?
        .is_some();
    if !project_exists {
        return Err(TaskdistError::NotFound(format!(
            "project {} does not exist",
            task.project_id
        )));
    }

    tx.execute(
        "INSERT INTO tasks (project_id, n_answers, priority, state, calibration, gold_answers, user_pref, info, created)
         VALUES (?1, ?2, ?3, 'ongoing', ?4, ?5, ?6, ?7, ?8)",
        params![
            task.project_id,
            task.n_answers,
            task.priority,
            task.calibration,
            task.gold_answers.as_ref().map(Value::to_string),
            task.user_pref.as_ref().map(Value::to_string),
            task.info.to_string(),
            now,
        ],
    )
    .map_err(db_err)?;
    let id = tx.last_insert_rowid();
    let row = fetch_task(&tx, id)?
        .ok_or_else(|| TaskdistError::Database("row missing after insert".to_string()))?;
    tx.commit().map_err(db_err)?;
    Ok(row)
}

fn insert_task_run(conn: &mut Connection, run: &PendingTaskRun) -> StoreResult<RecordedTaskRun> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(db_err)?;

    // Only ongoing tasks with open redundancy take runs; gold tasks always do.
    let inserted = tx
        .execute(
            "INSERT INTO task_runs (task_id, project_id, user_id, user_ip, info, created, finish_time)
             SELECT t.id, t.project_id, ?2, ?3, ?4, ?5, ?6
             FROM tasks t
             WHERE t.id = ?1
               AND t.project_id = ?7
               AND (t.calibration = 1
                    OR (t.state = 'ongoing'
                        AND (SELECT COUNT(*) FROM task_runs r WHERE r.task_id = t.id) < t.n_answers))",
            params![
                run.task_id,
                run.contributor.user_id(),
                run.contributor.user_ip(),
                run.info.to_string(),
                run.created,
                run.finish_time,
                run.project_id,
            ],
        )
        .map_err(|e| match constraint_kind(&e) {
            Some(ConstraintKind::Unique) => TaskdistError::Conflict(format!(
                "{} already submitted a run for task {}",
                run.contributor.key(),
                run.task_id
            )),
            _ => db_err(e),
        })?;
    if inserted == 0 {
        let exists = fetch_task(&tx, run.task_id)?;
        return Err(match exists {
            None => TaskdistError::NotFound(format!("task {} does not exist", run.task_id)),
            Some(task) if task.project_id != run.project_id => TaskdistError::Forbidden(format!(
                "task {} does not belong to project {}",
                run.task_id, run.project_id
            )),
            Some(_) => TaskdistError::Conflict(format!(
                "task {} already has all the answers it needs",
                run.task_id
            )),
        });
    }
    let run_id = tx.last_insert_rowid();
    let completion = complete_if_saturated(&tx, run.task_id, run.finish_time)?;
    tx.commit().map_err(db_err)?;

    Ok(RecordedTaskRun {
        task_run: TaskRun {
            id: run_id,
            task_id: run.task_id,
            project_id: run.project_id,
            contributor: run.contributor.clone(),
            info: run.info.clone(),
            created: run.created,
            finish_time: run.finish_time,
        },
        completion,
    })
}

/// The single conditional UPDATE behind every completion. Only the caller
/// whose UPDATE changes the row gets a result back.
fn complete_if_saturated(
    tx: &rusqlite::Transaction<'_>,
    task_id: TaskId,
    now: i64,
) -> StoreResult<Option<TaskResult>> {
    let changed = tx
        .execute(
            "UPDATE tasks SET state = 'completed'
             WHERE id = ?1
               AND calibration = 0
               AND state <> 'completed'
               AND (SELECT COUNT(*) FROM task_runs r WHERE r.task_id = tasks.id) >= n_answers",
            [task_id],
        )
        .map_err(db_err)?;
    if changed == 0 {
        return Ok(None);
    }
    upsert_result(tx, task_id, now).map(Some)
}

fn upsert_result(tx: &rusqlite::Transaction<'_>, task_id: TaskId, now: i64) -> StoreResult<TaskResult> {
    let run_ids = {
        let mut statement = tx
            .prepare("SELECT id FROM task_runs WHERE task_id = ?1 ORDER BY id ASC")
            .map_err(db_err)?;
        let ids = statement
            .query_map([task_id], |row| row.get::<_, i64>(0))
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        ids
    };
    let encoded = serde_json::to_string(&run_ids).map_err(|e| TaskdistError::Database(e.to_string()))?;
    tx.execute(
        "INSERT INTO results (project_id, task_id, task_run_ids, last_version, created)
         SELECT project_id, id, ?2, 1, ?3 FROM tasks WHERE id = ?1
         ON CONFLICT(task_id) DO UPDATE SET
             task_run_ids = excluded.task_run_ids,
             last_version = results.last_version + 1",
        params![task_id, encoded, now],
    )
    .map_err(db_err)?;
    fetch_result(tx, task_id)?
        .ok_or_else(|| TaskdistError::Database("result missing after upsert".to_string()))
}

fn update_state(
    conn: &mut Connection,
    task_id: TaskId,
    state: TaskState,
    now: i64,
) -> StoreResult<StateChange> {
    let tx = conn.transaction().map_err(db_err)?;
    if fetch_task(&tx, task_id)?.is_none() {
        return Err(TaskdistError::NotFound(format!("task {task_id} does not exist")));
    }
    let change = match state {
        TaskState::Completed => {
            let completion = complete_if_saturated(&tx, task_id, now)?;
            StateChange {
                changed: completion.is_some(),
                completion,
            }
        }
        TaskState::Ongoing => StateChange {
            changed: reopen_if_short(&tx, task_id)?,
            completion: None,
        },
    };
    tx.commit().map_err(db_err)?;
    Ok(change)
}

fn reopen_if_short(tx: &rusqlite::Transaction<'_>, task_id: TaskId) -> StoreResult<bool> {
    let changed = tx
        .execute(
            "UPDATE tasks SET state = 'ongoing'
             WHERE id = ?1
               AND state <> 'ongoing'
               AND (calibration = 1
                    OR (SELECT COUNT(*) FROM task_runs r WHERE r.task_id = tasks.id) < n_answers)",
            [task_id],
        )
        .map_err(db_err)?;
    Ok(changed > 0)
}

fn update_redundancy(
    conn: &mut Connection,
    task_id: TaskId,
    n_answers: i64,
    now: i64,
) -> StoreResult<RedundancyChange> {
    let tx = conn.transaction().map_err(db_err)?;
    let changed = tx
        .execute(
            "UPDATE tasks SET n_answers = ?2 WHERE id = ?1",
            params![task_id, n_answers],
        )
        .map_err(db_err)?;
    if changed == 0 {
        return Err(TaskdistError::NotFound(format!("task {task_id} does not exist")));
    }
    let reopened = reopen_if_short(&tx, task_id)?;
    let completion = complete_if_saturated(&tx, task_id, now)?;
    let task = fetch_task(&tx, task_id)?
        .ok_or_else(|| TaskdistError::Database("row missing after update".to_string()))?;
    tx.commit().map_err(db_err)?;
    Ok(RedundancyChange {
        task,
        reopened,
        completion,
    })
}

fn apply_quiz(
    conn: &mut Connection,
    project_id: ProjectId,
    user_id: UserId,
    config: &QuizConfig,
    action: QuizAction,
) -> StoreResult<QuizProgress> {
    let tx = conn.transaction().map_err(db_err)?;
    let mut progress =
        fetch_quiz_progress(&tx, project_id, user_id)?.unwrap_or_else(|| QuizProgress::fresh(config));
    match action {
        QuizAction::Start => {
            if progress.status == QuizStatus::NotStarted {
                progress.start(config)?;
            }
        }
        QuizAction::Answer { correct } => progress.record_answer(correct, config)?,
        QuizAction::Reset => progress.reset(config),
    }
    tx.execute(
        "INSERT INTO quiz_progress (project_id, user_id, status, right_answers, wrong_answers)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(project_id, user_id) DO UPDATE SET
             status = excluded.status,
             right_answers = excluded.right_answers,
             wrong_answers = excluded.wrong_answers",
        params![
            project_id,
            user_id,
            progress.status.as_str(),
            progress.right,
            progress.wrong
        ],
    )
    .map_err(db_err)?;
    tx.commit().map_err(db_err)?;
    Ok(progress)
}

fn fetch_task(conn: &Connection, task_id: TaskId) -> StoreResult<Option<Task>> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM tasks t WHERE t.id = ?1"),
        [task_id],
        row_to_task,
    )
    .optional()
    .map_err(db_err)
}

fn fetch_result(conn: &Connection, task_id: TaskId) -> StoreResult<Option<TaskResult>> {
    conn.query_row(
        "SELECT id, project_id, task_id, task_run_ids, last_version, created
         FROM results WHERE task_id = ?1",
        [task_id],
        |row| {
            let encoded = row.get::<_, String>(3)?;
            let task_run_ids = serde_json::from_str::<Vec<i64>>(&encoded)
                .map_err(|_| conversion_failure(3, "invalid task_run_ids"))?;
            Ok(TaskResult {
                id: row.get(0)?,
                project_id: row.get(1)?,
                task_id: row.get(2)?,
                task_run_ids,
                last_version: row.get(4)?,
                created: row.get(5)?,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

fn fetch_quiz_progress(
    conn: &Connection,
    project_id: ProjectId,
    user_id: UserId,
) -> StoreResult<Option<QuizProgress>> {
    conn.query_row(
        "SELECT status, right_answers, wrong_answers FROM quiz_progress
         WHERE project_id = ?1 AND user_id = ?2",
        params![project_id, user_id],
        |row| {
            let status = row.get::<_, String>(0)?;
            Ok(QuizProgress {
                status: QuizStatus::from_db(&status)
                    .ok_or_else(|| conversion_failure(0, "invalid quiz status"))?,
                right: row.get(1)?,
                wrong: row.get(2)?,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

fn row_to_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
    let scheduler = row.get::<_, String>(2)?;
    let quiz = row.get::<_, String>(4)?;
    let lock_timeout = row.get::<_, Option<i64>>(3)?;
    Ok(Project {
        id: row.get(0)?,
        short_name: row.get(1)?,
        scheduler: SchedulerPolicy::parse(&scheduler)
            .map_err(|_| conversion_failure(2, "invalid scheduler"))?,
        lock_timeout_seconds: lock_timeout.map(|secs| secs.max(0) as u64),
        quiz: serde_json::from_str(&quiz).map_err(|_| conversion_failure(4, "invalid quiz"))?,
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let state = row.get::<_, String>(4)?;
    Ok(Task {
        id: row.get(0)?,
        project_id: row.get(1)?,
        n_answers: row.get(2)?,
        priority: row.get(3)?,
        state: TaskState::from_db(&state).ok_or_else(|| conversion_failure(4, "invalid state"))?,
        calibration: row.get(5)?,
        gold_answers: optional_json(row, 6)?,
        user_pref: optional_json(row, 7)?,
        info: optional_json(row, 8)?.unwrap_or(Value::Null),
        created: row.get(9)?,
    })
}

fn row_to_task_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRun> {
    let user_id = row.get::<_, Option<UserId>>(3)?;
    let user_ip = row.get::<_, Option<String>>(4)?;
    let contributor = Contributor::from_parts(user_id, user_ip.as_deref())
        .map_err(|_| conversion_failure(3, "task run without exactly one contributor"))?;
    Ok(TaskRun {
        id: row.get(0)?,
        task_id: row.get(1)?,
        project_id: row.get(2)?,
        contributor,
        info: optional_json(row, 5)?.unwrap_or(Value::Null),
        created: row.get(6)?,
        finish_time: row.get(7)?,
    })
}

fn optional_json(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let Some(text) = row.get::<_, Option<String>>(idx)? else {
        return Ok(None);
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|_| conversion_failure(idx, "invalid json"))
}

fn conversion_failure(idx: usize, message: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.to_string(),
        )),
    )
}

enum ConstraintKind {
    Unique,
    Other,
}

fn constraint_kind(error: &rusqlite::Error) -> Option<ConstraintKind> {
    let rusqlite::Error::SqliteFailure(failure, _) = error else {
        return None;
    };
    if failure.code != ErrorCode::ConstraintViolation {
        return None;
    }
    if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    {
        Some(ConstraintKind::Unique)
    } else {
        Some(ConstraintKind::Other)
    }
}

fn db_err(error: rusqlite::Error) -> TaskdistError {
    TaskdistError::Database(error.to_string())
}
