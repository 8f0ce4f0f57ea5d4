pub mod active_users;
pub mod completion;
pub mod config;
pub mod contributions_guard;
pub mod coordination;
pub mod distributor;
pub mod errors;
pub mod lock_manager;
pub mod logging;
pub mod preferences;
pub mod quiz;
pub mod runtime;
pub mod scheduler;
pub mod task_store;
pub mod types;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{error::ErrorKind, Args, Parser, Subcommand};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use completion::JsonlWebhookOutbox;
use config::{load_config, AppConfig, CliOverrides};
use coordination::SqliteCoordinationStore;
use distributor::{EngineSettings, TaskDistributor};
use errors::TaskdistError;
use logging::{append_run_log, init_run_log, JsonlLogger};
use quiz::QuizConfig;
use runtime::{Clock, ProductionClock};
use scheduler::SchedulerPolicy;
use task_store::TaskStore;
use types::{Contributor, NewProject, NewTask, NewTaskRun, DEFAULT_N_ANSWERS};

#[derive(Debug, Clone, Parser)]
#[command(name = "taskdist")]
#[command(about = "Hands out crowdsourcing tasks and records the answers")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,
    #[arg(long, global = true)]
    pub coordination: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Create both databases and apply migrations.
    Init,
    CreateProject {
        #[arg(long)]
        short_name: String,
        /// Defaults to `scheduler.default_policy` from the config.
        #[arg(long)]
        scheduler: Option<String>,
        #[arg(long)]
        lock_timeout_seconds: Option<u64>,
    },
    SetScheduler {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        scheduler: String,
    },
    SetQuiz {
        #[arg(long)]
        project: i64,
        #[arg(long, default_value_t = false)]
        enabled: bool,
        #[arg(long, default_value_t = 0)]
        questions: u32,
        #[arg(long, default_value_t = 0)]
        passing: u32,
        #[arg(long, default_value_t = false)]
        no_short_circuit: bool,
    },
    AddTask {
        #[arg(long)]
        project: i64,
        #[arg(long, default_value_t = DEFAULT_N_ANSWERS)]
        n_answers: i64,
        #[arg(long, default_value_t = 0.0)]
        priority: f64,
        #[arg(long)]
        info: Option<String>,
        #[arg(long)]
        user_pref: Option<String>,
        /// Expected answer; marks the task as a gold task.
        #[arg(long)]
        gold_answers: Option<String>,
    },
    SetUserPref {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        pref: String,
    },
    SetRedundancy {
        #[arg(long)]
        task: i64,
        #[arg(long)]
        n_answers: i64,
    },
    NextTask {
        #[arg(long)]
        project: i64,
        #[command(flatten)]
        contributor: ContributorArgs,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    Submit {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        task: i64,
        #[command(flatten)]
        contributor: ContributorArgs,
        #[arg(long)]
        info: String,
    },
    ResetQuiz {
        #[arg(long)]
        project: i64,
        #[arg(long)]
        user_id: i64,
    },
    Task {
        #[arg(long)]
        id: i64,
    },
    ActiveUsers {
        #[arg(long)]
        project: i64,
    },
}

#[derive(Debug, Clone, Args)]
pub struct ContributorArgs {
    #[arg(long, conflicts_with = "ip")]
    pub user_id: Option<i64>,
    #[arg(long)]
    pub ip: Option<String>,
}

impl ContributorArgs {
    fn resolve(&self, anonymize_ips: bool) -> Result<Contributor, TaskdistError> {
        let ip = self.ip.as_deref().map(|raw| {
            if anonymize_ips {
                anonymize_ip(raw)
            } else {
                raw.trim().to_string()
            }
        });
        Contributor::from_parts(self.user_id, ip.as_deref())
    }
}

/// Hex SHA-256 of a client address, so raw IPs are never stored.
pub fn anonymize_ip(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.trim().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn run() -> Result<i32, TaskdistError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| TaskdistError::Io(e.to_string()))?;
    let mut stdout = std::io::stdout();
    run_with(&args, &cwd, &mut stdout)
}

pub fn run_with(
    args: &[std::ffi::OsString],
    cwd: &Path,
    out: &mut dyn Write,
) -> Result<i32, TaskdistError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                write!(out, "{error}").map_err(|e| TaskdistError::Io(e.to_string()))?;
                return Ok(0);
            }
            _ => return Err(TaskdistError::Cli(error.to_string())),
        },
    };

    let cfg = load_config(
        &CliOverrides {
            config_path: cli.config.clone(),
            database_path: cli.database.clone(),
            coordination_path: cli.coordination.clone(),
        },
        cwd,
    )?;
    init_run_log(JsonlLogger {
        path: cfg.logging.path.clone(),
        max_payload_bytes: cfg.logging.max_payload_bytes,
        budget_bytes: cfg.logging.budget_bytes,
    });

    let engine = open_engine(&cfg)?;
    append_run_log(
        "info",
        "cli.command",
        json!({ "command": format!("{:?}", cli.command) }),
    );
    let output = execute(&engine, &cfg, cli.command)?;
    writeln!(out, "{output}").map_err(|e| TaskdistError::Io(e.to_string()))?;
    Ok(0)
}

fn open_engine(cfg: &AppConfig) -> Result<TaskDistributor, TaskdistError> {
    let clock: Arc<dyn Clock> = Arc::new(ProductionClock);
    let store = Arc::new(TaskStore::open(&cfg.store.database_path, Arc::clone(&clock))?);
    let coordination = Arc::new(SqliteCoordinationStore::open(
        &cfg.store.coordination_path,
        Arc::clone(&clock),
        cfg.coordination_timeout(),
    )?);
    Ok(
        TaskDistributor::new(store, coordination, clock, EngineSettings::from_config(cfg))
            .with_listener(Box::new(JsonlWebhookOutbox::new(&cfg.webhooks.outbox_path))),
    )
}

fn execute(engine: &TaskDistributor, cfg: &AppConfig, command: Command) -> Result<Value, TaskdistError> {
    let store = engine.store();
    match command {
        Command::Init => Ok(json!({
            "database_path": store.db_path().display().to_string(),
            "coordination_path": cfg.store.coordination_path.display().to_string(),
        })),
        Command::CreateProject {
            short_name,
            scheduler,
            lock_timeout_seconds,
        } => {
            let scheduler = match scheduler {
                Some(name) => SchedulerPolicy::parse(&name)?,
                None => cfg.default_policy()?,
            };
            let project = store.create_project(NewProject {
                scheduler,
                lock_timeout_seconds,
                ..NewProject::named(&short_name)
            })?;
            to_json(&project)
        }
        Command::SetScheduler { project, scheduler } => {
            let policy = SchedulerPolicy::parse(&scheduler)?;
            if !store.set_project_scheduler(project, policy)? {
                return Err(missing_project(project));
            }
            Ok(json!({ "project_id": project, "scheduler": policy.as_name() }))
        }
        Command::SetQuiz {
            project,
            enabled,
            questions,
            passing,
            no_short_circuit,
        } => {
            let quiz = QuizConfig {
                enabled,
                questions,
                passing,
                short_circuit: !no_short_circuit,
            };
            if !store.set_project_quiz(project, quiz)? {
                return Err(missing_project(project));
            }
            Ok(json!({ "project_id": project, "quiz": quiz }))
        }
        Command::AddTask {
            project,
            n_answers,
            priority,
            info,
            user_pref,
            gold_answers,
        } => {
            let gold_answers = gold_answers.as_deref().map(parse_json_arg).transpose()?;
            let task = store.insert_task(NewTask {
                n_answers,
                priority,
                calibration: gold_answers.is_some(),
                gold_answers,
                user_pref: user_pref.as_deref().map(parse_json_arg).transpose()?,
                info: info.as_deref().map(parse_json_arg).transpose()?.unwrap_or_else(|| json!({})),
                ..NewTask::for_project(project)
            })?;
            to_json(&task)
        }
        Command::SetUserPref { user_id, pref } => {
            let pref = parse_json_arg(&pref)?;
            store.set_user_pref(user_id, pref.clone())?;
            Ok(json!({ "user_id": user_id, "user_pref": pref }))
        }
        Command::SetRedundancy { task, n_answers } => {
            let change = engine.update_task_redundancy(task, n_answers)?;
            Ok(json!({
                "task": change.task,
                "reopened": change.reopened,
                "completed": change.completion.is_some(),
            }))
        }
        Command::NextTask {
            project,
            contributor,
            offset,
        } => {
            let contributor = contributor.resolve(cfg.contributors.anonymize_ips)?;
            let task = engine.next_task(project, &contributor, offset)?;
            Ok(json!({ "contributor": contributor.key(), "task": task }))
        }
        Command::Submit {
            project,
            task,
            contributor,
            info,
        } => {
            let contributor = contributor.resolve(cfg.contributors.anonymize_ips)?;
            let outcome = engine.submit_task_run(NewTaskRun {
                project_id: project,
                task_id: task,
                contributor,
                info: parse_json_arg(&info)?,
            })?;
            Ok(json!({
                "task_run": outcome.task_run,
                "completed": outcome.completion.is_some(),
                "result": outcome.completion,
                "quiz": outcome.quiz,
            }))
        }
        Command::ResetQuiz { project, user_id } => {
            let progress = engine.reset_quiz(project, user_id)?;
            Ok(json!({ "project_id": project, "user_id": user_id, "quiz": progress }))
        }
        Command::Task { id } => {
            let task = store
                .get_task(id)?
                .ok_or_else(|| TaskdistError::NotFound(format!("task {id} does not exist")))?;
            Ok(json!({
                "task": task,
                "accepted_runs": store.count_accepted_task_runs(id)?,
                "task_runs": store.list_task_runs(id)?,
                "result": store.get_result(id)?,
            }))
        }
        Command::ActiveUsers { project } => Ok(json!({
            "project_id": project,
            "active_users": engine.active_user_count(project)?,
        })),
    }
}

fn parse_json_arg(raw: &str) -> Result<Value, TaskdistError> {
    serde_json::from_str(raw).map_err(|e| TaskdistError::InvalidInput(format!("invalid json `{raw}`: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, TaskdistError> {
    serde_json::to_value(value).map_err(|e| TaskdistError::Io(e.to_string()))
}

fn missing_project(project_id: i64) -> TaskdistError {
    TaskdistError::NotFound(format!("project {project_id} does not exist"))
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use serde_json::Value;

    use super::{anonymize_ip, run_with, ContributorArgs};
    use crate::errors::TaskdistError;
    use crate::types::Contributor;

    fn run_json(dir: &std::path::Path, args: &[&str]) -> Value {
        let mut argv = vec![OsString::from("taskdist")];
        argv.extend(args.iter().map(OsString::from));
        let mut out = Vec::new();
        let code = run_with(&argv, dir, &mut out).expect("run");
        assert_eq!(code, 0);
        serde_json::from_slice(&out).expect("json output")
    }

    #[test]
    fn anonymized_ips_are_stable_hex_digests() {
        let hashed = anonymize_ip("127.0.0.1");
        assert_eq!(hashed.len(), 64);
        assert_eq!(hashed, anonymize_ip(" 127.0.0.1 "));
        assert_ne!(hashed, anonymize_ip("127.0.0.2"));
        assert!(hashed.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn contributor_args_honour_anonymization_setting() {
        let args = ContributorArgs {
            user_id: None,
            ip: Some("10.0.0.1".to_string()),
        };
        assert_eq!(
            args.resolve(false).expect("raw"),
            Contributor::Ip("10.0.0.1".to_string())
        );
        assert_eq!(
            args.resolve(true).expect("hashed"),
            Contributor::Ip(anonymize_ip("10.0.0.1"))
        );
        let nobody = ContributorArgs {
            user_id: None,
            ip: None,
        };
        assert!(matches!(nobody.resolve(true), Err(TaskdistError::InvalidInput(_))));
    }

    #[test]
    fn create_project_then_offer_and_submit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let project = run_json(dir.path(), &["create-project", "--short-name", "birds"]);
        assert_eq!(project["scheduler"], "default");
        let project_id = project["id"].as_i64().expect("id").to_string();

        let task = run_json(
            dir.path(),
            &["add-task", "--project", &project_id, "--n-answers", "1", "--info", r#"{"url":"a.png"}"#],
        );
        let task_id = task["id"].as_i64().expect("task id").to_string();

        let offer = run_json(dir.path(), &["next-task", "--project", &project_id, "--user-id", "3"]);
        assert_eq!(offer["task"]["id"].as_i64(), task["id"].as_i64());

        let submitted = run_json(
            dir.path(),
            &["submit", "--project", &project_id, "--task", &task_id, "--user-id", "3", "--info", "\"bird\""],
        );
        assert_eq!(submitted["completed"], true);

        let shown = run_json(dir.path(), &["task", "--id", &task_id]);
        assert_eq!(shown["task"]["state"], "completed");
        assert_eq!(shown["accepted_runs"], 1);
    }

    #[test]
    fn usage_errors_surface_as_cli_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut out = Vec::new();
        let err = run_with(
            &[OsString::from("taskdist"), OsString::from("launch")],
            dir.path(),
            &mut out,
        )
        .expect_err("unknown command");
        assert!(matches!(err, TaskdistError::Cli(_)));

        let code = run_with(
            &[OsString::from("taskdist"), OsString::from("--help")],
            dir.path(),
            &mut out,
        )
        .expect("help");
        assert_eq!(code, 0);
        assert!(String::from_utf8_lossy(&out).contains("next-task"));
    }
}
