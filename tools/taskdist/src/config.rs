use crate::errors::TaskdistError;
use crate::scheduler::SchedulerPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub coordination_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub guard: GuardConfig,
    pub locks: LocksConfig,
    pub coordination: CoordinationConfig,
    pub scheduler: SchedulerConfig,
    pub activity: ActivityConfig,
    pub contributors: ContributorsConfig,
    pub logging: LoggingConfig,
    pub webhooks: WebhooksConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub database_path: PathBuf,
    pub coordination_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuardConfig {
    pub stamp_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocksConfig {
    pub lock_ttl_seconds: u64,
    pub release_grace_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoordinationConfig {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub default_policy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivityConfig {
    pub active_user_ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContributorsConfig {
    pub anonymize_ips: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhooksConfig {
    pub outbox_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig {
                database_path: PathBuf::from(".taskdist/tasks.sqlite"),
                coordination_path: PathBuf::from(".taskdist/coordination.sqlite"),
            },
            guard: GuardConfig {
                stamp_ttl_seconds: 3600,
            },
            locks: LocksConfig {
                lock_ttl_seconds: 3600,
                release_grace_seconds: 5,
            },
            coordination: CoordinationConfig { timeout_ms: 100 },
            scheduler: SchedulerConfig {
                default_policy: "default".to_string(),
            },
            activity: ActivityConfig {
                active_user_ttl_seconds: 7200,
            },
            contributors: ContributorsConfig {
                anonymize_ips: true,
            },
            logging: LoggingConfig {
                path: PathBuf::from(".taskdist/logs/run.jsonl"),
                max_payload_bytes: crate::logging::DEFAULT_MAX_PAYLOAD_BYTES,
                budget_bytes: crate::logging::DEFAULT_DISK_BUDGET_BYTES,
            },
            webhooks: WebhooksConfig {
                outbox_path: PathBuf::from(".taskdist/webhooks.jsonl"),
            },
        }
    }
}

impl AppConfig {
    pub fn stamp_ttl(&self) -> Duration {
        Duration::from_secs(self.guard.stamp_ttl_seconds)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.locks.lock_ttl_seconds)
    }

    pub fn release_grace(&self) -> Duration {
        Duration::from_secs(self.locks.release_grace_seconds)
    }

    pub fn coordination_timeout(&self) -> Duration {
        Duration::from_millis(self.coordination.timeout_ms)
    }

    pub fn active_user_ttl(&self) -> Duration {
        Duration::from_secs(self.activity.active_user_ttl_seconds)
    }

    /// Policy assigned to projects created without an explicit scheduler.
    pub fn default_policy(&self) -> Result<SchedulerPolicy, TaskdistError> {
        SchedulerPolicy::parse(&self.scheduler.default_policy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    store: Option<PartialStoreConfig>,
    guard: Option<PartialGuardConfig>,
    locks: Option<PartialLocksConfig>,
    coordination: Option<PartialCoordinationConfig>,
    scheduler: Option<PartialSchedulerConfig>,
    activity: Option<PartialActivityConfig>,
    contributors: Option<PartialContributorsConfig>,
    logging: Option<PartialLoggingConfig>,
    webhooks: Option<PartialWebhooksConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStoreConfig {
    database_path: Option<PathBuf>,
    coordination_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialGuardConfig {
    stamp_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLocksConfig {
    lock_ttl_seconds: Option<u64>,
    release_grace_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialCoordinationConfig {
    timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSchedulerConfig {
    default_policy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialActivityConfig {
    active_user_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialContributorsConfig {
    anonymize_ips: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialWebhooksConfig {
    outbox_path: Option<PathBuf>,
}

/// Builds the effective config: defaults, then the TOML file if one was
/// given, then command-line overrides. Relative paths are anchored at
/// `process_cwd`.
pub fn load_config(overrides: &CliOverrides, process_cwd: &Path) -> Result<AppConfig, TaskdistError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|e| TaskdistError::Io(format!("{}: {e}", path.display())))?;
        let partial: PartialAppConfig = toml::from_str(&file_contents)
            .map_err(|e| TaskdistError::ConfigParse(e.to_string()))?;
        merge_partial_config(&mut cfg, partial);
    }

    apply_cli_overrides(&mut cfg, overrides);
    absolutize_paths(&mut cfg, process_cwd);
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn parse_config_str(contents: &str) -> Result<AppConfig, TaskdistError> {
    let mut cfg = AppConfig::default();
    let partial: PartialAppConfig =
        toml::from_str(contents).map_err(|e| TaskdistError::ConfigParse(e.to_string()))?;
    merge_partial_config(&mut cfg, partial);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(store) = partial.store {
        if let Some(value) = store.database_path {
            cfg.store.database_path = value;
        }
        if let Some(value) = store.coordination_path {
            cfg.store.coordination_path = value;
        }
    }

    if let Some(guard) = partial.guard {
        if let Some(value) = guard.stamp_ttl_seconds {
            cfg.guard.stamp_ttl_seconds = value;
        }
    }

    if let Some(locks) = partial.locks {
        if let Some(value) = locks.lock_ttl_seconds {
            cfg.locks.lock_ttl_seconds = value;
        }
        if let Some(value) = locks.release_grace_seconds {
            cfg.locks.release_grace_seconds = value;
        }
    }

    if let Some(coordination) = partial.coordination {
        if let Some(value) = coordination.timeout_ms {
            cfg.coordination.timeout_ms = value;
        }
    }

    if let Some(scheduler) = partial.scheduler {
        if let Some(value) = scheduler.default_policy {
            cfg.scheduler.default_policy = value;
        }
    }

    if let Some(activity) = partial.activity {
        if let Some(value) = activity.active_user_ttl_seconds {
            cfg.activity.active_user_ttl_seconds = value;
        }
    }

    if let Some(contributors) = partial.contributors {
        if let Some(value) = contributors.anonymize_ips {
            cfg.contributors.anonymize_ips = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.path {
            cfg.logging.path = value;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }

    if let Some(webhooks) = partial.webhooks {
        if let Some(value) = webhooks.outbox_path {
            cfg.webhooks.outbox_path = value;
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.database_path {
        cfg.store.database_path = path.clone();
    }
    if let Some(path) = &overrides.coordination_path {
        cfg.store.coordination_path = path.clone();
    }
}

fn absolutize_paths(cfg: &mut AppConfig, base: &Path) {
    cfg.store.database_path = absolutize_path(base, &cfg.store.database_path);
    cfg.store.coordination_path = absolutize_path(base, &cfg.store.coordination_path);
    cfg.logging.path = absolutize_path(base, &cfg.logging.path);
    cfg.webhooks.outbox_path = absolutize_path(base, &cfg.webhooks.outbox_path);
}

fn absolutize_path(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), TaskdistError> {
    for (name, value) in [
        ("guard.stamp_ttl_seconds", cfg.guard.stamp_ttl_seconds),
        ("locks.lock_ttl_seconds", cfg.locks.lock_ttl_seconds),
        ("coordination.timeout_ms", cfg.coordination.timeout_ms),
        ("activity.active_user_ttl_seconds", cfg.activity.active_user_ttl_seconds),
    ] {
        if value == 0 {
            return Err(TaskdistError::InvalidConfig(format!(
                "{name} must be greater than zero"
            )));
        }
    }

    if cfg.locks.release_grace_seconds >= cfg.locks.lock_ttl_seconds {
        return Err(TaskdistError::InvalidConfig(
            "locks.release_grace_seconds must be shorter than locks.lock_ttl_seconds".to_string(),
        ));
    }

    if cfg.store.database_path == cfg.store.coordination_path {
        return Err(TaskdistError::InvalidConfig(
            "store.database_path and store.coordination_path must differ".to_string(),
        ));
    }

    if cfg.logging.max_payload_bytes == 0 || cfg.logging.budget_bytes == 0 {
        return Err(TaskdistError::InvalidConfig(
            "logging limits must be greater than zero".to_string(),
        ));
    }

    cfg.default_policy().map_err(|e| {
        TaskdistError::InvalidConfig(format!("scheduler.default_policy: {e}"))
    })?;

    Ok(())
}
