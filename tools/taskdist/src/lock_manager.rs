use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::coordination::{CoordinationStore, MemberEntry};
use crate::errors::TaskdistError;
use crate::logging::append_run_log;
use crate::runtime::Clock;
use crate::types::{Contributor, ProjectId, TaskId};

const KEY_PREFIX: &str = "taskdist:lock:project";

/// How long a released lock keeps counting against a task's capacity, so a
/// requester working from a candidate read taken before the release still
/// sees the slot as taken.
pub const DEFAULT_RELEASE_GRACE: Duration = Duration::from_secs(5);

/// Capacity-bounded, per-holder-expiring claims of contributors on tasks.
///
/// All holder bookkeeping happens inside the coordination store's atomic
/// member primitives; this type never reads a holder set and writes it back.
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    release_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub contributor: String,
    pub expires_at: i64,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        default_ttl: Duration,
        release_grace: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            default_ttl,
            release_grace,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Adds `contributor` to the task's holders if fewer than `remaining`
    /// live holders exist, or refreshes its lock if it already holds one.
    pub fn acquire(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        contributor: &Contributor,
        remaining: i64,
        ttl: Option<Duration>,
    ) -> Result<bool, TaskdistError> {
        let key = lock_key(project_id, task_id);
        let ttl = ttl.unwrap_or(self.default_ttl);
        let result =
            self.store
                .add_member_under_capacity(&key, &contributor.key(), ttl, remaining);
        match &result {
            Ok(true) => {
                append_run_log(
                    "info",
                    "lock.acquired",
                    json!({
                        "project_id": project_id,
                        "task_id": task_id,
                        "contributor": contributor.key(),
                        "remaining": remaining,
                        "ttl_secs": ttl.as_secs(),
                    }),
                );
            }
            Ok(false) => {
                append_run_log(
                    "debug",
                    "lock.acquire.full",
                    json!({
                        "project_id": project_id,
                        "task_id": task_id,
                        "contributor": contributor.key(),
                        "remaining": remaining,
                    }),
                );
            }
            Err(e) => {
                append_run_log(
                    "warn",
                    "lock.acquire.failed",
                    json!({
                        "project_id": project_id,
                        "task_id": task_id,
                        "contributor": contributor.key(),
                        "error": e.to_string(),
                    }),
                );
            }
        }
        result
    }

    pub fn has_lock(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        contributor: &Contributor,
    ) -> Result<bool, TaskdistError> {
        Ok(self
            .store
            .member_expiry(&lock_key(project_id, task_id), &contributor.key())?
            .is_some())
    }

    /// Whole seconds until the contributor's lock lapses.
    pub fn seconds_to_expiry(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        contributor: &Contributor,
    ) -> Result<Option<i64>, TaskdistError> {
        let expiry = self
            .store
            .member_expiry(&lock_key(project_id, task_id), &contributor.key())?;
        let now = self.clock.now_millis();
        Ok(expiry.map(|expires_at| (expires_at - now).max(0) / 1000))
    }

    /// Drops the contributor's lock. With a release grace configured the lock
    /// lingers for that long instead. Releasing a lock that is not held is a
    /// no-op.
    pub fn release(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        contributor: &Contributor,
    ) -> Result<bool, TaskdistError> {
        let key = lock_key(project_id, task_id);
        let member = contributor.key();
        let result = if self.release_grace.is_zero() {
            self.store.remove_member(&key, &member)
        } else {
            self.store.expire_member(&key, &member, self.release_grace)
        };
        match &result {
            Ok(released) => {
                append_run_log(
                    if *released { "info" } else { "debug" },
                    "lock.released",
                    json!({
                        "project_id": project_id,
                        "task_id": task_id,
                        "contributor": member,
                        "held": released,
                        "grace_secs": self.release_grace.as_secs(),
                    }),
                );
            }
            Err(e) => {
                append_run_log(
                    "error",
                    "lock.release.failed",
                    json!({
                        "project_id": project_id,
                        "task_id": task_id,
                        "contributor": member,
                        "error": e.to_string(),
                    }),
                );
            }
        }
        result
    }

    /// Removes the contributor's lock at once, ignoring the release grace.
    /// Used when an offer is taken back before any answer was recorded.
    pub fn withdraw(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
        contributor: &Contributor,
    ) -> Result<bool, TaskdistError> {
        let member = contributor.key();
        let result = self
            .store
            .remove_member(&lock_key(project_id, task_id), &member);
        match &result {
            Ok(held) => append_run_log(
                "info",
                "lock.withdrawn",
                json!({
                    "project_id": project_id,
                    "task_id": task_id,
                    "contributor": member,
                    "held": held,
                }),
            ),
            Err(e) => append_run_log(
                "error",
                "lock.withdraw.failed",
                json!({
                    "project_id": project_id,
                    "task_id": task_id,
                    "contributor": member,
                    "error": e.to_string(),
                }),
            ),
        }
        result
    }

    pub fn holders(
        &self,
        project_id: ProjectId,
        task_id: TaskId,
    ) -> Result<Vec<LockHolder>, TaskdistError> {
        let entries = self.store.members(&lock_key(project_id, task_id))?;
        Ok(entries
            .into_iter()
            .map(|MemberEntry { member, expires_at }| LockHolder {
                contributor: member,
                expires_at,
            })
            .collect())
    }

    /// Withdraws every lock the contributor holds in the project and returns
    /// the affected task ids.
    pub fn release_all_for_contributor(
        &self,
        project_id: ProjectId,
        contributor: &Contributor,
    ) -> Result<Vec<TaskId>, TaskdistError> {
        let prefix = format!("{KEY_PREFIX}:{project_id}:task:");
        let keys = self.store.keys_with_member(&prefix, &contributor.key())?;
        let mut released = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(task_id) = key
                .strip_prefix(&prefix)
                .and_then(|raw| raw.parse::<TaskId>().ok())
            else {
                continue;
            };
            self.withdraw(project_id, task_id, contributor)?;
            released.push(task_id);
        }
        append_run_log(
            "info",
            "lock.released_all",
            json!({
                "project_id": project_id,
                "contributor": contributor.key(),
                "task_ids": released,
            }),
        );
        Ok(released)
    }
}

fn lock_key(project_id: ProjectId, task_id: TaskId) -> String {
    format!("{KEY_PREFIX}:{project_id}:task:{task_id}")
}
