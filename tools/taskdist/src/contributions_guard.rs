use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::coordination::{CoordinationStore, SetMode};
use crate::errors::TaskdistError;
use crate::logging::append_run_log;
use crate::runtime::Clock;
use crate::types::{Contributor, TaskId};

pub const DEFAULT_STAMP_TTL: Duration = Duration::from_secs(3600);
const KEY_PREFIX: &str = "taskdist:task_requested";

/// Records which contributor was offered which task, and when.
///
/// A submission is only accepted while the offer's stamp is live, and the
/// stamp's time becomes the run's `created` timestamp.
pub struct ContributionsGuard {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ContributionsGuard {
    pub fn new(store: Arc<dyn CoordinationStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn stamp(&self, task_id: TaskId, contributor: &Contributor) -> Result<(), TaskdistError> {
        let key = stamp_key(task_id, contributor);
        let now = self.clock.now_millis();
        match self
            .store
            .set(&key, &now.to_string(), self.ttl, SetMode::Always)
        {
            Ok(_) => {
                append_run_log(
                    "debug",
                    "guard.stamped",
                    json!({
                        "task_id": task_id,
                        "contributor": contributor.key(),
                        "stamped_at": now,
                    }),
                );
                Ok(())
            }
            Err(e) => {
                append_run_log(
                    "error",
                    "guard.stamp.failed",
                    json!({
                        "task_id": task_id,
                        "contributor": contributor.key(),
                        "error": e.to_string(),
                    }),
                );
                Err(e)
            }
        }
    }

    pub fn check_stamped(
        &self,
        task_id: TaskId,
        contributor: &Contributor,
    ) -> Result<bool, TaskdistError> {
        Ok(self.retrieve_timestamp(task_id, contributor)?.is_some())
    }

    /// Offer time in unix millis, if the stamp is still live.
    pub fn retrieve_timestamp(
        &self,
        task_id: TaskId,
        contributor: &Contributor,
    ) -> Result<Option<i64>, TaskdistError> {
        let raw = self.store.get(&stamp_key(task_id, contributor))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        raw.parse::<i64>().map(Some).map_err(|_| {
            TaskdistError::Database(format!(
                "stamp for task {task_id} holds a non-numeric timestamp `{raw}`"
            ))
        })
    }

    pub fn remove_stamp(
        &self,
        task_id: TaskId,
        contributor: &Contributor,
    ) -> Result<bool, TaskdistError> {
        let removed = self.store.del(&stamp_key(task_id, contributor))?;
        append_run_log(
            "debug",
            "guard.stamp_removed",
            json!({
                "task_id": task_id,
                "contributor": contributor.key(),
                "removed": removed,
            }),
        );
        Ok(removed)
    }
}

fn stamp_key(task_id: TaskId, contributor: &Contributor) -> String {
    format!("{KEY_PREFIX}:{}:task:{task_id}", contributor.key())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::{stamp_key, ContributionsGuard, DEFAULT_STAMP_TTL};
    use crate::coordination::{CoordinationStore, SetMode, SqliteCoordinationStore};
    use crate::runtime::{Clock, FakeClock};
    use crate::types::Contributor;

    fn guard() -> (ContributionsGuard, Arc<SqliteCoordinationStore>, FakeClock, TempDir) {
        let dir = TempDir::new().expect("tempdir");
        let clock = FakeClock::default();
        let store = Arc::new(
            SqliteCoordinationStore::open(
                dir.path().join("coordination.sqlite"),
                Arc::new(clock.clone()),
                Duration::from_millis(100),
            )
            .expect("open"),
        );
        let guard = ContributionsGuard::new(store.clone(), Arc::new(clock.clone()), DEFAULT_STAMP_TTL);
        (guard, store, clock, dir)
    }

    #[test]
    fn stamp_is_live_until_ttl_elapses() {
        let (guard, _store, clock, _dir) = guard();
        let ip = Contributor::parse("ip:127.0.0.1").expect("contributor");

        assert!(!guard.check_stamped(4, &ip).expect("before stamp"));
        guard.stamp(4, &ip).expect("stamp");
        assert!(guard.check_stamped(4, &ip).expect("after stamp"));

        clock.advance(DEFAULT_STAMP_TTL - Duration::from_millis(1));
        assert!(guard.check_stamped(4, &ip).expect("just before expiry"));
        clock.advance(Duration::from_millis(1));
        assert!(!guard.check_stamped(4, &ip).expect("after expiry"));
    }

    #[test]
    fn timestamp_is_the_offer_time_and_restamping_overwrites() {
        let (guard, _store, clock, _dir) = guard();
        let user = Contributor::User(3);
        let offered_at = clock.now_millis();

        guard.stamp(9, &user).expect("stamp");
        clock.advance(Duration::from_secs(30));
        assert_eq!(guard.retrieve_timestamp(9, &user).expect("read"), Some(offered_at));

        guard.stamp(9, &user).expect("restamp");
        assert_eq!(
            guard.retrieve_timestamp(9, &user).expect("read"),
            Some(offered_at + 30_000)
        );
    }

    #[test]
    fn stamps_are_per_task_and_contributor() {
        let (guard, _store, _clock, _dir) = guard();
        guard.stamp(1, &Contributor::User(1)).expect("stamp");
        assert!(!guard.check_stamped(2, &Contributor::User(1)).expect("other task"));
        assert!(!guard.check_stamped(1, &Contributor::User(2)).expect("other user"));
        assert!(!guard
            .check_stamped(1, &Contributor::Ip("1".to_string()))
            .expect("ip with same digits"));
    }

    #[test]
    fn removed_stamp_cannot_be_replayed() {
        let (guard, _store, _clock, _dir) = guard();
        let user = Contributor::User(5);
        guard.stamp(1, &user).expect("stamp");
        assert!(guard.remove_stamp(1, &user).expect("remove"));
        assert!(!guard.check_stamped(1, &user).expect("gone"));
        assert!(!guard.remove_stamp(1, &user).expect("idempotent"));
    }

    #[test]
    fn corrupt_stamp_value_is_reported() {
        let (guard, store, _clock, _dir) = guard();
        let user = Contributor::User(5);
        store
            .set(&stamp_key(1, &user), "yesterday", Duration::from_secs(60), SetMode::Always)
            .expect("seed corrupt");
        assert!(guard.retrieve_timestamp(1, &user).is_err());
    }
}
