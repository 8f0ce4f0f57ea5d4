use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::coordination::CoordinationStore;
use crate::errors::TaskdistError;
use crate::logging::append_run_log;
use crate::types::{Contributor, ProjectId};

pub const DEFAULT_ACTIVE_USER_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// Tracks contributors who recently asked a project for work.
pub struct ActiveUsers {
    store: Arc<dyn CoordinationStore>,
    ttl: Duration,
}

impl ActiveUsers {
    pub fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn register(
        &self,
        project_id: ProjectId,
        contributor: &Contributor,
    ) -> Result<(), TaskdistError> {
        self.store.add_member_under_capacity(
            &registry_key(project_id),
            &contributor.key(),
            self.ttl,
            i64::MAX,
        )?;
        Ok(())
    }

    pub fn count(&self, project_id: ProjectId) -> Result<usize, TaskdistError> {
        let live = self.store.members(&registry_key(project_id))?.len();
        append_run_log(
            "debug",
            "active_users.counted",
            json!({ "project_id": project_id, "count": live }),
        );
        Ok(live)
    }
}

fn registry_key(project_id: ProjectId) -> String {
    format!("taskdist:active_users:project:{project_id}")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::ActiveUsers;
    use crate::coordination::SqliteCoordinationStore;
    use crate::runtime::FakeClock;
    use crate::types::Contributor;

    #[test]
    fn registrations_are_deduplicated_and_expire() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = FakeClock::default();
        let store = SqliteCoordinationStore::open(
            dir.path().join("coordination.sqlite"),
            Arc::new(clock.clone()),
            Duration::from_millis(100),
        )
        .expect("open");
        let active = ActiveUsers::new(Arc::new(store), Duration::from_secs(60));

        active.register(1, &Contributor::User(1)).expect("u1");
        active.register(1, &Contributor::User(1)).expect("u1 again");
        active
            .register(1, &Contributor::Ip("10.0.0.9".to_string()))
            .expect("ip");
        active.register(2, &Contributor::User(3)).expect("other project");
        assert_eq!(active.count(1).expect("count"), 2);

        clock.advance(Duration::from_secs(30));
        active.register(1, &Contributor::User(1)).expect("refresh u1");
        clock.advance(Duration::from_secs(31));
        assert_eq!(active.count(1).expect("count"), 1);
        assert_eq!(active.count(2).expect("count"), 0);
    }
}
