use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use serde_json::json;

use crate::errors::TaskdistError;
use crate::logging::append_run_log;
use crate::runtime::Clock;

type CoordResult<T> = Result<T, TaskdistError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Always,
    IfAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEntry {
    pub member: String,
    pub expires_at: i64,
}

/// Shared ephemeral key-value state with per-key and per-member expiry.
///
/// Every method is a single atomic unit against the backing store, so callers
/// never need read-modify-write sequences of their own. Implementations report
/// timeouts and contention as `TaskdistError::TransientUnavailable`.
pub trait CoordinationStore: Send + Sync {
    /// `SET key value EX ttl [NX]`. Returns whether the value was written.
    fn set(&self, key: &str, value: &str, ttl: Duration, mode: SetMode) -> CoordResult<bool>;
    fn get(&self, key: &str) -> CoordResult<Option<String>>;
    fn del(&self, key: &str) -> CoordResult<bool>;

    /// Drops expired members of `key`, then refreshes `member` if it is still
    /// live, or adds it when fewer than `capacity` live members remain.
    fn add_member_under_capacity(
        &self,
        key: &str,
        member: &str,
        ttl: Duration,
        capacity: i64,
    ) -> CoordResult<bool>;
    /// Expiry (unix millis) of a live member.
    fn member_expiry(&self, key: &str, member: &str) -> CoordResult<Option<i64>>;
    /// Brings a live member's expiry forward to at most `now + after`.
    fn expire_member(&self, key: &str, member: &str, after: Duration) -> CoordResult<bool>;
    fn remove_member(&self, key: &str, member: &str) -> CoordResult<bool>;
    fn members(&self, key: &str) -> CoordResult<Vec<MemberEntry>>;
    /// Keys starting with `prefix` in which `member` is live.
    fn keys_with_member(&self, prefix: &str, member: &str) -> CoordResult<Vec<String>>;
}

/// Embedded coordination store on a SQLite file. Several processes may open
/// the same file; every mutation runs in a `BEGIN IMMEDIATE` transaction and
/// gives up after the configured busy timeout.
pub struct SqliteCoordinationStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    path: PathBuf,
}

impl SqliteCoordinationStore {
    pub fn open(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> CoordResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TaskdistError::Io(e.to_string()))?;
        }
        let conn = Connection::open(&path).map_err(coord_err)?;
        conn.busy_timeout(timeout).map_err(coord_err)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(coord_err)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(coord_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS member_entries (
                key TEXT NOT NULL,
                member TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (key, member)
            );
            CREATE INDEX IF NOT EXISTS member_entries_by_member ON member_entries(member, key);",
        )
        .map_err(coord_err)?;

        let store = Self {
            conn: Mutex::new(conn),
            clock,
            path: path.clone(),
        };
        let purged = store.purge_expired()?;
        append_run_log(
            "info",
            "coordination.opened",
            json!({
                "path": path.display().to_string(),
                "timeout_ms": timeout.as_millis() as u64,
                "purged": purged,
            }),
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes every expired key and member. Reads already ignore expired
    /// rows, this only reclaims space.
    pub fn purge_expired(&self) -> CoordResult<usize> {
        self.with_tx(|tx, now| {
            let keys = tx
                .execute("DELETE FROM kv_entries WHERE expires_at <= ?1", [now])
                .map_err(coord_err)?;
            let members = tx
                .execute("DELETE FROM member_entries WHERE expires_at <= ?1", [now])
                .map_err(coord_err)?;
            Ok(keys + members)
        })
    }

    fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>, i64) -> CoordResult<T>,
    ) -> CoordResult<T> {
        let mut guard = self.conn.lock().map_err(|_| {
            TaskdistError::TransientUnavailable("coordination connection lock poisoned".to_string())
        })?;
        let tx = guard
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(coord_err)?;
        let now = self.clock.now_millis();
        let value = f(&tx, now)?;
        tx.commit().map_err(coord_err)?;
        Ok(value)
    }
}

impl CoordinationStore for SqliteCoordinationStore {
    fn set(&self, key: &str, value: &str, ttl: Duration, mode: SetMode) -> CoordResult<bool> {
        let result = self.with_tx(|tx, now| {
            let expires_at = now.saturating_add(ttl_millis(ttl));
            let changed = match mode {
                SetMode::Always => tx
                    .execute(
                        "INSERT INTO kv_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                        params![key, value, expires_at],
                    )
                    .map_err(coord_err)?,
                SetMode::IfAbsent => {
                    tx.execute(
                        "DELETE FROM kv_entries WHERE key = ?1 AND expires_at <= ?2",
                        params![key, now],
                    )
                    .map_err(coord_err)?;
                    tx.execute(
                        "INSERT INTO kv_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
                         ON CONFLICT(key) DO NOTHING",
                        params![key, value, expires_at],
                    )
                    .map_err(coord_err)?
                }
            };
            Ok(changed > 0)
        });
        if let Err(e) = &result {
            append_run_log(
                "warn",
                "coordination.set.failed",
                json!({ "key": key, "error": e.to_string() }),
            );
        }
        result
    }

    fn get(&self, key: &str) -> CoordResult<Option<String>> {
        self.with_tx(|tx, now| {
            tx.query_row(
                "SELECT value FROM kv_entries WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(coord_err)
        })
    }

    fn del(&self, key: &str) -> CoordResult<bool> {
        self.with_tx(|tx, now| {
            let live = tx
                .execute(
                    "DELETE FROM kv_entries WHERE key = ?1 AND expires_at > ?2",
                    params![key, now],
                )
                .map_err(coord_err)?;
            tx.execute("DELETE FROM kv_entries WHERE key = ?1", [key])
                .map_err(coord_err)?;
            Ok(live > 0)
        })
    }

    fn add_member_under_capacity(
        &self,
        key: &str,
        member: &str,
        ttl: Duration,
        capacity: i64,
    ) -> CoordResult<bool> {
        self.with_tx(|tx, now| {
            let expires_at = now.saturating_add(ttl_millis(ttl));
            tx.execute(
                "DELETE FROM member_entries WHERE key = ?1 AND expires_at <= ?2",
                params![key, now],
            )
            .map_err(coord_err)?;

            let refreshed = tx
                .execute(
                    "UPDATE member_entries SET expires_at = ?3 WHERE key = ?1 AND member = ?2",
                    params![key, member, expires_at],
                )
                .map_err(coord_err)?;
            if refreshed > 0 {
                return Ok(true);
            }

            let held: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM member_entries WHERE key = ?1",
                    [key],
                    |row| row.get(0),
                )
                .map_err(coord_err)?;
            if held >= capacity {
                return Ok(false);
            }

            tx.execute(
                "INSERT INTO member_entries (key, member, expires_at) VALUES (?1, ?2, ?3)",
                params![key, member, expires_at],
            )
            .map_err(coord_err)?;
            Ok(true)
        })
    }

    fn member_expiry(&self, key: &str, member: &str) -> CoordResult<Option<i64>> {
        self.with_tx(|tx, now| {
            tx.query_row(
                "SELECT expires_at FROM member_entries
                 WHERE key = ?1 AND member = ?2 AND expires_at > ?3",
                params![key, member, now],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(coord_err)
        })
    }

    fn expire_member(&self, key: &str, member: &str, after: Duration) -> CoordResult<bool> {
        self.with_tx(|tx, now| {
            let deadline = now.saturating_add(ttl_millis(after));
            let changed = tx
                .execute(
                    "UPDATE member_entries SET expires_at = MIN(expires_at, ?3)
                     WHERE key = ?1 AND member = ?2 AND expires_at > ?4",
                    params![key, member, deadline, now],
                )
                .map_err(coord_err)?;
            Ok(changed > 0)
        })
    }

    fn remove_member(&self, key: &str, member: &str) -> CoordResult<bool> {
        self.with_tx(|tx, now| {
            let live: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM member_entries
                     WHERE key = ?1 AND member = ?2 AND expires_at > ?3",
                    params![key, member, now],
                    |row| row.get(0),
                )
                .map_err(coord_err)?;
            tx.execute(
                "DELETE FROM member_entries WHERE key = ?1 AND member = ?2",
                params![key, member],
            )
            .map_err(coord_err)?;
            Ok(live > 0)
        })
    }

    fn members(&self, key: &str) -> CoordResult<Vec<MemberEntry>> {
        self.with_tx(|tx, now| {
            let mut stmt = tx
                .prepare(
                    "SELECT member, expires_at FROM member_entries
                     WHERE key = ?1 AND expires_at > ?2
                     ORDER BY expires_at ASC, member ASC",
                )
                .map_err(coord_err)?;
            let rows = stmt
                .query_map(params![key, now], |row| {
                    Ok(MemberEntry {
                        member: row.get(0)?,
                        expires_at: row.get(1)?,
                    })
                })
                .map_err(coord_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(coord_err)?;
            Ok(rows)
        })
    }

    fn keys_with_member(&self, prefix: &str, member: &str) -> CoordResult<Vec<String>> {
        self.with_tx(|tx, now| {
            let mut stmt = tx
                .prepare(
                    "SELECT key FROM member_entries
                     WHERE member = ?1 AND expires_at > ?2 AND substr(key, 1, length(?3)) = ?3
                     ORDER BY key ASC",
                )
                .map_err(coord_err)?;
            let rows = stmt
                .query_map(params![member, now, prefix], |row| row.get::<_, String>(0))
                .map_err(coord_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(coord_err)?;
            Ok(rows)
        })
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

fn coord_err(error: rusqlite::Error) -> TaskdistError {
    match error.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            TaskdistError::TransientUnavailable(error.to_string())
        }
        _ => TaskdistError::Database(error.to_string()),
    }
}
