// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Identity store — SQLite persistence for the two identity records (User,
// Worker) that may or may not be linked.
//
// Both tables carry a canonical-RUT column with an index so that the
// offline reconciliation path resolves identities in O(log n) instead of a
// full scan. Resolution order (worker first, then user) is the caller's
// concern; this layer only offers the lookups.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tracing::{debug, info, instrument};

use rubrica_core::error::{Result, RubricaError};
use rubrica_core::types::{
    EnrollmentSnapshot, Role, User, UserId, UserStatus, Worker, WorkerId,
};

/// SQLite schema for both identity tables.
const CREATE_TABLES_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        rut TEXT NOT NULL,
        name TEXT NOT NULL,
        role TEXT NOT NULL,
        password_hash TEXT NOT NULL,
        pin_hash TEXT,
        enabled INTEGER NOT NULL DEFAULT 0,
        worker_id TEXT,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_users_rut ON users (rut);

    CREATE TABLE IF NOT EXISTS workers (
        id TEXT PRIMARY KEY,
        rut TEXT NOT NULL,
        name TEXT NOT NULL,
        pin_hash TEXT,
        enabled INTEGER NOT NULL DEFAULT 0,
        user_id TEXT,
        enrollment_signature TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_workers_rut ON workers (rut);
"#;

/// Persistent identity store backed by a SQLite database.
///
/// All methods are synchronous because `rusqlite` does not support async
/// natively.  In an async context, wrap calls in `tokio::task::spawn_blocking`.
pub struct IdentityStore {
    conn: Connection,
}

impl IdentityStore {
    /// Open (or create) the identity database at the given path.
    ///
    /// Applies WAL journal mode for better concurrent-read performance and
    /// creates both identity tables if they do not exist.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| RubricaError::Database(format!("open: {e}")))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| RubricaError::Database(format!("WAL pragma: {e}")))?;

        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(|e| RubricaError::Database(format!("create tables: {e}")))?;

        info!("identity store opened");
        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RubricaError::Database(format!("open in-memory: {e}")))?;

        conn.execute_batch(CREATE_TABLES_SQL)
            .map_err(|e| RubricaError::Database(format!("create tables: {e}")))?;

        debug!("in-memory identity store opened");
        Ok(Self { conn })
    }

    // -- Users --------------------------------------------------------------

    /// Insert a new user record.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub fn insert_user(&self, user: &User) -> Result<()> {
        let role_json = serde_json::to_string(&user.role)
            .map_err(|e| RubricaError::Database(format!("serialize role: {e}")))?;
        let status_json = serde_json::to_string(&user.status)
            .map_err(|e| RubricaError::Database(format!("serialize status: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO users (id, rut, name, role, password_hash, pin_hash,
                 enabled, worker_id, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    user.id.to_string(),
                    user.rut,
                    user.name,
                    role_json,
                    user.password_hash,
                    user.pin_hash,
                    user.enabled as i32,
                    user.worker_id.map(|w| w.to_string()),
                    status_json,
                    user.created_at.to_rfc3339(),
                    user.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| RubricaError::Database(format!("insert user: {e}")))?;

        info!(user_id = %user.id, "user inserted");
        Ok(())
    }

    /// Retrieve a user by id. Returns `None` if absent.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn get_user(&self, user_id: &UserId) -> Result<Option<User>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, rut, name, role, password_hash, pin_hash, enabled,
                        worker_id, status, created_at, updated_at
                 FROM users WHERE id = ?1",
            )
            .map_err(|e| RubricaError::Database(format!("prepare get_user: {e}")))?;

        let mut rows = stmt
            .query_map(params![user_id.to_string()], row_to_user)
            .map_err(|e| RubricaError::Database(format!("query get_user: {e}")))?;

        match rows.next() {
            Some(Ok(user)) => Ok(Some(user)),
            Some(Err(e)) => Err(RubricaError::Database(format!("row parse: {e}"))),
            None => Ok(None),
        }
    }

    /// Look up a user by canonical RUT. Returns `None` when no user matches.
    #[instrument(skip(self))]
    pub fn find_user_by_rut(&self, rut: &str) -> Result<Option<User>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, rut, name, role, password_hash, pin_hash, enabled,
                        worker_id, status, created_at, updated_at
                 FROM users WHERE rut = ?1 LIMIT 1",
            )
            .map_err(|e| RubricaError::Database(format!("prepare find_user_by_rut: {e}")))?;

        let mut rows = stmt
            .query_map(params![rut], row_to_user)
            .map_err(|e| RubricaError::Database(format!("query find_user_by_rut: {e}")))?;

        match rows.next() {
            Some(Ok(user)) => Ok(Some(user)),
            Some(Err(e)) => Err(RubricaError::Database(format!("row parse: {e}"))),
            None => Ok(None),
        }
    }

    /// Overwrite a user's profile fields, bumping `updated_at`.
    ///
    /// The `enabled` flag is deliberately NOT written here — it only flips
    /// through `enable_user_if_disabled`, so a stale in-memory `User` can
    /// never un-enable a record that a racing enrollment just enabled.
    ///
    /// Fails with `NotFound` when no row matches the id.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub fn update_user(&self, user: &User) -> Result<()> {
        let role_json = serde_json::to_string(&user.role)
            .map_err(|e| RubricaError::Database(format!("serialize role: {e}")))?;
        let status_json = serde_json::to_string(&user.status)
            .map_err(|e| RubricaError::Database(format!("serialize status: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let rows = self
            .conn
            .execute(
                "UPDATE users SET rut = ?1, name = ?2, role = ?3, password_hash = ?4,
                 pin_hash = ?5, worker_id = ?6, status = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    user.rut,
                    user.name,
                    role_json,
                    user.password_hash,
                    user.pin_hash,
                    user.worker_id.map(|w| w.to_string()),
                    status_json,
                    now,
                    user.id.to_string(),
                ],
            )
            .map_err(|e| RubricaError::Database(format!("update user: {e}")))?;

        if rows == 0 {
            return Err(RubricaError::NotFound(format!("user {}", user.id)));
        }

        debug!(user_id = %user.id, "user updated");
        Ok(())
    }

    /// Conditionally flip `enabled` on a user.
    ///
    /// The `WHERE enabled = 0` guard makes the write safe against a racing
    /// enrollment completion: exactly one caller observes `true`.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn enable_user_if_disabled(&self, user_id: &UserId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let rows = self
            .conn
            .execute(
                "UPDATE users SET enabled = 1, updated_at = ?1
                 WHERE id = ?2 AND enabled = 0",
                params![now, user_id.to_string()],
            )
            .map_err(|e| RubricaError::Database(format!("enable user: {e}")))?;
        Ok(rows > 0)
    }

    /// Replace the stored PIN hash of a user.
    #[instrument(skip(self, pin_hash), fields(user_id = %user_id))]
    pub fn set_user_pin_hash(&self, user_id: &UserId, pin_hash: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let rows = self
            .conn
            .execute(
                "UPDATE users SET pin_hash = ?1, updated_at = ?2 WHERE id = ?3",
                params![pin_hash, now, user_id.to_string()],
            )
            .map_err(|e| RubricaError::Database(format!("set user pin hash: {e}")))?;

        if rows == 0 {
            return Err(RubricaError::NotFound(format!("user {user_id}")));
        }
        debug!(user_id = %user_id, "user PIN hash updated");
        Ok(())
    }

    // -- Workers ------------------------------------------------------------

    /// Insert a new worker record.
    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    pub fn insert_worker(&self, worker: &Worker) -> Result<()> {
        let snapshot_json = worker
            .enrollment_signature
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RubricaError::Database(format!("serialize snapshot: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO workers (id, rut, name, pin_hash, enabled, user_id,
                 enrollment_signature, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    worker.id.to_string(),
                    worker.rut,
                    worker.name,
                    worker.pin_hash,
                    worker.enabled as i32,
                    worker.user_id.map(|u| u.to_string()),
                    snapshot_json,
                    worker.created_at.to_rfc3339(),
                    worker.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| RubricaError::Database(format!("insert worker: {e}")))?;

        info!(worker_id = %worker.id, "worker inserted");
        Ok(())
    }

    /// Retrieve a worker by id. Returns `None` if absent.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub fn get_worker(&self, worker_id: &WorkerId) -> Result<Option<Worker>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, rut, name, pin_hash, enabled, user_id,
                        enrollment_signature, created_at, updated_at
                 FROM workers WHERE id = ?1",
            )
            .map_err(|e| RubricaError::Database(format!("prepare get_worker: {e}")))?;

        let mut rows = stmt
            .query_map(params![worker_id.to_string()], row_to_worker)
            .map_err(|e| RubricaError::Database(format!("query get_worker: {e}")))?;

        match rows.next() {
            Some(Ok(worker)) => Ok(Some(worker)),
            Some(Err(e)) => Err(RubricaError::Database(format!("row parse: {e}"))),
            None => Ok(None),
        }
    }

    /// Look up a worker by canonical RUT. Returns `None` when no worker
    /// matches.
    #[instrument(skip(self))]
    pub fn find_worker_by_rut(&self, rut: &str) -> Result<Option<Worker>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, rut, name, pin_hash, enabled, user_id,
                        enrollment_signature, created_at, updated_at
                 FROM workers WHERE rut = ?1 LIMIT 1",
            )
            .map_err(|e| RubricaError::Database(format!("prepare find_worker_by_rut: {e}")))?;

        let mut rows = stmt
            .query_map(params![rut], row_to_worker)
            .map_err(|e| RubricaError::Database(format!("query find_worker_by_rut: {e}")))?;

        match rows.next() {
            Some(Ok(worker)) => Ok(Some(worker)),
            Some(Err(e)) => Err(RubricaError::Database(format!("row parse: {e}"))),
            None => Ok(None),
        }
    }

    /// Overwrite a worker's profile fields, bumping `updated_at`.
    ///
    /// As with `update_user`, the `enabled` flag only flips through
    /// `enable_worker_if_disabled`.
    ///
    /// Fails with `NotFound` when no row matches the id.
    #[instrument(skip(self, worker), fields(worker_id = %worker.id))]
    pub fn update_worker(&self, worker: &Worker) -> Result<()> {
        let snapshot_json = worker
            .enrollment_signature
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RubricaError::Database(format!("serialize snapshot: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let rows = self
            .conn
            .execute(
                "UPDATE workers SET rut = ?1, name = ?2, pin_hash = ?3,
                 user_id = ?4, enrollment_signature = ?5, updated_at = ?6
                 WHERE id = ?7",
                params![
                    worker.rut,
                    worker.name,
                    worker.pin_hash,
                    worker.user_id.map(|u| u.to_string()),
                    snapshot_json,
                    now,
                    worker.id.to_string(),
                ],
            )
            .map_err(|e| RubricaError::Database(format!("update worker: {e}")))?;

        if rows == 0 {
            return Err(RubricaError::NotFound(format!("worker {}", worker.id)));
        }

        debug!(worker_id = %worker.id, "worker updated");
        Ok(())
    }

    /// Conditionally flip `enabled` on a worker (same race guard as the
    /// user-side variant).
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub fn enable_worker_if_disabled(&self, worker_id: &WorkerId) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let rows = self
            .conn
            .execute(
                "UPDATE workers SET enabled = 1, updated_at = ?1
                 WHERE id = ?2 AND enabled = 0",
                params![now, worker_id.to_string()],
            )
            .map_err(|e| RubricaError::Database(format!("enable worker: {e}")))?;
        Ok(rows > 0)
    }

    /// Replace the stored PIN hash of a worker.
    #[instrument(skip(self, pin_hash), fields(worker_id = %worker_id))]
    pub fn set_worker_pin_hash(&self, worker_id: &WorkerId, pin_hash: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let rows = self
            .conn
            .execute(
                "UPDATE workers SET pin_hash = ?1, updated_at = ?2 WHERE id = ?3",
                params![pin_hash, now, worker_id.to_string()],
            )
            .map_err(|e| RubricaError::Database(format!("set worker pin hash: {e}")))?;

        if rows == 0 {
            return Err(RubricaError::NotFound(format!("worker {worker_id}")));
        }
        debug!(worker_id = %worker_id, "worker PIN hash updated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_uuid(idx: usize, s: &str) -> rusqlite::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

/// Map a SQLite row to a `User`.
///
/// Column indices must match the SELECT order used in the query methods above.
fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id_str: String = row.get(0)?;
    let rut: String = row.get(1)?;
    let name: String = row.get(2)?;
    let role_json: String = row.get(3)?;
    let password_hash: String = row.get(4)?;
    let pin_hash: Option<String> = row.get(5)?;
    let enabled: bool = row.get::<_, i32>(6)? != 0;
    let worker_id_str: Option<String> = row.get(7)?;
    let status_json: String = row.get(8)?;
    let created_at_str: String = row.get(9)?;
    let updated_at_str: String = row.get(10)?;

    let role: Role = serde_json::from_str(&role_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status: UserStatus = serde_json::from_str(&status_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let worker_id = match worker_id_str {
        Some(s) => Some(WorkerId(parse_uuid(7, &s)?)),
        None => None,
    };

    Ok(User {
        id: UserId(parse_uuid(0, &id_str)?),
        rut,
        name,
        role,
        password_hash,
        pin_hash,
        enabled,
        worker_id,
        status,
        created_at: parse_timestamp(9, &created_at_str)?,
        updated_at: parse_timestamp(10, &updated_at_str)?,
    })
}

/// Map a SQLite row to a `Worker`.
fn row_to_worker(row: &rusqlite::Row<'_>) -> rusqlite::Result<Worker> {
    let id_str: String = row.get(0)?;
    let rut: String = row.get(1)?;
    let name: String = row.get(2)?;
    let pin_hash: Option<String> = row.get(3)?;
    let enabled: bool = row.get::<_, i32>(4)? != 0;
    let user_id_str: Option<String> = row.get(5)?;
    let snapshot_json: Option<String> = row.get(6)?;
    let created_at_str: String = row.get(7)?;
    let updated_at_str: String = row.get(8)?;

    let user_id = match user_id_str {
        Some(s) => Some(UserId(parse_uuid(5, &s)?)),
        None => None,
    };

    let enrollment_signature: Option<EnrollmentSnapshot> = match snapshot_json {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                6,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?),
        None => None,
    };

    Ok(Worker {
        id: WorkerId(parse_uuid(0, &id_str)?),
        rut,
        name,
        pin_hash,
        enabled,
        user_id,
        enrollment_signature,
        created_at: parse_timestamp(7, &created_at_str)?,
        updated_at: parse_timestamp(8, &updated_at_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rubrica_core::types::SignatureId;

    fn store() -> IdentityStore {
        IdentityStore::open_in_memory().expect("open in-memory identity store")
    }

    fn test_user() -> User {
        User::new(
            "12345678-5".into(),
            "Ana Rojas".into(),
            Role::Worker,
            "pw-hash".into(),
        )
    }

    fn test_worker() -> Worker {
        Worker::new("12345678-5".into(), "Ana Rojas".into())
    }

    #[test]
    fn insert_and_retrieve_user() {
        let store = store();
        let user = test_user();
        store.insert_user(&user).expect("insert");

        let found = store.get_user(&user.id).expect("get").expect("found");
        assert_eq!(found.id, user.id);
        assert_eq!(found.rut, "12345678-5");
        assert_eq!(found.role, Role::Worker);
        assert!(!found.enabled);
        assert!(found.pin_hash.is_none());
    }

    #[test]
    fn find_user_by_rut() {
        let store = store();
        let user = test_user();
        store.insert_user(&user).expect("insert");

        let found = store
            .find_user_by_rut("12345678-5")
            .expect("find")
            .expect("found");
        assert_eq!(found.id, user.id);

        assert!(store.find_user_by_rut("11111111-1").expect("find").is_none());
    }

    #[test]
    fn update_user_round_trip() {
        let store = store();
        let mut user = test_user();
        store.insert_user(&user).expect("insert");

        user.pin_hash = Some("hash".into());
        user.status = UserStatus::Active;
        let worker_id = WorkerId::new();
        user.worker_id = Some(worker_id);
        store.update_user(&user).expect("update");

        let found = store.get_user(&user.id).expect("get").expect("found");
        assert_eq!(found.pin_hash.as_deref(), Some("hash"));
        assert_eq!(found.worker_id, Some(worker_id));
        assert_eq!(found.status, UserStatus::Active);
    }

    #[test]
    fn update_user_never_touches_enabled() {
        let store = store();
        let mut user = test_user();
        store.insert_user(&user).expect("insert");
        assert!(store.enable_user_if_disabled(&user.id).expect("enable"));

        // A stale in-memory copy still says disabled; the update must not
        // revert the flag.
        user.enabled = false;
        user.name = "Ana R.".into();
        store.update_user(&user).expect("update");

        let found = store.get_user(&user.id).expect("get").expect("found");
        assert!(found.enabled);
        assert_eq!(found.name, "Ana R.");
    }

    #[test]
    fn update_missing_user_is_not_found() {
        let store = store();
        let user = test_user();
        let result = store.update_user(&user);
        assert!(matches!(result, Err(RubricaError::NotFound(_))));
    }

    #[test]
    fn enable_user_is_conditional() {
        let store = store();
        let user = test_user();
        store.insert_user(&user).expect("insert");

        // First flip wins, second observes the guard.
        assert!(store.enable_user_if_disabled(&user.id).expect("enable"));
        assert!(!store.enable_user_if_disabled(&user.id).expect("enable again"));

        let found = store.get_user(&user.id).expect("get").expect("found");
        assert!(found.enabled);
    }

    #[test]
    fn worker_snapshot_round_trip() {
        let store = store();
        let mut worker = test_worker();
        store.insert_worker(&worker).expect("insert");

        let snapshot = EnrollmentSnapshot {
            signature_id: SignatureId::new(),
            token: "SIG-T-R-C".into(),
            signed_at: Utc::now(),
        };
        worker.enrollment_signature = Some(snapshot.clone());
        store.update_worker(&worker).expect("update");
        assert!(store.enable_worker_if_disabled(&worker.id).expect("enable"));

        let found = store.get_worker(&worker.id).expect("get").expect("found");
        assert!(found.enabled);
        let stored = found.enrollment_signature.expect("snapshot");
        assert_eq!(stored.signature_id, snapshot.signature_id);
        assert_eq!(stored.token, "SIG-T-R-C");
    }

    #[test]
    fn find_worker_by_rut() {
        let store = store();
        let worker = test_worker();
        store.insert_worker(&worker).expect("insert");

        let found = store
            .find_worker_by_rut("12345678-5")
            .expect("find")
            .expect("found");
        assert_eq!(found.id, worker.id);
    }

    #[test]
    fn set_pin_hash_updates_both_sides_independently() {
        let store = store();
        let user = test_user();
        let worker = test_worker();
        store.insert_user(&user).expect("insert user");
        store.insert_worker(&worker).expect("insert worker");

        store.set_user_pin_hash(&user.id, "user-hash").expect("set user");
        store
            .set_worker_pin_hash(&worker.id, "worker-hash")
            .expect("set worker");

        let u = store.get_user(&user.id).expect("get").expect("found");
        let w = store.get_worker(&worker.id).expect("get").expect("found");
        assert_eq!(u.pin_hash.as_deref(), Some("user-hash"));
        assert_eq!(w.pin_hash.as_deref(), Some("worker-hash"));
    }

    #[test]
    fn get_nonexistent_returns_none() {
        let store = store();
        assert!(store.get_user(&UserId::new()).expect("get").is_none());
        assert!(store.get_worker(&WorkerId::new()).expect("get").is_none());
    }

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("identity.db");

        let user = test_user();
        {
            let store = IdentityStore::open(&path).expect("open");
            store.insert_user(&user).expect("insert");
        }

        let store = IdentityStore::open(&path).expect("reopen");
        let found = store.get_user(&user.id).expect("get").expect("found");
        assert_eq!(found.rut, user.rut);
    }
}
