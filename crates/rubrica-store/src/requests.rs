// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Signature request storage — the denormalized aggregate tracking N
// required signers for one unit of work.
//
// The signer array is a JSON column: the store does not interpret it, the
// tracker in rubrica-engine recomputes counts and state from it. Writes go
// through a conditional update carrying the expected current state so that
// two tracker invocations racing on the same request cannot lose an update.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tracing::{debug, info, instrument};

use rubrica_core::error::{Result, RubricaError};
use rubrica_core::types::{
    RequestId, RequestState, RequiredSigner, SignaturePurpose, SignatureRequest, UserId,
};

/// SQLite schema for the signature_requests table.
const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS signature_requests (
        id TEXT PRIMARY KEY,
        purpose TEXT NOT NULL,
        reference TEXT NOT NULL,
        requested_by TEXT NOT NULL,
        signers TEXT NOT NULL,
        required INTEGER NOT NULL,
        completed INTEGER NOT NULL,
        state TEXT NOT NULL,
        cancel_reason TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
"#;

/// Persistent signature-request store backed by a SQLite database.
pub struct RequestStore {
    conn: Connection,
}

impl RequestStore {
    /// Open (or create) the request database at the given path.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| RubricaError::Database(format!("open: {e}")))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| RubricaError::Database(format!("WAL pragma: {e}")))?;

        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| RubricaError::Database(format!("create table: {e}")))?;

        info!("signature request store opened");
        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RubricaError::Database(format!("open in-memory: {e}")))?;

        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| RubricaError::Database(format!("create table: {e}")))?;

        debug!("in-memory signature request store opened");
        Ok(Self { conn })
    }

    /// Insert a new signature request.
    #[instrument(skip(self, request), fields(request_id = %request.id))]
    pub fn insert_request(&self, request: &SignatureRequest) -> Result<()> {
        let purpose_json = serde_json::to_string(&request.purpose)
            .map_err(|e| RubricaError::Database(format!("serialize purpose: {e}")))?;
        let signers_json = serde_json::to_string(&request.signers)
            .map_err(|e| RubricaError::Database(format!("serialize signers: {e}")))?;
        let state_json = serde_json::to_string(&request.state)
            .map_err(|e| RubricaError::Database(format!("serialize state: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO signature_requests (id, purpose, reference, requested_by,
                 signers, required, completed, state, cancel_reason, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    request.id.to_string(),
                    purpose_json,
                    request.reference,
                    request.requested_by.to_string(),
                    signers_json,
                    request.required,
                    request.completed,
                    state_json,
                    request.cancel_reason,
                    request.created_at.to_rfc3339(),
                    request.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| RubricaError::Database(format!("insert request: {e}")))?;

        info!(request_id = %request.id, required = request.required, "signature request inserted");
        Ok(())
    }

    /// Retrieve a request by id. Returns `None` if absent.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub fn get_request(&self, request_id: &RequestId) -> Result<Option<SignatureRequest>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, purpose, reference, requested_by, signers, required,
                        completed, state, cancel_reason, created_at, updated_at
                 FROM signature_requests WHERE id = ?1",
            )
            .map_err(|e| RubricaError::Database(format!("prepare get_request: {e}")))?;

        let mut rows = stmt
            .query_map(params![request_id.to_string()], row_to_request)
            .map_err(|e| RubricaError::Database(format!("query get_request: {e}")))?;

        match rows.next() {
            Some(Ok(request)) => Ok(Some(request)),
            Some(Err(e)) => Err(RubricaError::Database(format!("row parse: {e}"))),
            None => Ok(None),
        }
    }

    /// Overwrite a request's mutable fields, guarded by the expected current
    /// state.
    ///
    /// Returns `false` when the row was not in `expected_state` — the caller
    /// re-reads and retries, or gives up. This is the optimistic-update
    /// primitive the tracker builds its monotonic transitions on.
    #[instrument(skip(self, request), fields(request_id = %request.id))]
    pub fn update_request_if_state(
        &self,
        request: &SignatureRequest,
        expected_state: RequestState,
    ) -> Result<bool> {
        let signers_json = serde_json::to_string(&request.signers)
            .map_err(|e| RubricaError::Database(format!("serialize signers: {e}")))?;
        let state_json = serde_json::to_string(&request.state)
            .map_err(|e| RubricaError::Database(format!("serialize state: {e}")))?;
        let expected_json = serde_json::to_string(&expected_state)
            .map_err(|e| RubricaError::Database(format!("serialize state: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let rows = self
            .conn
            .execute(
                "UPDATE signature_requests
                 SET signers = ?1, required = ?2, completed = ?3, state = ?4,
                     cancel_reason = ?5, updated_at = ?6
                 WHERE id = ?7 AND state = ?8",
                params![
                    signers_json,
                    request.required,
                    request.completed,
                    state_json,
                    request.cancel_reason,
                    now,
                    request.id.to_string(),
                    expected_json,
                ],
            )
            .map_err(|e| RubricaError::Database(format!("update request: {e}")))?;

        debug!(updated = rows > 0, "conditional request update");
        Ok(rows > 0)
    }

    /// Cancel a request unless it has already completed.
    ///
    /// Returns `false` when the row exists but the `state != completed`
    /// guard refused the write (or the row is absent) — the caller maps
    /// that to `Conflict` or `NotFound` after a re-read.
    #[instrument(skip(self), fields(request_id = %request_id))]
    pub fn cancel_request(&self, request_id: &RequestId, reason: &str) -> Result<bool> {
        let cancelled_json = serde_json::to_string(&RequestState::Cancelled)
            .map_err(|e| RubricaError::Database(format!("serialize state: {e}")))?;
        let completed_json = serde_json::to_string(&RequestState::Completed)
            .map_err(|e| RubricaError::Database(format!("serialize state: {e}")))?;
        let now = Utc::now().to_rfc3339();

        let rows = self
            .conn
            .execute(
                "UPDATE signature_requests
                 SET state = ?1, cancel_reason = ?2, updated_at = ?3
                 WHERE id = ?4 AND state != ?5",
                params![
                    cancelled_json,
                    reason,
                    now,
                    request_id.to_string(),
                    completed_json,
                ],
            )
            .map_err(|e| RubricaError::Database(format!("cancel request: {e}")))?;

        Ok(rows > 0)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Map a SQLite row to a `SignatureRequest`.
///
/// Column indices must match the SELECT order used in the query methods above.
fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<SignatureRequest> {
    let id_str: String = row.get(0)?;
    let purpose_json: String = row.get(1)?;
    let reference: String = row.get(2)?;
    let requested_by_str: String = row.get(3)?;
    let signers_json: String = row.get(4)?;
    let required: u32 = row.get::<_, i64>(5)? as u32;
    let completed: u32 = row.get::<_, i64>(6)? as u32;
    let state_json: String = row.get(7)?;
    let cancel_reason: Option<String> = row.get(8)?;
    let created_at_str: String = row.get(9)?;
    let updated_at_str: String = row.get(10)?;

    let conv = |idx, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
    };

    let id = uuid::Uuid::parse_str(&id_str).map_err(|e| conv(0, Box::new(e)))?;
    let requested_by =
        uuid::Uuid::parse_str(&requested_by_str).map_err(|e| conv(3, Box::new(e)))?;

    let purpose: SignaturePurpose =
        serde_json::from_str(&purpose_json).map_err(|e| conv(1, Box::new(e)))?;
    let signers: Vec<RequiredSigner> =
        serde_json::from_str(&signers_json).map_err(|e| conv(4, Box::new(e)))?;
    let state: RequestState =
        serde_json::from_str(&state_json).map_err(|e| conv(7, Box::new(e)))?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conv(9, Box::new(e)))?;
    let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&updated_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conv(10, Box::new(e)))?;

    Ok(SignatureRequest {
        id: RequestId(id),
        purpose,
        reference,
        requested_by: UserId(requested_by),
        signers,
        required,
        completed,
        state,
        cancel_reason,
        created_at,
        updated_at,
    })
}
