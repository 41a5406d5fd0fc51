// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Signature ledger storage — append-only SQLite table of attestation
// records.
//
// Rows are never deleted. The only mutation is the dispute sub-machine
// (valid -> disputed -> {valid, revoked}), and both transitions are
// conditional writes: the WHERE clause carries the expected current state,
// so a racing transition loses cleanly instead of clobbering.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use tracing::{debug, info, instrument};

use rubrica_core::error::{Result, RubricaError};
use rubrica_core::types::{
    DisputeInfo, Signature, SignatureId, SignaturePurpose, SignatureState, UserId,
    ValidationMethod, WorkerId,
};

/// SQLite schema for the signatures table.
const CREATE_TABLE_SQL: &str = r#"
    CREATE TABLE IF NOT EXISTS signatures (
        id TEXT PRIMARY KEY,
        token TEXT NOT NULL,
        worker_id TEXT NOT NULL,
        user_id TEXT,
        purpose TEXT NOT NULL,
        reference TEXT NOT NULL,
        signed_at TEXT NOT NULL,
        recorded_at TEXT NOT NULL,
        ip TEXT NOT NULL,
        user_agent TEXT NOT NULL,
        method TEXT NOT NULL,
        state TEXT NOT NULL,
        dispute TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_signatures_worker ON signatures (worker_id);
"#;

/// Append-only signature ledger backed by a SQLite database.
pub struct SignatureStore {
    conn: Connection,
}

impl SignatureStore {
    /// Open (or create) the ledger database at the given path.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| RubricaError::Database(format!("open: {e}")))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| RubricaError::Database(format!("WAL pragma: {e}")))?;

        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| RubricaError::Database(format!("create table: {e}")))?;

        info!("signature ledger opened");
        Ok(Self { conn })
    }

    /// Open an in-memory database (useful for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RubricaError::Database(format!("open in-memory: {e}")))?;

        conn.execute_batch(CREATE_TABLE_SQL)
            .map_err(|e| RubricaError::Database(format!("create table: {e}")))?;

        debug!("in-memory signature ledger opened");
        Ok(Self { conn })
    }

    /// Append a signature record to the ledger.
    #[instrument(skip(self, signature), fields(signature_id = %signature.id))]
    pub fn insert_signature(&self, signature: &Signature) -> Result<()> {
        let purpose_json = serde_json::to_string(&signature.purpose)
            .map_err(|e| RubricaError::Database(format!("serialize purpose: {e}")))?;
        let method_json = serde_json::to_string(&signature.method)
            .map_err(|e| RubricaError::Database(format!("serialize method: {e}")))?;
        let state_json = serde_json::to_string(&signature.state)
            .map_err(|e| RubricaError::Database(format!("serialize state: {e}")))?;
        let dispute_json = signature
            .dispute
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RubricaError::Database(format!("serialize dispute: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO signatures (id, token, worker_id, user_id, purpose,
                 reference, signed_at, recorded_at, ip, user_agent, method, state, dispute)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    signature.id.to_string(),
                    signature.token,
                    signature.worker_id.to_string(),
                    signature.user_id.map(|u| u.to_string()),
                    purpose_json,
                    signature.reference,
                    signature.signed_at.to_rfc3339(),
                    signature.recorded_at.to_rfc3339(),
                    signature.ip,
                    signature.user_agent,
                    method_json,
                    state_json,
                    dispute_json,
                ],
            )
            .map_err(|e| RubricaError::Database(format!("insert signature: {e}")))?;

        info!(signature_id = %signature.id, token = %signature.token, "signature recorded");
        Ok(())
    }

    /// Retrieve a signature by id. Returns `None` if absent.
    #[instrument(skip(self), fields(signature_id = %signature_id))]
    pub fn get_signature(&self, signature_id: &SignatureId) -> Result<Option<Signature>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, token, worker_id, user_id, purpose, reference, signed_at,
                        recorded_at, ip, user_agent, method, state, dispute
                 FROM signatures WHERE id = ?1",
            )
            .map_err(|e| RubricaError::Database(format!("prepare get_signature: {e}")))?;

        let mut rows = stmt
            .query_map(params![signature_id.to_string()], row_to_signature)
            .map_err(|e| RubricaError::Database(format!("query get_signature: {e}")))?;

        match rows.next() {
            Some(Ok(signature)) => Ok(Some(signature)),
            Some(Err(e)) => Err(RubricaError::Database(format!("row parse: {e}"))),
            None => Ok(None),
        }
    }

    /// All signatures recorded for a worker, oldest first.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub fn signatures_for_worker(&self, worker_id: &WorkerId) -> Result<Vec<Signature>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, token, worker_id, user_id, purpose, reference, signed_at,
                        recorded_at, ip, user_agent, method, state, dispute
                 FROM signatures WHERE worker_id = ?1 ORDER BY recorded_at ASC",
            )
            .map_err(|e| RubricaError::Database(format!("prepare signatures_for_worker: {e}")))?;

        let signatures = stmt
            .query_map(params![worker_id.to_string()], row_to_signature)
            .map_err(|e| RubricaError::Database(format!("query signatures_for_worker: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| RubricaError::Database(format!("collect rows: {e}")))?;

        debug!(count = signatures.len(), "retrieved worker signatures");
        Ok(signatures)
    }

    /// The most recent `limit` signatures, newest first.
    #[instrument(skip(self))]
    pub fn recent_signatures(&self, limit: u32) -> Result<Vec<Signature>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, token, worker_id, user_id, purpose, reference, signed_at,
                        recorded_at, ip, user_agent, method, state, dispute
                 FROM signatures ORDER BY recorded_at DESC LIMIT ?1",
            )
            .map_err(|e| RubricaError::Database(format!("prepare recent_signatures: {e}")))?;

        let signatures = stmt
            .query_map(params![limit], row_to_signature)
            .map_err(|e| RubricaError::Database(format!("query recent_signatures: {e}")))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| RubricaError::Database(format!("collect rows: {e}")))?;

        Ok(signatures)
    }

    /// Transition a signature from `valid` to `disputed`, attaching the
    /// dispute detail.
    ///
    /// Returns `false` when the row was not in `valid` state (or does not
    /// exist) — the caller decides between `NotFound` and `Conflict`.
    #[instrument(skip(self, dispute), fields(signature_id = %signature_id))]
    pub fn mark_disputed(
        &self,
        signature_id: &SignatureId,
        dispute: &DisputeInfo,
    ) -> Result<bool> {
        let dispute_json = serde_json::to_string(dispute)
            .map_err(|e| RubricaError::Database(format!("serialize dispute: {e}")))?;
        let valid_json = serde_json::to_string(&SignatureState::Valid)
            .map_err(|e| RubricaError::Database(format!("serialize state: {e}")))?;
        let disputed_json = serde_json::to_string(&SignatureState::Disputed)
            .map_err(|e| RubricaError::Database(format!("serialize state: {e}")))?;

        let rows = self
            .conn
            .execute(
                "UPDATE signatures SET state = ?1, dispute = ?2
                 WHERE id = ?3 AND state = ?4",
                params![disputed_json, dispute_json, signature_id.to_string(), valid_json],
            )
            .map_err(|e| RubricaError::Database(format!("mark disputed: {e}")))?;

        debug!(transitioned = rows > 0, "dispute transition attempted");
        Ok(rows > 0)
    }

    /// Transition a signature from `disputed` to `new_state` (`valid` or
    /// `revoked`), replacing the dispute detail with its resolved form.
    ///
    /// Returns `false` when the row was not in `disputed` state.
    #[instrument(skip(self, dispute), fields(signature_id = %signature_id))]
    pub fn mark_resolved(
        &self,
        signature_id: &SignatureId,
        dispute: &DisputeInfo,
        new_state: SignatureState,
    ) -> Result<bool> {
        let dispute_json = serde_json::to_string(dispute)
            .map_err(|e| RubricaError::Database(format!("serialize dispute: {e}")))?;
        let disputed_json = serde_json::to_string(&SignatureState::Disputed)
            .map_err(|e| RubricaError::Database(format!("serialize state: {e}")))?;
        let new_state_json = serde_json::to_string(&new_state)
            .map_err(|e| RubricaError::Database(format!("serialize state: {e}")))?;

        let rows = self
            .conn
            .execute(
                "UPDATE signatures SET state = ?1, dispute = ?2
                 WHERE id = ?3 AND state = ?4",
                params![
                    new_state_json,
                    dispute_json,
                    signature_id.to_string(),
                    disputed_json
                ],
            )
            .map_err(|e| RubricaError::Database(format!("mark resolved: {e}")))?;

        debug!(transitioned = rows > 0, "resolve transition attempted");
        Ok(rows > 0)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Map a SQLite row to a `Signature`.
///
/// Column indices must match the SELECT order used in the query methods above.
fn row_to_signature(row: &rusqlite::Row<'_>) -> rusqlite::Result<Signature> {
    let id_str: String = row.get(0)?;
    let token: String = row.get(1)?;
    let worker_id_str: String = row.get(2)?;
    let user_id_str: Option<String> = row.get(3)?;
    let purpose_json: String = row.get(4)?;
    let reference: String = row.get(5)?;
    let signed_at_str: String = row.get(6)?;
    let recorded_at_str: String = row.get(7)?;
    let ip: String = row.get(8)?;
    let user_agent: String = row.get(9)?;
    let method_json: String = row.get(10)?;
    let state_json: String = row.get(11)?;
    let dispute_json: Option<String> = row.get(12)?;

    let conv = |idx, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
    };

    let id = uuid::Uuid::parse_str(&id_str).map_err(|e| conv(0, Box::new(e)))?;
    let worker_uuid = uuid::Uuid::parse_str(&worker_id_str).map_err(|e| conv(2, Box::new(e)))?;
    let user_id = match user_id_str {
        Some(s) => Some(UserId(
            uuid::Uuid::parse_str(&s).map_err(|e| conv(3, Box::new(e)))?,
        )),
        None => None,
    };

    let purpose: SignaturePurpose =
        serde_json::from_str(&purpose_json).map_err(|e| conv(4, Box::new(e)))?;
    let method: ValidationMethod =
        serde_json::from_str(&method_json).map_err(|e| conv(10, Box::new(e)))?;
    let state: SignatureState =
        serde_json::from_str(&state_json).map_err(|e| conv(11, Box::new(e)))?;
    let dispute: Option<DisputeInfo> = match dispute_json {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| conv(12, Box::new(e)))?),
        None => None,
    };

    let signed_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&signed_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conv(6, Box::new(e)))?;
    let recorded_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&recorded_at_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conv(7, Box::new(e)))?;

    Ok(Signature {
        id: SignatureId(id),
        token,
        worker_id: WorkerId(worker_uuid),
        user_id,
        purpose,
        reference,
        signed_at,
        recorded_at,
        ip,
        user_agent,
        method,
        state,
        dispute,
    })
}
