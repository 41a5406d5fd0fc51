// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Rubrica.
//
// The taxonomy matters for callers: `Validation` means the input must change
// before a retry can succeed, `Auth` never reveals which factor failed beyond
// "PIN incorrect" / "not enrolled", `Conflict` marks an illegal state
// transition, and `Database`/`Internal` are safe to retry.

use thiserror::Error;

/// Top-level error type for all Rubrica operations.
#[derive(Debug, Error)]
pub enum RubricaError {
    // -- Caller's fault --
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("conflict: {0}")]
    Conflict(String),

    // -- Storage / infrastructure --
    #[error("database error: {0}")]
    Database(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RubricaError {
    /// Whether a retry with identical input could succeed.
    ///
    /// Only infrastructure failures qualify; everything else requires the
    /// caller to change its input or wait for a state change.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Database(_) | Self::Internal(_) | Self::Io(_)
        )
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, RubricaError>;
