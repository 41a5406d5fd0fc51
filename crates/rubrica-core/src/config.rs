// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Engine configuration.

use serde::{Deserialize, Serialize};

/// Process-wide settings injected into the engine at construction.
///
/// The PIN salt is deliberately an explicit configuration value rather than
/// a hidden global: the credential codec receives it at construction and
/// nothing else can reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureConfig {
    /// Secret salt mixed into every PIN hash. Rotating it invalidates all
    /// stored hashes, so it is set once per deployment.
    pub pin_salt: String,
    /// Upper bound on the number of tuples one offline batch may carry.
    pub max_offline_batch: usize,
    /// Whether best-effort notifications are dispatched after enrollment
    /// and signature-request creation.
    pub notifications_enabled: bool,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            // Placeholder salt — deployments must override.
            pin_salt: "rubrica-dev-salt".into(),
            max_offline_batch: 200,
            notifications_enabled: true,
        }
    }
}
