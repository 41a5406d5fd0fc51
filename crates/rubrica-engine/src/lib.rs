// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Business logic over the credential codec and the SQLite stores:
// enrollment, the signature ledger with its dispute lifecycle, multi-signer
// request tracking, and offline batch reconciliation.

pub mod enrollment;
pub mod ledger;
pub mod notify;
pub mod offline;
pub mod requests;

pub use enrollment::{EnrollmentEngine, EnrollmentOutcome};
pub use ledger::SignatureLedger;
pub use notify::{LogSender, NotificationSender};
pub use offline::{BatchOutcome, ItemOutcome, OfflineItem, OfflineReconciler};
pub use requests::RequestTracker;
