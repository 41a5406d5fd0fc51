// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// rubrica-store — SQLite persistence for identities, the signature ledger,
// and signature requests.
//
// Each store owns its own connection; there are no cross-table joins, so
// the three databases can live in one file or three. Conditional
// `UPDATE ... WHERE` guards are the concurrency primitive offered to the
// engine: every check-then-act sequence upstream ends in one of them.

pub mod identity;
pub mod requests;
pub mod signatures;

pub use identity::IdentityStore;
pub use requests::RequestStore;
pub use signatures::SignatureStore;
