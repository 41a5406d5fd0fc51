// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// rubrica-credential — the credential codec: deterministic PIN hashing and
// verification, RUT canonicalization, and audit-token generation.
//
// Everything here is pure computation over injected configuration; no I/O.

pub mod pin;
pub mod rut;
pub mod token;

pub use pin::{PinCodec, validate_pin_strength};
pub use rut::normalize_rut;
pub use token::TokenGenerator;
