// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Audit-token generation.
//
// Tokens identify signature records in audit trails and printed receipts.
// They combine a time component, random bytes, and a salted checksum, and
// are formatted for human legibility. They are NOT security credentials —
// possession of a token proves nothing.

use ring::rand::{SecureRandom, SystemRandom};
use rubrica_core::error::{Result, RubricaError};
use sha2::{Digest, Sha256};

/// Number of random bytes per token (12 hex characters).
const TOKEN_RANDOM_BYTES: usize = 6;

/// Generator for signature audit tokens.
pub struct TokenGenerator {
    rng: SystemRandom,
    salt: String,
}

impl TokenGenerator {
    pub fn new(salt: impl Into<String>) -> Self {
        Self {
            rng: SystemRandom::new(),
            salt: salt.into(),
        }
    }

    /// Generate a token of the form `SIG-<time>-<random>-<check>`.
    ///
    /// `time` is the Unix epoch in seconds, base-36; `random` is 6 bytes of
    /// OS entropy, hex; `check` is the first 4 hex characters of a salted
    /// SHA-256 over the other two parts, letting auditors spot transcription
    /// errors.
    pub fn generate(&self) -> Result<String> {
        let epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| RubricaError::Internal(format!("system clock: {e}")))?
            .as_secs();
        let time_part = to_base36(epoch);

        let mut random = [0u8; TOKEN_RANDOM_BYTES];
        self.rng
            .fill(&mut random)
            .map_err(|_| RubricaError::Internal("entropy source unavailable".into()))?;
        let random_part = hex::encode_upper(random);

        let check_part = self.checksum(&time_part, &random_part);
        Ok(format!("SIG-{time_part}-{random_part}-{check_part}"))
    }

    fn checksum(&self, time_part: &str, random_part: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(time_part.as_bytes());
        hasher.update(random_part.as_bytes());
        hasher.update(self.salt.as_bytes());
        hex::encode_upper(hasher.finalize())[..4].to_string()
    }
}

/// Encode an integer in uppercase base-36.
fn to_base36(mut n: u64) -> String {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
