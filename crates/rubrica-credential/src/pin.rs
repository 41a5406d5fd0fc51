// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// PIN hashing and verification.
//
// Hashes are bound to the identity record that stores them: the digest
// covers `pin:identity_id:salt`, so a hash copied from a User record to a
// Worker record (or vice versa) never verifies. Propagation between linked
// identities must re-hash with the receiving record's own id.

use rubrica_core::error::{Result, RubricaError};
use sha2::{Digest, Sha256};

/// Salted PIN codec. The salt is process-wide configuration injected at
/// construction — there is no global.
#[derive(Debug, Clone)]
pub struct PinCodec {
    salt: String,
}

impl PinCodec {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Hash a 4-digit PIN for the identity record identified by
    /// `identity_id`. Returns a lowercase hex digest.
    ///
    /// Fails with `Validation` unless the PIN is exactly 4 ASCII digits.
    pub fn hash_pin(&self, pin: &str, identity_id: &str) -> Result<String> {
        if !is_well_formed(pin) {
            return Err(RubricaError::Validation(
                "PIN must be exactly 4 digits".into(),
            ));
        }

        let mut hasher = Sha256::new();
        hasher.update(pin.as_bytes());
        hasher.update(b":");
        hasher.update(identity_id.as_bytes());
        hasher.update(b":");
        hasher.update(self.salt.as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }

    /// Verify a PIN against a stored hash for the given identity id.
    ///
    /// Recomputes and compares in constant time. Malformed input of any
    /// kind — wrong PIN length, empty strings, corrupt stored hash —
    /// yields `false`, never an error.
    pub fn verify_pin(&self, pin: &str, stored_hash: &str, identity_id: &str) -> bool {
        let Ok(computed) = self.hash_pin(pin, identity_id) else {
            return false;
        };
        ring::constant_time::verify_slices_are_equal(
            computed.as_bytes(),
            stored_hash.as_bytes(),
        )
        .is_ok()
    }
}

/// Check basic PIN shape: exactly 4 ASCII digits.
fn is_well_formed(pin: &str) -> bool {
    pin.len() == 4 && pin.bytes().all(|b| b.is_ascii_digit())
}

/// Reject PINs that are trivially guessable.
///
/// Denied: non-4-digit input, all-same-digit ("0000"), and strictly
/// ascending or descending digit runs ("1234", "4321").
pub fn validate_pin_strength(pin: &str) -> Result<()> {
    if !is_well_formed(pin) {
        return Err(RubricaError::Validation(
            "PIN must be exactly 4 digits".into(),
        ));
    }

    let digits: Vec<u8> = pin.bytes().map(|b| b - b'0').collect();

    if digits.windows(2).all(|w| w[1] == w[0]) {
        return Err(RubricaError::Validation(
            "PIN must not repeat a single digit".into(),
        ));
    }
    if digits.windows(2).all(|w| w[1] == w[0].wrapping_add(1)) {
        return Err(RubricaError::Validation(
            "PIN must not be an ascending sequence".into(),
        ));
    }
    if digits.windows(2).all(|w| w[0] == w[1].wrapping_add(1)) {
        return Err(RubricaError::Validation(
            "PIN must not be a descending sequence".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> PinCodec {
        PinCodec::new("test-salt")
    }

    #[test]
    fn hash_round_trip() {
        let codec = codec();
        let hash = codec.hash_pin("4099", "worker-1").unwrap();
        assert!(codec.verify_pin("4099", &hash, "worker-1"));
        assert!(!codec.verify_pin("4098", &hash, "worker-1"));
    }

    #[test]
    fn hash_is_identity_bound() {
        let codec = codec();
        let for_worker = codec.hash_pin("4099", "worker-1").unwrap();
        let for_user = codec.hash_pin("4099", "user-1").unwrap();
        assert_ne!(for_worker, for_user);
        // A hash copied across identities must never verify.
        assert!(!codec.verify_pin("4099", &for_worker, "user-1"));
    }

    #[test]
    fn hash_depends_on_salt() {
        let a = PinCodec::new("salt-a").hash_pin("4099", "id").unwrap();
        let b = PinCodec::new("salt-b").hash_pin("4099", "id").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn hash_rejects_malformed_pin() {
        let codec = codec();
        for bad in ["", "409", "40999", "40a9", "٤٠٩٩"] {
            assert!(codec.hash_pin(bad, "id").is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn verify_never_errors_on_malformed_input() {
        let codec = codec();
        assert!(!codec.verify_pin("", "whatever", "id"));
        assert!(!codec.verify_pin("409", "whatever", "id"));
        assert!(!codec.verify_pin("4099", "", "id"));
        assert!(!codec.verify_pin("4099", "not-a-hex-digest", "id"));
    }

    #[test]
    fn strength_denies_trivial_sequences() {
        assert!(validate_pin_strength("0000").is_err());
        assert!(validate_pin_strength("7777").is_err());
        assert!(validate_pin_strength("1234").is_err());
        assert!(validate_pin_strength("4321").is_err());
        assert!(validate_pin_strength("6789").is_err());
        assert!(validate_pin_strength("3210").is_err());
    }

    #[test]
    fn strength_accepts_ordinary_pins() {
        assert!(validate_pin_strength("4099").is_ok());
        assert!(validate_pin_strength("1357").is_ok());
        assert!(validate_pin_strength("2026").is_ok());
    }

    #[test]
    fn strength_rejects_wrong_length() {
        assert!(validate_pin_strength("123").is_err());
        assert!(validate_pin_strength("12345").is_err());
        assert!(validate_pin_strength("").is_err());
    }
}
