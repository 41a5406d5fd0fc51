// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// RUT normalization — Chilean national-ID canonicalization and check-digit
// validation.
//
// Every RUT comparison in the system happens on the canonical form produced
// here ("BODY-DV", no thousand separators, uppercase verifier). Raw input is
// never compared directly.

use rubrica_core::error::{Result, RubricaError};

/// Normalize a raw RUT to its canonical `BODY-DV` form.
///
/// Strips dots, dashes, and whitespace, uppercases the verifier digit, and
/// validates the modulo-11 check digit. Fails with `Validation` when the
/// input is malformed or the check digit does not match.
///
/// Normalization is idempotent: feeding the canonical form back in yields
/// the same string.
pub fn normalize_rut(raw: &str) -> Result<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '.' | '-') && !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();

    // A valid RUT is ASCII only; rejecting here also keeps the byte-offset
    // split below on a char boundary.
    if !cleaned.is_ascii() {
        return Err(RubricaError::Validation(format!(
            "RUT contains non-ASCII characters: {raw:?}"
        )));
    }
    if cleaned.len() < 2 {
        return Err(RubricaError::Validation(format!("RUT too short: {raw:?}")));
    }

    let (body, verifier) = cleaned.split_at(cleaned.len() - 1);
    let verifier = verifier
        .chars()
        .next()
        .ok_or_else(|| RubricaError::Validation("empty RUT verifier".into()))?;

    if body.is_empty() || !body.chars().all(|c| c.is_ascii_digit()) {
        return Err(RubricaError::Validation(format!(
            "RUT body must be numeric: {raw:?}"
        )));
    }
    if !verifier.is_ascii_digit() && verifier != 'K' {
        return Err(RubricaError::Validation(format!(
            "RUT verifier must be a digit or K: {raw:?}"
        )));
    }

    let expected = check_digit(body);
    if verifier != expected {
        return Err(RubricaError::Validation(format!(
            "RUT check digit mismatch: {raw:?}"
        )));
    }

    Ok(format!("{body}-{verifier}"))
}

/// Compute the modulo-11 check digit for a numeric RUT body.
///
/// Digits are weighted 2..=7 cycling from the rightmost position; the
/// remainder maps to '0'..'9' or 'K' (for 10).
fn check_digit(body: &str) -> char {
    let mut factor = 2u32;
    let mut sum = 0u32;
    for c in body.chars().rev() {
        let digit = c.to_digit(10).unwrap_or(0);
        sum += digit * factor;
        factor = if factor == 7 { 2 } else { factor + 1 };
    }
    match 11 - (sum % 11) {
        11 => '0',
        10 => 'K',
        n => char::from_digit(n, 10).unwrap_or('0'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_punctuated_form() {
        assert_eq!(normalize_rut("12.345.678-5").unwrap(), "12345678-5");
        assert_eq!(normalize_rut("12345678-5").unwrap(), "12345678-5");
        assert_eq!(normalize_rut(" 12345678 5 ").unwrap(), "12345678-5");
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize_rut("12.345.678-5").unwrap();
        let twice = normalize_rut(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn verifier_is_case_insensitive() {
        // 20.347.878-K carries a K verifier.
        let upper = normalize_rut("20347878-K").unwrap();
        let lower = normalize_rut("20347878-k").unwrap();
        assert_eq!(upper, lower);
        assert!(upper.ends_with("-K"));
    }

    #[test]
    fn rejects_bad_check_digit() {
        let err = normalize_rut("12345678-4").unwrap_err();
        assert!(err.to_string().contains("check digit"));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(normalize_rut("").is_err());
        assert!(normalize_rut("5").is_err());
        assert!(normalize_rut("abc-1").is_err());
        assert!(normalize_rut("1234x678-5").is_err());
    }

    #[test]
    fn rejects_non_ascii_without_panicking() {
        // Trailing multibyte characters must come back as Validation, not
        // trip the body/verifier split.
        let err = normalize_rut("1234567é").unwrap_err();
        assert!(matches!(err, RubricaError::Validation(_)), "got {err}");
        assert!(normalize_rut("é").is_err());
        assert!(normalize_rut("12345678-ñ").is_err());
    }

    #[test]
    fn known_check_digits() {
        assert_eq!(check_digit("12345678"), '5');
        assert_eq!(check_digit("11111111"), '1');
        assert_eq!(check_digit("20347878"), 'K');
    }
}
