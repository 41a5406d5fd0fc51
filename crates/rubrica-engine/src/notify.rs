// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Outbound notification seam.
//
// Delivery is out of scope for this engine; callers plug in a real sender.
// Every invocation inside the engine is best-effort: a failed notification
// is logged and never surfaces as the primary operation's error.

use rubrica_core::error::Result;
use tracing::{info, warn};

/// Abstract outbound notification sender.
///
/// `recipient` is an opaque address (RUT, email, inbox id) the surrounding
/// system knows how to route.
pub trait NotificationSender {
    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()>;
}

/// Sender that only records the notification in the trace log. Default for
/// tests and for deployments without a delivery channel.
pub struct LogSender;

impl NotificationSender for LogSender {
    fn send(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        info!(recipient, subject, body, "notification (log only)");
        Ok(())
    }
}

/// Dispatch a notification, swallowing and logging any failure.
pub(crate) fn notify_best_effort(
    sender: &dyn NotificationSender,
    recipient: &str,
    subject: &str,
    body: &str,
) {
    if let Err(e) = sender.send(recipient, subject, body) {
        warn!(recipient, error = %e, "notification dispatch failed (ignored)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rubrica_core::error::RubricaError;

    struct FailingSender;

    impl NotificationSender for FailingSender {
        fn send(&self, _recipient: &str, _subject: &str, _body: &str) -> Result<()> {
            Err(RubricaError::Internal("smtp down".into()))
        }
    }

    #[test]
    fn best_effort_swallows_failure() {
        // Must not panic or propagate.
        notify_best_effort(&FailingSender, "12345678-5", "subject", "body");
    }

    #[test]
    fn log_sender_always_succeeds() {
        assert!(LogSender.send("12345678-5", "s", "b").is_ok());
    }
}
