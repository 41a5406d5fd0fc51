// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Signature request tracker — the aggregate of required signers for one
// unit of work.
//
// The aggregate is a projection over the ledger: `on_signature_accepted`
// recomputes counts from the signer array and derives the overall state.
// Transitions are monotonic forward only; a completed request never moves
// again, no matter how often a late notification arrives.

use tracing::{debug, info, instrument};

use rubrica_core::SignatureConfig;
use rubrica_core::error::{Result, RubricaError};
use rubrica_core::types::{
    RequestId, RequestState, RequiredSigner, SignatureId, SignaturePurpose,
    SignatureRequest, UserId, WorkerId,
};
use rubrica_store::{IdentityStore, RequestStore};

use crate::notify::{NotificationSender, notify_best_effort};

/// How many times a conditional request write is retried before giving up.
const UPDATE_ATTEMPTS: usize = 3;

/// Tracks per-signer completion and the derived overall request state.
pub struct RequestTracker<'a> {
    identities: &'a IdentityStore,
    requests: &'a RequestStore,
    notifier: &'a dyn NotificationSender,
    notifications_enabled: bool,
}

impl<'a> RequestTracker<'a> {
    pub fn new(
        config: &SignatureConfig,
        identities: &'a IdentityStore,
        requests: &'a RequestStore,
        notifier: &'a dyn NotificationSender,
    ) -> Self {
        Self {
            identities,
            requests,
            notifier,
            notifications_enabled: config.notifications_enabled,
        }
    }

    /// Create a request naming the required signers.
    ///
    /// Worker ids that do not resolve are silently dropped (logged) — a
    /// partially-stale signer list should not sink the whole request. Zero
    /// resolvable signers is a `Validation` failure.
    #[instrument(skip(self, signer_ids), fields(signer_count = signer_ids.len()))]
    pub fn create(
        &self,
        signer_ids: &[WorkerId],
        purpose: SignaturePurpose,
        reference: &str,
        requested_by: &UserId,
    ) -> Result<SignatureRequest> {
        let mut signers = Vec::with_capacity(signer_ids.len());
        for worker_id in signer_ids {
            match self.identities.get_worker(worker_id)? {
                Some(worker) => signers.push(RequiredSigner {
                    worker_id: worker.id,
                    name: worker.name,
                    completed: false,
                    signature_id: None,
                }),
                None => {
                    debug!(worker_id = %worker_id, "signer did not resolve, dropping");
                }
            }
        }

        if signers.is_empty() {
            return Err(RubricaError::Validation(
                "no signer ids resolved to a worker".into(),
            ));
        }

        let request = SignatureRequest::new(
            purpose,
            reference.to_string(),
            *requested_by,
            signers,
        );
        self.requests.insert_request(&request)?;
        info!(request_id = %request.id, required = request.required, "signature request created");

        if self.notifications_enabled {
            for signer in &request.signers {
                notify_best_effort(
                    self.notifier,
                    &signer.worker_id.to_string(),
                    "Signature required",
                    &format!("{} requires your signature", request.reference),
                );
            }
        }

        Ok(request)
    }

    /// Record that a signer's signature was accepted.
    ///
    /// Idempotent per signer: a re-notification for an already-complete
    /// entry changes nothing. The request state only moves forward; once
    /// `completed` (or cancelled/expired) the aggregate is returned as-is.
    #[instrument(skip(self), fields(request_id = %request_id, signer_id = %signer_id))]
    pub fn on_signature_accepted(
        &self,
        request_id: &RequestId,
        signer_id: &WorkerId,
        signature_id: &SignatureId,
    ) -> Result<SignatureRequest> {
        for _ in 0..UPDATE_ATTEMPTS {
            let mut request = self
                .requests
                .get_request(request_id)?
                .ok_or_else(|| RubricaError::NotFound(format!("request {request_id}")))?;

            if is_terminal(request.state) {
                debug!(state = ?request.state, "request is terminal, ignoring acceptance");
                return Ok(request);
            }

            let entry = request
                .signers
                .iter_mut()
                .find(|s| s.worker_id == *signer_id)
                .ok_or_else(|| {
                    RubricaError::NotFound(format!(
                        "signer {signer_id} is not part of request {request_id}"
                    ))
                })?;

            if entry.completed {
                debug!("signer already complete, nothing to do");
                return Ok(request);
            }
            entry.completed = true;
            entry.signature_id = Some(*signature_id);

            let previous_state = request.state;
            request.completed = request.signers.iter().filter(|s| s.completed).count() as u32;
            request.state = derive_state(request.completed, request.required, previous_state);

            if self
                .requests
                .update_request_if_state(&request, previous_state)?
            {
                info!(
                    completed = request.completed,
                    required = request.required,
                    state = ?request.state,
                    "signer acceptance recorded"
                );
                return Ok(request);
            }
            // Lost the optimistic write; re-read and try again.
            debug!("conditional update lost a race, retrying");
        }

        Err(RubricaError::Internal(format!(
            "request {request_id} kept changing concurrently"
        )))
    }

    /// Cancel a request. Fails with `Conflict` once the request has
    /// completed; terminal `Cancelled` is idempotent.
    #[instrument(skip(self, reason), fields(request_id = %request_id))]
    pub fn cancel(&self, request_id: &RequestId, reason: &str) -> Result<SignatureRequest> {
        if !self.requests.cancel_request(request_id, reason)? {
            // The guard refused: either the row is missing or completed.
            return match self.requests.get_request(request_id)? {
                None => Err(RubricaError::NotFound(format!("request {request_id}"))),
                Some(_) => Err(RubricaError::Conflict(format!(
                    "request {request_id} is already completed"
                ))),
            };
        }

        info!(request_id = %request_id, "signature request cancelled");
        self.requests
            .get_request(request_id)?
            .ok_or_else(|| RubricaError::Internal(format!("request {request_id} vanished")))
    }
}

fn is_terminal(state: RequestState) -> bool {
    matches!(
        state,
        RequestState::Completed | RequestState::Cancelled | RequestState::Expired
    )
}

/// Derive the overall state from the completion counts, never moving
/// backward from `current`.
pub(crate) fn derive_state(completed: u32, required: u32, current: RequestState) -> RequestState {
    if is_terminal(current) {
        return current;
    }
    if required > 0 && completed >= required {
        RequestState::Completed
    } else if completed > 0 {
        RequestState::InProgress
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LogSender;
    use rubrica_core::types::Worker;

    struct Fixture {
        identities: IdentityStore,
        requests: RequestStore,
        config: SignatureConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                identities: IdentityStore::open_in_memory().expect("identity store"),
                requests: RequestStore::open_in_memory().expect("request store"),
                config: SignatureConfig::default(),
            }
        }

        fn tracker(&self) -> RequestTracker<'_> {
            RequestTracker::new(&self.config, &self.identities, &self.requests, &LogSender)
        }

        fn insert_worker(&self, rut: &str, name: &str) -> Worker {
            let worker = Worker::new(rut.into(), name.into());
            self.identities.insert_worker(&worker).expect("insert");
            worker
        }
    }

    #[test]
    fn create_resolves_signers() {
        let fx = Fixture::new();
        let a = fx.insert_worker("12345678-5", "Ana");
        let b = fx.insert_worker("11111111-1", "Benito");

        let request = fx
            .tracker()
            .create(
                &[a.id, b.id],
                SignaturePurpose::Document,
                "doc-3",
                &UserId::new(),
            )
            .expect("create");

        assert_eq!(request.required, 2);
        assert_eq!(request.state, RequestState::Pending);
        assert_eq!(request.signers[0].name, "Ana");
        assert_eq!(request.signers[1].name, "Benito");
    }

    #[test]
    fn unresolvable_signers_are_dropped_not_fatal() {
        let fx = Fixture::new();
        let a = fx.insert_worker("12345678-5", "Ana");

        let request = fx
            .tracker()
            .create(
                &[a.id, WorkerId::new(), WorkerId::new()],
                SignaturePurpose::Activity,
                "act-1",
                &UserId::new(),
            )
            .expect("create");

        assert_eq!(request.required, 1);
        assert_eq!(request.signers.len(), 1);
    }

    #[test]
    fn zero_resolvable_signers_fails_validation() {
        let fx = Fixture::new();
        let err = fx
            .tracker()
            .create(
                &[WorkerId::new()],
                SignaturePurpose::Document,
                "doc-1",
                &UserId::new(),
            )
            .unwrap_err();
        assert!(matches!(err, RubricaError::Validation(_)), "got {err}");
    }

    #[test]
    fn acceptance_walks_pending_in_progress_completed() {
        let fx = Fixture::new();
        let tracker = fx.tracker();
        let a = fx.insert_worker("12345678-5", "Ana");
        let b = fx.insert_worker("11111111-1", "Benito");

        let request = tracker
            .create(&[a.id, b.id], SignaturePurpose::Document, "doc-3", &UserId::new())
            .expect("create");

        let after_first = tracker
            .on_signature_accepted(&request.id, &a.id, &SignatureId::new())
            .expect("first");
        assert_eq!(after_first.completed, 1);
        assert_eq!(after_first.state, RequestState::InProgress);

        let after_second = tracker
            .on_signature_accepted(&request.id, &b.id, &SignatureId::new())
            .expect("second");
        assert_eq!(after_second.completed, 2);
        assert_eq!(after_second.state, RequestState::Completed);
    }

    #[test]
    fn acceptance_is_idempotent_per_signer() {
        let fx = Fixture::new();
        let tracker = fx.tracker();
        let a = fx.insert_worker("12345678-5", "Ana");
        let b = fx.insert_worker("11111111-1", "Benito");

        let request = tracker
            .create(&[a.id, b.id], SignaturePurpose::Document, "doc-3", &UserId::new())
            .expect("create");

        let signature_id = SignatureId::new();
        tracker
            .on_signature_accepted(&request.id, &a.id, &signature_id)
            .expect("first");
        let again = tracker
            .on_signature_accepted(&request.id, &a.id, &SignatureId::new())
            .expect("repeat");

        // No double count, and the original signature reference sticks.
        assert_eq!(again.completed, 1);
        assert_eq!(again.signers[0].signature_id, Some(signature_id));
    }

    #[test]
    fn completed_request_never_moves() {
        let fx = Fixture::new();
        let tracker = fx.tracker();
        let a = fx.insert_worker("12345678-5", "Ana");

        let request = tracker
            .create(&[a.id], SignaturePurpose::Document, "doc-3", &UserId::new())
            .expect("create");
        let completed = tracker
            .on_signature_accepted(&request.id, &a.id, &SignatureId::new())
            .expect("complete");
        assert_eq!(completed.state, RequestState::Completed);

        let still = tracker
            .on_signature_accepted(&request.id, &a.id, &SignatureId::new())
            .expect("late notification");
        assert_eq!(still.state, RequestState::Completed);
        assert_eq!(still.completed, 1);
        assert_eq!(still.required, 1);
    }

    #[test]
    fn unknown_signer_is_not_found() {
        let fx = Fixture::new();
        let tracker = fx.tracker();
        let a = fx.insert_worker("12345678-5", "Ana");

        let request = tracker
            .create(&[a.id], SignaturePurpose::Document, "doc-3", &UserId::new())
            .expect("create");

        let err = tracker
            .on_signature_accepted(&request.id, &WorkerId::new(), &SignatureId::new())
            .unwrap_err();
        assert!(matches!(err, RubricaError::NotFound(_)), "got {err}");
    }

    #[test]
    fn cancel_pending_succeeds_and_completed_conflicts() {
        let fx = Fixture::new();
        let tracker = fx.tracker();
        let a = fx.insert_worker("12345678-5", "Ana");
        let b = fx.insert_worker("11111111-1", "Benito");

        let pending = tracker
            .create(&[a.id, b.id], SignaturePurpose::Document, "doc-3", &UserId::new())
            .expect("create");
        let cancelled = tracker.cancel(&pending.id, "superseded").expect("cancel");
        assert_eq!(cancelled.state, RequestState::Cancelled);
        assert_eq!(cancelled.cancel_reason.as_deref(), Some("superseded"));

        let done = tracker
            .create(&[a.id], SignaturePurpose::Document, "doc-4", &UserId::new())
            .expect("create");
        tracker
            .on_signature_accepted(&done.id, &a.id, &SignatureId::new())
            .expect("complete");
        let err = tracker.cancel(&done.id, "too late").unwrap_err();
        assert!(matches!(err, RubricaError::Conflict(_)), "got {err}");
    }

    #[test]
    fn cancel_of_unknown_request_is_not_found() {
        let fx = Fixture::new();
        let err = fx.tracker().cancel(&RequestId::new(), "r").unwrap_err();
        assert!(matches!(err, RubricaError::NotFound(_)), "got {err}");
    }

    #[test]
    fn derive_state_is_forward_only() {
        use RequestState::*;
        assert_eq!(derive_state(0, 2, Pending), Pending);
        assert_eq!(derive_state(1, 2, Pending), InProgress);
        assert_eq!(derive_state(2, 2, InProgress), Completed);
        // Never backward.
        assert_eq!(derive_state(0, 2, InProgress), InProgress);
        assert_eq!(derive_state(1, 2, Completed), Completed);
        assert_eq!(derive_state(0, 2, Cancelled), Cancelled);
    }
}
