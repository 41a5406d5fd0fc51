// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Enrollment engine — drives a (User, Worker) pair from "not yet enrolled"
// to "enabled", and repairs the pair when the two records disagree.
//
// The state machine per pair: UNENROLLED (no PIN) -> PIN_SET -> ENABLED.
// The User-side write is authoritative; the Worker-side write is a
// best-effort propagation whose failure is logged and repaired by the next
// resynchronization pass. There is no transaction spanning the two records.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use rubrica_core::SignatureConfig;
use rubrica_core::error::{Result, RubricaError};
use rubrica_core::types::{
    EnrollmentSnapshot, RequestContext, Signature, SignatureId, SignaturePurpose,
    SignatureState, User, UserId, UserStatus, ValidationMethod, Worker, WorkerId,
};
use rubrica_credential::{PinCodec, TokenGenerator, validate_pin_strength};
use rubrica_store::{IdentityStore, SignatureStore};

use crate::notify::{NotificationSender, notify_best_effort};

/// Result of a successful enrollment completion.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentOutcome {
    pub user_id: UserId,
    pub worker_id: WorkerId,
    pub signature_id: SignatureId,
    pub token: String,
    pub enabled: bool,
    /// True when the user was already enabled and this call repaired the
    /// Worker side rather than performing a fresh enrollment.
    pub resynced: bool,
}

/// PIN enrollment and identity resynchronization.
pub struct EnrollmentEngine<'a> {
    identities: &'a IdentityStore,
    signatures: &'a SignatureStore,
    notifier: &'a dyn NotificationSender,
    codec: PinCodec,
    tokens: TokenGenerator,
    notifications_enabled: bool,
}

impl<'a> EnrollmentEngine<'a> {
    pub fn new(
        config: &SignatureConfig,
        identities: &'a IdentityStore,
        signatures: &'a SignatureStore,
        notifier: &'a dyn NotificationSender,
    ) -> Self {
        Self {
            identities,
            signatures,
            notifier,
            codec: PinCodec::new(config.pin_salt.clone()),
            tokens: TokenGenerator::new(config.pin_salt.clone()),
            notifications_enabled: config.notifications_enabled,
        }
    }

    /// Set (or rotate) a user's PIN.
    ///
    /// Before enrollment completes the PIN may be overwritten freely — the
    /// bootstrap case. Once the user is enabled and holds a hash, the
    /// current PIN must be presented and verify.
    ///
    /// The new hash is propagated to the linked worker, recomputed with the
    /// worker's own id — a hash is never copied between identities. That
    /// propagation is best-effort: its failure is logged, not surfaced.
    #[instrument(skip(self, new_pin, current_pin), fields(user_id = %user_id))]
    pub fn set_pin(
        &self,
        user_id: &UserId,
        new_pin: &str,
        current_pin: Option<&str>,
    ) -> Result<()> {
        validate_pin_strength(new_pin)?;

        let user = self
            .identities
            .get_user(user_id)?
            .ok_or_else(|| RubricaError::NotFound(format!("user {user_id}")))?;

        if user.enabled {
            if let Some(stored) = user.pin_hash.as_deref() {
                let presented = current_pin
                    .ok_or_else(|| RubricaError::Auth("PIN incorrect".into()))?;
                if !self.codec.verify_pin(presented, stored, &user.id.to_string()) {
                    return Err(RubricaError::Auth("PIN incorrect".into()));
                }
            }
        }

        let user_hash = self.codec.hash_pin(new_pin, &user.id.to_string())?;
        self.identities.set_user_pin_hash(&user.id, &user_hash)?;
        info!(user_id = %user.id, "user PIN set");

        if let Some(worker_id) = user.worker_id {
            let propagated = self
                .codec
                .hash_pin(new_pin, &worker_id.to_string())
                .and_then(|hash| self.identities.set_worker_pin_hash(&worker_id, &hash));
            if let Err(e) = propagated {
                warn!(worker_id = %worker_id, error = %e,
                    "worker-side PIN propagation failed (will repair on next resync)");
            }
        }

        Ok(())
    }

    /// Complete enrollment (or resynchronize a drifted pair).
    ///
    /// Verifies the PIN against the user's hash, resolves the effective
    /// worker, records the enrollment signature, and enables both sides.
    /// An already-enabled user is not rejected outright: the pair may have
    /// drifted (worker created later, link stale), and the call repairs it.
    /// Only when the user AND its resolved worker are both enabled does the
    /// call fail with `Conflict("already enrolled")`.
    #[instrument(skip(self, pin, ctx), fields(user_id = %user_id))]
    pub fn complete_enrollment(
        &self,
        user_id: &UserId,
        pin: &str,
        ctx: &RequestContext,
    ) -> Result<EnrollmentOutcome> {
        let user = self
            .identities
            .get_user(user_id)?
            .ok_or_else(|| RubricaError::NotFound(format!("user {user_id}")))?;

        let stored = user
            .pin_hash
            .as_deref()
            .ok_or_else(|| RubricaError::Validation("no PIN configured".into()))?;
        if !self.codec.verify_pin(pin, stored, &user.id.to_string()) {
            return Err(RubricaError::Auth("PIN incorrect".into()));
        }

        let resynced = user.enabled;
        let worker = self.resolve_worker(&user)?;

        if user.enabled && worker.enabled {
            return Err(RubricaError::Conflict("already enrolled".into()));
        }
        if resynced {
            info!(user_id = %user.id, worker_id = %worker.id,
                "user already enabled, resynchronizing worker side");
        }

        // A client retry racing this call can duplicate the signature; the
        // ledger tolerates that (no idempotency key is defined).
        let token = self.tokens.generate()?;
        let now = Utc::now();
        let signature = Signature {
            id: SignatureId::new(),
            token: token.clone(),
            worker_id: worker.id,
            user_id: Some(user.id),
            purpose: SignaturePurpose::Enrollment,
            reference: user.id.to_string(),
            signed_at: ctx.timestamp,
            recorded_at: now,
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            method: ValidationMethod::Pin,
            state: SignatureState::Valid,
            dispute: None,
        };
        self.signatures.insert_signature(&signature)?;

        let snapshot = EnrollmentSnapshot {
            signature_id: signature.id,
            token: token.clone(),
            signed_at: signature.signed_at,
        };

        // Authoritative user-side write: link, activate, enable.
        let mut updated_user = user.clone();
        updated_user.worker_id = Some(worker.id);
        updated_user.status = UserStatus::Active;
        self.identities.update_user(&updated_user)?;
        self.identities.enable_user_if_disabled(&user.id)?;
        info!(user_id = %user.id, signature_id = %signature.id, "enrollment recorded");

        // Worker-side write is fire-and-forget: the next enrollment attempt
        // or explicit resync repairs a failure here.
        if let Err(e) = self.sync_worker_side(&user, worker.clone(), pin, &snapshot) {
            warn!(worker_id = %worker.id, error = %e,
                "worker-side enrollment sync failed (will repair on next resync)");
        }

        if self.notifications_enabled {
            notify_best_effort(
                self.notifier,
                &user.rut,
                "Enrollment complete",
                &format!("Signature token {token} recorded for {}", user.name),
            );
        }

        Ok(EnrollmentOutcome {
            user_id: user.id,
            worker_id: worker.id,
            signature_id: signature.id,
            token,
            enabled: true,
            resynced,
        })
    }

    /// Resolve the effective worker for a user: existing link first, then a
    /// canonical-RUT match, then a freshly created (disabled) record built
    /// from the user's profile.
    fn resolve_worker(&self, user: &User) -> Result<Worker> {
        if let Some(worker_id) = user.worker_id {
            if let Some(worker) = self.identities.get_worker(&worker_id)? {
                return Ok(worker);
            }
            // Stale link: the referenced worker no longer resolves.
            debug!(user_id = %user.id, worker_id = %worker_id,
                "linked worker missing, falling back to RUT scan");
        }

        if let Some(worker) = self.identities.find_worker_by_rut(&user.rut)? {
            debug!(user_id = %user.id, worker_id = %worker.id, "worker matched by RUT");
            return Ok(worker);
        }

        let mut worker = Worker::new(user.rut.clone(), user.name.clone());
        worker.user_id = Some(user.id);
        self.identities.insert_worker(&worker)?;
        info!(user_id = %user.id, worker_id = %worker.id, "worker created from user profile");
        Ok(worker)
    }

    /// Propagate enrollment to the worker record: back-link, snapshot, a
    /// PIN hash recomputed with the worker's own id, and the enabled flag.
    fn sync_worker_side(
        &self,
        user: &User,
        mut worker: Worker,
        pin: &str,
        snapshot: &EnrollmentSnapshot,
    ) -> Result<()> {
        worker.user_id = Some(user.id);
        worker.pin_hash = Some(self.codec.hash_pin(pin, &worker.id.to_string())?);
        worker.enrollment_signature = Some(snapshot.clone());
        self.identities.update_worker(&worker)?;
        self.identities.enable_worker_if_disabled(&worker.id)?;
        debug!(worker_id = %worker.id, "worker side synchronized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LogSender;
    use rubrica_core::types::Role;

    struct Fixture {
        identities: IdentityStore,
        signatures: SignatureStore,
        config: SignatureConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                identities: IdentityStore::open_in_memory().expect("identity store"),
                signatures: SignatureStore::open_in_memory().expect("signature store"),
                config: SignatureConfig::default(),
            }
        }

        fn engine(&self) -> EnrollmentEngine<'_> {
            EnrollmentEngine::new(&self.config, &self.identities, &self.signatures, &LogSender)
        }

        fn insert_user(&self, rut: &str) -> User {
            let user = User::new(rut.into(), "Ana Rojas".into(), Role::Worker, "pw".into());
            self.identities.insert_user(&user).expect("insert user");
            user
        }
    }

    #[test]
    fn fresh_enrollment_enables_both_sides() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let user = fx.insert_user("12345678-5");

        engine.set_pin(&user.id, "4099", None).expect("set pin");
        let outcome = engine
            .complete_enrollment(&user.id, "4099", &RequestContext::unknown())
            .expect("complete");

        assert!(outcome.enabled);
        assert!(!outcome.resynced);

        let user = fx.identities.get_user(&user.id).expect("get").expect("user");
        assert!(user.enabled);
        assert_eq!(user.status, UserStatus::Active);
        assert_eq!(user.worker_id, Some(outcome.worker_id));

        let worker = fx
            .identities
            .get_worker(&outcome.worker_id)
            .expect("get")
            .expect("worker");
        assert!(worker.enabled);
        assert_eq!(worker.user_id, Some(user.id));
        assert_eq!(
            worker.enrollment_signature.expect("snapshot").signature_id,
            outcome.signature_id
        );

        let signature = fx
            .signatures
            .get_signature(&outcome.signature_id)
            .expect("get")
            .expect("signature");
        assert_eq!(signature.purpose, SignaturePurpose::Enrollment);
        assert_eq!(signature.method, ValidationMethod::Pin);
    }

    #[test]
    fn worker_hash_is_rehashed_not_copied() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let user = fx.insert_user("12345678-5");

        engine.set_pin(&user.id, "4099", None).expect("set pin");
        let outcome = engine
            .complete_enrollment(&user.id, "4099", &RequestContext::unknown())
            .expect("complete");

        let codec = PinCodec::new(fx.config.pin_salt.clone());
        let user = fx.identities.get_user(&user.id).expect("get").expect("user");
        let worker = fx
            .identities
            .get_worker(&outcome.worker_id)
            .expect("get")
            .expect("worker");

        let user_hash = user.pin_hash.expect("user hash");
        let worker_hash = worker.pin_hash.expect("worker hash");
        assert_ne!(user_hash, worker_hash);
        assert!(codec.verify_pin("4099", &user_hash, &user.id.to_string()));
        assert!(codec.verify_pin("4099", &worker_hash, &worker.id.to_string()));
    }

    #[test]
    fn second_completion_on_synced_pair_conflicts() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let user = fx.insert_user("12345678-5");

        engine.set_pin(&user.id, "4099", None).expect("set pin");
        engine
            .complete_enrollment(&user.id, "4099", &RequestContext::unknown())
            .expect("first");

        let err = engine
            .complete_enrollment(&user.id, "4099", &RequestContext::unknown())
            .unwrap_err();
        assert!(matches!(err, RubricaError::Conflict(_)), "got {err}");
        assert!(err.to_string().contains("already enrolled"));
    }

    #[test]
    fn enabled_user_without_worker_is_resynced_not_rejected() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let user = fx.insert_user("12345678-5");

        engine.set_pin(&user.id, "4099", None).expect("set pin");
        // Simulate drift: user got enabled but no worker was ever written.
        fx.identities.enable_user_if_disabled(&user.id).expect("enable");

        let outcome = engine
            .complete_enrollment(&user.id, "4099", &RequestContext::unknown())
            .expect("resync");
        assert!(outcome.resynced);

        let worker = fx
            .identities
            .get_worker(&outcome.worker_id)
            .expect("get")
            .expect("worker created");
        assert!(worker.enabled);
        assert_eq!(worker.rut, "12345678-5");
    }

    #[test]
    fn enabled_user_with_disabled_worker_is_repaired() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let user = fx.insert_user("12345678-5");

        // A worker with a matching RUT exists but is disabled and unlinked.
        let worker = Worker::new("12345678-5".into(), "Ana Rojas".into());
        fx.identities.insert_worker(&worker).expect("insert worker");

        engine.set_pin(&user.id, "4099", None).expect("set pin");
        fx.identities.enable_user_if_disabled(&user.id).expect("enable");

        let outcome = engine
            .complete_enrollment(&user.id, "4099", &RequestContext::unknown())
            .expect("resync");
        assert_eq!(outcome.worker_id, worker.id);

        let repaired = fx
            .identities
            .get_worker(&worker.id)
            .expect("get")
            .expect("worker");
        assert!(repaired.enabled);
        assert_eq!(repaired.user_id, Some(user.id));
    }

    #[test]
    fn stale_worker_link_falls_back_to_rut_match() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let mut user = fx.insert_user("12345678-5");

        // Dangling link to a worker id that was never written.
        user.worker_id = Some(WorkerId::new());
        fx.identities.update_user(&user).expect("update");

        let real = Worker::new("12345678-5".into(), "Ana Rojas".into());
        fx.identities.insert_worker(&real).expect("insert worker");

        engine.set_pin(&user.id, "4099", None).expect("set pin");
        let outcome = engine
            .complete_enrollment(&user.id, "4099", &RequestContext::unknown())
            .expect("complete");
        assert_eq!(outcome.worker_id, real.id);
    }

    #[test]
    fn completion_requires_a_configured_pin() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let user = fx.insert_user("12345678-5");

        let err = engine
            .complete_enrollment(&user.id, "4099", &RequestContext::unknown())
            .unwrap_err();
        assert!(matches!(err, RubricaError::Validation(_)), "got {err}");
        assert!(err.to_string().contains("no PIN configured"));
    }

    #[test]
    fn completion_rejects_wrong_pin() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let user = fx.insert_user("12345678-5");

        engine.set_pin(&user.id, "4099", None).expect("set pin");
        let err = engine
            .complete_enrollment(&user.id, "4098", &RequestContext::unknown())
            .unwrap_err();
        assert!(matches!(err, RubricaError::Auth(_)), "got {err}");
    }

    #[test]
    fn completion_of_unknown_user_is_not_found() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let err = engine
            .complete_enrollment(&UserId::new(), "4099", &RequestContext::unknown())
            .unwrap_err();
        assert!(matches!(err, RubricaError::NotFound(_)), "got {err}");
    }

    #[test]
    fn weak_pins_are_rejected_at_creation() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let user = fx.insert_user("12345678-5");

        for weak in ["1234", "4321", "0000"] {
            let err = engine.set_pin(&user.id, weak, None).unwrap_err();
            assert!(matches!(err, RubricaError::Validation(_)), "accepted {weak}");
        }
    }

    #[test]
    fn pin_rotation_after_enrollment_requires_current_pin() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let user = fx.insert_user("12345678-5");

        engine.set_pin(&user.id, "4099", None).expect("set pin");
        engine
            .complete_enrollment(&user.id, "4099", &RequestContext::unknown())
            .expect("complete");

        // No proof of the old PIN once enabled.
        let err = engine.set_pin(&user.id, "8642", None).unwrap_err();
        assert!(matches!(err, RubricaError::Auth(_)), "got {err}");

        let err = engine.set_pin(&user.id, "8642", Some("0001")).unwrap_err();
        assert!(matches!(err, RubricaError::Auth(_)), "got {err}");

        engine
            .set_pin(&user.id, "8642", Some("4099"))
            .expect("rotate with current pin");

        // Rotation propagates to the worker, rehashed with the worker's id.
        let user = fx.identities.get_user(&user.id).expect("get").expect("user");
        let worker_id = user.worker_id.expect("linked");
        let worker = fx
            .identities
            .get_worker(&worker_id)
            .expect("get")
            .expect("worker");
        let codec = PinCodec::new(fx.config.pin_salt.clone());
        assert!(codec.verify_pin(
            "8642",
            &worker.pin_hash.expect("hash"),
            &worker_id.to_string()
        ));
    }

    #[test]
    fn bootstrap_pin_can_be_overwritten_without_proof() {
        let fx = Fixture::new();
        let engine = fx.engine();
        let user = fx.insert_user("12345678-5");

        engine.set_pin(&user.id, "4099", None).expect("first");
        engine.set_pin(&user.id, "8642", None).expect("overwrite");

        engine
            .complete_enrollment(&user.id, "8642", &RequestContext::unknown())
            .expect("complete with latest pin");
    }
}
