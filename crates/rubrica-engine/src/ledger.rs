// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Signature ledger operations — interactive PIN-verified signing and the
// dispute sub-state-machine.
//
// The machine is small and strict:
//   valid --dispute--> disputed --resolve--> {valid, revoked}
// `valid` and `revoked` accept no other transitions. Resolving back to
// `valid` implicitly re-arms the dispute transition.

use chrono::Utc;
use tracing::{info, instrument};

use rubrica_core::SignatureConfig;
use rubrica_core::error::{Result, RubricaError};
use rubrica_core::types::{
    DisputeInfo, DisputeOutcome, DisputeResolution, RequestContext, Signature, SignatureId,
    SignaturePurpose, SignatureState, UserId, ValidationMethod, WorkerId,
};
use rubrica_credential::{PinCodec, TokenGenerator};
use rubrica_store::{IdentityStore, SignatureStore};

/// Interactive signing and dispute handling over the signature ledger.
pub struct SignatureLedger<'a> {
    identities: &'a IdentityStore,
    signatures: &'a SignatureStore,
    codec: PinCodec,
    tokens: TokenGenerator,
}

impl<'a> SignatureLedger<'a> {
    pub fn new(
        config: &SignatureConfig,
        identities: &'a IdentityStore,
        signatures: &'a SignatureStore,
    ) -> Self {
        Self {
            identities,
            signatures,
            codec: PinCodec::new(config.pin_salt.clone()),
            tokens: TokenGenerator::new(config.pin_salt.clone()),
        }
    }

    /// Create a PIN-verified signature for a worker.
    ///
    /// For every purpose except `enrollment` the worker must already be
    /// enabled (`Auth("not enrolled")`). The PIN always verifies against
    /// the worker's own hash. Enrollment signatures normally come from the
    /// enrollment engine; they are accepted here without the enabled gate
    /// because during enrollment the flag is not yet set.
    #[instrument(skip(self, pin, ctx), fields(worker_id = %worker_id))]
    pub fn create_signature(
        &self,
        worker_id: &WorkerId,
        pin: &str,
        purpose: SignaturePurpose,
        reference: &str,
        ctx: &RequestContext,
    ) -> Result<Signature> {
        let worker = self
            .identities
            .get_worker(worker_id)?
            .ok_or_else(|| RubricaError::NotFound(format!("worker {worker_id}")))?;

        if purpose != SignaturePurpose::Enrollment && !worker.enabled {
            return Err(RubricaError::Auth("not enrolled".into()));
        }

        let stored = worker
            .pin_hash
            .as_deref()
            .ok_or_else(|| RubricaError::Validation("no PIN configured".into()))?;
        if !self.codec.verify_pin(pin, stored, &worker.id.to_string()) {
            return Err(RubricaError::Auth("PIN incorrect".into()));
        }

        let signature = Signature {
            id: SignatureId::new(),
            token: self.tokens.generate()?,
            worker_id: worker.id,
            user_id: worker.user_id,
            purpose,
            reference: reference.to_string(),
            signed_at: ctx.timestamp,
            recorded_at: Utc::now(),
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            method: ValidationMethod::Pin,
            state: SignatureState::Valid,
            dispute: None,
        };
        self.signatures.insert_signature(&signature)?;

        info!(signature_id = %signature.id, "signature created");
        Ok(signature)
    }

    /// Dispute a signature: legal only from `valid`.
    ///
    /// Records reason, reporter, and report time; resolution fields stay
    /// empty until `resolve`.
    #[instrument(skip(self, reason), fields(signature_id = %signature_id))]
    pub fn dispute(
        &self,
        signature_id: &SignatureId,
        reason: &str,
        reporter_id: &UserId,
    ) -> Result<Signature> {
        let current = self
            .signatures
            .get_signature(signature_id)?
            .ok_or_else(|| RubricaError::NotFound(format!("signature {signature_id}")))?;

        let dispute = DisputeInfo {
            reason: reason.to_string(),
            reported_by: *reporter_id,
            reported_at: Utc::now(),
            resolution: None,
        };

        // The store's WHERE-state guard decides; `current.state` only
        // shapes the error message when it refuses.
        if !self.signatures.mark_disputed(signature_id, &dispute)? {
            return Err(RubricaError::Conflict(format!(
                "signature {signature_id} cannot be disputed from state {:?}",
                current.state
            )));
        }

        info!(signature_id = %signature_id, "signature disputed");
        self.fetch(signature_id)
    }

    /// Resolve a dispute: legal only from `disputed`. The outcome returns
    /// the signature to `valid` or moves it to `revoked`.
    #[instrument(skip(self, resolution), fields(signature_id = %signature_id))]
    pub fn resolve(
        &self,
        signature_id: &SignatureId,
        resolution: &str,
        resolver_id: &UserId,
        outcome: DisputeOutcome,
    ) -> Result<Signature> {
        let current = self
            .signatures
            .get_signature(signature_id)?
            .ok_or_else(|| RubricaError::NotFound(format!("signature {signature_id}")))?;

        let mut dispute = current.dispute.clone().ok_or_else(|| {
            RubricaError::Conflict(format!(
                "signature {signature_id} has no open dispute"
            ))
        })?;
        dispute.resolution = Some(DisputeResolution {
            outcome,
            resolution: resolution.to_string(),
            resolved_by: *resolver_id,
            resolved_at: Utc::now(),
        });

        let new_state = match outcome {
            DisputeOutcome::Valid => SignatureState::Valid,
            DisputeOutcome::Revoked => SignatureState::Revoked,
        };

        if !self
            .signatures
            .mark_resolved(signature_id, &dispute, new_state)?
        {
            return Err(RubricaError::Conflict(format!(
                "signature {signature_id} cannot be resolved from state {:?}",
                current.state
            )));
        }

        info!(signature_id = %signature_id, ?new_state, "dispute resolved");
        self.fetch(signature_id)
    }

    fn fetch(&self, signature_id: &SignatureId) -> Result<Signature> {
        self.signatures
            .get_signature(signature_id)?
            .ok_or_else(|| RubricaError::Internal(format!("signature {signature_id} vanished")))
    }
}
