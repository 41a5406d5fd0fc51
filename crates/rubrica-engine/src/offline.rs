// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Offline reconciliation — replays a batch of (RUT, PIN, timestamp) tuples
// collected without connectivity against current identity state.
//
// Processing is per-item, independent, and non-aborting: a bad tuple is
// reported in the batch outcome, never thrown. Identity resolution is
// worker-first, then user (linked worker preferred, bare user with its own
// PIN hash as the last resort), all on canonical RUTs through the indexed
// lookups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use rubrica_core::SignatureConfig;
use rubrica_core::error::{Result, RubricaError};
use rubrica_core::types::{
    RequestContext, RequestId, RequestState, RequiredSigner, Signature, SignatureId,
    SignaturePurpose, SignatureRequest, SignatureState, UserId, ValidationMethod, WorkerId,
};
use rubrica_credential::{PinCodec, TokenGenerator, normalize_rut};
use rubrica_store::{IdentityStore, RequestStore, SignatureStore};

use crate::requests::derive_state;

/// One client-collected tuple awaiting reconciliation.
#[derive(Debug, Clone, Deserialize)]
pub struct OfflineItem {
    pub raw_rut: String,
    pub pin: String,
    /// When the client says the signature happened.
    pub client_timestamp: DateTime<Utc>,
}

/// Per-tuple reconciliation result.
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    /// The RUT exactly as submitted, so the client can correlate.
    pub rut: String,
    pub accepted: bool,
    pub signature_id: Option<SignatureId>,
    pub token: Option<String>,
    pub reason: Option<String>,
}

/// Aggregate result of one reconciliation batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub accepted: u32,
    pub rejected: u32,
    pub items: Vec<ItemOutcome>,
    /// The request created over the accepted subset.
    pub request_id: RequestId,
    pub request_state: RequestState,
}

/// The identity a tuple resolved to — a worker, or a bare user standing in
/// for one.
struct ResolvedSigner {
    /// Id string the stored PIN hash was computed with.
    hash_key: String,
    worker_id: WorkerId,
    user_id: Option<UserId>,
    name: String,
    enabled: bool,
    pin_hash: Option<String>,
}

/// Replays offline signature batches.
pub struct OfflineReconciler<'a> {
    identities: &'a IdentityStore,
    signatures: &'a SignatureStore,
    requests: &'a RequestStore,
    codec: PinCodec,
    tokens: TokenGenerator,
    max_batch: usize,
}

impl<'a> OfflineReconciler<'a> {
    pub fn new(
        config: &SignatureConfig,
        identities: &'a IdentityStore,
        signatures: &'a SignatureStore,
        requests: &'a RequestStore,
    ) -> Self {
        Self {
            identities,
            signatures,
            requests,
            codec: PinCodec::new(config.pin_salt.clone()),
            tokens: TokenGenerator::new(config.pin_salt.clone()),
            max_batch: config.max_offline_batch,
        }
    }

    /// Process a batch, producing a per-item outcome list and a
    /// `SignatureRequest` over the accepted subset.
    ///
    /// Individual failures never abort the batch; zero acceptances is a
    /// reported outcome, not an error of the call.
    #[instrument(skip(self, items, ctx), fields(batch_size = items.len()))]
    pub fn process(
        &self,
        items: &[OfflineItem],
        requested_by: &UserId,
        purpose: SignaturePurpose,
        reference: &str,
        ctx: &RequestContext,
    ) -> Result<BatchOutcome> {
        if items.is_empty() {
            return Err(RubricaError::Validation("empty offline batch".into()));
        }
        if items.len() > self.max_batch {
            return Err(RubricaError::Validation(format!(
                "batch of {} exceeds limit of {}",
                items.len(),
                self.max_batch
            )));
        }

        let mut outcomes = Vec::with_capacity(items.len());
        let mut accepted_signers = Vec::new();

        for item in items {
            match self.process_item(item, purpose, reference, ctx) {
                Ok((signature, signer)) => {
                    accepted_signers.push(RequiredSigner {
                        worker_id: signer.worker_id,
                        name: signer.name,
                        completed: true,
                        signature_id: Some(signature.id),
                    });
                    outcomes.push(ItemOutcome {
                        rut: item.raw_rut.clone(),
                        accepted: true,
                        signature_id: Some(signature.id),
                        token: Some(signature.token),
                        reason: None,
                    });
                }
                Err(e) => {
                    debug!(rut = %item.raw_rut, reason = %e, "tuple rejected");
                    outcomes.push(ItemOutcome {
                        rut: item.raw_rut.clone(),
                        accepted: false,
                        signature_id: None,
                        token: None,
                        reason: Some(reject_reason(e)),
                    });
                }
            }
        }

        let accepted = accepted_signers.len() as u32;
        let attempted = items.len() as u32;

        // The request mirrors the whole batch: `required` counts every
        // attempted tuple, the signer array carries the accepted subset.
        let mut request = SignatureRequest::new(
            purpose,
            reference.to_string(),
            *requested_by,
            accepted_signers,
        );
        request.required = attempted;
        request.completed = accepted;
        request.state = derive_state(accepted, attempted, RequestState::Pending);
        self.requests.insert_request(&request)?;

        info!(
            accepted,
            rejected = attempted - accepted,
            request_id = %request.id,
            "offline batch reconciled"
        );

        Ok(BatchOutcome {
            accepted,
            rejected: attempted - accepted,
            items: outcomes,
            request_id: request.id,
            request_state: request.state,
        })
    }

    /// Validate and record one tuple.
    fn process_item(
        &self,
        item: &OfflineItem,
        purpose: SignaturePurpose,
        reference: &str,
        ctx: &RequestContext,
    ) -> Result<(Signature, ResolvedSigner)> {
        let canonical = normalize_rut(&item.raw_rut)?;
        let signer = self.resolve_identity(&canonical)?;

        if !signer.enabled {
            return Err(RubricaError::Auth("not enabled".into()));
        }
        let stored = signer
            .pin_hash
            .as_deref()
            .ok_or_else(|| RubricaError::Validation("no PIN configured".into()))?;
        // Always the resolved identity's own id — never a foreign one.
        if !self.codec.verify_pin(&item.pin, stored, &signer.hash_key) {
            return Err(RubricaError::Auth("invalid PIN".into()));
        }

        let signature = Signature {
            id: SignatureId::new(),
            token: self.tokens.generate()?,
            worker_id: signer.worker_id,
            user_id: signer.user_id,
            purpose,
            reference: reference.to_string(),
            // The client's clock is the attested signing time; the server
            // clock is recorded separately.
            signed_at: item.client_timestamp,
            recorded_at: Utc::now(),
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            method: ValidationMethod::PinOffline,
            state: SignatureState::Valid,
            dispute: None,
        };
        self.signatures.insert_signature(&signature)?;

        Ok((signature, signer))
    }

    /// Worker-first identity resolution on a canonical RUT.
    ///
    /// Order: worker record, then user record — preferring the user's
    /// linked worker, falling back to the bare user when it carries its
    /// own PIN hash (its id then substitutes for the worker id).
    fn resolve_identity(&self, canonical: &str) -> Result<ResolvedSigner> {
        if let Some(worker) = self.identities.find_worker_by_rut(canonical)? {
            return Ok(ResolvedSigner {
                hash_key: worker.id.to_string(),
                worker_id: worker.id,
                user_id: worker.user_id,
                name: worker.name,
                enabled: worker.enabled,
                pin_hash: worker.pin_hash,
            });
        }

        if let Some(user) = self.identities.find_user_by_rut(canonical)? {
            if let Some(worker_id) = user.worker_id {
                if let Some(worker) = self.identities.get_worker(&worker_id)? {
                    return Ok(ResolvedSigner {
                        hash_key: worker.id.to_string(),
                        worker_id: worker.id,
                        user_id: Some(user.id),
                        name: worker.name,
                        enabled: worker.enabled,
                        pin_hash: worker.pin_hash,
                    });
                }
            }
            if user.pin_hash.is_some() {
                return Ok(ResolvedSigner {
                    hash_key: user.id.to_string(),
                    worker_id: WorkerId(user.id.0),
                    user_id: Some(user.id),
                    name: user.name,
                    enabled: user.enabled,
                    pin_hash: user.pin_hash,
                });
            }
        }

        Err(RubricaError::NotFound("identity not found".into()))
    }
}

/// Strip the taxonomy prefix for the per-item outcome list: the client
/// wants "invalid PIN", not "authentication failed: invalid PIN".
fn reject_reason(e: RubricaError) -> String {
    match e {
        RubricaError::Validation(m)
        | RubricaError::NotFound(m)
        | RubricaError::Auth(m)
        | RubricaError::Conflict(m) => m,
        other => other.to_string(),
    }
}
