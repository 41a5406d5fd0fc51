// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Rubrica signature engine.
//
// Two identity records describe one physical person: a `User` (login
// credentials, role) and a `Worker` (the operational identity that signs).
// They should reference each other once both exist, but the engine must
// tolerate a missing or stale link — resynchronization lives in
// rubrica-engine, the shape of the drift lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a User (authentication identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

/// Unique identifier for a Worker (operational identity).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

/// Unique identifier for a Signature record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureId(pub Uuid);

/// Unique identifier for a SignatureRequest aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

macro_rules! impl_id {
    ($name:ident) => {
        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_id!(UserId);
impl_id!(WorkerId);
impl_id!(SignatureId);
impl_id!(RequestId);

/// What a role is allowed to do. Fixed per role, never stored per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    ManageUsers,
    ManageDocuments,
    RequestSignatures,
    ResolveDisputes,
    Sign,
    ViewRecords,
}

/// Authentication roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Preventionist,
    Worker,
}

impl Role {
    /// The fixed permission set associated with this role.
    pub fn permissions(&self) -> &'static [Permission] {
        match self {
            Self::Admin => &[
                Permission::ManageUsers,
                Permission::ManageDocuments,
                Permission::RequestSignatures,
                Permission::ResolveDisputes,
                Permission::Sign,
                Permission::ViewRecords,
            ],
            Self::Preventionist => &[
                Permission::ManageDocuments,
                Permission::RequestSignatures,
                Permission::ResolveDisputes,
                Permission::Sign,
                Permission::ViewRecords,
            ],
            Self::Worker => &[Permission::Sign, Permission::ViewRecords],
        }
    }

    pub fn can(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

/// Account lifecycle status, independent of enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Pending,
    Active,
    Suspended,
}

/// Authentication identity.
///
/// `pin_hash` stays `None` until enrollment; `enabled` flips permanently
/// true once the enrollment signature is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Canonical RUT (see `rubrica-credential`) — never the raw input.
    pub rut: String,
    pub name: String,
    pub role: Role,
    pub password_hash: String,
    pub pin_hash: Option<String>,
    pub enabled: bool,
    /// Back-reference to the linked Worker, when one exists.
    pub worker_id: Option<WorkerId>,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(rut: String, name: String, role: Role, password_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: UserId::new(),
            rut,
            name,
            role,
            password_hash,
            pin_hash: None,
            enabled: false,
            worker_id: None,
            status: UserStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Snapshot of the enrollment attestation, stored on the identity that
/// completed it so auditors can trace enablement without a ledger join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentSnapshot {
    pub signature_id: SignatureId,
    pub token: String,
    pub signed_at: DateTime<Utc>,
}

/// Operational identity bound to a physical person performing work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    /// Canonical RUT — equality across the system uses this form only.
    pub rut: String,
    pub name: String,
    pub pin_hash: Option<String>,
    pub enabled: bool,
    /// Back-reference to the linked User, when one exists.
    pub user_id: Option<UserId>,
    pub enrollment_signature: Option<EnrollmentSnapshot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(rut: String, name: String) -> Self {
        let now = Utc::now();
        Self {
            id: WorkerId::new(),
            rut,
            name,
            pin_hash: None,
            enabled: false,
            user_id: None,
            enrollment_signature: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a signature attests to. Closed set — illegal purposes cannot be
/// constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignaturePurpose {
    Enrollment,
    Document,
    Activity,
    Training,
}

/// How the signer was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationMethod {
    #[serde(rename = "PIN")]
    Pin,
    /// Collected without connectivity and replayed by the reconciliation
    /// processor.
    #[serde(rename = "PIN-OFFLINE")]
    PinOffline,
}

/// Lifecycle states of a signature's dispute sub-machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureState {
    Valid,
    Disputed,
    Revoked,
}

/// Terminal outcome of a dispute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeOutcome {
    /// The signature stands; a further dispute cycle remains possible.
    Valid,
    Revoked,
}

/// Resolution half of a dispute, absent while the dispute is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeResolution {
    pub outcome: DisputeOutcome,
    pub resolution: String,
    pub resolved_by: UserId,
    pub resolved_at: DateTime<Utc>,
}

/// Dispute detail attached to a signature once reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeInfo {
    pub reason: String,
    pub reported_by: UserId,
    pub reported_at: DateTime<Utc>,
    pub resolution: Option<DisputeResolution>,
}

/// Request metadata captured at signing time for evidentiary logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub ip: String,
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
}

impl RequestContext {
    pub fn capture(ip: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            user_agent: user_agent.into(),
            timestamp: Utc::now(),
        }
    }

    /// Fallback when the transport provides no metadata.
    pub fn unknown() -> Self {
        Self::capture("unknown", "unknown")
    }
}

/// An immutable attestation event.
///
/// Both identity ids are retained for traceability: either may be the sole
/// resolvable identity (a bare User signing offline has no Worker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub id: SignatureId,
    /// Opaque audit token — legible, high entropy, not a credential.
    pub token: String,
    pub worker_id: WorkerId,
    pub user_id: Option<UserId>,
    pub purpose: SignaturePurpose,
    /// Identifier of the signed entity (document, activity, ...).
    pub reference: String,
    /// Attested signing time — client-supplied on the offline path.
    pub signed_at: DateTime<Utc>,
    /// Server time when the record was written.
    pub recorded_at: DateTime<Utc>,
    pub ip: String,
    pub user_agent: String,
    pub method: ValidationMethod,
    pub state: SignatureState,
    pub dispute: Option<DisputeInfo>,
}

/// One required signer inside a `SignatureRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredSigner {
    pub worker_id: WorkerId,
    pub name: String,
    pub completed: bool,
    pub signature_id: Option<SignatureId>,
}

/// Overall state of a signature request.
///
/// Forward-only: `Completed` is never left via `on_signature_accepted`;
/// `Cancelled` and `Expired` are terminal side branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Expired,
}

/// Aggregate tracking N required signers for one unit of work.
///
/// Denormalized projection over the signature ledger; `required` and
/// `completed` are recomputed from `signers` after every accepted signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub id: RequestId,
    pub purpose: SignaturePurpose,
    pub reference: String,
    pub requested_by: UserId,
    pub signers: Vec<RequiredSigner>,
    pub required: u32,
    pub completed: u32,
    pub state: RequestState,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SignatureRequest {
    pub fn new(
        purpose: SignaturePurpose,
        reference: String,
        requested_by: UserId,
        signers: Vec<RequiredSigner>,
    ) -> Self {
        let now = Utc::now();
        let required = signers.len() as u32;
        Self {
            id: RequestId::new(),
            purpose,
            reference,
            requested_by,
            signers,
            required,
            completed: 0,
            state: RequestState::Pending,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}
