//! quire-core: envelope data model and the pure validation rules shared by
//! every entry point of the signing workflow.
//!
//! # Public API
//!
//! - Model types: [`Envelope`], [`Signer`], [`SignatureField`], [`AuditEvent`]
//! - [`normalize_email()`] -- the one place emails are canonicalized
//! - [`validate_fields()`] / [`validate_signers()`] -- field placement and
//!   signer list validation, reporting every violation at once
//! - [`validate_transition()`] -- the envelope status table

pub mod email;
pub mod model;
pub mod status;
pub mod validate;

pub use email::{is_well_formed, normalize_email};
pub use model::{
    AuditEvent, AuditKind, ClientInfo, DeclineActor, DeclineInfo, Envelope, EnvelopeStatus,
    FieldType, Position, SealedDocument, SignatureField, Signer, SignerRole, SignerStatus,
    SigningMode,
};
pub use status::{allowed_transitions, validate_transition, TransitionError};
pub use validate::{validate_fields, validate_signers, SignerViolation, Violation};
