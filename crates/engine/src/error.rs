use quire_core::{EnvelopeStatus, SignerViolation, TransitionError, Violation};
use quire_storage::{StorageError, TokenState};

use crate::values::ValueViolation;

/// Errors from a [`crate::blob::BlobStore`].
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("blob not found: {key}")]
    NotFound { key: String },

    /// Keys are relative, '/'-separated and may not contain '..'.
    #[error("invalid blob key: {key}")]
    InvalidKey { key: String },

    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("blob backend error: {0}")]
    Backend(String),
}

/// A notification could not be delivered. Never fails the request.
#[derive(Debug, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Why a token does not grant access.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Unknown, superseded or revoked.
    #[error("invalid signing token")]
    Invalid,

    #[error("signing token has expired")]
    Expired,

    /// Sequential envelope, and an earlier signer has not signed yet.
    #[error("it is not this signer's turn yet")]
    NotYetActive,

    #[error("signing token has already been used")]
    AlreadyUsed,

    #[error(transparent)]
    Storage(StorageError),
}

/// Sealing failures. The envelope stays `IN_PROGRESS` and can be finalized
/// again once the cause is fixed.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("source document '{document_ref}' is missing")]
    SourceMissing { document_ref: String },

    #[error("envelope has unsigned signers")]
    NotFullySigned,

    #[error("required field '{field_id}' has no captured value")]
    MissingValue { field_id: String },

    #[error("could not render field '{field_id}': {reason}")]
    Render { field_id: String, reason: String },

    #[error("could not process source document: {reason}")]
    Document { reason: String },

    #[error(transparent)]
    Blob(#[from] BlobError),
}

/// Every failure an orchestrator operation can report.
///
/// [`EnvelopeError::code`] is the stable wire code; HTTP status mapping
/// lives in the server.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid signer list ({} problem(s))", .0.len())]
    InvalidSigners(Vec<SignerViolation>),

    #[error("field placement validation failed ({} problem(s))", .0.len())]
    ValidationFailed(Vec<Violation>),

    #[error("envelope is {status}; fields can only change in DRAFT")]
    EnvelopeLocked { status: EnvelopeStatus },

    #[error("envelope is {status} and can no longer be sent")]
    AlreadySent { status: EnvelopeStatus },

    #[error("invalid signing token")]
    InvalidToken,

    #[error("envelope has expired")]
    Expired,

    #[error("it is not this signer's turn yet")]
    NotYetActive,

    #[error("signing token has already been used")]
    AlreadyUsed,

    #[error("submitted values are incomplete or invalid ({} problem(s))", .0.len())]
    IncompleteValues(Vec<ValueViolation>),

    #[error("envelope has been declined")]
    EnvelopeDeclined,

    #[error("envelope is already completed")]
    EnvelopeCompleted,

    #[error("envelope not found: {envelope_id}")]
    NotFound { envelope_id: String },

    #[error("no signer '{email}' on this envelope")]
    SignerNotFound { email: String },

    #[error("envelope is {status}, not awaiting signatures")]
    NotInFlight { status: EnvelopeStatus },

    #[error("envelope is {status} and not fully signed")]
    NotReadyToSeal { status: EnvelopeStatus },

    #[error("sealing failed: {0}")]
    SealingFailed(#[source] SealError),

    #[error("{message}")]
    InvalidRequest { message: String },

    /// Version conflicts persisted past `max_commit_attempts`.
    #[error("envelope {envelope_id} is busy, retry later")]
    Contention { envelope_id: String },

    #[error("illegal status transition: {0}")]
    Transition(TransitionError),

    #[error(transparent)]
    Storage(StorageError),
}

impl EnvelopeError {
    pub fn code(&self) -> &'static str {
        match self {
            EnvelopeError::InvalidSigners(_) => "INVALID_SIGNERS",
            EnvelopeError::ValidationFailed(_) => "VALIDATION_FAILED",
            EnvelopeError::EnvelopeLocked { .. } => "ENVELOPE_LOCKED",
            EnvelopeError::AlreadySent { .. } => "ALREADY_SENT",
            EnvelopeError::InvalidToken => "INVALID_TOKEN",
            EnvelopeError::Expired => "EXPIRED",
            EnvelopeError::NotYetActive => "NOT_YET_ACTIVE",
            EnvelopeError::AlreadyUsed => "ALREADY_USED",
            EnvelopeError::IncompleteValues(_) => "INCOMPLETE_VALUES",
            EnvelopeError::EnvelopeDeclined => "ENVELOPE_DECLINED",
            EnvelopeError::EnvelopeCompleted => "ENVELOPE_COMPLETED",
            EnvelopeError::NotFound { .. } => "NOT_FOUND",
            EnvelopeError::SignerNotFound { .. } => "SIGNER_NOT_FOUND",
            EnvelopeError::NotInFlight { .. } => "NOT_IN_FLIGHT",
            EnvelopeError::NotReadyToSeal { .. } => "NOT_READY_TO_SEAL",
            EnvelopeError::SealingFailed(_) => "SEALING_FAILED",
            EnvelopeError::InvalidRequest { .. } => "INVALID_REQUEST",
            EnvelopeError::Contention { .. } => "CONFLICT",
            EnvelopeError::Transition(_) => "CONFLICT",
            EnvelopeError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// The itemized problem list for validation-style errors.
    pub fn violations(&self) -> Option<serde_json::Value> {
        let value = match self {
            EnvelopeError::InvalidSigners(v) => serde_json::to_value(v),
            EnvelopeError::ValidationFailed(v) => serde_json::to_value(v),
            EnvelopeError::IncompleteValues(v) => serde_json::to_value(v),
            _ => return None,
        };
        value.ok()
    }

    /// The envelope of a version conflict the caller should retry with
    /// fresh state.
    pub(crate) fn conflicting_envelope(&self) -> Option<&str> {
        match self {
            EnvelopeError::Storage(StorageError::ConcurrentConflict { envelope_id, .. }) => {
                Some(envelope_id)
            }
            _ => None,
        }
    }
}

impl From<StorageError> for EnvelopeError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::EnvelopeNotFound { envelope_id } => EnvelopeError::NotFound { envelope_id },
            // A token compare-and-set lost at commit time.
            StorageError::TokenStateConflict { actual, .. } => match actual {
                TokenState::Consumed => EnvelopeError::AlreadyUsed,
                TokenState::Dormant => EnvelopeError::NotYetActive,
                TokenState::Active | TokenState::Revoked => EnvelopeError::InvalidToken,
            },
            StorageError::TokenNotFound { .. } => EnvelopeError::InvalidToken,
            other => EnvelopeError::Storage(other),
        }
    }
}

impl From<TokenError> for EnvelopeError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Invalid => EnvelopeError::InvalidToken,
            TokenError::Expired => EnvelopeError::Expired,
            TokenError::NotYetActive => EnvelopeError::NotYetActive,
            TokenError::AlreadyUsed => EnvelopeError::AlreadyUsed,
            TokenError::Storage(e) => EnvelopeError::from(e),
        }
    }
}

impl From<TransitionError> for EnvelopeError {
    fn from(err: TransitionError) -> Self {
        EnvelopeError::Transition(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_errors_map_to_wire_codes() {
        let cases = [
            (TokenError::Invalid, "INVALID_TOKEN"),
            (TokenError::Expired, "EXPIRED"),
            (TokenError::NotYetActive, "NOT_YET_ACTIVE"),
            (TokenError::AlreadyUsed, "ALREADY_USED"),
        ];
        for (err, code) in cases {
            assert_eq!(EnvelopeError::from(err).code(), code);
        }
    }

    #[test]
    fn missing_envelope_is_not_found() {
        let err = EnvelopeError::from(StorageError::EnvelopeNotFound {
            envelope_id: "env-9".to_string(),
        });
        assert_eq!(err.code(), "NOT_FOUND");
        assert_eq!(err.conflicting_envelope(), None);
    }

    #[test]
    fn version_conflict_names_its_envelope() {
        let err = EnvelopeError::from(StorageError::ConcurrentConflict {
            envelope_id: "env-3".to_string(),
            expected_version: 2,
            actual_version: 3,
        });
        assert_eq!(err.conflicting_envelope(), Some("env-3"));
    }

    #[test]
    fn lost_token_race_at_commit_is_already_used() {
        let err = EnvelopeError::from(StorageError::TokenStateConflict {
            token: "0123456789abcdef".to_string(),
            expected: TokenState::Active,
            actual: TokenState::Consumed,
        });
        assert_eq!(err.code(), "ALREADY_USED");
    }

    #[test]
    fn validation_errors_carry_violations() {
        let err = EnvelopeError::ValidationFailed(vec![Violation::MissingCoverage {
            email: "bob@example.com".to_string(),
        }]);
        let violations = err.violations().unwrap();
        assert_eq!(violations[0]["kind"], "missing_coverage");
        assert!(EnvelopeError::InvalidToken.violations().is_none());
    }
}
