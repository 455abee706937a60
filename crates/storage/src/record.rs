use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Lifecycle state of a signer access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    /// Reserved for a sequential signer whose turn has not come yet.
    Dormant,
    /// Issued; may be verified and consumed.
    Active,
    /// Used by a successful submission or decline. Never validates again.
    Consumed,
    /// Superseded by a re-issue, or invalidated when the envelope closed.
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeReason {
    /// A newer token was issued to the same signer.
    Superseded,
    /// The envelope was declined, cancelled or expired.
    EnvelopeClosed,
}

/// A row of the token table, keyed by `token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token: String,
    pub envelope_id: String,
    pub signer_email: String,
    pub state: TokenState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub activated_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub consumed_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_reason: Option<RevokeReason>,
}

/// A state change applied to a token by compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenChange {
    Activate { at: OffsetDateTime },
    Consume { at: OffsetDateTime },
    Revoke { at: OffsetDateTime, reason: RevokeReason },
}

impl TokenChange {
    /// State the token is in after the change.
    pub fn target(&self) -> TokenState {
        match self {
            TokenChange::Activate { .. } => TokenState::Active,
            TokenChange::Consume { .. } => TokenState::Consumed,
            TokenChange::Revoke { .. } => TokenState::Revoked,
        }
    }

    /// Apply to a record. Backends call this after their state check passed.
    pub fn apply(&self, record: &mut TokenRecord) {
        record.state = self.target();
        match *self {
            TokenChange::Activate { at } => record.activated_at = Some(at),
            TokenChange::Consume { at } => record.consumed_at = Some(at),
            TokenChange::Revoke { at, reason } => {
                record.revoked_at = Some(at);
                record.revoke_reason = Some(reason);
            }
        }
    }
}

/// Query filter for [`crate::EnvelopeStore::list_envelopes`].
#[derive(Debug, Clone, Default)]
pub struct EnvelopeFilter {
    pub owner_id: Option<String>,
    pub status: Option<quire_core::EnvelopeStatus>,
    /// Only envelopes whose `expires_at` is strictly before this instant.
    pub expires_before: Option<OffsetDateTime>,
    /// Skip envelopes in a terminal status.
    pub open_only: bool,
}

impl EnvelopeFilter {
    pub fn matches(&self, envelope: &quire_core::Envelope) -> bool {
        if let Some(owner) = &self.owner_id {
            if &envelope.owner_id != owner {
                return false;
            }
        }
        if let Some(status) = self.status {
            if envelope.status != status {
                return false;
            }
        }
        if let Some(cutoff) = self.expires_before {
            if envelope.expires_at >= cutoff {
                return false;
            }
        }
        !(self.open_only && envelope.status.is_terminal())
    }
}

/// First eight characters of a token, for logs and error messages.
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{prefix}...")
}
