//! Envelope data model: envelopes, signers, signature fields and the audit
//! trail attached to each envelope.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Whether signers may act simultaneously or strictly by `order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SigningMode {
    Parallel,
    Sequential,
}

/// Envelope lifecycle status. See [`crate::status`] for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeStatus {
    Draft,
    Ready,
    Sent,
    InProgress,
    Completed,
    Expired,
    Declined,
}

impl EnvelopeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeStatus::Draft => "DRAFT",
            EnvelopeStatus::Ready => "READY",
            EnvelopeStatus::Sent => "SENT",
            EnvelopeStatus::InProgress => "IN_PROGRESS",
            EnvelopeStatus::Completed => "COMPLETED",
            EnvelopeStatus::Expired => "EXPIRED",
            EnvelopeStatus::Declined => "DECLINED",
        }
    }

    /// Parse the wire representation (`"IN_PROGRESS"` etc.), case-insensitive.
    pub fn parse(raw: &str) -> Option<Self> {
        let status = match raw.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => EnvelopeStatus::Draft,
            "READY" => EnvelopeStatus::Ready,
            "SENT" => EnvelopeStatus::Sent,
            "IN_PROGRESS" => EnvelopeStatus::InProgress,
            "COMPLETED" => EnvelopeStatus::Completed,
            "EXPIRED" => EnvelopeStatus::Expired,
            "DECLINED" => EnvelopeStatus::Declined,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnvelopeStatus::Completed | EnvelopeStatus::Expired | EnvelopeStatus::Declined
        )
    }

    /// Sent or partially signed: signers hold live tokens.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, EnvelopeStatus::Sent | EnvelopeStatus::InProgress)
    }
}

impl std::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerRole {
    Sender,
    #[default]
    Signer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignerStatus {
    Pending,
    Active,
    Signed,
    Declined,
}

/// Network metadata captured from the request that signed or declined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl ClientInfo {
    pub fn is_empty(&self) -> bool {
        self.ip.is_none() && self.user_agent.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signer {
    /// Lower-cased and trimmed. See [`crate::email::normalize_email`].
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub role: SignerRole,
    /// 1-based, unique within the envelope.
    pub order: u32,
    pub status: SignerStatus,
    /// The currently issued access token, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub signed_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
}

impl Signer {
    pub fn new(email: &str, name: &str, role: SignerRole, order: u32) -> Self {
        Signer {
            email: crate::email::normalize_email(email),
            name: name.trim().to_string(),
            role,
            order,
            status: SignerStatus::Pending,
            token: None,
            signed_at: None,
            client: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Signature,
    Initials,
    Date,
    Text,
}

impl FieldType {
    /// Signature and initials capture an image; date and text capture text.
    pub fn captures_image(&self) -> bool {
        matches!(self, FieldType::Signature | FieldType::Initials)
    }
}

/// Field rectangle in PDF points, origin at the page's lower-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureField {
    pub id: String,
    pub assignee_email: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// 1-based page number.
    pub page: u32,
    pub position: Position,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Captured value: a `data:image/png;base64,...` URL for image fields,
    /// plain text otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub signed_at: Option<OffsetDateTime>,
}

fn default_required() -> bool {
    true
}

/// Reference and integrity hash of the sealed output document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedDocument {
    pub document_ref: String,
    /// Lower-case hex SHA-256 of the sealed bytes.
    pub sha256: String,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub sealed_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeclineActor {
    Signer { email: String },
    Owner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclineInfo {
    pub by: DeclineActor,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditKind {
    Created,
    FieldsUpdated,
    Sent,
    Opened,
    Signed,
    Completed,
    Declined,
    Cancelled,
    Expired,
    ReminderSent,
    LinkReissued,
    LinkCopied,
    Sealed,
    SealingFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub message: String,
    /// Opaque reference to the source PDF in the blob store.
    pub document_ref: String,
    pub signing_mode: SigningMode,
    pub status: EnvelopeStatus,
    pub signers: Vec<Signer>,
    pub fields: Vec<SignatureField>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed: Option<SealedDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline: Option<DeclineInfo>,
    #[serde(default)]
    pub audit: Vec<AuditEvent>,
    /// Incremented by the store on every committed update.
    pub version: i64,
}

impl Envelope {
    pub fn signer(&self, email: &str) -> Option<&Signer> {
        self.signers.iter().find(|s| s.email == email)
    }

    pub fn signer_mut(&mut self, email: &str) -> Option<&mut Signer> {
        self.signers.iter_mut().find(|s| s.email == email)
    }

    /// Fields assigned to `email`, in envelope order.
    pub fn fields_for<'a>(&'a self, email: &'a str) -> impl Iterator<Item = &'a SignatureField> {
        self.fields.iter().filter(move |f| f.assignee_email == email)
    }

    pub fn all_signed(&self) -> bool {
        !self.signers.is_empty()
            && self
                .signers
                .iter()
                .all(|s| s.status == SignerStatus::Signed)
    }

    /// The lowest-`order` signer still `PENDING`, if any.
    pub fn next_pending_signer(&self) -> Option<&Signer> {
        self.signers
            .iter()
            .filter(|s| s.status == SignerStatus::Pending)
            .min_by_key(|s| s.order)
    }

    pub fn is_past_expiry(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Append an audit event.
    pub fn record(
        &mut self,
        kind: AuditKind,
        at: OffsetDateTime,
        actor: Option<&str>,
        client: Option<&ClientInfo>,
        detail: serde_json::Value,
    ) {
        self.audit.push(AuditEvent {
            kind,
            at,
            actor: actor.map(str::to_owned),
            client: client.filter(|c| !c.is_empty()).cloned(),
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn envelope() -> Envelope {
        let mut second = Signer::new("B@Example.com", "Bea", SignerRole::Signer, 2);
        second.status = SignerStatus::Pending;
        Envelope {
            id: "env-1".to_string(),
            owner_id: "owner".to_string(),
            title: "NDA".to_string(),
            message: String::new(),
            document_ref: "docs/nda.pdf".to_string(),
            signing_mode: SigningMode::Sequential,
            status: EnvelopeStatus::Draft,
            signers: vec![
                Signer::new(" a@example.com ", " Ann ", SignerRole::Sender, 1),
                second,
            ],
            fields: vec![],
            created_at: datetime!(2026-01-01 00:00 UTC),
            expires_at: datetime!(2026-01-15 00:00 UTC),
            completed_at: None,
            sealed: None,
            decline: None,
            audit: vec![],
            version: 0,
        }
    }

    #[test]
    fn signer_new_normalizes_email_and_name() {
        let env = envelope();
        assert_eq!(env.signers[0].email, "a@example.com");
        assert_eq!(env.signers[0].name, "Ann");
        assert_eq!(env.signers[1].email, "b@example.com");
    }

    #[test]
    fn next_pending_signer_uses_lowest_order() {
        let mut env = envelope();
        env.signers.reverse();
        assert_eq!(env.next_pending_signer().unwrap().order, 1);
        env.signer_mut("a@example.com").unwrap().status = SignerStatus::Signed;
        assert_eq!(env.next_pending_signer().unwrap().email, "b@example.com");
    }

    #[test]
    fn all_signed_requires_every_signer() {
        let mut env = envelope();
        assert!(!env.all_signed());
        for s in &mut env.signers {
            s.status = SignerStatus::Signed;
        }
        assert!(env.all_signed());
    }

    #[test]
    fn status_wire_format_round_trips() {
        let json = serde_json::to_string(&EnvelopeStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        assert_eq!(
            EnvelopeStatus::parse("in_progress"),
            Some(EnvelopeStatus::InProgress)
        );
        assert_eq!(EnvelopeStatus::parse("voided"), None);
    }

    #[test]
    fn record_drops_empty_client_info() {
        let mut env = envelope();
        env.record(
            AuditKind::Opened,
            datetime!(2026-01-02 00:00 UTC),
            Some("a@example.com"),
            Some(&ClientInfo::default()),
            serde_json::Value::Null,
        );
        assert_eq!(env.audit.len(), 1);
        assert!(env.audit[0].client.is_none());
    }
}
