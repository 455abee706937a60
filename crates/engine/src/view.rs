//! Read models returned by the orchestrator.

use quire_core::{
    Envelope, EnvelopeStatus, SealedDocument, SignatureField, SignerStatus, SigningMode,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// What a signer sees when opening their link: their own fields only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningSession {
    pub envelope_id: String,
    pub title: String,
    pub message: String,
    pub document_ref: String,
    pub signer_email: String,
    pub signer_name: String,
    pub fields: Vec<SignatureField>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
}

impl SigningSession {
    pub fn for_signer(envelope: &Envelope, email: &str) -> Self {
        let name = envelope
            .signer(email)
            .map(|s| s.name.clone())
            .unwrap_or_default();
        Self {
            envelope_id: envelope.id.clone(),
            title: envelope.title.clone(),
            message: envelope.message.clone(),
            document_ref: envelope.document_ref.clone(),
            signer_email: email.to_string(),
            signer_name: name,
            fields: envelope.fields_for(email).cloned().collect(),
            expires_at: envelope.expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerSummary {
    pub email: String,
    pub name: String,
    pub order: u32,
    pub status: SignerStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub signed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeSummary {
    pub id: String,
    pub owner_id: String,
    pub title: String,
    pub status: EnvelopeStatus,
    pub signing_mode: SigningMode,
    pub signed: usize,
    pub total: usize,
    pub signers: Vec<SignerSummary>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed: Option<SealedDocument>,
}

impl EnvelopeSummary {
    pub fn of(envelope: &Envelope) -> Self {
        let mut signers: Vec<SignerSummary> = envelope
            .signers
            .iter()
            .map(|s| SignerSummary {
                email: s.email.clone(),
                name: s.name.clone(),
                order: s.order,
                status: s.status,
                signed_at: s.signed_at,
            })
            .collect();
        signers.sort_by_key(|s| s.order);
        Self {
            id: envelope.id.clone(),
            owner_id: envelope.owner_id.clone(),
            title: envelope.title.clone(),
            status: envelope.status,
            signing_mode: envelope.signing_mode,
            signed: signers
                .iter()
                .filter(|s| s.status == SignerStatus::Signed)
                .count(),
            total: signers.len(),
            signers,
            created_at: envelope.created_at,
            expires_at: envelope.expires_at,
            completed_at: envelope.completed_at,
            sealed: envelope.sealed.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopePage {
    pub items: Vec<EnvelopeSummary>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}
