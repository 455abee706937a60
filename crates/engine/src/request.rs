//! Inputs to orchestrator operations.

use quire_core::{normalize_email, EnvelopeStatus, SignatureField, Signer, SignerRole, SigningMode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignerInput {
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub role: SignerRole,
    /// Defaults to the signer's 1-based position in the list.
    #[serde(default)]
    pub order: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateEnvelope {
    #[serde(default)]
    pub owner_id: String,
    pub title: String,
    #[serde(default)]
    pub message: Option<String>,
    pub document_ref: String,
    #[serde(default = "default_mode")]
    pub signing_mode: SigningMode,
    pub signers: Vec<SignerInput>,
    /// Optional initial field set, validated like an update.
    #[serde(default)]
    pub fields: Vec<SignatureField>,
    #[serde(default)]
    pub expires_in_days: Option<u32>,
}

impl CreateEnvelope {
    /// Normalized signers, with missing orders filled from list position.
    pub fn signers(&self) -> Vec<Signer> {
        self.signers
            .iter()
            .enumerate()
            .map(|(i, s)| Signer::new(&s.email, &s.name, s.role, s.order.unwrap_or(i as u32 + 1)))
            .collect()
    }
}

/// Trimmed ids and normalized assignees. Captured values never come in
/// through a field update.
pub fn normalize_fields(fields: Vec<SignatureField>) -> Vec<SignatureField> {
    fields
        .into_iter()
        .map(|mut f| {
            f.id = f.id.trim().to_string();
            f.assignee_email = normalize_email(&f.assignee_email);
            f.value = None;
            f.signed_at = None;
            f
        })
        .collect()
}

fn default_mode() -> SigningMode {
    SigningMode::Parallel
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub status: Option<EnvelopeStatus>,
    /// 0 means the default page size.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl ListQuery {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 500;

    pub fn effective_limit(&self) -> usize {
        match self.limit {
            0 => Self::DEFAULT_LIMIT,
            n => n.min(Self::MAX_LIMIT),
        }
    }
}
