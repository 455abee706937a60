//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use quire_core::{FieldType, Position, SignatureField, SignerRole, SigningMode};
use quire_engine::{
    CreateEnvelope, DocumentRenderer, EngineConfig, FieldValues, ManualClock, MemoryBlobStore,
    Orchestrator, RecordingNotifier, SignerInput, StampRenderer,
};
use quire_storage::MemoryStore;
use time::macros::datetime;
use time::OffsetDateTime;

pub const SOURCE_REF: &str = "docs/contract.pdf";
pub const SOURCE_PDF: &[u8] = b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\n";
pub const SIGNATURE: &str = "data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAE=";
pub const START: OffsetDateTime = datetime!(2026-03-02 09:00 UTC);

pub struct Harness {
    pub engine: Orchestrator<MemoryStore>,
    pub store: Arc<MemoryStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_blobs(MemoryBlobStore::new().with_blob(SOURCE_REF, SOURCE_PDF))
    }

    /// A harness whose blob store lacks the source document.
    pub fn without_source() -> Self {
        Self::with_blobs(MemoryBlobStore::new())
    }

    /// Seal through `renderer` instead of the stamp renderer.
    pub fn rendering_with(self, renderer: Arc<dyn DocumentRenderer>) -> Self {
        Self {
            engine: self.engine.with_renderer(renderer),
            ..self
        }
    }

    fn with_blobs(blobs: MemoryBlobStore) -> Self {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(blobs);
        let notifier = Arc::new(RecordingNotifier::new());
        let clock = Arc::new(ManualClock::new(START));
        let engine = Orchestrator::new(
            store.clone(),
            blobs.clone(),
            notifier.clone(),
            clock.clone(),
            EngineConfig::default(),
        )
        .with_renderer(Arc::new(StampRenderer));
        Self {
            engine,
            store,
            blobs,
            notifier,
            clock,
        }
    }

    /// Create an envelope with one required signature field per signer.
    pub async fn create(&self, mode: SigningMode, emails: &[&str]) -> String {
        let request = request(mode, emails);
        self.engine
            .create_envelope(request)
            .await
            .expect("create envelope")
            .id
    }

    /// Create and send; returns the envelope id.
    pub async fn sent(&self, mode: SigningMode, emails: &[&str]) -> String {
        let id = self.create(mode, emails).await;
        self.engine.send(&id).await.expect("send envelope");
        id
    }

    /// The most recent link `email` was invited with.
    pub fn link(&self, email: &str) -> String {
        self.notifier
            .invites_for(email)
            .pop()
            .unwrap_or_else(|| panic!("no invitation for {email}"))
    }
}

pub fn request(mode: SigningMode, emails: &[&str]) -> CreateEnvelope {
    CreateEnvelope {
        owner_id: "owner-1".to_string(),
        title: "Master services agreement".to_string(),
        message: Some("Please sign by Friday".to_string()),
        document_ref: SOURCE_REF.to_string(),
        signing_mode: mode,
        signers: emails
            .iter()
            .enumerate()
            .map(|(i, email)| SignerInput {
                email: email.to_string(),
                name: format!("Signer {}", i + 1),
                role: SignerRole::Signer,
                order: Some(i as u32 + 1),
            })
            .collect(),
        fields: emails.iter().map(|email| signature_field(email)).collect(),
        expires_in_days: None,
    }
}

pub fn signature_field(email: &str) -> SignatureField {
    SignatureField {
        id: format!("sig-{}", field_key(email)),
        assignee_email: email.to_string(),
        field_type: FieldType::Signature,
        page: 1,
        position: Position {
            x: 72.0,
            y: 96.0,
            width: 200.0,
            height: 50.0,
        },
        required: true,
        value: None,
        signed_at: None,
    }
}

/// Values that satisfy the fixture fields of `email`.
pub fn values_for(email: &str) -> FieldValues {
    let mut values = FieldValues::new();
    values.insert(format!("sig-{}", field_key(email)), SIGNATURE.to_string());
    values
}

fn field_key(email: &str) -> String {
    email
        .trim()
        .to_lowercase()
        .split('@')
        .next()
        .unwrap_or_default()
        .to_string()
}
