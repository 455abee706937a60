//! Document sealer.
//!
//! Renders every captured value onto the source document, hashes the result
//! and stores it content-addressed. Only data fixed once the last signer
//! signed enters the artifact, so sealing the same envelope twice yields the
//! same bytes and the same key.

use std::fmt::Write as _;
use std::sync::Arc;

use quire_core::{Envelope, FieldType, Position, SealedDocument, Signer};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::blob::{sha256_hex, BlobStore};
use crate::error::{BlobError, SealError};
use crate::values::{decode_image, parse_date};

/// One captured value and where it goes.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement<'a> {
    pub field_id: &'a str,
    pub field_type: FieldType,
    pub page: u32,
    pub position: Position,
    pub assignee_email: &'a str,
    pub value: &'a str,
}

/// Turns a source document plus placements into the flattened output.
///
/// Implementations must be deterministic in their inputs.
pub trait DocumentRenderer: Send + Sync {
    fn render(
        &self,
        source: &[u8],
        placements: &[Placement<'_>],
        signers: &[Signer],
    ) -> Result<Vec<u8>, SealError>;
}

/// Appends a plain-text seal section to the source bytes: one line per
/// placement, then one line per signer with the signing time and client
/// details. Accepts any source, so tests seal placeholder documents with it.
#[derive(Debug, Clone, Copy, Default)]
pub struct StampRenderer;

impl StampRenderer {
    fn stamp(placement: &Placement<'_>) -> Result<String, SealError> {
        let render_err = |reason: &str| SealError::Render {
            field_id: placement.field_id.to_string(),
            reason: reason.to_string(),
        };
        let body = match placement.field_type {
            FieldType::Signature | FieldType::Initials => {
                let image = decode_image(placement.value)
                    .ok_or_else(|| render_err("not a base64 image"))?;
                format!("image {} bytes sha256 {}", image.len(), sha256_hex(&image))
            }
            FieldType::Date => {
                let date = parse_date(placement.value).ok_or_else(|| render_err("not a date"))?;
                format!("text {:?}", date.to_string())
            }
            FieldType::Text => format!("text {:?}", placement.value),
        };
        let p = placement.position;
        Ok(format!(
            "% field {} {:?} page {} at {},{} size {}x{} by {}: {}",
            placement.field_id,
            placement.field_type,
            placement.page,
            p.x,
            p.y,
            p.width,
            p.height,
            placement.assignee_email,
            body
        ))
    }
}

impl DocumentRenderer for StampRenderer {
    fn render(
        &self,
        source: &[u8],
        placements: &[Placement<'_>],
        signers: &[Signer],
    ) -> Result<Vec<u8>, SealError> {
        let mut section = String::from("\n%% quire seal\n");
        for placement in placements {
            section.push_str(&Self::stamp(placement)?);
            section.push('\n');
        }
        let mut ordered: Vec<&Signer> = signers.iter().collect();
        ordered.sort_by_key(|s| s.order);
        for signer in ordered {
            let signed_at = match signer.signed_at {
                Some(at) => at.format(&Rfc3339).unwrap_or_default(),
                None => "-".to_string(),
            };
            let client = signer.client.clone().unwrap_or_default();
            let _ = writeln!(
                section,
                "% signer {} {:?} <{}> signed {} ip {} agent {:?}",
                signer.order,
                signer.name,
                signer.email,
                signed_at,
                client.ip.as_deref().unwrap_or("-"),
                client.user_agent.as_deref().unwrap_or("-"),
            );
        }
        section.push_str("%% end quire seal\n");

        let mut out = Vec::with_capacity(source.len() + section.len());
        out.extend_from_slice(source);
        out.extend_from_slice(section.as_bytes());
        Ok(out)
    }
}

pub struct Sealer {
    blobs: Arc<dyn BlobStore>,
    renderer: Arc<dyn DocumentRenderer>,
}

impl Sealer {
    pub fn new(blobs: Arc<dyn BlobStore>, renderer: Arc<dyn DocumentRenderer>) -> Self {
        Self { blobs, renderer }
    }

    /// Seal a fully signed envelope. `sealed_at` is recorded on the result
    /// but does not enter the artifact.
    pub async fn seal(
        &self,
        envelope: &Envelope,
        sealed_at: OffsetDateTime,
    ) -> Result<SealedDocument, SealError> {
        if !envelope.all_signed() {
            return Err(SealError::NotFullySigned);
        }

        let mut placements = Vec::with_capacity(envelope.fields.len());
        for field in &envelope.fields {
            match field.value.as_deref() {
                Some(value) => placements.push(Placement {
                    field_id: &field.id,
                    field_type: field.field_type,
                    page: field.page,
                    position: field.position,
                    assignee_email: &field.assignee_email,
                    value,
                }),
                None if field.required => {
                    return Err(SealError::MissingValue {
                        field_id: field.id.clone(),
                    })
                }
                None => {}
            }
        }
        placements.sort_by(|a, b| a.page.cmp(&b.page));

        let source = match self.blobs.get(&envelope.document_ref).await {
            Ok(bytes) => bytes,
            Err(BlobError::NotFound { .. }) => {
                return Err(SealError::SourceMissing {
                    document_ref: envelope.document_ref.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let rendered = self
            .renderer
            .render(&source, &placements, &envelope.signers)?;
        let address = self.blobs.put_content_addressed(rendered).await?;

        Ok(SealedDocument {
            document_ref: address.key,
            sha256: address.sha256,
            size: address.size,
            sealed_at,
        })
    }
}
