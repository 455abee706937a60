//! Signing sequencer: the envelope state machine.
//!
//! Every function here is pure. It checks the transition against
//! [`quire_core::validate_transition`], mutates an in-memory copy of the
//! envelope and reports which tokens the caller must mint or activate in the
//! same commit.

use quire_core::{
    validate_fields, validate_transition, AuditKind, ClientInfo, DeclineActor, DeclineInfo,
    Envelope, EnvelopeStatus, SealedDocument, SignerStatus, SigningMode,
};
use time::OffsetDateTime;

use crate::error::EnvelopeError;
use crate::values::FieldValues;

/// Token work a send requires, per signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenAction {
    /// The signer may act now.
    Issue { email: String },
    /// A later sequential signer; the token stays dormant until their turn.
    Reserve { email: String },
}

/// Result of applying one signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureOutcome {
    /// Sequential mode: the signer whose turn it now is.
    pub next_signer: Option<String>,
    pub all_signed: bool,
}

/// `DRAFT -> READY -> SENT`.
///
/// The field set is validated authoritatively first; an empty set never
/// reaches `READY`.
pub fn send(envelope: &mut Envelope, now: OffsetDateTime) -> Result<Vec<TokenAction>, EnvelopeError> {
    if envelope.status != EnvelopeStatus::Draft {
        return Err(EnvelopeError::AlreadySent {
            status: envelope.status,
        });
    }
    validate_fields(&envelope.signers, &envelope.fields).map_err(EnvelopeError::ValidationFailed)?;
    if envelope.fields.is_empty() {
        return Err(EnvelopeError::ValidationFailed(vec![]));
    }

    validate_transition(envelope.status, EnvelopeStatus::Ready)?;
    envelope.status = EnvelopeStatus::Ready;
    validate_transition(envelope.status, EnvelopeStatus::Sent)?;
    envelope.status = EnvelopeStatus::Sent;

    let first_order = envelope
        .next_pending_signer()
        .map(|s| s.order)
        .unwrap_or_default();
    let mut actions = Vec::with_capacity(envelope.signers.len());
    let mut signers: Vec<_> = envelope.signers.iter_mut().collect();
    signers.sort_by_key(|s| s.order);
    for signer in signers {
        let acts_now = match envelope.signing_mode {
            SigningMode::Parallel => true,
            SigningMode::Sequential => signer.order == first_order,
        };
        if acts_now {
            signer.status = SignerStatus::Active;
            actions.push(TokenAction::Issue {
                email: signer.email.clone(),
            });
        } else {
            signer.status = SignerStatus::Pending;
            actions.push(TokenAction::Reserve {
                email: signer.email.clone(),
            });
        }
    }

    let detail = serde_json::json!({
        "signing_mode": envelope.signing_mode,
        "signers": envelope.signers.len(),
    });
    envelope.record(AuditKind::Sent, now, None, None, detail);
    Ok(actions)
}

/// Record `email`'s signature: captured values, signer `SIGNED`, envelope
/// `IN_PROGRESS`. In sequential mode the next pending signer becomes active.
///
/// Values must already have passed [`crate::values::validate_values`].
pub fn apply_signature(
    envelope: &mut Envelope,
    email: &str,
    values: &FieldValues,
    client: Option<&ClientInfo>,
    now: OffsetDateTime,
) -> Result<SignatureOutcome, EnvelopeError> {
    guard_open(envelope)?;
    let signer = envelope
        .signer(email)
        .ok_or_else(|| EnvelopeError::SignerNotFound {
            email: email.to_string(),
        })?;
    match signer.status {
        SignerStatus::Active => {}
        SignerStatus::Pending => return Err(EnvelopeError::NotYetActive),
        SignerStatus::Signed => return Err(EnvelopeError::AlreadyUsed),
        SignerStatus::Declined => return Err(EnvelopeError::EnvelopeDeclined),
    }
    // Strict order: nobody with a lower order may still be unsigned.
    if envelope.signing_mode == SigningMode::Sequential {
        let order = signer.order;
        let blocked = envelope
            .signers
            .iter()
            .any(|s| s.order < order && s.status != SignerStatus::Signed);
        if blocked {
            return Err(EnvelopeError::NotYetActive);
        }
    }

    validate_transition(envelope.status, EnvelopeStatus::InProgress)?;
    envelope.status = EnvelopeStatus::InProgress;

    for field in envelope.fields.iter_mut().filter(|f| f.assignee_email == email) {
        if let Some(value) = values.get(&field.id).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            field.value = Some(value.to_string());
            field.signed_at = Some(now);
        }
    }
    if let Some(signer) = envelope.signer_mut(email) {
        signer.status = SignerStatus::Signed;
        signer.signed_at = Some(now);
        signer.client = client.filter(|c| !c.is_empty()).cloned();
    }
    envelope.record(
        AuditKind::Signed,
        now,
        Some(email),
        client,
        serde_json::json!({ "fields": values.len() }),
    );

    let mut next_signer = None;
    if envelope.signing_mode == SigningMode::Sequential {
        let next = envelope.next_pending_signer().map(|s| s.email.clone());
        if let Some(next) = next {
            if let Some(signer) = envelope.signer_mut(&next) {
                signer.status = SignerStatus::Active;
            }
            next_signer = Some(next);
        }
    }

    Ok(SignatureOutcome {
        next_signer,
        all_signed: envelope.all_signed(),
    })
}

/// `* -> DECLINED`, by a signer or by the owner cancelling.
pub fn apply_decline(
    envelope: &mut Envelope,
    by: DeclineActor,
    reason: &str,
    client: Option<&ClientInfo>,
    now: OffsetDateTime,
) -> Result<(), EnvelopeError> {
    guard_open(envelope)?;
    validate_transition(envelope.status, EnvelopeStatus::Declined)?;
    envelope.status = EnvelopeStatus::Declined;

    let (kind, actor) = match &by {
        DeclineActor::Signer { email } => {
            if let Some(signer) = envelope.signer_mut(email) {
                signer.status = SignerStatus::Declined;
                signer.client = client.filter(|c| !c.is_empty()).cloned();
            }
            (AuditKind::Declined, Some(email.clone()))
        }
        DeclineActor::Owner => (AuditKind::Cancelled, None),
    };
    let reason = reason.trim().to_string();
    envelope.record(
        kind,
        now,
        actor.as_deref(),
        client,
        serde_json::json!({ "reason": reason }),
    );
    envelope.decline = Some(DeclineInfo { by, reason, at: now });
    Ok(())
}

/// Pin a non-terminal envelope past its expiry to `EXPIRED`. Returns
/// whether anything changed.
///
/// A fully signed envelope only waits for sealing and never expires.
pub fn apply_expiry(envelope: &mut Envelope, now: OffsetDateTime) -> Result<bool, EnvelopeError> {
    if envelope.status.is_terminal() || envelope.all_signed() || !envelope.is_past_expiry(now) {
        return Ok(false);
    }
    validate_transition(envelope.status, EnvelopeStatus::Expired)?;
    envelope.status = EnvelopeStatus::Expired;
    let expires_at = envelope.expires_at;
    envelope.record(
        AuditKind::Expired,
        now,
        None,
        None,
        serde_json::json!({ "expires_at": expires_at.unix_timestamp() }),
    );
    Ok(true)
}

/// `IN_PROGRESS -> COMPLETED`, attaching the sealed document exactly once.
pub fn apply_completion(
    envelope: &mut Envelope,
    sealed: SealedDocument,
    now: OffsetDateTime,
) -> Result<(), EnvelopeError> {
    if !envelope.all_signed() {
        return Err(EnvelopeError::NotReadyToSeal {
            status: envelope.status,
        });
    }
    if envelope.sealed.is_some() {
        return Err(EnvelopeError::EnvelopeCompleted);
    }
    validate_transition(envelope.status, EnvelopeStatus::Completed)?;
    envelope.status = EnvelopeStatus::Completed;
    envelope.completed_at = Some(now);
    envelope.record(
        AuditKind::Sealed,
        now,
        None,
        None,
        serde_json::json!({ "document_ref": sealed.document_ref, "sha256": sealed.sha256 }),
    );
    envelope.record(AuditKind::Completed, now, None, None, serde_json::Value::Null);
    envelope.sealed = Some(sealed);
    Ok(())
}

/// Terminal envelopes reject every signer action with their own code.
pub fn guard_open(envelope: &Envelope) -> Result<(), EnvelopeError> {
    match envelope.status {
        EnvelopeStatus::Declined => Err(EnvelopeError::EnvelopeDeclined),
        EnvelopeStatus::Expired => Err(EnvelopeError::Expired),
        EnvelopeStatus::Completed => Err(EnvelopeError::EnvelopeCompleted),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::{FieldType, Position, SignatureField, Signer, SignerRole};
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-05-01 09:00 UTC);

    fn envelope(mode: SigningMode, emails: &[&str]) -> Envelope {
        let signers: Vec<Signer> = emails
            .iter()
            .enumerate()
            .map(|(i, e)| Signer::new(e, "Someone", SignerRole::Signer, i as u32 + 1))
            .collect();
        let fields = signers
            .iter()
            .map(|s| SignatureField {
                id: format!("sig-{}", s.order),
                assignee_email: s.email.clone(),
                field_type: FieldType::Text,
                page: 1,
                position: Position {
                    x: 1.0,
                    y: 1.0,
                    width: 10.0,
                    height: 10.0,
                },
                required: true,
                value: None,
                signed_at: None,
            })
            .collect();
        Envelope {
            id: "env-1".to_string(),
            owner_id: "owner".to_string(),
            title: "t".to_string(),
            message: String::new(),
            document_ref: "docs/t.pdf".to_string(),
            signing_mode: mode,
            status: EnvelopeStatus::Draft,
            signers,
            fields,
            created_at: NOW,
            expires_at: NOW + time::Duration::days(14),
            completed_at: None,
            sealed: None,
            decline: None,
            audit: vec![],
            version: 0,
        }
    }

    fn value_for(order: u32) -> FieldValues {
        [(format!("sig-{order}"), "yes".to_string())].into_iter().collect()
    }

    #[test]
    fn parallel_send_issues_to_everyone() {
        let mut env = envelope(SigningMode::Parallel, &["a@x.io", "b@x.io"]);
        let actions = send(&mut env, NOW).unwrap();
        assert_eq!(env.status, EnvelopeStatus::Sent);
        assert!(actions.iter().all(|a| matches!(a, TokenAction::Issue { .. })));
        assert!(env.signers.iter().all(|s| s.status == SignerStatus::Active));
    }

    #[test]
    fn sequential_send_issues_only_to_first() {
        let mut env = envelope(SigningMode::Sequential, &["a@x.io", "b@x.io", "c@x.io"]);
        let actions = send(&mut env, NOW).unwrap();
        assert_eq!(
            actions,
            vec![
                TokenAction::Issue {
                    email: "a@x.io".to_string()
                },
                TokenAction::Reserve {
                    email: "b@x.io".to_string()
                },
                TokenAction::Reserve {
                    email: "c@x.io".to_string()
                },
            ]
        );
    }

    #[test]
    fn send_twice_is_already_sent() {
        let mut env = envelope(SigningMode::Parallel, &["a@x.io"]);
        send(&mut env, NOW).unwrap();
        assert!(matches!(
            send(&mut env, NOW),
            Err(EnvelopeError::AlreadySent { .. })
        ));
    }

    #[test]
    fn send_without_fields_fails_validation() {
        let mut env = envelope(SigningMode::Parallel, &["a@x.io"]);
        env.fields.clear();
        assert!(matches!(
            send(&mut env, NOW),
            Err(EnvelopeError::ValidationFailed(_))
        ));
        assert_eq!(env.status, EnvelopeStatus::Draft);
    }

    #[test]
    fn sequential_signature_activates_next() {
        let mut env = envelope(SigningMode::Sequential, &["a@x.io", "b@x.io"]);
        send(&mut env, NOW).unwrap();
        assert!(matches!(
            apply_signature(&mut env, "b@x.io", &value_for(2), None, NOW),
            Err(EnvelopeError::NotYetActive)
        ));

        let outcome = apply_signature(&mut env, "a@x.io", &value_for(1), None, NOW).unwrap();
        assert_eq!(outcome.next_signer.as_deref(), Some("b@x.io"));
        assert!(!outcome.all_signed);
        assert_eq!(env.status, EnvelopeStatus::InProgress);

        let outcome = apply_signature(&mut env, "b@x.io", &value_for(2), None, NOW).unwrap();
        assert_eq!(outcome.next_signer, None);
        assert!(outcome.all_signed);
    }

    #[test]
    fn decline_is_terminal() {
        let mut env = envelope(SigningMode::Parallel, &["a@x.io", "b@x.io"]);
        send(&mut env, NOW).unwrap();
        apply_decline(
            &mut env,
            DeclineActor::Signer {
                email: "b@x.io".to_string(),
            },
            " wrong address ",
            None,
            NOW,
        )
        .unwrap();
        assert_eq!(env.status, EnvelopeStatus::Declined);
        assert_eq!(env.decline.as_ref().unwrap().reason, "wrong address");
        assert!(matches!(
            apply_signature(&mut env, "a@x.io", &value_for(1), None, NOW),
            Err(EnvelopeError::EnvelopeDeclined)
        ));
    }

    #[test]
    fn expiry_only_after_deadline() {
        let mut env = envelope(SigningMode::Parallel, &["a@x.io"]);
        let deadline = env.expires_at;
        assert!(!apply_expiry(&mut env, deadline).unwrap());
        let later = deadline + time::Duration::seconds(1);
        assert!(apply_expiry(&mut env, later).unwrap());
        assert_eq!(env.status, EnvelopeStatus::Expired);
        assert!(!apply_expiry(&mut env, later).unwrap());
    }
}
