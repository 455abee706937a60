//! Property tests for sequential ordering and send-time coverage.

mod common;

use common::{request, values_for, Harness};
use proptest::prelude::*;
use quire_core::{EnvelopeStatus, SignatureField, SigningMode};
use time::Duration;

const EMAILS: [&str; 4] = [
    "ann@example.com",
    "bob@example.com",
    "cy@example.com",
    "dee@example.com",
];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Whatever order signers try, a sequential envelope only accepts the
    /// lowest unsigned order; earlier signers see ALREADY_USED and later
    /// ones NOT_YET_ACTIVE.
    #[test]
    fn sequential_accepts_only_the_next_signer(
        count in 2usize..=4,
        attempts in prop::collection::vec(0usize..4, 0..12),
    ) {
        runtime().block_on(async {
            let h = Harness::new();
            let emails = &EMAILS[..count];
            let id = h.sent(SigningMode::Sequential, emails).await;

            let mut links = Vec::new();
            for email in emails {
                links.push(h.engine.copy_link(&id, email).await.unwrap());
            }

            let mut next = 0usize;
            let mut order: Vec<usize> = attempts.iter().map(|i| i % count).collect();
            // Finish the envelope after the random prefix.
            order.extend(0..count);

            for i in order {
                h.clock.advance(Duration::minutes(1));
                let result = h
                    .engine
                    .submit_signature(&links[i], values_for(emails[i]), None)
                    .await;
                if i == next {
                    prop_assert!(result.is_ok(), "signer {} should be accepted: {:?}", i, result.err());
                    next += 1;
                } else if i < next {
                    prop_assert_eq!(result.unwrap_err().code(), "ALREADY_USED");
                } else {
                    prop_assert_eq!(result.unwrap_err().code(), "NOT_YET_ACTIVE");
                }
            }

            let envelope = h.engine.get_envelope(&id).await.unwrap();
            prop_assert_eq!(envelope.status, EnvelopeStatus::Completed);
            let mut signers = envelope.signers.clone();
            signers.sort_by_key(|s| s.order);
            for pair in signers.windows(2) {
                prop_assert!(pair[0].signed_at.unwrap() < pair[1].signed_at.unwrap());
            }
            Ok(())
        })?;
    }

    /// Send succeeds exactly when every signer has a required field.
    #[test]
    fn send_requires_every_signer_covered(
        count in 1usize..=4,
        fields in prop::collection::vec((0usize..4, any::<bool>()), 0..8),
    ) {
        runtime().block_on(async {
            let h = Harness::new();
            let emails = &EMAILS[..count];
            let mut req = request(SigningMode::Parallel, emails);
            req.fields = fields
                .iter()
                .enumerate()
                .map(|(n, (assignee, required))| SignatureField {
                    id: format!("f{n}"),
                    required: *required,
                    ..common::signature_field(emails[assignee % count])
                })
                .collect();
            let covered = (0..count).all(|s| {
                fields
                    .iter()
                    .any(|(assignee, required)| *required && assignee % count == s)
            });

            let created = h.engine.create_envelope(req).await;
            let sent = match created {
                Ok(envelope) => h.engine.send(&envelope.id).await,
                Err(e) => Err(e),
            };
            prop_assert_eq!(sent.is_ok(), covered);
            if let Err(e) = sent {
                prop_assert_eq!(e.code(), "VALIDATION_FAILED");
            }
            Ok(())
        })?;
    }
}
