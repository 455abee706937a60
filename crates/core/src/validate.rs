//! Field placement and signer list validation.
//!
//! Both validators are pure and report every problem they find rather than
//! stopping at the first, so a caller can fix a whole submission in one pass.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::email::{is_well_formed, normalize_email};
use crate::model::{SignatureField, Signer, SigningMode};

/// A problem with a proposed field set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// The signer has no required field assigned.
    MissingCoverage { email: String },
    DuplicateFieldId { field_id: String },
    /// The field is assigned to an email that is not a signer.
    UnknownAssignee { field_id: String, email: String },
    /// Zero, negative or non-finite width/height.
    EmptyPosition { field_id: String },
    NegativeCoordinate { field_id: String },
    /// Pages are 1-based.
    InvalidPage { field_id: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MissingCoverage { email } => {
                write!(f, "signer '{}' has no required field", email)
            }
            Violation::DuplicateFieldId { field_id } => {
                write!(f, "field id '{}' is used more than once", field_id)
            }
            Violation::UnknownAssignee { field_id, email } => write!(
                f,
                "field '{}' is assigned to '{}', who is not a signer",
                field_id, email
            ),
            Violation::EmptyPosition { field_id } => {
                write!(f, "field '{}' has an empty position", field_id)
            }
            Violation::NegativeCoordinate { field_id } => {
                write!(f, "field '{}' has a negative coordinate", field_id)
            }
            Violation::InvalidPage { field_id } => {
                write!(f, "field '{}' has page 0 (pages start at 1)", field_id)
            }
        }
    }
}

/// A problem with a proposed signer list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignerViolation {
    NoSigners,
    MalformedEmail { email: String },
    EmptyName { email: String },
    DuplicateEmail { email: String },
    ZeroOrder { email: String },
    DuplicateOrder { order: u32 },
    /// Sequential envelopes need orders 1..=n without gaps.
    NonContiguousOrder { expected: u32, found: u32 },
}

impl fmt::Display for SignerViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignerViolation::NoSigners => write!(f, "at least one signer is required"),
            SignerViolation::MalformedEmail { email } => {
                write!(f, "'{}' is not a valid email address", email)
            }
            SignerViolation::EmptyName { email } => {
                write!(f, "signer '{}' has an empty name", email)
            }
            SignerViolation::DuplicateEmail { email } => {
                write!(f, "signer '{}' appears more than once", email)
            }
            SignerViolation::ZeroOrder { email } => {
                write!(f, "signer '{}' has order 0 (orders start at 1)", email)
            }
            SignerViolation::DuplicateOrder { order } => {
                write!(f, "order {} is used by more than one signer", order)
            }
            SignerViolation::NonContiguousOrder { expected, found } => write!(
                f,
                "sequential orders must be contiguous: expected {}, found {}",
                expected, found
            ),
        }
    }
}

/// Validate `fields` against `signers`.
///
/// Assignee emails are compared after normalization on both sides.
pub fn validate_fields(signers: &[Signer], fields: &[SignatureField]) -> Result<(), Vec<Violation>> {
    let mut violations = Vec::new();

    let signer_emails: BTreeSet<String> = signers.iter().map(|s| normalize_email(&s.email)).collect();

    let mut seen_ids = HashSet::new();
    let mut reported_dupes = HashSet::new();
    let mut covered = BTreeSet::new();

    for field in fields {
        if !seen_ids.insert(field.id.as_str()) && reported_dupes.insert(field.id.as_str()) {
            violations.push(Violation::DuplicateFieldId {
                field_id: field.id.clone(),
            });
        }

        let assignee = normalize_email(&field.assignee_email);
        if !signer_emails.contains(&assignee) {
            violations.push(Violation::UnknownAssignee {
                field_id: field.id.clone(),
                email: assignee.clone(),
            });
        }

        let p = &field.position;
        if !(p.width.is_finite() && p.height.is_finite() && p.width > 0.0 && p.height > 0.0) {
            violations.push(Violation::EmptyPosition {
                field_id: field.id.clone(),
            });
        }
        if !(p.x.is_finite() && p.y.is_finite()) || p.x < 0.0 || p.y < 0.0 {
            violations.push(Violation::NegativeCoordinate {
                field_id: field.id.clone(),
            });
        }
        if field.page == 0 {
            violations.push(Violation::InvalidPage {
                field_id: field.id.clone(),
            });
        }

        if field.required {
            covered.insert(assignee);
        }
    }

    for email in signer_emails.difference(&covered) {
        violations.push(Violation::MissingCoverage {
            email: email.clone(),
        });
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Validate a signer list for envelope creation.
///
/// Emails are expected to be normalized already (as [`Signer::new`] does);
/// duplicates are detected on the normalized form.
pub fn validate_signers(signers: &[Signer], mode: SigningMode) -> Result<(), Vec<SignerViolation>> {
    if signers.is_empty() {
        return Err(vec![SignerViolation::NoSigners]);
    }

    let mut violations = Vec::new();
    let mut emails = HashSet::new();
    let mut orders: BTreeMap<u32, usize> = BTreeMap::new();

    for signer in signers {
        let email = normalize_email(&signer.email);
        if !is_well_formed(&email) {
            violations.push(SignerViolation::MalformedEmail {
                email: email.clone(),
            });
        }
        if signer.name.trim().is_empty() {
            violations.push(SignerViolation::EmptyName {
                email: email.clone(),
            });
        }
        if !emails.insert(email.clone()) {
            violations.push(SignerViolation::DuplicateEmail {
                email: email.clone(),
            });
        }
        if signer.order == 0 {
            violations.push(SignerViolation::ZeroOrder { email });
        } else {
            *orders.entry(signer.order).or_default() += 1;
        }
    }

    for (order, count) in &orders {
        if *count > 1 {
            violations.push(SignerViolation::DuplicateOrder { order: *order });
        }
    }

    if mode == SigningMode::Sequential {
        // Orders are sorted; the k-th distinct order must be k.
        for (expected, found) in (1u32..).zip(orders.keys()) {
            if *found != expected {
                violations.push(SignerViolation::NonContiguousOrder {
                    expected,
                    found: *found,
                });
                break;
            }
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldType, Position, SignerRole};

    fn signer(email: &str, order: u32) -> Signer {
        Signer::new(email, "Name", SignerRole::Signer, order)
    }

    fn field(id: &str, email: &str, required: bool) -> SignatureField {
        SignatureField {
            id: id.to_string(),
            assignee_email: email.to_string(),
            field_type: FieldType::Signature,
            page: 1,
            position: Position {
                x: 10.0,
                y: 10.0,
                width: 120.0,
                height: 40.0,
            },
            required,
            value: None,
            signed_at: None,
        }
    }

    #[test]
    fn accepts_full_coverage() {
        let signers = vec![signer("a@x.io", 1), signer("b@x.io", 2)];
        let fields = vec![field("f1", "a@x.io", true), field("f2", "B@X.io ", true)];
        assert_eq!(validate_fields(&signers, &fields), Ok(()));
    }

    #[test]
    fn optional_field_does_not_count_as_coverage() {
        let signers = vec![signer("a@x.io", 1)];
        let fields = vec![field("f1", "a@x.io", false)];
        assert_eq!(
            validate_fields(&signers, &fields),
            Err(vec![Violation::MissingCoverage {
                email: "a@x.io".to_string()
            }])
        );
    }

    #[test]
    fn reports_every_violation_at_once() {
        let signers = vec![signer("a@x.io", 1), signer("b@x.io", 2)];
        let mut empty = field("f2", "a@x.io", true);
        empty.position.width = 0.0;
        let mut off_page = field("f3", "a@x.io", true);
        off_page.page = 0;
        off_page.position.x = -1.0;
        let fields = vec![
            field("f1", "a@x.io", true),
            field("f1", "a@x.io", true),
            empty,
            off_page,
            field("f4", "ghost@x.io", true),
        ];

        let violations = validate_fields(&signers, &fields).unwrap_err();
        assert!(violations.contains(&Violation::DuplicateFieldId {
            field_id: "f1".to_string()
        }));
        assert!(violations.contains(&Violation::EmptyPosition {
            field_id: "f2".to_string()
        }));
        assert!(violations.contains(&Violation::InvalidPage {
            field_id: "f3".to_string()
        }));
        assert!(violations.contains(&Violation::NegativeCoordinate {
            field_id: "f3".to_string()
        }));
        assert!(violations.contains(&Violation::UnknownAssignee {
            field_id: "f4".to_string(),
            email: "ghost@x.io".to_string()
        }));
        assert!(violations.contains(&Violation::MissingCoverage {
            email: "b@x.io".to_string()
        }));
        assert_eq!(violations.len(), 6);
    }

    #[test]
    fn duplicate_id_reported_once() {
        let signers = vec![signer("a@x.io", 1)];
        let fields = vec![
            field("f1", "a@x.io", true),
            field("f1", "a@x.io", true),
            field("f1", "a@x.io", true),
        ];
        let violations = validate_fields(&signers, &fields).unwrap_err();
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn nan_position_is_empty() {
        let signers = vec![signer("a@x.io", 1)];
        let mut f = field("f1", "a@x.io", true);
        f.position.height = f64::NAN;
        assert_eq!(
            validate_fields(&signers, &[f]),
            Err(vec![Violation::EmptyPosition {
                field_id: "f1".to_string()
            }])
        );
    }

    #[test]
    fn signers_reject_duplicate_emails_after_normalization() {
        let signers = vec![signer("A@x.io", 1), signer(" a@X.IO", 2)];
        assert_eq!(
            validate_signers(&signers, SigningMode::Parallel),
            Err(vec![SignerViolation::DuplicateEmail {
                email: "a@x.io".to_string()
            }])
        );
    }

    #[test]
    fn sequential_orders_must_be_contiguous() {
        let signers = vec![signer("a@x.io", 1), signer("b@x.io", 3)];
        assert_eq!(
            validate_signers(&signers, SigningMode::Sequential),
            Err(vec![SignerViolation::NonContiguousOrder {
                expected: 2,
                found: 3
            }])
        );
        // Gaps are fine in parallel mode; only uniqueness matters.
        assert_eq!(validate_signers(&signers, SigningMode::Parallel), Ok(()));
    }

    #[test]
    fn order_ties_rejected_in_both_modes() {
        let signers = vec![signer("a@x.io", 1), signer("b@x.io", 1)];
        for mode in [SigningMode::Parallel, SigningMode::Sequential] {
            let violations = validate_signers(&signers, mode).unwrap_err();
            assert!(violations.contains(&SignerViolation::DuplicateOrder { order: 1 }));
        }
    }

    #[test]
    fn empty_signer_list_rejected() {
        assert_eq!(
            validate_signers(&[], SigningMode::Parallel),
            Err(vec![SignerViolation::NoSigners])
        );
    }

    #[test]
    fn malformed_email_and_blank_name() {
        let mut s = signer("not-an-email", 1);
        s.name = "  ".to_string();
        let violations = validate_signers(&[s], SigningMode::Parallel).unwrap_err();
        assert_eq!(
            violations,
            vec![
                SignerViolation::MalformedEmail {
                    email: "not-an-email".to_string()
                },
                SignerViolation::EmptyName {
                    email: "not-an-email".to_string()
                },
            ]
        );
    }
}
