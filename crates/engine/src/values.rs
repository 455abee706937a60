//! Validation of the values a signer submits.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use quire_core::{Envelope, FieldType};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::Date;

/// Field id to captured value.
pub type FieldValues = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueViolation {
    /// A required field of this signer has no value.
    Missing { field_id: String },
    /// The field does not exist or belongs to another signer.
    Unexpected { field_id: String },
    /// Dates are `YYYY-MM-DD`.
    InvalidDate { field_id: String },
    /// Signatures and initials are `data:image/...;base64,` URLs.
    InvalidImage { field_id: String },
}

impl fmt::Display for ValueViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueViolation::Missing { field_id } => {
                write!(f, "required field '{}' has no value", field_id)
            }
            ValueViolation::Unexpected { field_id } => {
                write!(f, "field '{}' is not assigned to this signer", field_id)
            }
            ValueViolation::InvalidDate { field_id } => {
                write!(f, "field '{}' is not a YYYY-MM-DD date", field_id)
            }
            ValueViolation::InvalidImage { field_id } => {
                write!(f, "field '{}' is not a base64 image data URL", field_id)
            }
        }
    }
}

/// Check `values` covers every required field assigned to `email`, names no
/// field outside that set, and that each value suits its field type.
/// Blank values count as absent.
pub fn validate_values(
    envelope: &Envelope,
    email: &str,
    values: &FieldValues,
) -> Result<(), Vec<ValueViolation>> {
    let mut violations = Vec::new();

    for field_id in values.keys() {
        let owned = envelope
            .fields
            .iter()
            .any(|f| &f.id == field_id && f.assignee_email == email);
        if !owned {
            violations.push(ValueViolation::Unexpected {
                field_id: field_id.clone(),
            });
        }
    }

    for field in envelope.fields_for(email) {
        let value = values
            .get(&field.id)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty());
        let Some(value) = value else {
            if field.required {
                violations.push(ValueViolation::Missing {
                    field_id: field.id.clone(),
                });
            }
            continue;
        };
        match field.field_type {
            FieldType::Signature | FieldType::Initials => {
                if decode_image(value).is_none() {
                    violations.push(ValueViolation::InvalidImage {
                        field_id: field.id.clone(),
                    });
                }
            }
            FieldType::Date => {
                if parse_date(value).is_none() {
                    violations.push(ValueViolation::InvalidDate {
                        field_id: field.id.clone(),
                    });
                }
            }
            FieldType::Text => {}
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

pub(crate) fn parse_date(value: &str) -> Option<Date> {
    Date::parse(value, format_description!("[year]-[month]-[day]")).ok()
}

/// Decode a `data:image/<subtype>;base64,<payload>` URL into its bytes.
pub(crate) fn decode_image(value: &str) -> Option<Vec<u8>> {
    let rest = value.strip_prefix("data:image/")?;
    let (subtype, payload) = rest.split_once(";base64,")?;
    if subtype.is_empty() {
        return None;
    }
    let bytes = STANDARD.decode(payload).ok()?;
    (!bytes.is_empty()).then_some(bytes)
}
