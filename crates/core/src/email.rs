//! Signer email normalization.
//!
//! Every entry point that accepts an email (envelope creation, field
//! assignment, link lookups) goes through [`normalize_email`]; stored emails
//! are always in normalized form and compared byte-for-byte afterwards.

/// Trim surrounding whitespace and lower-case.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Structural check on an already-normalized email: one `@`, a non-empty
/// local part, a dotted domain, and no whitespace.
pub fn is_well_formed(email: &str) -> bool {
    if email.is_empty() || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    if domain.starts_with('.') || domain.ends_with('.') || domain.contains("..") {
        return false;
    }
    domain.contains('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_and_lowercases() {
        assert_eq!(normalize_email("  Alice@Example.COM \n"), "alice@example.com");
    }

    #[test]
    fn well_formed_accepts_plain_addresses() {
        assert!(is_well_formed("a@b.co"));
        assert!(is_well_formed("first.last+tag@sub.example.org"));
    }

    #[test]
    fn well_formed_rejects_broken_addresses() {
        for bad in [
            "",
            "plain",
            "@example.com",
            "a@",
            "a@localhost",
            "a@@example.com",
            "a@b@example.com",
            "a b@example.com",
            "a@.example.com",
            "a@example.com.",
            "a@example..com",
        ] {
            assert!(!is_well_formed(bad), "accepted {bad:?}");
        }
    }
}
