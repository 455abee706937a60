//! Envelope status transition table.
//!
//! Status only moves forward. The two abort states (`EXPIRED`, `DECLINED`)
//! are reachable from every non-terminal status; terminal statuses have no
//! outgoing transitions.

use crate::model::EnvelopeStatus;

/// A transition not present in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: EnvelopeStatus,
    pub to: EnvelopeStatus,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "illegal envelope transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for TransitionError {}

pub fn allowed_transitions(from: EnvelopeStatus) -> &'static [EnvelopeStatus] {
    use EnvelopeStatus::*;
    match from {
        Draft => &[Ready, Expired, Declined],
        Ready => &[Sent, Expired, Declined],
        Sent => &[InProgress, Expired, Declined],
        InProgress => &[InProgress, Completed, Expired, Declined],
        Completed | Expired | Declined => &[],
    }
}

pub fn validate_transition(from: EnvelopeStatus, to: EnvelopeStatus) -> Result<(), TransitionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EnvelopeStatus::*;

    const ALL: [EnvelopeStatus; 7] = [Draft, Ready, Sent, InProgress, Completed, Expired, Declined];

    #[test]
    fn happy_path_is_allowed() {
        for (from, to) in [
            (Draft, Ready),
            (Ready, Sent),
            (Sent, InProgress),
            (InProgress, InProgress),
            (InProgress, Completed),
        ] {
            assert!(validate_transition(from, to).is_ok(), "{from} -> {to}");
        }
    }

    #[test]
    fn abort_states_reachable_from_every_open_status() {
        for from in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(validate_transition(*from, Expired).is_ok());
            assert!(validate_transition(*from, Declined).is_ok());
        }
    }

    #[test]
    fn terminal_statuses_are_final() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(validate_transition(*from, to).is_err());
            }
        }
    }

    #[test]
    fn never_moves_backward_except_to_abort_states() {
        for from in ALL {
            for to in allowed_transitions(from) {
                assert!(
                    *to >= from || matches!(to, Expired | Declined),
                    "{from} -> {to} moves backward"
                );
            }
        }
    }

    #[test]
    fn completion_requires_in_progress() {
        assert!(validate_transition(Sent, Completed).is_err());
        assert!(validate_transition(Draft, Sent).is_err());
    }
}
