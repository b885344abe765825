//! Status projection
//!
//! Maps the outcome of a reconciliation pass to a phase and a `Ready`
//! condition, and merges that condition into an existing list so each type
//! appears once. The transition time is kept while the condition's status
//! value stays the same, which lets callers compare old and new status and
//! skip writes that would only bump a timestamp.

use crate::crd::{Condition, ConditionStatus, Phase};

/// Condition type written by both controllers
pub const READY_CONDITION: &str = "Ready";

/// Outcome of a reconciliation pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome<'a> {
    /// Everything applied; `phase` is `Running` for servers, `Synced` for users
    Converged {
        /// Phase to report
        phase: Phase,
        /// Reason code
        reason: &'a str,
        /// Human-readable message
        message: &'a str,
    },
    /// Parked until the user changes something (e.g. missing admin secret)
    Waiting {
        /// Reason code
        reason: &'a str,
        /// Human-readable message
        message: &'a str,
    },
    /// The pass failed
    Failed {
        /// Reason code
        reason: &'a str,
        /// Underlying error text
        message: &'a str,
    },
}

/// Phase and condition derived from an [`Outcome`]
#[derive(Clone, Debug, PartialEq)]
pub struct Projection {
    /// Phase to report
    pub phase: Phase,
    /// `Ready` condition to merge
    pub condition: Condition,
}

/// Project an outcome onto phase and `Ready` condition
pub fn project(outcome: Outcome<'_>) -> Projection {
    let (phase, status, reason, message) = match outcome {
        Outcome::Converged {
            phase,
            reason,
            message,
        } => (phase, ConditionStatus::True, reason, message),
        Outcome::Waiting { reason, message } => {
            (Phase::Pending, ConditionStatus::False, reason, message)
        }
        Outcome::Failed { reason, message } => {
            (Phase::Error, ConditionStatus::False, reason, message)
        }
    };
    Projection {
        phase,
        condition: Condition::new(READY_CONDITION, status, reason, message),
    }
}

/// Merge `condition` into `existing`, replacing any entry of the same type.
///
/// Keeps the previous `lastTransitionTime` when the status value did not
/// change. Order of other conditions is preserved.
pub fn merge_condition(existing: &[Condition], condition: Condition) -> Vec<Condition> {
    let mut merged: Vec<Condition> = Vec::with_capacity(existing.len() + 1);
    let mut placed = false;

    for current in existing {
        if current.type_ != condition.type_ {
            merged.push(current.clone());
            continue;
        }
        // Duplicates of the same type collapse into one entry
        if placed {
            continue;
        }
        let mut next = condition.clone();
        if next.status == current.status {
            next.last_transition_time = current.last_transition_time;
        }
        merged.push(next);
        placed = true;
    }

    if !placed {
        merged.push(condition);
    }
    merged
}

/// Whether two condition lists carry the same information, ignoring timestamps
pub fn conditions_equivalent(a: &[Condition], b: &[Condition]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_state(y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::reasons;

    #[test]
    fn converged_outcome_is_ready_true() {
        let p = project(Outcome::Converged {
            phase: Phase::Running,
            reason: reasons::RECONCILED,
            message: "SftpGoServer reconciled",
        });
        assert_eq!(p.phase, Phase::Running);
        assert_eq!(p.condition.type_, READY_CONDITION);
        assert_eq!(p.condition.status, ConditionStatus::True);
        assert_eq!(p.condition.reason, "Reconciled");
    }

    #[test]
    fn waiting_outcome_is_pending() {
        let p = project(Outcome::Waiting {
            reason: reasons::AUTH_NOT_CONFIGURED,
            message: "no admin secret",
        });
        assert_eq!(p.phase, Phase::Pending);
        assert_eq!(p.condition.status, ConditionStatus::False);
    }

    #[test]
    fn failed_outcome_keeps_raw_message() {
        let p = project(Outcome::Failed {
            reason: reasons::API_ERROR,
            message: "connection refused",
        });
        assert_eq!(p.phase, Phase::Error);
        assert_eq!(p.condition.message, "connection refused");
    }

    #[test]
    fn merge_replaces_by_type_without_duplicates() {
        let old = Condition::new("Ready", ConditionStatus::False, "APIError", "boom");
        let other = Condition::new("Progressing", ConditionStatus::True, "Rolling", "");
        let existing = vec![other.clone(), old.clone(), old];

        let new = Condition::new("Ready", ConditionStatus::True, "Synced", "ok");
        let merged = merge_condition(&existing, new);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], other);
        assert_eq!(merged[1].reason, "Synced");
    }

    #[test]
    fn merge_keeps_transition_time_when_status_is_unchanged() {
        let mut old = Condition::new("Ready", ConditionStatus::False, "APIError", "boom");
        old.last_transition_time -= chrono::Duration::minutes(10);

        let new = Condition::new("Ready", ConditionStatus::False, "APIError", "boom again");
        let merged = merge_condition(std::slice::from_ref(&old), new);
        assert_eq!(merged[0].last_transition_time, old.last_transition_time);
        assert_eq!(merged[0].message, "boom again");

        let flipped = Condition::new("Ready", ConditionStatus::True, "Synced", "ok");
        let merged = merge_condition(std::slice::from_ref(&old), flipped);
        assert!(merged[0].last_transition_time > old.last_transition_time);
    }

    #[test]
    fn merge_appends_when_type_absent() {
        let merged = merge_condition(
            &[],
            Condition::new("Ready", ConditionStatus::True, "Synced", "ok"),
        );
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn equivalence_ignores_timestamps() {
        let a = Condition::new("Ready", ConditionStatus::True, "Synced", "ok");
        let mut b = a.clone();
        b.last_transition_time -= chrono::Duration::seconds(30);
        assert!(conditions_equivalent(&[a.clone()], &[b]));
        assert!(!conditions_equivalent(&[a], &[]));
    }
}
