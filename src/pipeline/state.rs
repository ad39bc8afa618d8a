//! Per-message workflow state machine.

use serde::{Deserialize, Serialize};

/// Where a message is in the triage → draft → approval → send workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    /// Ingested, not yet triaged.
    Received,
    /// Labeled; branch not yet taken.
    Triaged,
    /// Dropped by triage.
    Ignored,
    /// Surfaced to the human without a draft.
    Notified,
    /// Waiting on the drafter.
    Drafting,
    /// Draft checkpointed, waiting on the human.
    AwaitingApproval,
    /// Approved as drafted; delivery pending.
    Approved,
    /// Approved with edits; delivery pending.
    Edited,
    /// Reply delivered.
    Sent,
    /// Human rejected the draft.
    Denied,
}

impl WorkflowState {
    pub const ALL: [WorkflowState; 10] = [
        Self::Received,
        Self::Triaged,
        Self::Ignored,
        Self::Notified,
        Self::Drafting,
        Self::AwaitingApproval,
        Self::Approved,
        Self::Edited,
        Self::Sent,
        Self::Denied,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkflowState) -> bool {
        use WorkflowState::*;

        matches!(
            (self, target),
            (Received, Triaged) |
            (Triaged, Ignored) | (Triaged, Notified) | (Triaged, Drafting) |
            // Drafter exhaustion escalates to the human
            (Drafting, AwaitingApproval) | (Drafting, Notified) |
            (AwaitingApproval, Approved) | (AwaitingApproval, Edited) | (AwaitingApproval, Denied) |
            (Approved, Sent) | (Edited, Sent)
        ) || self.can_override_to(target)
    }

    /// Transitions a human triage override may reopen.
    pub fn can_override_to(&self, target: WorkflowState) -> bool {
        use WorkflowState::*;

        matches!(
            (self, target),
            (Ignored, Notified) | (Ignored, Drafting) | (Notified, Ignored) | (Notified, Drafting)
        )
    }

    /// Check if this is a terminal state for automated processing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ignored | Self::Notified | Self::Sent | Self::Denied)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Triaged => "triaged",
            Self::Ignored => "ignored",
            Self::Notified => "notified",
            Self::Drafting => "drafting",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Edited => "edited",
            Self::Sent => "sent",
            Self::Denied => "denied",
        }
    }

    pub fn from_str_value(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        use WorkflowState::*;
        let path = [Received, Triaged, Drafting, AwaitingApproval, Edited, Sent];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn invalid_transitions() {
        use WorkflowState::*;
        assert!(!Received.can_transition_to(Drafting));
        assert!(!AwaitingApproval.can_transition_to(Sent));
        assert!(!Denied.can_transition_to(Sent));
        assert!(!Sent.can_transition_to(AwaitingApproval));
        assert!(!Approved.can_transition_to(Denied));
    }

    #[test]
    fn overrides_only_reopen_triage_outcomes() {
        use WorkflowState::*;
        assert!(Ignored.can_transition_to(Drafting));
        assert!(Notified.can_override_to(Ignored));
        assert!(!Sent.can_override_to(Drafting));
        assert!(!Denied.can_override_to(Drafting));
    }

    #[test]
    fn terminal_states() {
        use WorkflowState::*;
        for state in WorkflowState::ALL {
            let expected = matches!(state, Ignored | Notified | Sent | Denied);
            assert_eq!(state.is_terminal(), expected, "{state}");
        }
    }

    #[test]
    fn db_string_roundtrip() {
        for state in WorkflowState::ALL {
            assert_eq!(WorkflowState::from_str_value(state.as_str()), Some(state));
        }
        assert_eq!(WorkflowState::from_str_value("bogus"), None);
    }
}
