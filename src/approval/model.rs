//! Draft checkpoint model: the durable record of a draft paused for
//! human disposition, and the decisions that resolve it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::pipeline::state::WorkflowState;

/// Status of a draft checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Waiting for the human.
    Pending,
    /// Sent as drafted.
    Approved,
    /// Sent with the human's edits.
    Edited,
    /// Rejected; nothing sent.
    Denied,
}

impl CheckpointStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Edited => "edited",
            Self::Denied => "denied",
        }
    }

    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "edited" => Some(Self::Edited),
            "denied" => Some(Self::Denied),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A draft waiting on (or resolved by) the human. One per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftCheckpoint {
    pub message_id: String,
    pub draft_text: String,
    /// Text that was approved for sending; set on resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    pub status: CheckpointStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl DraftCheckpoint {
    /// Create a new pending checkpoint.
    pub fn new(message_id: impl Into<String>, draft_text: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            draft_text: draft_text.into(),
            final_text: None,
            status: CheckpointStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// What the human decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Send the draft verbatim.
    Approve,
    /// Send this text instead.
    Edit { text: String },
    /// Send nothing.
    Deny,
}

impl Decision {
    /// Terminal checkpoint status this decision produces.
    ///
    /// An edit whose text matches the draft is an approval.
    pub fn status_for(&self, draft_text: &str) -> CheckpointStatus {
        match self {
            Self::Approve => CheckpointStatus::Approved,
            Self::Edit { text } if text.trim() == draft_text.trim() => CheckpointStatus::Approved,
            Self::Edit { .. } => CheckpointStatus::Edited,
            Self::Deny => CheckpointStatus::Denied,
        }
    }

    /// Text to send, if any.
    pub fn final_text(&self, draft_text: &str) -> Option<String> {
        match self {
            Self::Approve => Some(draft_text.to_string()),
            Self::Edit { text } => Some(text.clone()),
            Self::Deny => None,
        }
    }

    /// Reject edits that would send an empty reply.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        match self {
            Self::Edit { text } if text.trim().is_empty() => Err(WorkflowError::InvalidDecision(
                "edited text is empty; deny instead".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub message_id: String,
    pub status: CheckpointStatus,
    /// Workflow state after delivery was attempted.
    pub state: WorkflowState,
    /// Whether the reply went out on this call.
    pub delivered: bool,
    /// Number of preference signals learned from this resolution.
    pub signals: usize,
}
