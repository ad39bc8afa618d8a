//! Shared types for the message workflow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Inbound message ─────────────────────────────────────────────────

/// An inbound email as handed to the workflow.
///
/// Immutable once ingested. The id is assigned by the sender's transport
/// and is the dedupe key for re-deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// Normalized sender address (see [`normalize_sender`]).
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Build a message, normalizing the sender address.
    pub fn new(
        id: impl Into<String>,
        sender: &str,
        subject: impl Into<String>,
        body: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            sender: normalize_sender(sender),
            subject: subject.into(),
            body: body.into(),
            received_at,
        }
    }
}

/// Reduce `Display Name <addr@host>` to `addr@host`, trimmed and lower-cased.
pub fn normalize_sender(raw: &str) -> String {
    let raw = raw.trim();
    let addr = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => &raw[start + 1..end],
        _ => raw,
    };
    addr.trim().trim_matches('"').to_lowercase()
}

// ── Triage ──────────────────────────────────────────────────────────

/// Handling category for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageLabel {
    /// Drop. Nothing is sent and nobody is notified.
    Ignore,
    /// Surface to the human without a draft.
    NotifyHuman,
    /// Draft a reply for approval.
    Respond,
}

impl TriageLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ignore => "ignore",
            Self::NotifyHuman => "notify_human",
            Self::Respond => "respond",
        }
    }

    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "ignore" => Some(Self::Ignore),
            "notify_human" => Some(Self::NotifyHuman),
            "respond" => Some(Self::Respond),
            _ => None,
        }
    }
}

impl std::fmt::Display for TriageLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who produced a triage label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageSource {
    Model,
    HumanOverride,
}

impl TriageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::HumanOverride => "human_override",
        }
    }

    pub fn from_str_value(s: &str) -> Self {
        match s {
            "human_override" => Self::HumanOverride,
            _ => Self::Model,
        }
    }
}

/// A recorded triage label for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageDecision {
    pub message_id: String,
    pub label: TriageLabel,
    pub source: TriageSource,
    /// Classifier confidence; `None` for human overrides and fallbacks.
    pub confidence: Option<f32>,
    /// Why the label was chosen when it was not the classifier's own call.
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_display_name_form() {
        assert_eq!(normalize_sender("Alice Smith <Alice@Example.COM>"), "alice@example.com");
        assert_eq!(normalize_sender("  bob@x.com "), "bob@x.com");
        assert_eq!(normalize_sender("\"Carol\" <carol@y.org>"), "carol@y.org");
    }

    #[test]
    fn normalize_leaves_malformed_input_trimmed() {
        assert_eq!(normalize_sender("> odd <"), "> odd <");
        assert_eq!(normalize_sender(""), "");
    }

    #[test]
    fn triage_label_roundtrips_through_db_string() {
        for label in [TriageLabel::Ignore, TriageLabel::NotifyHuman, TriageLabel::Respond] {
            assert_eq!(TriageLabel::from_str_value(label.as_str()), Some(label));
        }
        assert_eq!(TriageLabel::from_str_value("digest"), None);
    }

    #[test]
    fn triage_label_serde_is_snake_case() {
        let json = serde_json::to_string(&TriageLabel::NotifyHuman).unwrap();
        assert_eq!(json, "\"notify_human\"");
    }

    #[test]
    fn message_new_normalizes_sender() {
        let msg = Message::new("m1", "A <A@X.com>", "Hi", "Body", Utc::now());
        assert_eq!(msg.sender, "a@x.com");
    }
}
