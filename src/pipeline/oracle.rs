//! Collaborator contracts for the workflow: triage classification, reply
//! drafting, and reply delivery.
//!
//! The engine only sees these traits. Built-in implementations here (and
//! [`RulesClassifier`](crate::pipeline::rules::RulesClassifier)) let the
//! service run without an LLM; model-backed adapters plug in the same way.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DeliveryError, OracleError};
use crate::learning::memory_view::{BiasPayload, TriageHint};
use crate::learning::preference::{Length, Preference, Tone};
use crate::pipeline::types::{Message, TriageLabel};

/// A classifier's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: TriageLabel,
    /// 0.0..=1.0
    pub confidence: f32,
}

/// Labels an inbound message. `hints` are advisory: labels the human kept
/// correcting for this sender.
#[async_trait]
pub trait TriageClassifier: Send + Sync {
    async fn classify(&self, message: &Message, hints: &[TriageHint]) -> Result<Classification, OracleError>;
}

/// Produces reply text for a message, biased by learned preferences.
#[async_trait]
pub trait Drafter: Send + Sync {
    async fn draft(&self, message: &Message, bias: &BiasPayload) -> Result<String, OracleError>;
}

/// Sends an approved reply.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send(&self, message: &Message, text: &str) -> Result<(), DeliveryError>;
}

// ── Built-in drafter ────────────────────────────────────────────────

/// Plain acknowledgement drafter that follows the active preferences:
/// greeting and sign-off are dropped when learned, tone picks the wording,
/// and brevity collapses the body to one line.
#[derive(Debug, Clone, Default)]
pub struct TemplateDrafter {
    /// Name placed under the sign-off.
    pub signature: Option<String>,
}

impl TemplateDrafter {
    pub fn with_signature(signature: impl Into<String>) -> Self {
        Self {
            signature: Some(signature.into()),
        }
    }

    fn compose(&self, message: &Message, bias: &BiasPayload) -> String {
        let casual = bias.is_active(&Preference::Tone(Tone::Casual));
        let brief = bias.is_active(&Preference::Length(Length::Brief))
            || bias.is_active(&Preference::Tone(Tone::Concise));

        let mut lines = Vec::new();
        if !bias.is_active(&Preference::NoGreeting) {
            lines.push(if casual { "Hey," } else { "Hi," }.to_string());
        }

        let topic = if message.subject.trim().is_empty() {
            "your message".to_string()
        } else {
            format!("\"{}\"", message.subject.trim())
        };
        let body = match (brief, casual) {
            (true, true) => "Got it, will get back to you soon.".to_string(),
            (true, false) => "Thanks, I will follow up shortly.".to_string(),
            (false, true) => format!(
                "Thanks for the note about {topic}. I'll take a look and get back to you soon."
            ),
            (false, false) => format!(
                "Thank you for reaching out about {topic}. I will look into it and follow up shortly."
            ),
        };
        lines.push(body);

        if !bias.is_active(&Preference::NoSignoff) {
            lines.push(if casual { "Cheers," } else { "Best regards," }.to_string());
            if let Some(name) = &self.signature {
                lines.push(name.clone());
            }
        }
        lines.join("\n")
    }
}

#[async_trait]
impl Drafter for TemplateDrafter {
    async fn draft(&self, message: &Message, bias: &BiasPayload) -> Result<String, OracleError> {
        Ok(self.compose(message, bias))
    }
}

// ── Built-in outbox ─────────────────────────────────────────────────

/// Delivers replies to the log instead of a mail transport.
#[derive(Debug, Clone, Default)]
pub struct LogOutbox;

#[async_trait]
impl ReplySender for LogOutbox {
    async fn send(&self, message: &Message, text: &str) -> Result<(), DeliveryError> {
        info!(
            message_id = %message.id,
            to = %message.sender,
            subject = %message.subject,
            chars = text.len(),
            "Reply delivered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::memory_view::ActivePreference;
    use crate::learning::preference::Scope;
    use chrono::Utc;

    fn message() -> Message {
        Message::new("m1", "a@x.com", "Lunch", "Free on Friday?", Utc::now())
    }

    fn bias_with(prefs: &[Preference]) -> BiasPayload {
        let mut bias = BiasPayload::cold("a@x.com");
        bias.active = prefs
            .iter()
            .map(|p| ActivePreference {
                preference: p.clone(),
                scope: Scope::Sender("a@x.com".into()),
                evidence_count: 3,
                staleness: 0.0,
                instruction: p.instruction(),
            })
            .collect();
        bias
    }

    #[tokio::test]
    async fn cold_draft_has_greeting_and_signoff() {
        let drafter = TemplateDrafter::with_signature("Jane");
        let text = drafter.draft(&message(), &BiasPayload::cold("a@x.com")).await.unwrap();
        assert!(text.starts_with("Hi,"));
        assert!(text.contains("\"Lunch\""));
        assert!(text.ends_with("Best regards,\nJane"));
    }

    #[tokio::test]
    async fn learned_preferences_shape_the_draft() {
        let drafter = TemplateDrafter::with_signature("Jane");
        let bias = bias_with(&[
            Preference::NoGreeting,
            Preference::NoSignoff,
            Preference::Length(Length::Brief),
        ]);
        let text = drafter.draft(&message(), &bias).await.unwrap();
        assert_eq!(text, "Thanks, I will follow up shortly.");
    }

    #[tokio::test]
    async fn casual_tone_changes_wording() {
        let drafter = TemplateDrafter::default();
        let text = drafter
            .draft(&message(), &bias_with(&[Preference::Tone(Tone::Casual)]))
            .await
            .unwrap();
        assert!(text.starts_with("Hey,"));
        assert!(text.ends_with("Cheers,"));
    }

    #[tokio::test]
    async fn log_outbox_always_delivers() {
        assert!(LogOutbox.send(&message(), "ok").await.is_ok());
    }
}
