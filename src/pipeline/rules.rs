//! Offline rules-based triage classifier.
//!
//! Pattern matching over sender, subject, and body:
//! - noreply/no-reply senders → Ignore
//! - Marketing/newsletter domains → Ignore
//! - "Unsubscribe" subjects or footers → Ignore
//! - Transactional (shipping, receipts) → NotifyHuman
//! - Questions and direct requests → Respond
//! - Anything else → NotifyHuman
//!
//! Triage hints flip a default the human has repeatedly corrected.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::error::OracleError;
use crate::learning::memory_view::TriageHint;
use crate::pipeline::oracle::{Classification, TriageClassifier};
use crate::pipeline::types::{Message, TriageLabel};

/// Which field a rule matches against.
#[derive(Debug, Clone, Copy)]
pub enum RuleField {
    Sender,
    Subject,
    Body,
}

impl RuleField {
    fn value<'a>(&self, message: &'a Message) -> &'a str {
        match self {
            Self::Sender => &message.sender,
            Self::Subject => &message.subject,
            Self::Body => &message.body,
        }
    }
}

/// A single labeling rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct Rule {
    pub regex: Regex,
    pub field: RuleField,
    pub label: TriageLabel,
    /// Why this rule triggers.
    pub reason: String,
}

/// Rules-based [`TriageClassifier`]. Rules are checked in order; the first
/// match wins.
pub struct RulesClassifier {
    rules: Vec<Rule>,
    /// Senders that always get a human look (bypass ignore rules).
    always_notify: Vec<Regex>,
}

const RULE_CONFIDENCE: f32 = 0.9;
const FALLBACK_CONFIDENCE: f32 = 0.5;
const HINTED_CONFIDENCE: f32 = 0.6;

impl RulesClassifier {
    /// Classifier with the default rule set.
    pub fn default_rules() -> Result<Self, regex::Error> {
        let mut classifier = Self::empty();
        for (pattern, field, label, reason) in [
            (
                r"(?i)^no[\-_.]?reply@",
                RuleField::Sender,
                TriageLabel::Ignore,
                "noreply sender",
            ),
            (
                r"(?i)@(marketing|newsletter|promo|campaign)\b",
                RuleField::Sender,
                TriageLabel::Ignore,
                "marketing/newsletter sender",
            ),
            (
                r"(?i)^(mailer[\-_]?daemon|postmaster)@",
                RuleField::Sender,
                TriageLabel::Ignore,
                "automated mail system",
            ),
            (
                r"(?i)\bunsubscribe\b",
                RuleField::Subject,
                TriageLabel::Ignore,
                "unsubscribe in subject",
            ),
            (
                r"(?i)(click here to unsubscribe|manage your subscription|email preferences|opt[- ]?out)",
                RuleField::Body,
                TriageLabel::Ignore,
                "bulk email footer",
            ),
            (
                r"(?i)(your (order|package|shipment)|tracking (number|update)|has (shipped|been delivered)|out for delivery)",
                RuleField::Body,
                TriageLabel::NotifyHuman,
                "shipping/delivery update",
            ),
            (
                r"(?i)(payment (received|confirmed)|receipt for|invoice #|your (receipt|transaction))",
                RuleField::Body,
                TriageLabel::NotifyHuman,
                "payment/receipt",
            ),
            (r"\?", RuleField::Body, TriageLabel::Respond, "question"),
            (
                r"(?i)\b(can you|could you|would you|please|let me know|are you (free|available))\b",
                RuleField::Body,
                TriageLabel::Respond,
                "direct request",
            ),
        ] {
            classifier.add_rule(pattern, field, label, reason)?;
        }
        Ok(classifier)
    }

    /// A classifier with no rules; everything falls back to `notify_human`.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            always_notify: Vec::new(),
        }
    }

    pub fn add_rule(
        &mut self,
        pattern: &str,
        field: RuleField,
        label: TriageLabel,
        reason: &str,
    ) -> Result<(), regex::Error> {
        self.rules.push(Rule {
            regex: Regex::new(pattern)?,
            field,
            label,
            reason: reason.into(),
        });
        Ok(())
    }

    /// Add a sender pattern that is never ignored.
    pub fn add_always_notify(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.always_notify.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Label from rules alone.
    pub fn evaluate(&self, message: &Message) -> Classification {
        let protected = self.always_notify.iter().any(|r| r.is_match(&message.sender));

        for rule in &self.rules {
            if protected && rule.label == TriageLabel::Ignore {
                continue;
            }
            if rule.regex.is_match(rule.field.value(message)) {
                debug!(
                    message_id = %message.id,
                    label = %rule.label,
                    reason = %rule.reason,
                    "Message matched triage rule"
                );
                return Classification {
                    label: rule.label,
                    confidence: RULE_CONFIDENCE,
                };
            }
        }

        Classification {
            label: TriageLabel::NotifyHuman,
            confidence: FALLBACK_CONFIDENCE,
        }
    }
}

/// A hint applies when its keywords (if any) appear in the subject.
fn hint_applies(hint: &TriageHint, message: &Message) -> bool {
    if hint.subject_keywords.is_empty() {
        return true;
    }
    let subject = message.subject.to_lowercase();
    hint.subject_keywords.iter().any(|k| subject.contains(k.as_str()))
}

#[async_trait]
impl TriageClassifier for RulesClassifier {
    async fn classify(&self, message: &Message, hints: &[TriageHint]) -> Result<Classification, OracleError> {
        let verdict = self.evaluate(message);
        let hinted = hints
            .iter()
            .find(|h| h.original == verdict.label && hint_applies(h, message));

        Ok(match hinted {
            Some(hint) => {
                debug!(
                    message_id = %message.id,
                    from = %hint.original,
                    to = %hint.corrected,
                    evidence = hint.evidence_count,
                    "Triage hint applied"
                );
                Classification {
                    label: hint.corrected,
                    confidence: HINTED_CONFIDENCE,
                }
            }
            None => verdict,
        })
    }
}
