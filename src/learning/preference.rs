//! Preference data model: the closed set of learnable preference kinds,
//! their scopes, aggregate rows, sender contexts, and the feedback log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::types::TriageLabel;

/// Version of the preference kind enumeration. Bump when a kind is added
/// or a value encoding changes.
pub const SCHEMA_VERSION: u32 = 1;

/// Cap on subject keywords remembered per triage-override row.
pub const MAX_OVERRIDE_KEYWORDS: usize = 8;

// ── Kinds ───────────────────────────────────────────────────────────

/// Categorical tone value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tone {
    Concise,
    Casual,
}

impl Tone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Concise => "concise",
            Self::Casual => "casual",
        }
    }
}

/// Categorical length value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Length {
    Brief,
}

impl Length {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Brief => "brief",
        }
    }
}

/// Features of a human triage correction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriageOverride {
    pub original: TriageLabel,
    pub corrected: TriageLabel,
    /// Salient subject words. Not part of the row identity.
    #[serde(default)]
    pub subject_keywords: Vec<String>,
}

/// A single learnable preference, typed per kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Preference {
    NoGreeting,
    NoSignoff,
    Tone(Tone),
    Length(Length),
    AvoidWord(String),
    PreferWord(String),
    AvoidPhrase(String),
    PreferPhrase(String),
    TriageOverride(TriageOverride),
}

/// Discriminant of [`Preference`], used as the `kind` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceKind {
    NoGreeting,
    NoSignoff,
    Tone,
    Length,
    AvoidWord,
    PreferWord,
    AvoidPhrase,
    PreferPhrase,
    TriageOverride,
}

impl PreferenceKind {
    pub const ALL: [PreferenceKind; 9] = [
        Self::NoGreeting,
        Self::NoSignoff,
        Self::Tone,
        Self::Length,
        Self::AvoidWord,
        Self::PreferWord,
        Self::AvoidPhrase,
        Self::PreferPhrase,
        Self::TriageOverride,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoGreeting => "no_greeting",
            Self::NoSignoff => "no_signoff",
            Self::Tone => "tone",
            Self::Length => "length",
            Self::AvoidWord => "avoid_word",
            Self::PreferWord => "prefer_word",
            Self::AvoidPhrase => "avoid_phrase",
            Self::PreferPhrase => "prefer_phrase",
            Self::TriageOverride => "triage_override",
        }
    }

    pub fn from_str_value(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Lexical kinds hold many independent values; precedence between
    /// sender and global rows is per value rather than per kind.
    pub fn is_lexical(&self) -> bool {
        matches!(
            self,
            Self::AvoidWord | Self::PreferWord | Self::AvoidPhrase | Self::PreferPhrase
        )
    }
}

impl fmt::Display for PreferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Preference {
    pub fn kind(&self) -> PreferenceKind {
        match self {
            Self::NoGreeting => PreferenceKind::NoGreeting,
            Self::NoSignoff => PreferenceKind::NoSignoff,
            Self::Tone(_) => PreferenceKind::Tone,
            Self::Length(_) => PreferenceKind::Length,
            Self::AvoidWord(_) => PreferenceKind::AvoidWord,
            Self::PreferWord(_) => PreferenceKind::PreferWord,
            Self::AvoidPhrase(_) => PreferenceKind::AvoidPhrase,
            Self::PreferPhrase(_) => PreferenceKind::PreferPhrase,
            Self::TriageOverride(_) => PreferenceKind::TriageOverride,
        }
    }

    /// Discrete value that, with kind and scope, identifies an aggregate row.
    pub fn value_key(&self) -> String {
        match self {
            Self::NoGreeting | Self::NoSignoff => "true".to_string(),
            Self::Tone(t) => t.as_str().to_string(),
            Self::Length(l) => l.as_str().to_string(),
            Self::AvoidWord(w) | Self::PreferWord(w) => w.clone(),
            Self::AvoidPhrase(p) | Self::PreferPhrase(p) => p.clone(),
            Self::TriageOverride(o) => format!("{}->{}", o.original, o.corrected),
        }
    }

    /// Rebuild a preference from its stored columns.
    ///
    /// `keywords` is only meaningful for triage overrides.
    pub fn from_parts(kind: PreferenceKind, value: &str, keywords: Vec<String>) -> Option<Self> {
        let pref = match kind {
            PreferenceKind::NoGreeting => Self::NoGreeting,
            PreferenceKind::NoSignoff => Self::NoSignoff,
            PreferenceKind::Tone => match value {
                "concise" => Self::Tone(Tone::Concise),
                "casual" => Self::Tone(Tone::Casual),
                _ => return None,
            },
            PreferenceKind::Length => match value {
                "brief" => Self::Length(Length::Brief),
                _ => return None,
            },
            PreferenceKind::AvoidWord => Self::AvoidWord(value.to_string()),
            PreferenceKind::PreferWord => Self::PreferWord(value.to_string()),
            PreferenceKind::AvoidPhrase => Self::AvoidPhrase(value.to_string()),
            PreferenceKind::PreferPhrase => Self::PreferPhrase(value.to_string()),
            PreferenceKind::TriageOverride => {
                let (original, corrected) = value.split_once("->")?;
                Self::TriageOverride(TriageOverride {
                    original: TriageLabel::from_str_value(original)?,
                    corrected: TriageLabel::from_str_value(corrected)?,
                    subject_keywords: keywords,
                })
            }
        };
        Some(pref)
    }

    /// Subject keywords carried by a triage override; empty otherwise.
    pub fn keywords(&self) -> &[String] {
        match self {
            Self::TriageOverride(o) => &o.subject_keywords,
            _ => &[],
        }
    }

    /// Human-readable drafting instruction for an active preference.
    pub fn instruction(&self) -> String {
        match self {
            Self::NoGreeting => "Do not open with a greeting line.".to_string(),
            Self::NoSignoff => "Do not close with a sign-off or signature.".to_string(),
            Self::Tone(Tone::Concise) => "Keep the tone concise and to the point.".to_string(),
            Self::Tone(Tone::Casual) => "Use a casual, relaxed tone.".to_string(),
            Self::Length(Length::Brief) => "Keep the reply brief.".to_string(),
            Self::AvoidWord(w) => format!("Avoid the word \"{w}\"."),
            Self::PreferWord(w) => format!("Prefer the word \"{w}\"."),
            Self::AvoidPhrase(p) => format!("Avoid the phrase \"{p}\"."),
            Self::PreferPhrase(p) => format!("Prefer the phrase \"{p}\"."),
            Self::TriageOverride(o) => format!(
                "Messages like this were labeled {} but the human chose {}.",
                o.original, o.corrected
            ),
        }
    }
}

// ── Scope ───────────────────────────────────────────────────────────

/// Where a preference applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Scope {
    Global,
    Sender(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Sender(addr) => write!(f, "sender:{addr}"),
        }
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "global" {
            return Ok(Self::Global);
        }
        match s.strip_prefix("sender:") {
            Some(addr) if !addr.is_empty() => Ok(Self::Sender(addr.to_string())),
            _ => Err(format!("invalid scope: {s}")),
        }
    }
}

impl From<Scope> for String {
    fn from(scope: Scope) -> Self {
        scope.to_string()
    }
}

impl TryFrom<String> for Scope {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ── Aggregate rows ──────────────────────────────────────────────────

/// Identity of an aggregate row: (kind, value, scope).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub kind: PreferenceKind,
    pub value: String,
    pub scope: Scope,
}

impl RowKey {
    pub fn new(preference: &Preference, scope: Scope) -> Self {
        Self {
            kind: preference.kind(),
            value: preference.value_key(),
            scope,
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}@{}", self.kind, self.value, self.scope)
    }
}

/// Aggregated evidence for one preference in one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceRow {
    pub preference: Preference,
    pub scope: Scope,
    pub evidence_count: u32,
    /// Grows with contradictions, halves with confirmations.
    pub staleness: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl PreferenceRow {
    /// A fresh row holding one confirmation.
    pub fn first(preference: Preference, scope: Scope, at: DateTime<Utc>) -> Self {
        Self {
            preference,
            scope,
            evidence_count: 1,
            staleness: 0.0,
            first_seen: at,
            last_seen: at,
        }
    }

    pub fn key(&self) -> RowKey {
        RowKey::new(&self.preference, self.scope.clone())
    }

    /// Apply one confirming observation.
    pub fn confirm(&mut self, observed: &Preference, at: DateTime<Utc>) {
        self.evidence_count = self.evidence_count.saturating_add(1);
        self.staleness /= 2.0;
        if at > self.last_seen {
            self.last_seen = at;
        }
        if let (Preference::TriageOverride(mine), Preference::TriageOverride(new)) =
            (&mut self.preference, observed)
        {
            for kw in &new.subject_keywords {
                if mine.subject_keywords.len() >= MAX_OVERRIDE_KEYWORDS {
                    break;
                }
                if !mine.subject_keywords.contains(kw) {
                    mine.subject_keywords.push(kw.clone());
                }
            }
        }
    }

    /// Apply one contradicting observation.
    pub fn contradict(&mut self, penalty: u32) {
        self.evidence_count = self.evidence_count.saturating_sub(penalty);
        self.staleness += 1.0;
    }
}

// ── Sender context ──────────────────────────────────────────────────

/// Derived relationship hint for a sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipHint {
    /// A reply to this sender has been approved and sent before.
    RepliedBefore,
    /// Many messages received from this sender.
    FrequentCorrespondent,
    /// Drafts for this sender are often denied.
    OftenDeclined,
}

/// Message count at which a sender counts as a frequent correspondent.
pub const FREQUENT_CORRESPONDENT_MESSAGES: u64 = 10;
/// Denials at which drafts for a sender count as often declined.
pub const OFTEN_DECLINED_DENIALS: u32 = 3;

/// What we know about one sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderContext {
    pub address: String,
    pub message_count: u64,
    pub replies_sent: u32,
    pub denials: u32,
    pub first_seen: DateTime<Utc>,
    pub last_interaction: DateTime<Utc>,
}

impl SenderContext {
    pub fn relationship_hints(&self) -> Vec<RelationshipHint> {
        let mut hints = Vec::new();
        if self.replies_sent > 0 {
            hints.push(RelationshipHint::RepliedBefore);
        }
        if self.message_count >= FREQUENT_CORRESPONDENT_MESSAGES {
            hints.push(RelationshipHint::FrequentCorrespondent);
        }
        if self.denials >= OFTEN_DECLINED_DENIALS {
            hints.push(RelationshipHint::OftenDeclined);
        }
        hints
    }
}

/// Counter increments a merged feedback event applies to its sender.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderDelta {
    pub replies_sent: u32,
    pub denials: u32,
}

// ── Feedback log ────────────────────────────────────────────────────

/// What the human did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOutcome {
    Approved,
    Edited,
    Denied,
    TriageOverride,
}

impl FeedbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Edited => "edited",
            Self::Denied => "denied",
            Self::TriageOverride => "triage_override",
        }
    }

    pub fn from_str_value(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(Self::Approved),
            "edited" => Some(Self::Edited),
            "denied" => Some(Self::Denied),
            "triage_override" => Some(Self::TriageOverride),
            _ => None,
        }
    }

    /// Sender counters this outcome contributes when merged.
    pub fn sender_delta(&self) -> SenderDelta {
        match self {
            Self::Approved | Self::Edited => SenderDelta {
                replies_sent: 1,
                denials: 0,
            },
            Self::Denied => SenderDelta {
                replies_sent: 0,
                denials: 1,
            },
            Self::TriageOverride => SenderDelta::default(),
        }
    }
}

/// One append-only entry in the feedback log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEvent {
    /// Monotonic sequence number assigned by the store; 0 before append.
    pub seq: i64,
    pub message_id: String,
    pub sender: String,
    pub outcome: FeedbackOutcome,
    pub draft_text: String,
    /// Text actually sent; `None` for denials and triage overrides.
    pub final_text: Option<String>,
    /// Confirming observations.
    pub signals: Vec<Preference>,
    /// Preferences the human visibly went against.
    pub contradictions: Vec<Preference>,
    pub created_at: DateTime<Utc>,
    /// Whether the aggregate rows reflect this event.
    pub merged: bool,
}

impl FeedbackEvent {
    pub fn new(
        message_id: impl Into<String>,
        sender: impl Into<String>,
        outcome: FeedbackOutcome,
        draft_text: impl Into<String>,
        final_text: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            seq: 0,
            message_id: message_id.into(),
            sender: sender.into(),
            outcome,
            draft_text: draft_text.into(),
            final_text,
            signals: Vec::new(),
            contradictions: Vec::new(),
            created_at,
            merged: false,
        }
    }

    pub fn with_signals(mut self, signals: Vec<Preference>, contradictions: Vec<Preference>) -> Self {
        self.signals = signals;
        self.contradictions = contradictions;
        self
    }
}
