//! Read-only view over learned preferences, shaped as a bias payload for
//! the drafter and advisory hints for the triage classifier.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::LearningConfig;
use crate::error::DatabaseError;
use crate::learning::preference::{
    FeedbackOutcome, Preference, PreferenceKind, PreferenceRow, RelationshipHint, SCHEMA_VERSION,
    Scope,
};
use crate::pipeline::types::TriageLabel;
use crate::store::traits::PreferenceStore;

/// One preference that crossed the confidence threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePreference {
    pub preference: Preference,
    pub scope: Scope,
    pub evidence_count: u32,
    /// Contradictions not yet outweighed by confirmations.
    pub staleness: f64,
    pub instruction: String,
}

/// Advisory triage context: the human kept correcting this label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageHint {
    pub original: TriageLabel,
    pub corrected: TriageLabel,
    pub evidence_count: u32,
    pub subject_keywords: Vec<String>,
}

/// A recent edit, offered to the drafter as a few-shot example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackExample {
    pub message_id: String,
    pub outcome: FeedbackOutcome,
    pub draft_text: String,
    pub final_text: Option<String>,
    pub signals: Vec<Preference>,
}

/// Everything learned about drafting for one sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiasPayload {
    pub sender: String,
    pub schema_version: u32,
    /// Sender-scoped entries first, then global; each group in kind order.
    pub active: Vec<ActivePreference>,
    pub triage_hints: Vec<TriageHint>,
    /// Newest first.
    pub examples: Vec<FeedbackExample>,
    pub relationship_hints: Vec<RelationshipHint>,
    pub message_count: u64,
}

impl BiasPayload {
    /// Payload for a sender with no history.
    pub fn cold(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            schema_version: SCHEMA_VERSION,
            active: Vec::new(),
            triage_hints: Vec::new(),
            examples: Vec::new(),
            relationship_hints: Vec::new(),
            message_count: 0,
        }
    }

    pub fn is_active(&self, preference: &Preference) -> bool {
        self.active.iter().any(|a| &a.preference == preference)
    }

    /// Drafting instructions in payload order.
    pub fn instructions(&self) -> Vec<&str> {
        self.active.iter().map(|a| a.instruction.as_str()).collect()
    }
}

/// Builds bias payloads from a store snapshot.
pub struct MemoryView {
    store: Arc<dyn PreferenceStore>,
    config: LearningConfig,
}

impl MemoryView {
    pub fn new(store: Arc<dyn PreferenceStore>, config: LearningConfig) -> Self {
        Self { store, config }
    }

    /// Bias payload for `sender`. A never-seen sender gets
    /// [`BiasPayload::cold`].
    pub async fn build_bias(&self, sender: &str) -> Result<BiasPayload, DatabaseError> {
        let snapshot = self.store.preference_snapshot(sender).await?;
        let context = self.store.get_sender_context(sender).await?;
        let recent = self
            .store
            .recent_feedback(sender, self.config.recent_examples)
            .await?;

        let mut payload = BiasPayload::cold(sender);
        payload.active = self.active_preferences(&snapshot);
        payload.triage_hints = self.triage_hints(&snapshot);
        payload.examples = recent
            .into_iter()
            .map(|event| FeedbackExample {
                message_id: event.message_id,
                outcome: event.outcome,
                draft_text: event.draft_text,
                final_text: event.final_text,
                signals: event.signals,
            })
            .collect();
        if let Some(ctx) = context {
            payload.relationship_hints = ctx.relationship_hints();
            payload.message_count = ctx.message_count;
        }
        Ok(payload)
    }

    fn active_preferences(&self, snapshot: &[PreferenceRow]) -> Vec<ActivePreference> {
        let threshold = self.config.confidence_threshold;
        let style = |row: &&PreferenceRow| {
            row.preference.kind() != PreferenceKind::TriageOverride && row.evidence_count >= threshold
        };

        let mut sender_rows: Vec<&PreferenceRow> = snapshot
            .iter()
            .filter(style)
            .filter(|r| matches!(r.scope, Scope::Sender(_)))
            .collect();
        let mut global_rows: Vec<&PreferenceRow> = snapshot
            .iter()
            .filter(style)
            .filter(|r| r.scope == Scope::Global)
            .collect();
        sort_rows(&mut sender_rows);
        sort_rows(&mut global_rows);

        // Active sender rows shadow global rows: whole kinds for categorical
        // preferences, single words or phrases for lexical ones.
        let shadowed_kinds: HashSet<PreferenceKind> = sender_rows
            .iter()
            .map(|r| r.preference.kind())
            .filter(|k| !k.is_lexical())
            .collect();
        let shadowed_terms: HashSet<(bool, String)> = sender_rows
            .iter()
            .filter_map(|r| lexical_term(&r.preference))
            .collect();

        let visible_global = global_rows.into_iter().filter(|r| {
            let kind = r.preference.kind();
            if kind.is_lexical() {
                lexical_term(&r.preference).is_none_or(|term| !shadowed_terms.contains(&term))
            } else {
                !shadowed_kinds.contains(&kind)
            }
        });

        sender_rows
            .into_iter()
            .chain(visible_global)
            .map(|row| ActivePreference {
                preference: row.preference.clone(),
                scope: row.scope.clone(),
                evidence_count: row.evidence_count,
                staleness: row.staleness,
                instruction: row.preference.instruction(),
            })
            .collect()
    }

    fn triage_hints(&self, snapshot: &[PreferenceRow]) -> Vec<TriageHint> {
        let mut rows: Vec<&PreferenceRow> = snapshot
            .iter()
            .filter(|r| matches!(r.scope, Scope::Sender(_)))
            .filter(|r| r.evidence_count >= self.config.triage_hint_threshold)
            .collect();
        sort_rows(&mut rows);

        rows.into_iter()
            .filter_map(|row| match &row.preference {
                Preference::TriageOverride(o) => Some(TriageHint {
                    original: o.original,
                    corrected: o.corrected,
                    evidence_count: row.evidence_count,
                    subject_keywords: o.subject_keywords.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Kind order, then strongest evidence, then least stale, then value.
fn sort_rows(rows: &mut [&PreferenceRow]) {
    rows.sort_by(|a, b| {
        a.preference
            .kind()
            .cmp(&b.preference.kind())
            .then(b.evidence_count.cmp(&a.evidence_count))
            .then(a.staleness.total_cmp(&b.staleness))
            .then_with(|| a.preference.value_key().cmp(&b.preference.value_key()))
    });
}

/// (is_phrase, term) for lexical preferences, so "avoid x" and "prefer x"
/// compete for the same term.
fn lexical_term(pref: &Preference) -> Option<(bool, String)> {
    match pref {
        Preference::AvoidWord(w) | Preference::PreferWord(w) => Some((false, w.clone())),
        Preference::AvoidPhrase(p) | Preference::PreferPhrase(p) => Some((true, p.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::preference::{FeedbackEvent, Tone, TriageOverride};
    use crate::store::LibSqlBackend;
    use chrono::Utc;

    async fn setup() -> (Arc<LibSqlBackend>, MemoryView) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let view = MemoryView::new(db.clone(), LearningConfig::default());
        (db, view)
    }

    /// Write rows directly through a logged placeholder event.
    async fn seed(db: &LibSqlBackend, tag: &str, rows: Vec<PreferenceRow>) {
        let event = db
            .append_feedback(&FeedbackEvent::new(
                tag,
                "seed@x.com",
                FeedbackOutcome::TriageOverride,
                "",
                None,
                Utc::now(),
            ))
            .await
            .unwrap();
        db.apply_merge(event.seq, &rows, "seed@x.com", &Default::default(), Utc::now())
            .await
            .unwrap();
    }

    fn row(pref: Preference, scope: Scope, count: u32) -> PreferenceRow {
        let mut row = PreferenceRow::first(pref, scope, Utc::now());
        row.evidence_count = count;
        row
    }

    fn sender() -> Scope {
        Scope::Sender("a@x.com".into())
    }

    #[tokio::test]
    async fn unknown_sender_gets_cold_payload() {
        let (_db, view) = setup().await;
        let payload = view.build_bias("nobody@nowhere.com").await.unwrap();
        assert_eq!(payload, BiasPayload::cold("nobody@nowhere.com"));
        assert!(payload.instructions().is_empty());
    }

    #[tokio::test]
    async fn below_threshold_is_tracked_not_surfaced() {
        let (db, view) = setup().await;
        seed(&db, "s1", vec![row(Preference::NoGreeting, sender(), 2)]).await;
        assert!(view.build_bias("a@x.com").await.unwrap().active.is_empty());

        seed(&db, "s2", vec![row(Preference::NoGreeting, sender(), 3)]).await;
        let payload = view.build_bias("a@x.com").await.unwrap();
        assert!(payload.is_active(&Preference::NoGreeting));
        assert_eq!(payload.active[0].scope, sender());
    }

    #[tokio::test]
    async fn sender_rows_shadow_global_kind() {
        let (db, view) = setup().await;
        seed(
            &db,
            "s1",
            vec![
                row(Preference::Tone(Tone::Casual), sender(), 3),
                row(Preference::Tone(Tone::Concise), Scope::Global, 9),
                row(Preference::NoSignoff, Scope::Global, 4),
            ],
        )
        .await;

        let payload = view.build_bias("a@x.com").await.unwrap();
        let prefs: Vec<&Preference> = payload.active.iter().map(|a| &a.preference).collect();
        assert_eq!(prefs, vec![&Preference::Tone(Tone::Casual), &Preference::NoSignoff]);

        // Other senders still see the global tone.
        let other = view.build_bias("b@y.com").await.unwrap();
        assert!(other.is_active(&Preference::Tone(Tone::Concise)));
    }

    #[tokio::test]
    async fn lexical_precedence_is_per_term() {
        let (db, view) = setup().await;
        seed(
            &db,
            "s1",
            vec![
                row(Preference::PreferWord("cheers".into()), sender(), 3),
                row(Preference::AvoidWord("cheers".into()), Scope::Global, 5),
                row(Preference::AvoidWord("kindly".into()), Scope::Global, 5),
            ],
        )
        .await;

        let payload = view.build_bias("a@x.com").await.unwrap();
        assert!(payload.is_active(&Preference::PreferWord("cheers".into())));
        assert!(!payload.is_active(&Preference::AvoidWord("cheers".into())));
        assert!(payload.is_active(&Preference::AvoidWord("kindly".into())));
    }

    #[tokio::test]
    async fn triage_hints_use_their_own_threshold() {
        let (db, view) = setup().await;
        let over = Preference::TriageOverride(TriageOverride {
            original: TriageLabel::Ignore,
            corrected: TriageLabel::Respond,
            subject_keywords: vec!["invoice".into()],
        });
        seed(&db, "s1", vec![row(over.clone(), sender(), 1)]).await;
        assert!(view.build_bias("a@x.com").await.unwrap().triage_hints.is_empty());

        seed(&db, "s2", vec![row(over, sender(), 2)]).await;
        let payload = view.build_bias("a@x.com").await.unwrap();
        assert_eq!(payload.triage_hints.len(), 1);
        assert_eq!(payload.triage_hints[0].corrected, TriageLabel::Respond);
        assert!(payload.active.is_empty(), "overrides are not style preferences");
    }

    #[tokio::test]
    async fn contradicted_rows_rank_after_fresh_ones() {
        let (db, view) = setup().await;
        let mut stale = row(Preference::AvoidWord("alpha".into()), Scope::Global, 3);
        stale.staleness = 1.5;
        seed(
            &db,
            "s1",
            vec![stale, row(Preference::AvoidWord("beta".into()), Scope::Global, 3)],
        )
        .await;

        let payload = view.build_bias("a@x.com").await.unwrap();
        let words: Vec<(&Preference, f64)> = payload
            .active
            .iter()
            .map(|a| (&a.preference, a.staleness))
            .collect();
        assert_eq!(
            words,
            vec![
                (&Preference::AvoidWord("beta".into()), 0.0),
                (&Preference::AvoidWord("alpha".into()), 1.5),
            ]
        );
    }

    #[tokio::test]
    async fn payload_order_is_deterministic() {
        let (db, view) = setup().await;
        seed(
            &db,
            "s1",
            vec![
                row(Preference::AvoidWord("zeta".into()), Scope::Global, 3),
                row(Preference::AvoidWord("alpha".into()), Scope::Global, 3),
                row(Preference::NoSignoff, Scope::Global, 3),
                row(Preference::NoGreeting, sender(), 3),
            ],
        )
        .await;

        let first = view.build_bias("a@x.com").await.unwrap();
        let second = view.build_bias("a@x.com").await.unwrap();
        assert_eq!(first, second);
        let prefs: Vec<Preference> = first.active.into_iter().map(|a| a.preference).collect();
        assert_eq!(
            prefs,
            vec![
                Preference::NoGreeting,
                Preference::NoSignoff,
                Preference::AvoidWord("alpha".into()),
                Preference::AvoidWord("zeta".into()),
            ]
        );
    }
}
