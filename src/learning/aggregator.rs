//! Preference aggregation: folds logged feedback events into the per-sender
//! and global aggregate rows.
//!
//! Every event is appended to the feedback log first and merged second. A
//! merge recomputes the touched rows under per-row locks and writes them,
//! together with the event's merged flag, in one store transaction. A
//! failed merge leaves the event unmerged for [`PreferenceAggregator::retry_unmerged`].
//!
//! Events are always folded in sequence order: merging an event first
//! merges every earlier event still unmerged, and a failure stops the pass
//! so a later event never overtakes an earlier one. Live state therefore
//! equals a replay of the log from empty aggregates.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::config::LearningConfig;
use crate::error::LearningError;
use crate::learning::preference::{FeedbackEvent, PreferenceRow, RowKey, Scope, SenderContext};
use crate::store::traits::PreferenceStore;

type RowLocks = Mutex<HashMap<RowKey, Arc<AsyncMutex<()>>>>;

/// Merges feedback into durable preference state.
pub struct PreferenceAggregator {
    store: Arc<dyn PreferenceStore>,
    config: LearningConfig,
    row_locks: RowLocks,
    /// Merges hold it shared; a rebuild holds it exclusively.
    replay: RwLock<()>,
}

impl PreferenceAggregator {
    pub fn new(store: Arc<dyn PreferenceStore>, config: LearningConfig) -> Self {
        Self {
            store,
            config,
            row_locks: Mutex::new(HashMap::new()),
            replay: RwLock::new(()),
        }
    }

    /// Count one inbound message for its sender.
    pub async fn observe_message(&self, sender: &str, at: DateTime<Utc>) -> Result<SenderContext, LearningError> {
        Ok(self.store.observe_sender(sender, at).await?)
    }

    /// Log an event and merge it.
    ///
    /// Logging is idempotent per (message id, outcome). If the merge fails
    /// the event stays logged and unmerged and the error is returned.
    pub async fn record(&self, event: &FeedbackEvent) -> Result<FeedbackEvent, LearningError> {
        let logged = self.store.append_feedback(event).await?;
        self.merge(&logged).await?;
        Ok(logged)
    }

    /// Fold one logged event into the aggregates, after every earlier
    /// unmerged event.
    ///
    /// Returns false if the event had already been merged.
    pub async fn merge(&self, event: &FeedbackEvent) -> Result<bool, LearningError> {
        if event.merged {
            return Ok(false);
        }
        let _replay = self.replay.read().await;
        let backlog = self.store.unmerged_feedback().await?;
        let mut merged = false;
        for pending in backlog.iter().take_while(|pending| pending.seq <= event.seq) {
            if pending.seq < event.seq {
                debug!(seq = pending.seq, before = event.seq, "Merging earlier feedback first");
            }
            let applied = self.merge_locked(pending).await?;
            if pending.seq == event.seq {
                merged = applied;
            }
        }
        Ok(merged)
    }

    /// Merge every unmerged event in sequence order. Stops at the first
    /// failure so later events never overtake an earlier one.
    pub async fn retry_unmerged(&self) -> Result<usize, LearningError> {
        let _replay = self.replay.read().await;
        self.drain_unmerged().await
    }

    /// Recompute all aggregates from the feedback log.
    pub async fn rebuild(&self) -> Result<usize, LearningError> {
        let _replay = self.replay.write().await;
        self.store.reset_aggregates().await?;
        let merged = self.drain_unmerged().await?;
        info!(events = merged, "Preference aggregates rebuilt from feedback log");
        Ok(merged)
    }

    async fn drain_unmerged(&self) -> Result<usize, LearningError> {
        let mut merged = 0;
        for event in self.store.unmerged_feedback().await? {
            if self.merge_locked(&event).await? {
                merged += 1;
            }
        }
        Ok(merged)
    }

    async fn merge_locked(&self, event: &FeedbackEvent) -> Result<bool, LearningError> {
        let keys = self.touched_keys(event);
        let _guards = self.lock_rows(&keys).await;

        let result = self.apply(event, &keys).await;
        drop(_guards);
        self.prune_locks();

        match &result {
            Ok(true) => debug!(
                seq = event.seq,
                message_id = %event.message_id,
                signals = event.signals.len(),
                contradictions = event.contradictions.len(),
                "Feedback merged"
            ),
            Ok(false) => debug!(seq = event.seq, "Feedback already merged"),
            Err(e) => warn!(seq = event.seq, error = %e, "Feedback merge failed"),
        }
        result
    }

    async fn apply(&self, event: &FeedbackEvent, keys: &BTreeSet<RowKey>) -> Result<bool, LearningError> {
        let failure = |reason: String| LearningError::MergeFailure {
            seq: event.seq,
            reason,
        };
        let key_list: Vec<RowKey> = keys.iter().cloned().collect();
        let existing = self
            .store
            .get_rows(&key_list)
            .await
            .map_err(|e| failure(e.to_string()))?;

        let mut rows: BTreeMap<RowKey, PreferenceRow> =
            existing.into_iter().map(|row| (row.key(), row)).collect();
        let mut changed: BTreeSet<RowKey> = BTreeSet::new();
        let at = event.created_at;

        for signal in &event.signals {
            for scope in self.scopes(&event.sender) {
                let key = RowKey::new(signal, scope.clone());
                match rows.get_mut(&key) {
                    Some(row) => row.confirm(signal, at),
                    None => {
                        rows.insert(key.clone(), PreferenceRow::first(signal.clone(), scope, at));
                    }
                }
                changed.insert(key);
            }
        }

        for pref in &event.contradictions {
            for scope in self.scopes(&event.sender) {
                let key = RowKey::new(pref, scope);
                if let Some(row) = rows.get_mut(&key) {
                    row.contradict(self.config.contradiction_penalty);
                    changed.insert(key);
                }
            }
        }

        let updated: Vec<PreferenceRow> = changed
            .iter()
            .filter_map(|key| rows.get(key).cloned())
            .collect();

        self.store
            .apply_merge(event.seq, &updated, &event.sender, &event.outcome.sender_delta(), at)
            .await
            .map_err(|e| failure(e.to_string()))
    }

    fn scopes(&self, sender: &str) -> [Scope; 2] {
        [Scope::Sender(sender.to_string()), Scope::Global]
    }

    fn touched_keys(&self, event: &FeedbackEvent) -> BTreeSet<RowKey> {
        event
            .signals
            .iter()
            .chain(&event.contradictions)
            .flat_map(|pref| {
                self.scopes(&event.sender)
                    .into_iter()
                    .map(move |scope| RowKey::new(pref, scope))
            })
            .collect()
    }

    /// Lock rows in key order so overlapping merges cannot deadlock.
    async fn lock_rows(&self, keys: &BTreeSet<RowKey>) -> Vec<OwnedMutexGuard<()>> {
        let locks: Vec<Arc<AsyncMutex<()>>> = {
            let mut table = match self.row_locks.lock() {
                Ok(table) => table,
                Err(poisoned) => poisoned.into_inner(),
            };
            keys.iter()
                .map(|key| table.entry(key.clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    /// Forget locks nobody holds or waits on.
    fn prune_locks(&self) {
        let mut table = match self.row_locks.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learning::preference::{FeedbackOutcome, Preference, TriageOverride};
    use crate::pipeline::types::TriageLabel;
    use crate::store::LibSqlBackend;

    async fn setup() -> (Arc<LibSqlBackend>, PreferenceAggregator) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let agg = PreferenceAggregator::new(db.clone(), LearningConfig::default());
        (db, agg)
    }

    fn edited(message_id: &str, sender: &str, signals: Vec<Preference>) -> FeedbackEvent {
        FeedbackEvent::new(message_id, sender, FeedbackOutcome::Edited, "draft", Some("final".into()), Utc::now())
            .with_signals(signals, Vec::new())
    }

    fn approved_keeping(message_id: &str, sender: &str, kept: Vec<Preference>) -> FeedbackEvent {
        FeedbackEvent::new(message_id, sender, FeedbackOutcome::Approved, "draft", Some("draft".into()), Utc::now())
            .with_signals(Vec::new(), kept)
    }

    async fn count_of(db: &LibSqlBackend, pref: &Preference, scope: Scope) -> Option<u32> {
        db.get_rows(&[RowKey::new(pref, scope)])
            .await
            .unwrap()
            .first()
            .map(|r| r.evidence_count)
    }

    #[tokio::test]
    async fn merge_updates_sender_and_global_rows() {
        let (db, agg) = setup().await;
        agg.record(&edited("m1", "a@x.com", vec![Preference::NoGreeting, Preference::NoSignoff]))
            .await
            .unwrap();

        for pref in [Preference::NoGreeting, Preference::NoSignoff] {
            assert_eq!(count_of(&db, &pref, Scope::Sender("a@x.com".into())).await, Some(1));
            assert_eq!(count_of(&db, &pref, Scope::Global).await, Some(1));
        }
        let ctx = db.get_sender_context("a@x.com").await.unwrap().unwrap();
        assert_eq!(ctx.replies_sent, 1);
    }

    #[tokio::test]
    async fn merging_twice_counts_once() {
        let (db, agg) = setup().await;
        let logged = agg
            .record(&edited("m1", "a@x.com", vec![Preference::NoGreeting]))
            .await
            .unwrap();

        // A retry with the stale, pre-merge copy of the event.
        assert!(!agg.merge(&logged).await.unwrap());
        // A re-delivered record call.
        agg.record(&edited("m1", "a@x.com", vec![Preference::NoGreeting]))
            .await
            .unwrap();

        assert_eq!(count_of(&db, &Preference::NoGreeting, Scope::Global).await, Some(1));
    }

    #[tokio::test]
    async fn contradictions_decay_but_never_create() {
        let (db, agg) = setup().await;
        for i in 0..3 {
            agg.record(&edited(&format!("m{i}"), "a@x.com", vec![Preference::NoGreeting]))
                .await
                .unwrap();
        }
        agg.record(&approved_keeping("m9", "a@x.com", vec![Preference::NoGreeting, Preference::NoSignoff]))
            .await
            .unwrap();

        let rows = db
            .get_rows(&[RowKey::new(&Preference::NoGreeting, Scope::Sender("a@x.com".into()))])
            .await
            .unwrap();
        assert_eq!(rows[0].evidence_count, 1);
        assert!(rows[0].staleness > 0.9);
        assert_eq!(count_of(&db, &Preference::NoSignoff, Scope::Global).await, None);
    }

    #[tokio::test]
    async fn rebuild_reproduces_live_state() {
        let (db, agg) = setup().await;
        agg.record(&edited("m1", "a@x.com", vec![Preference::NoGreeting, Preference::AvoidWord("kindly".into())]))
            .await
            .unwrap();
        agg.record(&edited("m2", "b@y.com", vec![Preference::NoGreeting]))
            .await
            .unwrap();
        agg.record(&approved_keeping("m3", "a@x.com", vec![Preference::NoGreeting]))
            .await
            .unwrap();
        agg.record(&edited("m4", "a@x.com", vec![Preference::NoGreeting]))
            .await
            .unwrap();
        let denied = FeedbackEvent::new("m5", "b@y.com", FeedbackOutcome::Denied, "draft", None, Utc::now());
        agg.record(&denied).await.unwrap();

        let live = db.list_preferences(None).await.unwrap();
        let live_ctx = db.get_sender_context("b@y.com").await.unwrap();

        assert_eq!(agg.rebuild().await.unwrap(), 5);
        assert_eq!(db.list_preferences(None).await.unwrap(), live);
        assert_eq!(db.get_sender_context("b@y.com").await.unwrap(), live_ctx);
    }

    #[tokio::test]
    async fn merging_a_later_event_first_keeps_sequence_order() {
        let (db, agg) = setup().await;
        agg.record(&edited("m1", "a@x.com", vec![Preference::NoGreeting]))
            .await
            .unwrap();
        let kept = db
            .append_feedback(&approved_keeping("m2", "a@x.com", vec![Preference::NoGreeting]))
            .await
            .unwrap();
        let removed = db
            .append_feedback(&edited("m3", "a@x.com", vec![Preference::NoGreeting]))
            .await
            .unwrap();
        assert!(kept.seq < removed.seq);

        assert!(agg.merge(&removed).await.unwrap());
        assert!(db.unmerged_feedback().await.unwrap().is_empty());
        // Decayed to zero by m2, then confirmed again by m3.
        assert_eq!(count_of(&db, &Preference::NoGreeting, Scope::Global).await, Some(1));

        let live = db.list_preferences(None).await.unwrap();
        assert_eq!(agg.rebuild().await.unwrap(), 3);
        assert_eq!(db.list_preferences(None).await.unwrap(), live);
    }

    #[tokio::test]
    async fn concurrent_merges_on_one_row_lose_nothing() {
        let (db, agg) = setup().await;
        let agg = Arc::new(agg);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let agg = agg.clone();
                tokio::spawn(async move {
                    agg.record(&edited(&format!("m{i}"), "a@x.com", vec![Preference::NoGreeting]))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }

        assert_eq!(count_of(&db, &Preference::NoGreeting, Scope::Global).await, Some(8));
        assert_eq!(
            count_of(&db, &Preference::NoGreeting, Scope::Sender("a@x.com".into())).await,
            Some(8)
        );
    }

    #[tokio::test]
    async fn retry_picks_up_unmerged_events() {
        let (db, agg) = setup().await;
        let event = edited("m1", "a@x.com", vec![Preference::NoSignoff]);
        db.append_feedback(&event).await.unwrap();
        assert_eq!(count_of(&db, &Preference::NoSignoff, Scope::Global).await, None);

        assert_eq!(agg.retry_unmerged().await.unwrap(), 1);
        assert_eq!(agg.retry_unmerged().await.unwrap(), 0);
        assert_eq!(count_of(&db, &Preference::NoSignoff, Scope::Global).await, Some(1));
    }

    #[tokio::test]
    async fn triage_overrides_accumulate_keywords() {
        let (db, agg) = setup().await;
        let override_for = |kw: &str| {
            Preference::TriageOverride(TriageOverride {
                original: TriageLabel::Ignore,
                corrected: TriageLabel::Respond,
                subject_keywords: vec![kw.to_string()],
            })
        };
        for (i, kw) in ["invoice", "contract"].iter().enumerate() {
            let event = FeedbackEvent::new(
                format!("m{i}"),
                "a@x.com",
                FeedbackOutcome::TriageOverride,
                "",
                None,
                Utc::now(),
            )
            .with_signals(vec![override_for(kw)], Vec::new());
            agg.record(&event).await.unwrap();
        }

        let rows = db
            .list_preferences(Some(&Scope::Sender("a@x.com".into())))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].evidence_count, 2);
        assert_eq!(rows[0].preference.keywords(), &["invoice".to_string(), "contract".to_string()]);
    }

    #[tokio::test]
    async fn lock_table_is_pruned_after_merges() {
        let (_db, agg) = setup().await;
        agg.record(&edited("m1", "a@x.com", vec![Preference::NoGreeting]))
            .await
            .unwrap();
        assert!(agg.row_locks.lock().unwrap().is_empty());
    }
}
