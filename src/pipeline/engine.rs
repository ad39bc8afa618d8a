//! Workflow engine: drives one message through
//! triage → draft → checkpoint → human decision → send, and feeds each
//! human decision back into preference learning.
//!
//! All cross-message state lives in the stores. The engine itself holds
//! only handles, so any number of messages may be in flight at once.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::approval::model::{CheckpointStatus, Decision, DraftCheckpoint, Resolution};
use crate::config::EngineConfig;
use crate::error::{DeliveryError, Error, LearningError, OracleError, WorkflowError};
use crate::learning::lexicon;
use crate::learning::preference::{
    FeedbackEvent, FeedbackOutcome, MAX_OVERRIDE_KEYWORDS, Preference, TriageOverride,
};
use crate::learning::{BiasPayload, EditDiffAnalyzer, MemoryView, PreferenceAggregator};
use crate::pipeline::oracle::{Drafter, ReplySender, TriageClassifier};
use crate::pipeline::retry;
use crate::pipeline::state::WorkflowState;
use crate::pipeline::types::{Message, TriageDecision, TriageLabel, TriageSource, normalize_sender};
use crate::store::traits::{CheckpointStore, PreferenceStore, ResolveOutcome, StoredMessage};

/// Where a message ended up after an engine call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub message_id: String,
    pub state: WorkflowState,
    /// Effective triage label, once there is one.
    pub label: Option<TriageLabel>,
    /// True when the message id had already been ingested.
    pub duplicate: bool,
}

/// Work done by [`WorkflowEngine::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub pending_checkpoints: usize,
    pub triaged: usize,
    pub drafted: usize,
    pub delivered: usize,
    /// Resolved checkpoints whose feedback event was logged late.
    pub relearned: usize,
    pub merged_feedback: usize,
    pub failures: usize,
}

/// Counts for dashboards and health checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub messages: BTreeMap<String, u64>,
    pub checkpoints: BTreeMap<String, u64>,
    pub feedback_events: u64,
    pub active_preferences: u64,
}

/// The per-message state machine plus its learning loop.
pub struct WorkflowEngine {
    checkpoints: Arc<dyn CheckpointStore>,
    preferences: Arc<dyn PreferenceStore>,
    classifier: Arc<dyn TriageClassifier>,
    drafter: Arc<dyn Drafter>,
    outbox: Arc<dyn ReplySender>,
    analyzer: EditDiffAnalyzer,
    aggregator: PreferenceAggregator,
    memory: MemoryView,
    config: EngineConfig,
}

impl WorkflowEngine {
    /// Build an engine over one backend that implements both stores.
    pub fn new<S>(
        store: Arc<S>,
        classifier: Arc<dyn TriageClassifier>,
        drafter: Arc<dyn Drafter>,
        outbox: Arc<dyn ReplySender>,
        config: EngineConfig,
    ) -> Self
    where
        S: CheckpointStore + PreferenceStore + 'static,
    {
        let checkpoints: Arc<dyn CheckpointStore> = store.clone();
        let preferences: Arc<dyn PreferenceStore> = store;
        Self {
            aggregator: PreferenceAggregator::new(preferences.clone(), config.learning.clone()),
            memory: MemoryView::new(preferences.clone(), config.learning.clone()),
            analyzer: EditDiffAnalyzer::new(config.learning.clone()),
            checkpoints,
            preferences,
            classifier,
            drafter,
            outbox,
            config,
        }
    }

    pub fn aggregator(&self) -> &PreferenceAggregator {
        &self.aggregator
    }

    // ── Ingest and triage ───────────────────────────────────────────

    /// Take in a message and run it as far as it can go without the human.
    ///
    /// A re-delivered id is reported as a duplicate and not processed again.
    pub async fn ingest(&self, message: Message) -> Result<Progress, Error> {
        if !self.checkpoints.insert_message(&message).await? {
            let stored = self.stored(&message.id).await?;
            let label = self.effective_label(&message.id).await?;
            debug!(message_id = %message.id, state = %stored.state, "Duplicate delivery ignored");
            return Ok(Progress {
                message_id: message.id,
                state: stored.state,
                label,
                duplicate: true,
            });
        }

        info!(
            message_id = %message.id,
            sender = %message.sender,
            "Message received"
        );

        if let Err(e) = self.aggregator.observe_message(&message.sender, message.received_at).await {
            warn!(sender = %message.sender, error = %e, "Sender context not updated");
        }

        let label = self.triage(&message).await?;
        let state = self.branch(&message, label).await?;
        Ok(Progress {
            message_id: message.id,
            state,
            label: Some(label),
            duplicate: false,
        })
    }

    /// Ingest messages concurrently. Each result stands alone.
    pub async fn process_batch(&self, messages: Vec<Message>) -> Vec<Result<Progress, Error>> {
        let count = messages.len();
        info!(count, "Processing message batch");
        let results = join_all(messages.into_iter().map(|m| self.ingest(m))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            error!(failed, total = count, "Some messages in batch failed");
        }
        results
    }

    /// `received → triaged`. Classifier failure falls back to `notify_human`.
    async fn triage(&self, message: &Message) -> Result<TriageLabel, Error> {
        let bias = self.bias_or_cold(&message.sender).await;
        let verdict = self
            .bounded("classifier", self.classifier.classify(message, &bias.triage_hints))
            .await;

        let decision = match verdict {
            Ok(c) => TriageDecision {
                message_id: message.id.clone(),
                label: c.label,
                source: TriageSource::Model,
                confidence: Some(c.confidence),
                reason: None,
                decided_at: Utc::now(),
            },
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Classifier failed, escalating to human");
                TriageDecision {
                    message_id: message.id.clone(),
                    label: TriageLabel::NotifyHuman,
                    source: TriageSource::Model,
                    confidence: None,
                    reason: Some(e.to_string()),
                    decided_at: Utc::now(),
                }
            }
        };

        self.checkpoints.record_triage(&decision).await?;
        self.transition(&message.id, WorkflowState::Received, WorkflowState::Triaged, None)
            .await?;
        info!(message_id = %message.id, label = %decision.label, "Message triaged");
        Ok(decision.label)
    }

    /// Take the branch for a triaged message.
    async fn branch(&self, message: &Message, label: TriageLabel) -> Result<WorkflowState, Error> {
        let target = target_state(label);
        self.transition(&message.id, WorkflowState::Triaged, target, None)
            .await?;
        if target == WorkflowState::Drafting {
            return self.draft(message).await;
        }
        Ok(target)
    }

    // ── Drafting ────────────────────────────────────────────────────

    /// Draft with bounded retries, then checkpoint. On exhaustion the
    /// message escalates to `notified`.
    ///
    /// The attempt budget is durable: attempts made before a restart count
    /// against it.
    async fn draft(&self, message: &Message) -> Result<WorkflowState, Error> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let used = self.stored(&message.id).await?.draft_attempts;
        if used >= max_attempts {
            let reason = format!("drafting failed: {used} attempts already made");
            return self.escalate_draft(message, &reason).await;
        }

        let bias = self.bias_or_cold(&message.sender).await;
        let mut last_error = None;

        for attempt in used..max_attempts {
            let total = self.checkpoints.record_draft_attempt(&message.id).await?;
            let result = self
                .bounded("drafter", self.drafter.draft(message, &bias))
                .await
                .and_then(|text| {
                    if text.trim().is_empty() {
                        Err(OracleError::DraftGenerationFailed("drafter returned empty text".into()))
                    } else {
                        Ok(text)
                    }
                });

            match result {
                Ok(text) => {
                    let checkpoint = DraftCheckpoint::new(&message.id, text);
                    if !self.checkpoints.create_checkpoint(&checkpoint).await? {
                        debug!(message_id = %message.id, "Checkpoint already exists");
                        return Ok(self.stored(&message.id).await?.state);
                    }
                    info!(
                        message_id = %message.id,
                        attempts = total,
                        active_preferences = bias.active.len(),
                        "Draft awaiting approval"
                    );
                    return Ok(WorkflowState::AwaitingApproval);
                }
                Err(e) => {
                    warn!(message_id = %message.id, attempt = attempt + 1, error = %e, "Draft attempt failed");
                    let retryable = retry::is_retryable(&e);
                    last_error = Some(e);
                    if !retryable || attempt + 1 >= max_attempts {
                        break;
                    }
                    tokio::time::sleep(retry::compute_delay(&self.config.retry, attempt)).await;
                }
            }
        }

        let reason = match last_error {
            Some(e) => format!("drafting failed: {e}"),
            None => "drafting failed".to_string(),
        };
        self.escalate_draft(message, &reason).await
    }

    async fn escalate_draft(&self, message: &Message, reason: &str) -> Result<WorkflowState, Error> {
        self.transition(&message.id, WorkflowState::Drafting, WorkflowState::Notified, Some(reason))
            .await?;
        warn!(message_id = %message.id, reason, "Drafting exhausted, escalated to human");
        Ok(WorkflowState::Notified)
    }

    // ── Resolution ──────────────────────────────────────────────────

    /// Apply the human's decision to a pending checkpoint, exactly once.
    ///
    /// Delivery happens before learning, and learning failures are only
    /// logged. A second resolution returns `CheckpointConflict`.
    pub async fn resolve(&self, message_id: &str, decision: Decision) -> Result<Resolution, Error> {
        decision.validate()?;
        let pending = self
            .checkpoints
            .get_checkpoint(message_id)
            .await?
            .ok_or_else(|| WorkflowError::CheckpointNotFound(message_id.to_string()))?;
        if pending.status.is_terminal() {
            return Err(conflict(message_id, pending.status));
        }

        let status = decision.status_for(&pending.draft_text);
        let final_text = decision.final_text(&pending.draft_text);
        let checkpoint = match self
            .checkpoints
            .resolve_checkpoint(message_id, status, final_text.as_deref(), Utc::now())
            .await?
        {
            ResolveOutcome::Resolved(cp) => cp,
            ResolveOutcome::Conflict(existing) => {
                warn!(message_id, status = %existing, "Checkpoint already resolved");
                return Err(conflict(message_id, existing));
            }
            ResolveOutcome::NotFound => {
                return Err(WorkflowError::CheckpointNotFound(message_id.to_string()).into());
            }
        };
        info!(message_id, status = %checkpoint.status, "Checkpoint resolved");

        let stored = self.stored(message_id).await?;
        let (state, delivered) = match checkpoint.status {
            CheckpointStatus::Approved | CheckpointStatus::Edited => {
                self.deliver(&stored.message, &checkpoint).await?
            }
            _ => (stored.state, false),
        };
        let signals = self.learn_from_checkpoint(&stored.message, &checkpoint).await;

        Ok(Resolution {
            message_id: message_id.to_string(),
            status: checkpoint.status,
            state,
            delivered,
            signals,
        })
    }

    /// Send the approved text and move the message to `sent`. A transport
    /// failure leaves it in `approved`/`edited` for [`recover`](Self::recover).
    async fn deliver(
        &self,
        message: &Message,
        checkpoint: &DraftCheckpoint,
    ) -> Result<(WorkflowState, bool), Error> {
        let from = match checkpoint.status {
            CheckpointStatus::Edited => WorkflowState::Edited,
            _ => WorkflowState::Approved,
        };
        let text = checkpoint.final_text.as_deref().unwrap_or(&checkpoint.draft_text);

        match self.outbox.send(message, text).await {
            Ok(()) => {
                self.transition(&message.id, from, WorkflowState::Sent, None)
                    .await?;
                info!(message_id = %message.id, "Reply sent");
                Ok((WorkflowState::Sent, true))
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Reply delivery failed");
                Ok((from, false))
            }
        }
    }

    /// Log the resolution as a feedback event and merge it. Returns the
    /// number of signals learned; failures only warn.
    async fn learn_from_checkpoint(&self, message: &Message, checkpoint: &DraftCheckpoint) -> usize {
        match self.try_learn(message, checkpoint).await {
            Ok(count) => count,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "Learning skipped for this resolution");
                0
            }
        }
    }

    async fn try_learn(&self, message: &Message, checkpoint: &DraftCheckpoint) -> Result<usize, LearningError> {
        let (outcome, signals, contradictions) = match checkpoint.status {
            CheckpointStatus::Approved | CheckpointStatus::Edited => {
                let final_text = checkpoint.final_text.as_deref().unwrap_or(&checkpoint.draft_text);
                let outcome = if checkpoint.status == CheckpointStatus::Edited {
                    FeedbackOutcome::Edited
                } else {
                    FeedbackOutcome::Approved
                };
                (
                    outcome,
                    self.analyzer
                        .analyze_reply(&checkpoint.draft_text, final_text, &message.body),
                    self.analyzer.retained(&checkpoint.draft_text, final_text),
                )
            }
            CheckpointStatus::Denied => (FeedbackOutcome::Denied, Vec::new(), Vec::new()),
            CheckpointStatus::Pending => return Ok(0),
        };

        let count = signals.len();
        let event = FeedbackEvent::new(
            &checkpoint.message_id,
            &message.sender,
            outcome,
            &checkpoint.draft_text,
            checkpoint.final_text.clone(),
            checkpoint.resolved_at.unwrap_or_else(Utc::now),
        )
        .with_signals(signals, contradictions);

        let logged = self.record_feedback(&event).await?;
        debug!(message_id = %message.id, seq = logged.seq, signals = count, "Feedback recorded");
        Ok(count)
    }

    /// Log and merge with the drafting backoff. Safe to repeat: logging is
    /// idempotent per (message id, outcome) and merging per event.
    async fn record_feedback(&self, event: &FeedbackEvent) -> Result<FeedbackEvent, LearningError> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.aggregator.record(event).await {
                Ok(logged) => return Ok(logged),
                Err(e) if attempt + 1 < max_attempts => {
                    warn!(
                        message_id = %event.message_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Feedback not recorded, retrying"
                    );
                    tokio::time::sleep(retry::compute_delay(&self.config.retry, attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Triage override ─────────────────────────────────────────────

    /// Human relabels an ignored or notified message. The correction is
    /// learned as a triage override; `respond` continues into drafting.
    pub async fn override_triage(&self, message_id: &str, corrected: TriageLabel) -> Result<Progress, Error> {
        let stored = self.stored(message_id).await?;
        let original = match stored.state {
            WorkflowState::Ignored => TriageLabel::Ignore,
            WorkflowState::Notified => TriageLabel::NotifyHuman,
            state => return Err(invalid(message_id, state, target_state(corrected))),
        };
        let target = target_state(corrected);
        if corrected == original || !stored.state.can_override_to(target) {
            return Err(invalid(message_id, stored.state, target));
        }

        self.transition(message_id, stored.state, target, Some("human override"))
            .await?;
        if target == WorkflowState::Drafting {
            self.checkpoints.reset_draft_attempts(message_id).await?;
        }
        self.checkpoints
            .record_triage(&TriageDecision {
                message_id: message_id.to_string(),
                label: corrected,
                source: TriageSource::HumanOverride,
                confidence: None,
                reason: None,
                decided_at: Utc::now(),
            })
            .await?;
        info!(message_id, from = %original, to = %corrected, "Triage overridden");

        let message = &stored.message;
        let signal = Preference::TriageOverride(TriageOverride {
            original,
            corrected,
            subject_keywords: subject_keywords(&message.subject),
        });
        let event = FeedbackEvent::new(
            message_id,
            &message.sender,
            FeedbackOutcome::TriageOverride,
            "",
            None,
            Utc::now(),
        )
        .with_signals(vec![signal], Vec::new());
        if let Err(e) = self.record_feedback(&event).await {
            warn!(message_id, error = %e, "Learning skipped for triage override");
        }

        let state = if target == WorkflowState::Drafting {
            self.draft(message).await?
        } else {
            target
        };
        Ok(Progress {
            message_id: message_id.to_string(),
            state,
            label: Some(corrected),
            duplicate: false,
        })
    }

    // ── Recovery ────────────────────────────────────────────────────

    /// Resume everything a restart interrupted.
    pub async fn recover(&self) -> Result<RecoveryReport, Error> {
        let mut report = RecoveryReport {
            pending_checkpoints: self.checkpoints.pending_checkpoints().await?.len(),
            ..Default::default()
        };

        for stored in self.checkpoints.messages_in_state(WorkflowState::Received).await? {
            let message = &stored.message;
            let result = match self.triage(message).await {
                Ok(label) => self.branch(message, label).await,
                Err(e) => Err(e),
            };
            tally(&mut report.triaged, &mut report.failures, &message.id, result);
        }

        for stored in self.checkpoints.messages_in_state(WorkflowState::Triaged).await? {
            let message = &stored.message;
            let result = match self.effective_label(&message.id).await {
                Ok(label) => self.branch(message, label.unwrap_or(TriageLabel::NotifyHuman)).await,
                Err(e) => Err(e),
            };
            tally(&mut report.triaged, &mut report.failures, &message.id, result);
        }

        for stored in self.checkpoints.messages_in_state(WorkflowState::Drafting).await? {
            let result = self.draft(&stored.message).await;
            tally(&mut report.drafted, &mut report.failures, &stored.message.id, result);
        }

        for state in [WorkflowState::Approved, WorkflowState::Edited] {
            for stored in self.checkpoints.messages_in_state(state).await? {
                let message = &stored.message;
                let checkpoint = match self.checkpoints.get_checkpoint(&message.id).await {
                    Ok(Some(checkpoint)) => checkpoint,
                    Ok(None) => {
                        warn!(message_id = %message.id, "Resolved message has no checkpoint");
                        report.failures += 1;
                        continue;
                    }
                    Err(e) => {
                        tally(&mut report.delivered, &mut report.failures, &message.id, Err(e.into()));
                        continue;
                    }
                };
                let result = match self.deliver(message, &checkpoint).await {
                    Ok((state, true)) => Ok(state),
                    Ok((_, false)) => Err(DeliveryError::SendFailed {
                        message_id: message.id.clone(),
                        reason: "outbox rejected the reply".into(),
                    }
                    .into()),
                    Err(e) => Err(e),
                };
                tally(&mut report.delivered, &mut report.failures, &message.id, result);
                self.learn_from_checkpoint(message, &checkpoint).await;
            }
        }

        // Resolutions whose feedback never reached the log.
        for checkpoint in self.checkpoints.resolved_without_feedback().await? {
            let result = match self.stored(&checkpoint.message_id).await {
                Ok(stored) => match self.try_learn(&stored.message, &checkpoint).await {
                    Ok(_) => Ok(stored.state),
                    Err(e) => Err(e.into()),
                },
                Err(e) => Err(e),
            };
            tally(&mut report.relearned, &mut report.failures, &checkpoint.message_id, result);
        }

        match self.aggregator.retry_unmerged().await {
            Ok(n) => report.merged_feedback = n,
            Err(e) => {
                warn!(error = %e, "Unmerged feedback left for later");
                report.failures += 1;
            }
        }

        info!(
            pending = report.pending_checkpoints,
            triaged = report.triaged,
            drafted = report.drafted,
            delivered = report.delivered,
            relearned = report.relearned,
            merged = report.merged_feedback,
            failures = report.failures,
            "Recovery complete"
        );
        Ok(report)
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Pending checkpoints, oldest first.
    pub async fn pending(&self) -> Result<Vec<DraftCheckpoint>, Error> {
        Ok(self.checkpoints.pending_checkpoints().await?)
    }

    pub async fn message(&self, message_id: &str) -> Result<Option<StoredMessage>, Error> {
        Ok(self.checkpoints.get_message(message_id).await?)
    }

    /// Bias payload for a (raw or normalized) sender address.
    pub async fn bias(&self, sender: &str) -> Result<BiasPayload, Error> {
        Ok(self.memory.build_bias(&normalize_sender(sender)).await?)
    }

    pub async fn stats(&self) -> Result<EngineStats, Error> {
        let messages = self
            .checkpoints
            .message_state_counts()
            .await?
            .into_iter()
            .map(|(state, n)| (state.as_str().to_string(), n))
            .collect();
        let checkpoints = self
            .checkpoints
            .checkpoint_status_counts()
            .await?
            .into_iter()
            .map(|(status, n)| (status.as_str().to_string(), n))
            .collect();
        Ok(EngineStats {
            messages,
            checkpoints,
            feedback_events: self.preferences.feedback_count().await?,
            active_preferences: self
                .preferences
                .active_preference_count(self.config.learning.confidence_threshold)
                .await?,
        })
    }

    // ── Helpers ─────────────────────────────────────────────────────

    async fn bounded<T>(
        &self,
        oracle: &str,
        call: impl Future<Output = Result<T, OracleError>>,
    ) -> Result<T, OracleError> {
        let timeout = self.config.oracle_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout {
                oracle: oracle.to_string(),
                timeout,
            }),
        }
    }

    async fn bias_or_cold(&self, sender: &str) -> BiasPayload {
        match self.memory.build_bias(sender).await {
            Ok(bias) => bias,
            Err(e) => {
                warn!(sender, error = %e, "Bias unavailable, drafting cold");
                BiasPayload::cold(sender)
            }
        }
    }

    async fn stored(&self, message_id: &str) -> Result<StoredMessage, Error> {
        self.checkpoints
            .get_message(message_id)
            .await?
            .ok_or_else(|| WorkflowError::MessageNotFound(message_id.to_string()).into())
    }

    async fn effective_label(&self, message_id: &str) -> Result<Option<TriageLabel>, Error> {
        Ok(self.checkpoints.get_triage(message_id).await?.map(|d| d.label))
    }

    /// Compare-and-swap a state change; losing the race is an error.
    async fn transition(
        &self,
        message_id: &str,
        from: WorkflowState,
        to: WorkflowState,
        reason: Option<&str>,
    ) -> Result<(), Error> {
        if !from.can_transition_to(to) {
            return Err(invalid(message_id, from, to));
        }
        if self
            .checkpoints
            .transition_message(message_id, from, to, reason)
            .await?
        {
            debug!(message_id, from = %from, to = %to, "State transition");
            return Ok(());
        }
        let current = self.stored(message_id).await?.state;
        Err(invalid(message_id, current, to))
    }
}

fn target_state(label: TriageLabel) -> WorkflowState {
    match label {
        TriageLabel::Ignore => WorkflowState::Ignored,
        TriageLabel::NotifyHuman => WorkflowState::Notified,
        TriageLabel::Respond => WorkflowState::Drafting,
    }
}

fn conflict(message_id: &str, status: CheckpointStatus) -> Error {
    WorkflowError::CheckpointConflict {
        message_id: message_id.to_string(),
        status: status.to_string(),
    }
    .into()
}

fn invalid(message_id: &str, state: WorkflowState, target: WorkflowState) -> Error {
    WorkflowError::InvalidTransition {
        message_id: message_id.to_string(),
        state: state.to_string(),
        target: target.to_string(),
    }
    .into()
}

fn tally(done: &mut usize, failures: &mut usize, message_id: &str, result: Result<WorkflowState, Error>) {
    match result {
        Ok(_) => *done += 1,
        Err(e) => {
            warn!(message_id, error = %e, "Recovery step failed");
            *failures += 1;
        }
    }
}

/// Distinct, non-trivial subject words, in order.
fn subject_keywords(subject: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for token in lexicon::tokenize(subject) {
        if token.chars().count() < 3
            || lexicon::is_stopword(&token)
            || token.chars().all(|c| c.is_ascii_digit())
            || keywords.contains(&token)
        {
            continue;
        }
        keywords.push(token);
        if keywords.len() == MAX_OVERRIDE_KEYWORDS {
            break;
        }
    }
    keywords
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_map_to_branch_states() {
        assert_eq!(target_state(TriageLabel::Ignore), WorkflowState::Ignored);
        assert_eq!(target_state(TriageLabel::NotifyHuman), WorkflowState::Notified);
        assert_eq!(target_state(TriageLabel::Respond), WorkflowState::Drafting);
    }

    #[test]
    fn subject_keywords_skip_noise() {
        assert_eq!(
            subject_keywords("Re: the Q3 invoice for the 2024 contract, invoice"),
            vec!["invoice".to_string(), "contract".to_string()]
        );
        assert!(subject_keywords("").is_empty());
    }

    #[test]
    fn subject_keywords_are_capped() {
        let subject = "alpha bravo charlie delta echo foxtrot golf hotel india juliet";
        assert_eq!(subject_keywords(subject).len(), MAX_OVERRIDE_KEYWORDS);
    }

    #[test]
    fn recovery_tally_counts_both_ways() {
        let (mut done, mut failed) = (0, 0);
        tally(&mut done, &mut failed, "m1", Ok(WorkflowState::Sent));
        tally(
            &mut done,
            &mut failed,
            "m2",
            Err(WorkflowError::MessageNotFound("m2".into()).into()),
        );
        assert_eq!((done, failed), (1, 1));
    }
}
