//! Storage traits for workflow checkpoints and learned preferences.
//!
//! Both are implemented by [`LibSqlBackend`](crate::store::LibSqlBackend);
//! callers receive explicit handles, never a process-wide singleton.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::approval::model::{CheckpointStatus, DraftCheckpoint};
use crate::error::DatabaseError;
use crate::learning::preference::{
    FeedbackEvent, PreferenceRow, RowKey, Scope, SenderContext, SenderDelta,
};
use crate::pipeline::state::WorkflowState;
use crate::pipeline::types::{Message, TriageDecision};

/// A persisted inbound message with its workflow position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredMessage {
    pub message: Message,
    pub state: WorkflowState,
    /// Why the message was escalated to the human, if it was.
    pub escalation_reason: Option<String>,
    pub draft_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

/// Result of a compare-and-swap checkpoint resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// This call moved the checkpoint out of `pending`.
    Resolved(DraftCheckpoint),
    /// The checkpoint was already terminal.
    Conflict(CheckpointStatus),
    /// No checkpoint for this message.
    NotFound,
}

/// Durable workflow state: messages, triage decisions, and draft checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message in `received`. Returns false if the id already exists.
    async fn insert_message(&self, message: &Message) -> Result<bool, DatabaseError>;

    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>, DatabaseError>;

    /// Move a message from `from` to `to`. Returns false if it was not in `from`.
    async fn transition_message(
        &self,
        id: &str,
        from: WorkflowState,
        to: WorkflowState,
        reason: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Count one drafter attempt; returns the new total.
    async fn record_draft_attempt(&self, id: &str) -> Result<u32, DatabaseError>;

    /// Start a fresh drafting budget, e.g. after a human sends the message
    /// back to drafting.
    async fn reset_draft_attempts(&self, id: &str) -> Result<(), DatabaseError>;

    /// Messages currently in `state`, oldest first.
    async fn messages_in_state(&self, state: WorkflowState) -> Result<Vec<StoredMessage>, DatabaseError>;

    async fn message_state_counts(&self) -> Result<Vec<(WorkflowState, u64)>, DatabaseError>;

    // ── Triage ──────────────────────────────────────────────────────

    /// Record a decision; one row per (message, source).
    async fn record_triage(&self, decision: &TriageDecision) -> Result<(), DatabaseError>;

    /// The effective decision: a human override wins over the model.
    async fn get_triage(&self, message_id: &str) -> Result<Option<TriageDecision>, DatabaseError>;

    // ── Checkpoints ─────────────────────────────────────────────────

    /// Persist a pending checkpoint and move the message from `drafting`
    /// to `awaiting_approval`, atomically. Returns false if the message
    /// already has a checkpoint.
    async fn create_checkpoint(&self, checkpoint: &DraftCheckpoint) -> Result<bool, DatabaseError>;

    async fn get_checkpoint(&self, message_id: &str) -> Result<Option<DraftCheckpoint>, DatabaseError>;

    /// Exactly-once transition out of `pending`. On success the message
    /// moves from `awaiting_approval` to the matching state in the same
    /// transaction.
    async fn resolve_checkpoint(
        &self,
        message_id: &str,
        status: CheckpointStatus,
        final_text: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<ResolveOutcome, DatabaseError>;

    /// Pending checkpoints, oldest first.
    async fn pending_checkpoints(&self) -> Result<Vec<DraftCheckpoint>, DatabaseError>;

    async fn checkpoint_status_counts(&self) -> Result<Vec<(CheckpointStatus, u64)>, DatabaseError>;

    /// Resolved checkpoints with no matching feedback event in the log,
    /// oldest resolution first.
    async fn resolved_without_feedback(&self) -> Result<Vec<DraftCheckpoint>, DatabaseError>;
}

/// Durable learning state: aggregate rows, sender contexts, and the
/// append-only feedback log.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    // ── Aggregates ──────────────────────────────────────────────────

    /// Global rows plus the sender's rows, read as one consistent snapshot.
    async fn preference_snapshot(&self, sender: &str) -> Result<Vec<PreferenceRow>, DatabaseError>;

    /// All rows, optionally limited to one scope, in key order.
    async fn list_preferences(&self, scope: Option<&Scope>) -> Result<Vec<PreferenceRow>, DatabaseError>;

    /// Existing rows for the given keys; missing keys are skipped.
    async fn get_rows(&self, keys: &[RowKey]) -> Result<Vec<PreferenceRow>, DatabaseError>;

    async fn active_preference_count(&self, threshold: u32) -> Result<u64, DatabaseError>;

    // ── Sender contexts ─────────────────────────────────────────────

    /// Create the context on first sight, else bump its message count.
    async fn observe_sender(&self, address: &str, at: DateTime<Utc>) -> Result<SenderContext, DatabaseError>;

    async fn get_sender_context(&self, address: &str) -> Result<Option<SenderContext>, DatabaseError>;

    // ── Feedback log ────────────────────────────────────────────────

    /// Append an event, assigning its sequence number. Appending the same
    /// (message id, outcome) again returns the stored event unchanged.
    async fn append_feedback(&self, event: &FeedbackEvent) -> Result<FeedbackEvent, DatabaseError>;

    async fn get_feedback(&self, seq: i64) -> Result<Option<FeedbackEvent>, DatabaseError>;

    /// Whole log in sequence order.
    async fn list_feedback(&self) -> Result<Vec<FeedbackEvent>, DatabaseError>;

    /// Events not yet reflected in the aggregates, in sequence order.
    async fn unmerged_feedback(&self) -> Result<Vec<FeedbackEvent>, DatabaseError>;

    /// Most recent events for a sender that carried signals, newest first.
    async fn recent_feedback(&self, sender: &str, limit: usize) -> Result<Vec<FeedbackEvent>, DatabaseError>;

    async fn feedback_count(&self) -> Result<u64, DatabaseError>;

    /// Write the recomputed rows for event `seq`, apply the sender counters,
    /// and mark the event merged, in one transaction. Returns false without
    /// writing if the event was already merged.
    async fn apply_merge(
        &self,
        seq: i64,
        rows: &[PreferenceRow],
        sender: &str,
        delta: &SenderDelta,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Drop every aggregate row, zero the event-derived sender counters,
    /// and mark every event unmerged.
    async fn reset_aggregates(&self) -> Result<(), DatabaseError>;
}
