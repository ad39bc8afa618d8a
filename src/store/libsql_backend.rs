//! libSQL backend for [`CheckpointStore`] and [`PreferenceStore`].
//!
//! Supports local file and in-memory databases. All statements share one
//! connection; a `RwLock` gate lets reads run together while writes and
//! multi-statement transactions run alone, so a reader never sees a
//! half-applied merge or resolution.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::approval::model::{CheckpointStatus, DraftCheckpoint};
use crate::error::DatabaseError;
use crate::learning::preference::{
    FeedbackEvent, FeedbackOutcome, Preference, PreferenceKind, PreferenceRow, RowKey, Scope,
    SenderContext, SenderDelta,
};
use crate::pipeline::state::WorkflowState;
use crate::pipeline::types::{Message, TriageDecision, TriageLabel, TriageSource};
use crate::store::migrations;
use crate::store::traits::{CheckpointStore, PreferenceStore, ResolveOutcome, StoredMessage};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: RwLock<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            gate: RwLock::new(()),
        })
    }

    async fn begin(&self, op: &str) -> Result<Transaction, DatabaseError> {
        self.conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} begin: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width so stored values sort as text.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Commit on success, roll back on failure.
async fn finish<T>(
    tx: Transaction,
    result: Result<T, DatabaseError>,
    op: &str,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("{op} commit: {e}")))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                warn!(op, error = %rb, "Rollback failed");
            }
            Err(e)
        }
    }
}

const MESSAGE_COLUMNS: &str =
    "id, sender, subject, body, received_at, state, escalation_reason, draft_attempts, updated_at";

const CHECKPOINT_COLUMNS: &str = "message_id, draft_text, final_text, status, created_at, resolved_at";

const PREFERENCE_COLUMNS: &str =
    "kind, value, scope, keywords, evidence_count, staleness, first_seen, last_seen";

const SENDER_COLUMNS: &str =
    "address, message_count, replies_sent, denials, first_seen, last_interaction";

const FEEDBACK_COLUMNS: &str = "seq, message_id, sender, outcome, draft_text, final_text, signals, contradictions, created_at, merged";

const TRIAGE_COLUMNS: &str = "message_id, label, source, confidence, reason, decided_at";

fn row_to_message(row: &libsql::Row) -> Result<StoredMessage, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("message row: {e}"));
    let state_str: String = row.get(5).map_err(map)?;
    let state = WorkflowState::from_str_value(&state_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown workflow state: {state_str}")))?;
    let received_str: String = row.get(4).map_err(map)?;
    let updated_str: String = row.get(8).map_err(map)?;
    let attempts: i64 = row.get(7).map_err(map)?;

    Ok(StoredMessage {
        message: Message {
            id: row.get(0).map_err(map)?,
            sender: row.get(1).map_err(map)?,
            subject: row.get(2).map_err(map)?,
            body: row.get(3).map_err(map)?,
            received_at: parse_datetime(&received_str),
        },
        state,
        escalation_reason: row.get(6).ok(),
        draft_attempts: attempts.max(0) as u32,
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_checkpoint(row: &libsql::Row) -> Result<DraftCheckpoint, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("checkpoint row: {e}"));
    let status_str: String = row.get(3).map_err(map)?;
    let created_str: String = row.get(4).map_err(map)?;
    let resolved_str: Option<String> = row.get(5).ok();

    let status = CheckpointStatus::from_str_value(&status_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown checkpoint status: {status_str}")))?;

    Ok(DraftCheckpoint {
        message_id: row.get(0).map_err(map)?,
        draft_text: row.get(1).map_err(map)?,
        final_text: row.get(2).ok(),
        status,
        created_at: parse_datetime(&created_str),
        resolved_at: parse_optional_datetime(&resolved_str),
    })
}

fn row_to_preference(row: &libsql::Row) -> Result<PreferenceRow, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("preference row: {e}"));
    let kind_str: String = row.get(0).map_err(map)?;
    let value: String = row.get(1).map_err(map)?;
    let scope_str: String = row.get(2).map_err(map)?;
    let keywords_str: String = row.get(3).map_err(map)?;
    let count: i64 = row.get(4).map_err(map)?;
    let staleness: f64 = row.get(5).map_err(map)?;
    let first_str: String = row.get(6).map_err(map)?;
    let last_str: String = row.get(7).map_err(map)?;

    let kind = PreferenceKind::from_str_value(&kind_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown preference kind: {kind_str}")))?;
    let keywords: Vec<String> = from_json(&keywords_str)?;
    let preference = Preference::from_parts(kind, &value, keywords)
        .ok_or_else(|| DatabaseError::Serialization(format!("bad value for {kind}: {value}")))?;
    let scope: Scope = scope_str.parse().map_err(DatabaseError::Serialization)?;

    Ok(PreferenceRow {
        preference,
        scope,
        evidence_count: count.max(0) as u32,
        staleness,
        first_seen: parse_datetime(&first_str),
        last_seen: parse_datetime(&last_str),
    })
}

fn row_to_sender(row: &libsql::Row) -> Result<SenderContext, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("sender row: {e}"));
    let count: i64 = row.get(1).map_err(map)?;
    let replies: i64 = row.get(2).map_err(map)?;
    let denials: i64 = row.get(3).map_err(map)?;
    let first_str: String = row.get(4).map_err(map)?;
    let last_str: String = row.get(5).map_err(map)?;

    Ok(SenderContext {
        address: row.get(0).map_err(map)?,
        message_count: count.max(0) as u64,
        replies_sent: replies.max(0) as u32,
        denials: denials.max(0) as u32,
        first_seen: parse_datetime(&first_str),
        last_interaction: parse_datetime(&last_str),
    })
}

fn row_to_feedback(row: &libsql::Row) -> Result<FeedbackEvent, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("feedback row: {e}"));
    let outcome_str: String = row.get(3).map_err(map)?;
    let signals_str: String = row.get(6).map_err(map)?;
    let contradictions_str: String = row.get(7).map_err(map)?;
    let created_str: String = row.get(8).map_err(map)?;
    let merged: i64 = row.get(9).map_err(map)?;

    Ok(FeedbackEvent {
        seq: row.get(0).map_err(map)?,
        message_id: row.get(1).map_err(map)?,
        sender: row.get(2).map_err(map)?,
        outcome: FeedbackOutcome::from_str_value(&outcome_str).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown feedback outcome: {outcome_str}"))
        })?,
        draft_text: row.get(4).map_err(map)?,
        final_text: row.get(5).ok(),
        signals: from_json(&signals_str)?,
        contradictions: from_json(&contradictions_str)?,
        created_at: parse_datetime(&created_str),
        merged: merged != 0,
    })
}

fn row_to_triage(row: &libsql::Row) -> Result<TriageDecision, DatabaseError> {
    let map = |e: libsql::Error| DatabaseError::Query(format!("triage row: {e}"));
    let label_str: String = row.get(1).map_err(map)?;
    let source_str: String = row.get(2).map_err(map)?;
    let decided_str: String = row.get(5).map_err(map)?;

    Ok(TriageDecision {
        message_id: row.get(0).map_err(map)?,
        label: TriageLabel::from_str_value(&label_str)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown triage label: {label_str}")))?,
        source: TriageSource::from_str_value(&source_str),
        confidence: row.get::<f64>(3).ok().map(|c| c as f32),
        reason: row.get(4).ok(),
        decided_at: parse_datetime(&decided_str),
    })
}

/// Drain a result set through a row mapper, skipping rows that fail to parse.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    op: &str,
    mapper: fn(&libsql::Row) -> Result<T, DatabaseError>,
) -> Result<Vec<T>, DatabaseError> {
    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
    {
        match mapper(&row) {
            Ok(item) => out.push(item),
            Err(e) => warn!(op, error = %e, "Skipping unreadable row"),
        }
    }
    Ok(out)
}

async fn fetch_checkpoint(conn: &Connection, message_id: &str) -> Result<Option<DraftCheckpoint>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE message_id = ?1"),
            params![message_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_checkpoint: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_checkpoint(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_checkpoint: {e}"))),
    }
}

async fn fetch_row(conn: &Connection, key: &RowKey) -> Result<Option<PreferenceRow>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {PREFERENCE_COLUMNS} FROM preferences WHERE kind = ?1 AND value = ?2 AND scope = ?3"
            ),
            params![key.kind.as_str(), key.value.as_str(), key.scope.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_rows: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_preference(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_rows: {e}"))),
    }
}

async fn fetch_sender(conn: &Connection, address: &str) -> Result<Option<SenderContext>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {SENDER_COLUMNS} FROM sender_contexts WHERE address = ?1"),
            params![address],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_sender_context: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_sender(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_sender_context: {e}"))),
    }
}

async fn fetch_feedback(conn: &Connection, sql: &str, value: libsql::Value) -> Result<Option<FeedbackEvent>, DatabaseError> {
    let mut rows = conn
        .query(sql, params![value])
        .await
        .map_err(|e| DatabaseError::Query(format!("get_feedback: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_feedback(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_feedback: {e}"))),
    }
}

async fn count(conn: &Connection, sql: &str, values: Vec<libsql::Value>, op: &str) -> Result<u64, DatabaseError> {
    let mut rows = conn
        .query(sql, values)
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
    match rows.next().await {
        Ok(Some(row)) => {
            let n: i64 = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
            Ok(n.max(0) as u64)
        }
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
    }
}

// ── Transaction bodies ──────────────────────────────────────────────

async fn create_checkpoint_in(conn: &Connection, checkpoint: &DraftCheckpoint) -> Result<bool, DatabaseError> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO checkpoints (message_id, draft_text, status, created_at) VALUES (?1, ?2, 'pending', ?3)",
            params![
                checkpoint.message_id.as_str(),
                checkpoint.draft_text.as_str(),
                ts(&checkpoint.created_at)
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_checkpoint: {e}")))?;
    if inserted == 0 {
        return Ok(false);
    }

    let moved = conn
        .execute(
            "UPDATE messages SET state = 'awaiting_approval', updated_at = ?1 WHERE id = ?2 AND state = 'drafting'",
            params![ts(&Utc::now()), checkpoint.message_id.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_checkpoint: {e}")))?;
    if moved == 0 {
        return Err(DatabaseError::Constraint(format!(
            "message {} is not drafting",
            checkpoint.message_id
        )));
    }
    Ok(true)
}

async fn resolve_checkpoint_in(
    conn: &Connection,
    message_id: &str,
    status: CheckpointStatus,
    final_text: Option<&str>,
    at: DateTime<Utc>,
) -> Result<ResolveOutcome, DatabaseError> {
    let target = match status {
        CheckpointStatus::Approved => WorkflowState::Approved,
        CheckpointStatus::Edited => WorkflowState::Edited,
        CheckpointStatus::Denied => WorkflowState::Denied,
        CheckpointStatus::Pending => {
            return Err(DatabaseError::Constraint("cannot resolve to pending".into()));
        }
    };

    let swapped = conn
        .execute(
            "UPDATE checkpoints SET status = ?1, final_text = ?2, resolved_at = ?3 WHERE message_id = ?4 AND status = 'pending'",
            params![status.as_str(), opt_text(final_text), ts(&at), message_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("resolve_checkpoint: {e}")))?;

    if swapped == 0 {
        return Ok(match fetch_checkpoint(conn, message_id).await? {
            Some(existing) => ResolveOutcome::Conflict(existing.status),
            None => ResolveOutcome::NotFound,
        });
    }

    conn.execute(
        "UPDATE messages SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = 'awaiting_approval'",
        params![target.as_str(), ts(&at), message_id],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("resolve_checkpoint: {e}")))?;

    match fetch_checkpoint(conn, message_id).await? {
        Some(cp) => Ok(ResolveOutcome::Resolved(cp)),
        None => Err(DatabaseError::NotFound {
            entity: "checkpoint".into(),
            id: message_id.into(),
        }),
    }
}

async fn apply_merge_in(
    conn: &Connection,
    seq: i64,
    rows: &[PreferenceRow],
    sender: &str,
    delta: &SenderDelta,
    at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let mut flag = conn
        .query("SELECT merged FROM feedback_events WHERE seq = ?1", params![seq])
        .await
        .map_err(|e| DatabaseError::Query(format!("apply_merge: {e}")))?;
    let merged: i64 = match flag.next().await {
        Ok(Some(row)) => row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("apply_merge: {e}")))?,
        Ok(None) => {
            return Err(DatabaseError::NotFound {
                entity: "feedback_event".into(),
                id: seq.to_string(),
            });
        }
        Err(e) => return Err(DatabaseError::Query(format!("apply_merge: {e}"))),
    };
    if merged != 0 {
        return Ok(false);
    }

    for row in rows {
        conn.execute(
            "INSERT INTO preferences (kind, value, scope, keywords, evidence_count, staleness, first_seen, last_seen)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (kind, value, scope) DO UPDATE SET
                keywords = excluded.keywords,
                evidence_count = excluded.evidence_count,
                staleness = excluded.staleness,
                first_seen = excluded.first_seen,
                last_seen = excluded.last_seen",
            params![
                row.preference.kind().as_str(),
                row.preference.value_key(),
                row.scope.to_string(),
                to_json(&row.preference.keywords())?,
                row.evidence_count as i64,
                row.staleness,
                ts(&row.first_seen),
                ts(&row.last_seen),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("apply_merge upsert: {e}")))?;
    }

    if *delta != SenderDelta::default() {
        conn.execute(
            "INSERT INTO sender_contexts (address, message_count, replies_sent, denials, first_seen, last_interaction)
             VALUES (?1, 0, ?2, ?3, ?4, ?4)
             ON CONFLICT (address) DO UPDATE SET
                replies_sent = replies_sent + excluded.replies_sent,
                denials = denials + excluded.denials",
            params![sender, delta.replies_sent as i64, delta.denials as i64, ts(&at)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("apply_merge sender: {e}")))?;
    }

    conn.execute("UPDATE feedback_events SET merged = 1 WHERE seq = ?1", params![seq])
        .await
        .map_err(|e| DatabaseError::Query(format!("apply_merge mark: {e}")))?;
    Ok(true)
}

async fn reset_aggregates_in(conn: &Connection) -> Result<(), DatabaseError> {
    for sql in [
        "DELETE FROM preferences",
        "UPDATE sender_contexts SET replies_sent = 0, denials = 0",
        "UPDATE feedback_events SET merged = 0",
    ] {
        conn.execute(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_aggregates: {e}")))?;
    }
    Ok(())
}

// ── CheckpointStore ─────────────────────────────────────────────────

#[async_trait]
impl CheckpointStore for LibSqlBackend {
    async fn insert_message(&self, message: &Message) -> Result<bool, DatabaseError> {
        let _guard = self.gate.write().await;
        let now = ts(&Utc::now());
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO messages (id, sender, subject, body, received_at, state, draft_attempts, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, 'received', 0, ?6, ?6)",
                params![
                    message.id.as_str(),
                    message.sender.as_str(),
                    message.subject.as_str(),
                    message.body.as_str(),
                    ts(&message.received_at),
                    now
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        debug!(message_id = %message.id, inserted = inserted == 1, "Message insert");
        Ok(inserted == 1)
    }

    async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>, DatabaseError> {
        let _guard = self.gate.read().await;
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_message: {e}"))),
        }
    }

    async fn transition_message(
        &self,
        id: &str,
        from: WorkflowState,
        to: WorkflowState,
        reason: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.gate.write().await;
        let changed = self
            .conn
            .execute(
                "UPDATE messages SET state = ?1, escalation_reason = COALESCE(?2, escalation_reason), updated_at = ?3 WHERE id = ?4 AND state = ?5",
                params![to.as_str(), opt_text(reason), ts(&Utc::now()), id, from.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_message: {e}")))?;

        debug!(message_id = %id, %from, %to, applied = changed == 1, "Message transition");
        Ok(changed == 1)
    }

    async fn record_draft_attempt(&self, id: &str) -> Result<u32, DatabaseError> {
        let _guard = self.gate.write().await;
        let changed = self
            .conn
            .execute(
                "UPDATE messages SET draft_attempts = draft_attempts + 1, updated_at = ?1 WHERE id = ?2",
                params![ts(&Utc::now()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_draft_attempt: {e}")))?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "message".into(),
                id: id.into(),
            });
        }
        let n = count(
            &self.conn,
            "SELECT draft_attempts FROM messages WHERE id = ?1",
            vec![id.into()],
            "record_draft_attempt",
        )
        .await?;
        Ok(n as u32)
    }

    async fn reset_draft_attempts(&self, id: &str) -> Result<(), DatabaseError> {
        let _guard = self.gate.write().await;
        self.conn
            .execute(
                "UPDATE messages SET draft_attempts = 0, updated_at = ?1 WHERE id = ?2",
                params![ts(&Utc::now()), id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reset_draft_attempts: {e}")))?;
        Ok(())
    }

    async fn messages_in_state(&self, state: WorkflowState) -> Result<Vec<StoredMessage>, DatabaseError> {
        let _guard = self.gate.read().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE state = ?1 ORDER BY received_at ASC, id ASC"
                ),
                params![state.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("messages_in_state: {e}")))?;
        collect_rows(rows, "messages_in_state", row_to_message).await
    }

    async fn message_state_counts(&self) -> Result<Vec<(WorkflowState, u64)>, DatabaseError> {
        let _guard = self.gate.read().await;
        let mut rows = self
            .conn
            .query("SELECT state, COUNT(*) FROM messages GROUP BY state ORDER BY state", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("message_state_counts: {e}")))?;

        let mut counts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("message_state_counts: {e}")))?
        {
            let state: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("message_state_counts: {e}")))?;
            let n: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("message_state_counts: {e}")))?;
            if let Some(state) = WorkflowState::from_str_value(&state) {
                counts.push((state, n.max(0) as u64));
            }
        }
        Ok(counts)
    }

    // ── Triage ──────────────────────────────────────────────────────

    async fn record_triage(&self, decision: &TriageDecision) -> Result<(), DatabaseError> {
        let _guard = self.gate.write().await;
        let confidence = match decision.confidence {
            Some(c) => libsql::Value::Real(c as f64),
            None => libsql::Value::Null,
        };
        self.conn
            .execute(
                "INSERT OR REPLACE INTO triage_decisions (message_id, source, label, confidence, reason, decided_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    decision.message_id.as_str(),
                    decision.source.as_str(),
                    decision.label.as_str(),
                    confidence,
                    opt_text(decision.reason.as_deref()),
                    ts(&decision.decided_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_triage: {e}")))?;
        Ok(())
    }

    async fn get_triage(&self, message_id: &str) -> Result<Option<TriageDecision>, DatabaseError> {
        let _guard = self.gate.read().await;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TRIAGE_COLUMNS} FROM triage_decisions WHERE message_id = ?1
                     ORDER BY CASE source WHEN 'human_override' THEN 0 ELSE 1 END LIMIT 1"
                ),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_triage: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_triage(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_triage: {e}"))),
        }
    }

    // ── Checkpoints ─────────────────────────────────────────────────

    async fn create_checkpoint(&self, checkpoint: &DraftCheckpoint) -> Result<bool, DatabaseError> {
        let _guard = self.gate.write().await;
        let tx = self.begin("create_checkpoint").await?;
        let result = create_checkpoint_in(&tx, checkpoint).await;
        let created = finish(tx, result, "create_checkpoint").await?;
        debug!(message_id = %checkpoint.message_id, created, "Checkpoint create");
        Ok(created)
    }

    async fn get_checkpoint(&self, message_id: &str) -> Result<Option<DraftCheckpoint>, DatabaseError> {
        let _guard = self.gate.read().await;
        fetch_checkpoint(&self.conn, message_id).await
    }

    async fn resolve_checkpoint(
        &self,
        message_id: &str,
        status: CheckpointStatus,
        final_text: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<ResolveOutcome, DatabaseError> {
        let _guard = self.gate.write().await;
        let tx = self.begin("resolve_checkpoint").await?;
        let result = resolve_checkpoint_in(&tx, message_id, status, final_text, at).await;
        finish(tx, result, "resolve_checkpoint").await
    }

    async fn pending_checkpoints(&self) -> Result<Vec<DraftCheckpoint>, DatabaseError> {
        let _guard = self.gate.read().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints WHERE status = 'pending' ORDER BY created_at ASC, message_id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("pending_checkpoints: {e}")))?;
        collect_rows(rows, "pending_checkpoints", row_to_checkpoint).await
    }

    async fn resolved_without_feedback(&self) -> Result<Vec<DraftCheckpoint>, DatabaseError> {
        let _guard = self.gate.read().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CHECKPOINT_COLUMNS} FROM checkpoints c
                     WHERE c.status != 'pending'
                       AND NOT EXISTS (
                           SELECT 1 FROM feedback_events f
                           WHERE f.message_id = c.message_id AND f.outcome = c.status
                       )
                     ORDER BY c.resolved_at ASC, c.message_id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolved_without_feedback: {e}")))?;
        collect_rows(rows, "resolved_without_feedback", row_to_checkpoint).await
    }

    async fn checkpoint_status_counts(&self) -> Result<Vec<(CheckpointStatus, u64)>, DatabaseError> {
        let _guard = self.gate.read().await;
        let mut rows = self
            .conn
            .query("SELECT status, COUNT(*) FROM checkpoints GROUP BY status ORDER BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("checkpoint_status_counts: {e}")))?;

        let mut counts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("checkpoint_status_counts: {e}")))?
        {
            let status: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("checkpoint_status_counts: {e}")))?;
            let n: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("checkpoint_status_counts: {e}")))?;
            let status = CheckpointStatus::from_str_value(&status)
                .ok_or_else(|| DatabaseError::Serialization(format!("unknown checkpoint status: {status}")))?;
            counts.push((status, n.max(0) as u64));
        }
        Ok(counts)
    }
}

// ── PreferenceStore ─────────────────────────────────────────────────

#[async_trait]
impl PreferenceStore for LibSqlBackend {
    async fn preference_snapshot(&self, sender: &str) -> Result<Vec<PreferenceRow>, DatabaseError> {
        let _guard = self.gate.read().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {PREFERENCE_COLUMNS} FROM preferences WHERE scope IN ('global', ?1) ORDER BY kind, value, scope"
                ),
                params![Scope::Sender(sender.to_string()).to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("preference_snapshot: {e}")))?;
        collect_rows(rows, "preference_snapshot", row_to_preference).await
    }

    async fn list_preferences(&self, scope: Option<&Scope>) -> Result<Vec<PreferenceRow>, DatabaseError> {
        let _guard = self.gate.read().await;
        let rows = match scope {
            Some(scope) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {PREFERENCE_COLUMNS} FROM preferences WHERE scope = ?1 ORDER BY kind, value, scope"
                        ),
                        params![scope.to_string()],
                    )
                    .await
            }
            None => {
                self.conn
                    .query(
                        &format!("SELECT {PREFERENCE_COLUMNS} FROM preferences ORDER BY kind, value, scope"),
                        (),
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_preferences: {e}")))?;
        collect_rows(rows, "list_preferences", row_to_preference).await
    }

    async fn get_rows(&self, keys: &[RowKey]) -> Result<Vec<PreferenceRow>, DatabaseError> {
        let _guard = self.gate.read().await;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = fetch_row(&self.conn, key).await? {
                out.push(row);
            }
        }
        Ok(out)
    }

    async fn active_preference_count(&self, threshold: u32) -> Result<u64, DatabaseError> {
        let _guard = self.gate.read().await;
        count(
            &self.conn,
            "SELECT COUNT(*) FROM preferences WHERE evidence_count >= ?1",
            vec![(threshold as i64).into()],
            "active_preference_count",
        )
        .await
    }

    // ── Sender contexts ─────────────────────────────────────────────

    async fn observe_sender(&self, address: &str, at: DateTime<Utc>) -> Result<SenderContext, DatabaseError> {
        let _guard = self.gate.write().await;
        self.conn
            .execute(
                "INSERT INTO sender_contexts (address, message_count, replies_sent, denials, first_seen, last_interaction)
                 VALUES (?1, 1, 0, 0, ?2, ?2)
                 ON CONFLICT (address) DO UPDATE SET
                    message_count = message_count + 1,
                    last_interaction = MAX(last_interaction, excluded.last_interaction)",
                params![address, ts(&at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("observe_sender: {e}")))?;

        fetch_sender(&self.conn, address)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "sender_context".into(),
                id: address.into(),
            })
    }

    async fn get_sender_context(&self, address: &str) -> Result<Option<SenderContext>, DatabaseError> {
        let _guard = self.gate.read().await;
        fetch_sender(&self.conn, address).await
    }

    // ── Feedback log ────────────────────────────────────────────────

    async fn append_feedback(&self, event: &FeedbackEvent) -> Result<FeedbackEvent, DatabaseError> {
        let _guard = self.gate.write().await;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO feedback_events (message_id, sender, outcome, draft_text, final_text, signals, contradictions, created_at, merged)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
                params![
                    event.message_id.as_str(),
                    event.sender.as_str(),
                    event.outcome.as_str(),
                    event.draft_text.as_str(),
                    opt_text(event.final_text.as_deref()),
                    to_json(&event.signals)?,
                    to_json(&event.contradictions)?,
                    ts(&event.created_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_feedback: {e}")))?;

        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {FEEDBACK_COLUMNS} FROM feedback_events WHERE message_id = ?1 AND outcome = ?2"
                ),
                params![event.message_id.as_str(), event.outcome.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("append_feedback: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let stored = row_to_feedback(&row)?;
                debug!(seq = stored.seq, message_id = %stored.message_id, outcome = stored.outcome.as_str(), "Feedback appended");
                Ok(stored)
            }
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "feedback_event".into(),
                id: event.message_id.clone(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("append_feedback: {e}"))),
        }
    }

    async fn get_feedback(&self, seq: i64) -> Result<Option<FeedbackEvent>, DatabaseError> {
        let _guard = self.gate.read().await;
        fetch_feedback(
            &self.conn,
            &format!("SELECT {FEEDBACK_COLUMNS} FROM feedback_events WHERE seq = ?1"),
            seq.into(),
        )
        .await
    }

    async fn list_feedback(&self) -> Result<Vec<FeedbackEvent>, DatabaseError> {
        let _guard = self.gate.read().await;
        let rows = self
            .conn
            .query(&format!("SELECT {FEEDBACK_COLUMNS} FROM feedback_events ORDER BY seq ASC"), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_feedback: {e}")))?;
        collect_rows(rows, "list_feedback", row_to_feedback).await
    }

    async fn unmerged_feedback(&self) -> Result<Vec<FeedbackEvent>, DatabaseError> {
        let _guard = self.gate.read().await;
        let rows = self
            .conn
            .query(
                &format!("SELECT {FEEDBACK_COLUMNS} FROM feedback_events WHERE merged = 0 ORDER BY seq ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("unmerged_feedback: {e}")))?;
        collect_rows(rows, "unmerged_feedback", row_to_feedback).await
    }

    async fn recent_feedback(&self, sender: &str, limit: usize) -> Result<Vec<FeedbackEvent>, DatabaseError> {
        let _guard = self.gate.read().await;
        let rows = self
            .conn
            .query(
                &format!(
                    "SELECT {FEEDBACK_COLUMNS} FROM feedback_events WHERE sender = ?1 AND signals != '[]' ORDER BY seq DESC LIMIT ?2"
                ),
                params![sender, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_feedback: {e}")))?;
        collect_rows(rows, "recent_feedback", row_to_feedback).await
    }

    async fn feedback_count(&self) -> Result<u64, DatabaseError> {
        let _guard = self.gate.read().await;
        count(&self.conn, "SELECT COUNT(*) FROM feedback_events", Vec::new(), "feedback_count").await
    }

    async fn apply_merge(
        &self,
        seq: i64,
        rows: &[PreferenceRow],
        sender: &str,
        delta: &SenderDelta,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.gate.write().await;
        let tx = self.begin("apply_merge").await?;
        let result = apply_merge_in(&tx, seq, rows, sender, delta, at).await;
        let applied = finish(tx, result, "apply_merge").await?;
        debug!(seq, rows = rows.len(), applied, "Merge applied");
        Ok(applied)
    }

    async fn reset_aggregates(&self) -> Result<(), DatabaseError> {
        let _guard = self.gate.write().await;
        let tx = self.begin("reset_aggregates").await?;
        let result = reset_aggregates_in(&tx).await;
        finish(tx, result, "reset_aggregates").await?;
        info!("Preference aggregates reset");
        Ok(())
    }
}
