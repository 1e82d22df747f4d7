use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::debug;

use distil_types::{Conversation, RollupRecord, SeqRange, Strategy, Turn, TurnRole};

use crate::database::{Database, DatabaseError};

/// Per-conversation overrides for the compaction settings. Any field left
/// unset falls back to the global defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationSettings {
    pub threshold: Option<f64>,
    pub emergency_threshold: Option<f64>,
    pub summary_ratio: Option<f64>,
    pub model: Option<String>,
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    model_id: String,
    token_estimate: i64,
    next_seq: i64,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct TurnRow {
    id: String,
    conversation_id: String,
    seq: i64,
    role: String,
    segments: String,
    token_estimate: i64,
    in_flight: bool,
    provenance_start: Option<i64>,
    provenance_end: Option<i64>,
    created_at: i64,
}

impl TurnRow {
    fn into_turn(self) -> Result<Turn, DatabaseError> {
        let role = TurnRole::parse(&self.role)
            .ok_or_else(|| DatabaseError::QueryError(format!("unknown turn role: {}", self.role)))?;
        let segments = serde_json::from_str(&self.segments)
            .map_err(|e| DatabaseError::QueryError(format!("invalid segments JSON: {e}")))?;
        let provenance = match (self.provenance_start, self.provenance_end) {
            (Some(start), Some(end)) => Some(SeqRange::new(start as u64, end as u64)),
            _ => None,
        };

        Ok(Turn {
            id: self.id,
            conversation_id: self.conversation_id,
            role,
            segments,
            seq: self.seq as u64,
            token_estimate: self.token_estimate as u64,
            in_flight: self.in_flight,
            provenance,
            created_at: millis_to_datetime(self.created_at),
        })
    }
}

#[derive(Debug, FromRow)]
struct RollupRecordRow {
    id: String,
    conversation_id: String,
    start_seq: i64,
    end_seq: i64,
    turns_compacted: i64,
    tokens_before: i64,
    tokens_after: i64,
    reduction_pct: f64,
    strategy: String,
    elapsed_ms: i64,
    created_at: i64,
}

impl RollupRecordRow {
    fn into_record(self) -> Result<RollupRecord, DatabaseError> {
        let strategy = Strategy::parse(&self.strategy).ok_or_else(|| {
            DatabaseError::QueryError(format!("unknown strategy: {}", self.strategy))
        })?;

        Ok(RollupRecord {
            id: self.id,
            conversation_id: self.conversation_id,
            range: SeqRange::new(self.start_seq as u64, self.end_seq as u64),
            turns_compacted: self.turns_compacted as usize,
            tokens_before: self.tokens_before as u64,
            tokens_after: self.tokens_after as u64,
            reduction_pct: self.reduction_pct,
            strategy,
            elapsed_ms: self.elapsed_ms as u64,
            created_at: millis_to_datetime(self.created_at),
        })
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

/// SQLite-backed history store. Rolled-up turns are retained on disk with a
/// `rolled_up` flag so the rollup history is auditable; the live sequence is
/// everything still unrolled, ordered by seq.
pub struct HistoryRepository<'a> {
    db: &'a Database,
}

impl<'a> HistoryRepository<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub async fn save_conversation(&self, conversation: &Conversation) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO conversations (id, model_id, token_estimate, next_seq, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                model_id = excluded.model_id,
                token_estimate = excluded.token_estimate,
                next_seq = excluded.next_seq,
                updated_at = excluded.updated_at",
        )
        .bind(&conversation.id)
        .bind(&conversation.model_id)
        .bind(conversation.token_estimate as i64)
        .bind(conversation.next_seq() as i64)
        .bind(conversation.created_at.timestamp_millis())
        .bind(conversation.updated_at.timestamp_millis())
        .execute(self.db.pool())
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        Ok(())
    }

    /// Load a conversation with its live (unrolled) turns, or None if no row
    /// exists.
    pub async fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, model_id, token_estimate, next_seq, created_at, updated_at
             FROM conversations WHERE id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let turns = self.live_turns(conversation_id).await?;
        let mut conversation = Conversation::from_parts(
            row.id,
            row.model_id,
            turns,
            row.token_estimate as u64,
            row.next_seq as u64,
        );
        conversation.created_at = millis_to_datetime(row.created_at);
        conversation.updated_at = millis_to_datetime(row.updated_at);

        Ok(Some(conversation))
    }

    pub async fn append_turn(
        &self,
        conversation: &Conversation,
        turn: &Turn,
    ) -> Result<(), DatabaseError> {
        self.insert_turn(turn).await?;

        sqlx::query(
            "UPDATE conversations SET token_estimate = ?, next_seq = ?, updated_at = ? WHERE id = ?",
        )
        .bind(conversation.token_estimate as i64)
        .bind(conversation.next_seq() as i64)
        .bind(Utc::now().timestamp_millis())
        .bind(&conversation.id)
        .execute(self.db.pool())
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        // A tool result clears the in-flight flag on the matching call.
        // Match the serialized call_id field exactly so "call_1" never
        // clears a still-open "call_10".
        if turn.is_tool_result() {
            if let Some(call_id) = turn.call_id() {
                sqlx::query(
                    "UPDATE turns SET in_flight = 0
                     WHERE conversation_id = ? AND in_flight = 1 AND role = 'tool-call'
                       AND segments LIKE '%\"call_id\":\"' || ? || '\"%'",
                )
                .bind(&turn.conversation_id)
                .bind(call_id)
                .execute(self.db.pool())
                .await
                .map_err(|e| DatabaseError::QueryError(e.to_string()))?;
            }
        }

        Ok(())
    }

    /// All unrolled turns in sequence order.
    pub async fn live_turns(&self, conversation_id: &str) -> Result<Vec<Turn>, DatabaseError> {
        let rows = sqlx::query_as::<_, TurnRow>(
            "SELECT id, conversation_id, seq, role, segments, token_estimate, in_flight,
                    provenance_start, provenance_end, created_at
             FROM turns
             WHERE conversation_id = ? AND rolled_up = 0
             ORDER BY seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        rows.into_iter().map(TurnRow::into_turn).collect()
    }

    /// Persist one compaction atomically: mark the replaced range rolled up,
    /// insert the rollup turn, append the record, and refresh the
    /// conversation bookkeeping. Either all of it lands or none of it does.
    pub async fn commit_rollup(
        &self,
        conversation: &Conversation,
        rollup_turn: &Turn,
        record: &RollupRecord,
    ) -> Result<(), DatabaseError> {
        let range = record.range;
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "UPDATE turns SET rolled_up = 1
             WHERE conversation_id = ? AND seq >= ? AND seq <= ? AND rolled_up = 0",
        )
        .bind(&conversation.id)
        .bind(range.start as i64)
        .bind(range.end as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        let segments = serde_json::to_string(&rollup_turn.segments)
            .map_err(|e| DatabaseError::QueryError(e.to_string()))?;
        sqlx::query(
            "INSERT INTO turns (id, conversation_id, seq, role, segments, token_estimate,
                                in_flight, rolled_up, provenance_start, provenance_end, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(&rollup_turn.id)
        .bind(&rollup_turn.conversation_id)
        .bind(rollup_turn.seq as i64)
        .bind(rollup_turn.role.as_str())
        .bind(&segments)
        .bind(rollup_turn.token_estimate as i64)
        .bind(rollup_turn.in_flight)
        .bind(rollup_turn.provenance.map(|r| r.start as i64))
        .bind(rollup_turn.provenance.map(|r| r.end as i64))
        .bind(rollup_turn.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        sqlx::query(
            "INSERT INTO rollup_records (id, conversation_id, start_seq, end_seq, turns_compacted,
                                         tokens_before, tokens_after, reduction_pct, strategy,
                                         elapsed_ms, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.conversation_id)
        .bind(record.range.start as i64)
        .bind(record.range.end as i64)
        .bind(record.turns_compacted as i64)
        .bind(record.tokens_before as i64)
        .bind(record.tokens_after as i64)
        .bind(record.reduction_pct)
        .bind(record.strategy.as_str())
        .bind(record.elapsed_ms as i64)
        .bind(record.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        sqlx::query(
            "UPDATE conversations SET token_estimate = ?, next_seq = ?, updated_at = ? WHERE id = ?",
        )
        .bind(conversation.token_estimate as i64)
        .bind(conversation.next_seq() as i64)
        .bind(Utc::now().timestamp_millis())
        .bind(&conversation.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::TransactionError(e.to_string()))?;

        debug!(
            conversation_id = %conversation.id,
            rollup_id = %record.id,
            strategy = record.strategy.as_str(),
            "committed rollup"
        );

        Ok(())
    }

    /// All compaction records for a conversation, oldest first.
    pub async fn rollup_records(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<RollupRecord>, DatabaseError> {
        let rows = sqlx::query_as::<_, RollupRecordRow>(
            "SELECT id, conversation_id, start_seq, end_seq, turns_compacted, tokens_before,
                    tokens_after, reduction_pct, strategy, elapsed_ms, created_at
             FROM rollup_records
             WHERE conversation_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(conversation_id)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        rows.into_iter().map(RollupRecordRow::into_record).collect()
    }

    pub async fn save_settings(
        &self,
        conversation_id: &str,
        settings: &ConversationSettings,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO conversation_settings (conversation_id, threshold, emergency_threshold,
                                                summary_ratio, model)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(conversation_id) DO UPDATE SET
                threshold = excluded.threshold,
                emergency_threshold = excluded.emergency_threshold,
                summary_ratio = excluded.summary_ratio,
                model = excluded.model",
        )
        .bind(conversation_id)
        .bind(settings.threshold)
        .bind(settings.emergency_threshold)
        .bind(settings.summary_ratio)
        .bind(&settings.model)
        .execute(self.db.pool())
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        Ok(())
    }

    pub async fn load_settings(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationSettings>, DatabaseError> {
        let row = sqlx::query_as::<_, (Option<f64>, Option<f64>, Option<f64>, Option<String>)>(
            "SELECT threshold, emergency_threshold, summary_ratio, model
             FROM conversation_settings WHERE conversation_id = ?",
        )
        .bind(conversation_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        Ok(row.map(
            |(threshold, emergency_threshold, summary_ratio, model)| ConversationSettings {
                threshold,
                emergency_threshold,
                summary_ratio,
                model,
            },
        ))
    }

    async fn insert_turn(&self, turn: &Turn) -> Result<(), DatabaseError> {
        let segments = serde_json::to_string(&turn.segments)
            .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        sqlx::query(
            "INSERT INTO turns (id, conversation_id, seq, role, segments, token_estimate,
                                in_flight, rolled_up, provenance_start, provenance_end, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)",
        )
        .bind(&turn.id)
        .bind(&turn.conversation_id)
        .bind(turn.seq as i64)
        .bind(turn.role.as_str())
        .bind(&segments)
        .bind(turn.token_estimate as i64)
        .bind(turn.in_flight)
        .bind(turn.provenance.map(|r| r.start as i64))
        .bind(turn.provenance.map(|r| r.end as i64))
        .bind(turn.created_at.timestamp_millis())
        .execute(self.db.pool())
        .await
        .map_err(|e| DatabaseError::QueryError(e.to_string()))?;

        Ok(())
    }
}
