use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;

use distil_storage::HistoryRepository;
use distil_types::{Conversation, RollupRecord, Turn};

/// Marker line embedded at the top of every rollup turn so readers (and the
/// prompt formatter) can recognize previously compacted content.
pub const COMPACTION_MARKER: &str = "=== CONVERSATION COMPACTED ===";

/// Header prepended to rollup content: when it happened, what it covered,
/// and what it saved.
pub fn rollup_header(turns_compacted: usize, tokens_before: u64, tokens_after: u64) -> String {
    let reduction = if tokens_before > 0 {
        (tokens_before.saturating_sub(tokens_after)) as f64 / tokens_before as f64 * 100.0
    } else {
        0.0
    };
    format!(
        "{COMPACTION_MARKER}\n\
         Compacted {turns_compacted} messages at {} ({tokens_before} -> {tokens_after} tokens, {reduction:.1}% reduction)\n\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

/// Persistence seam for compaction commits. The engine takes an
/// `Option<&H>` so callers without a store (tests, dry runs) pass None and
/// commits stay in memory only.
#[allow(async_fn_in_trait)]
pub trait HistoryOps {
    async fn commit_rollup(
        &self,
        conversation: &Conversation,
        rollup_turn: &Turn,
        record: &RollupRecord,
    ) -> Result<()>;

    async fn rollup_records(&self, conversation_id: &str) -> Result<Vec<RollupRecord>>;
}

impl HistoryOps for HistoryRepository<'_> {
    async fn commit_rollup(
        &self,
        conversation: &Conversation,
        rollup_turn: &Turn,
        record: &RollupRecord,
    ) -> Result<()> {
        HistoryRepository::commit_rollup(self, conversation, rollup_turn, record).await?;
        Ok(())
    }

    async fn rollup_records(&self, conversation_id: &str) -> Result<Vec<RollupRecord>> {
        Ok(HistoryRepository::rollup_records(self, conversation_id).await?)
    }
}

/// In-memory history store for tests and embedded callers.
#[derive(Default)]
pub struct MemoryHistory {
    records: Mutex<HashMap<String, Vec<RollupRecord>>>,
    turns: Mutex<Vec<Turn>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed_turns(&self) -> Vec<Turn> {
        self.turns.lock().unwrap().clone()
    }
}

impl HistoryOps for MemoryHistory {
    async fn commit_rollup(
        &self,
        _conversation: &Conversation,
        rollup_turn: &Turn,
        record: &RollupRecord,
    ) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .entry(record.conversation_id.clone())
            .or_default()
            .push(record.clone());
        self.turns.lock().unwrap().push(rollup_turn.clone());
        Ok(())
    }

    async fn rollup_records(&self, conversation_id: &str) -> Result<Vec<RollupRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
