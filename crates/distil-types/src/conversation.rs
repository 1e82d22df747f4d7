use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use distil_core::id::{self, Prefix};

use crate::turn::Turn;

/// An ordered conversation. Insertion order is chronological order and turns
/// are never reordered. The token estimate is a running sum that the
/// compaction engine recomputes from scratch after every commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub model_id: String,
    pub turns: Vec<Turn>,
    pub token_estimate: u64,
    next_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(model_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id::create(Prefix::Conversation, None),
            model_id: model_id.into(),
            turns: Vec::new(),
            token_estimate: 0,
            next_seq: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a turn, assigning the next sequence position. Sequence ids are
    /// never reused, which keeps rollup provenance ranges disjoint across
    /// repeated compactions.
    pub fn push(&mut self, mut turn: Turn) -> u64 {
        turn.conversation_id = self.id.clone();
        turn.seq = self.next_seq;
        self.next_seq += 1;
        self.token_estimate += turn.token_estimate;
        self.updated_at = Utc::now();
        let seq = turn.seq;

        // A tool result resolves the matching in-flight call.
        if turn.is_tool_result() {
            if let Some(call_id) = turn.call_id().map(str::to_string) {
                for existing in self.turns.iter_mut().rev() {
                    if existing.in_flight && existing.call_id() == Some(call_id.as_str()) {
                        existing.in_flight = false;
                        break;
                    }
                }
            }
        }

        self.turns.push(turn);
        seq
    }

    /// Replace `range` (indices into `turns`) with the given replacement
    /// turns, assigning them fresh sequence positions. Used only by the
    /// compaction commit; callers recompute the token estimate afterwards.
    pub fn replace_range(&mut self, range: std::ops::Range<usize>, replacements: Vec<Turn>) {
        let mut sequenced = Vec::with_capacity(replacements.len());
        for mut turn in replacements {
            turn.conversation_id = self.id.clone();
            turn.seq = self.next_seq;
            self.next_seq += 1;
            sequenced.push(turn);
        }
        self.turns.splice(range, sequenced);
        self.updated_at = Utc::now();
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Restore bookkeeping after loading turns from storage.
    pub fn from_parts(
        id: String,
        model_id: String,
        turns: Vec<Turn>,
        token_estimate: u64,
        next_seq: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            model_id,
            turns,
            token_estimate,
            next_seq,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_token_estimate(&mut self, tokens: u64) {
        self.token_estimate = tokens;
        self.updated_at = Utc::now();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}
