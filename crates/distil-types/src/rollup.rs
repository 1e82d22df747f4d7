use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use distil_core::id::{self, Prefix};

use crate::turn::SeqRange;

/// Which compaction strategy produced a rollup. Strategies form a
/// strictly-ordered fallback chain; each is attempted at most once per
/// trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Full,
    Chunked,
    Emergency,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Full => "full",
            Strategy::Chunked => "chunked",
            Strategy::Emergency => "emergency",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Strategy::Full),
            "chunked" => Some(Strategy::Chunked),
            "emergency" => Some(Strategy::Emergency),
            _ => None,
        }
    }
}

/// One row per compaction event. Append-only; never mutated. Ranges of
/// different records are disjoint because sequence ids are never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupRecord {
    pub id: String,
    pub conversation_id: String,
    pub range: SeqRange,
    pub turns_compacted: usize,
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub reduction_pct: f64,
    pub strategy: Strategy,
    pub elapsed_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl RollupRecord {
    pub fn new(
        conversation_id: &str,
        range: SeqRange,
        turns_compacted: usize,
        tokens_before: u64,
        tokens_after: u64,
        strategy: Strategy,
        elapsed_ms: u64,
    ) -> Self {
        let reduction_pct = if tokens_before > 0 {
            (tokens_before.saturating_sub(tokens_after)) as f64 / tokens_before as f64 * 100.0
        } else {
            0.0
        };
        Self {
            id: id::create(Prefix::Rollup, None),
            conversation_id: conversation_id.to_string(),
            range,
            turns_compacted,
            tokens_before,
            tokens_after,
            reduction_pct,
            strategy,
            elapsed_ms,
            created_at: Utc::now(),
        }
    }
}
