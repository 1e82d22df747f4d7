use std::collections::{HashMap, HashSet};
use std::ops::Range;

use distil_types::{Turn, TurnRole};

use crate::estimator;

/// Sequence positions of turns that must not enter any compaction range: a
/// tool call whose result has not arrived, or a result whose call is absent
/// from the sequence. Removing either half of a pair is protocol-fatal at
/// the model API layer, so this is a hard precondition for range selection,
/// not a heuristic.
pub fn protected_turns(turns: &[Turn]) -> HashSet<u64> {
    let mut protected = HashSet::new();
    let mut open_calls: HashMap<&str, u64> = HashMap::new();

    for turn in turns {
        match turn.role {
            TurnRole::ToolCall => {
                if let Some(call_id) = turn.call_id() {
                    open_calls.insert(call_id, turn.seq);
                }
            }
            TurnRole::ToolResult => {
                if let Some(call_id) = turn.call_id() {
                    if open_calls.remove(call_id).is_none() {
                        // Orphaned result, its call never appeared.
                        protected.insert(turn.seq);
                    }
                }
            }
            _ => {}
        }
        if turn.in_flight {
            protected.insert(turn.seq);
        }
    }

    // Calls still open at the end of the sequence are unresolved.
    protected.extend(open_calls.into_values());
    protected
}

/// The largest pairing-safe contiguous range of turns starting from the
/// oldest, as indices into `turns`. Stops at the first protected turn.
/// None when the very first turn is protected.
pub fn eligible_range(turns: &[Turn]) -> Option<Range<usize>> {
    let protected = protected_turns(turns);
    let end = turns
        .iter()
        .position(|t| protected.contains(&t.seq))
        .unwrap_or(turns.len());

    if end == 0 {
        None
    } else {
        Some(0..end)
    }
}

/// Largest prefix length not exceeding `limit` that no call/result pair
/// spans. Used by emergency truncation so the removal boundary never
/// separates a call from its result.
pub fn pair_safe_cut(turns: &[Turn], limit: usize) -> usize {
    let mut open: HashSet<&str> = HashSet::new();
    let mut best = 0;

    for (index, turn) in turns.iter().enumerate().take(limit) {
        match turn.role {
            TurnRole::ToolCall => {
                if let Some(call_id) = turn.call_id() {
                    open.insert(call_id);
                }
            }
            TurnRole::ToolResult => {
                if let Some(call_id) = turn.call_id() {
                    open.remove(call_id);
                }
            }
            _ => {}
        }
        if open.is_empty() {
            best = index + 1;
        }
    }

    best
}

/// Split an eligible range into sub-ranges whose estimated token size stays
/// under `budget_tokens`, without splitting a call/result pair across a
/// boundary. Chunks are at least one turn each, so a single oversized turn
/// still forms its own chunk (the predictor rejects it downstream).
pub fn chunk_ranges(
    turns: &[Turn],
    range: Range<usize>,
    budget_tokens: u64,
    model_id: &str,
) -> Vec<Range<usize>> {
    let mut chunks = Vec::new();
    let mut start = range.start;
    let mut tokens: u64 = 0;
    let mut open_calls: HashSet<&str> = HashSet::new();

    for idx in range.clone() {
        let turn = &turns[idx];
        let turn_tokens = estimator::estimate_tokens(std::slice::from_ref(turn), model_id);

        let over_budget = tokens > 0 && tokens + turn_tokens > budget_tokens;
        if over_budget && open_calls.is_empty() {
            chunks.push(start..idx);
            start = idx;
            tokens = 0;
        }

        match turn.role {
            TurnRole::ToolCall => {
                if let Some(call_id) = turn.call_id() {
                    open_calls.insert(call_id);
                }
            }
            TurnRole::ToolResult => {
                if let Some(call_id) = turn.call_id() {
                    open_calls.remove(call_id);
                }
            }
            _ => {}
        }
        tokens += turn_tokens;
    }

    if start < range.end {
        chunks.push(start..range.end);
    }
    chunks
}
