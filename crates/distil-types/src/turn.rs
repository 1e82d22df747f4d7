use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use distil_core::id::{self, Prefix};

/// Baseline chars-per-token used for the per-turn estimate stored on the
/// turn itself. The compaction engine recomputes conversation totals with a
/// model-aware estimator; this baseline only feeds the running estimate.
const BASELINE_CHARS_PER_TOKEN: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TurnRole {
    User,
    Assistant,
    ToolCall,
    ToolResult,
    RollupSummary,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::ToolCall => "tool-call",
            TurnRole::ToolResult => "tool-result",
            TurnRole::RollupSummary => "rollup-summary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TurnRole::User),
            "assistant" => Some(TurnRole::Assistant),
            "tool-call" => Some(TurnRole::ToolCall),
            "tool-result" => Some(TurnRole::ToolResult),
            "rollup-summary" => Some(TurnRole::RollupSummary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Segment {
    Text {
        text: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

impl Segment {
    /// Character length of the segment's textual payload. Tool-call inputs
    /// count via their serialized form so bigger inputs never estimate
    /// smaller.
    pub fn char_len(&self) -> u64 {
        match self {
            Segment::Text { text } => text.chars().count() as u64,
            Segment::ToolCall { name, input, .. } => {
                let input_len = serde_json::to_string(input)
                    .map(|s| s.chars().count() as u64)
                    .unwrap_or(0);
                name.chars().count() as u64 + input_len
            }
            Segment::ToolResult { content, .. } => content.chars().count() as u64,
        }
    }
}

/// Source sequence range replaced by a rollup turn. Inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRange {
    pub start: u64,
    pub end: u64,
}

impl SeqRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn overlaps(&self, other: &SeqRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// One message unit in a conversation. Turns are immutable once created:
/// compaction never edits a turn in place, it replaces a contiguous range
/// with a synthesized rollup turn carrying a fresh sequence position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub conversation_id: String,
    pub role: TurnRole,
    pub segments: Vec<Segment>,
    /// Monotonically increasing position, assigned by the conversation and
    /// never reused.
    pub seq: u64,
    pub token_estimate: u64,
    /// Set while this turn is the unresolved half of a tool-call/result
    /// pair. In-flight turns are never eligible for compaction.
    pub in_flight: bool,
    /// For rollup-summary turns: the source sequence range this rollup
    /// replaced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<SeqRange>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    fn build(conversation_id: &str, role: TurnRole, segments: Vec<Segment>) -> Self {
        let chars: u64 = segments.iter().map(Segment::char_len).sum();
        Self {
            id: id::create(Prefix::Turn, None),
            conversation_id: conversation_id.to_string(),
            role,
            segments,
            seq: 0,
            token_estimate: chars / BASELINE_CHARS_PER_TOKEN,
            in_flight: false,
            provenance: None,
            created_at: Utc::now(),
        }
    }

    pub fn user(conversation_id: &str, text: impl Into<String>) -> Self {
        Self::build(
            conversation_id,
            TurnRole::User,
            vec![Segment::Text { text: text.into() }],
        )
    }

    pub fn assistant(conversation_id: &str, text: impl Into<String>) -> Self {
        Self::build(
            conversation_id,
            TurnRole::Assistant,
            vec![Segment::Text { text: text.into() }],
        )
    }

    pub fn tool_call(
        conversation_id: &str,
        call_id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        let mut turn = Self::build(
            conversation_id,
            TurnRole::ToolCall,
            vec![Segment::ToolCall {
                call_id: call_id.into(),
                name: name.into(),
                input,
            }],
        );
        turn.in_flight = true;
        turn
    }

    pub fn tool_result(
        conversation_id: &str,
        call_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::build(
            conversation_id,
            TurnRole::ToolResult,
            vec![Segment::ToolResult {
                call_id: call_id.into(),
                content: content.into(),
                is_error,
            }],
        )
    }

    pub fn rollup(conversation_id: &str, text: impl Into<String>, provenance: SeqRange) -> Self {
        let mut turn = Self::build(
            conversation_id,
            TurnRole::RollupSummary,
            vec![Segment::Text { text: text.into() }],
        );
        turn.provenance = Some(provenance);
        turn
    }

    /// All textual content joined. Tool calls render as `name(input)`.
    pub fn content_text(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            if !out.is_empty() {
                out.push('\n');
            }
            match segment {
                Segment::Text { text } => out.push_str(text),
                Segment::ToolCall { name, input, .. } => {
                    out.push_str(name);
                    out.push('(');
                    out.push_str(&input.to_string());
                    out.push(')');
                }
                Segment::ToolResult { content, .. } => out.push_str(content),
            }
        }
        out
    }

    pub fn char_len(&self) -> u64 {
        self.segments.iter().map(Segment::char_len).sum()
    }

    /// The tool call id this turn participates in, if any.
    pub fn call_id(&self) -> Option<&str> {
        self.segments.iter().find_map(|s| match s {
            Segment::ToolCall { call_id, .. } => Some(call_id.as_str()),
            Segment::ToolResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
    }

    pub fn is_tool_call(&self) -> bool {
        self.role == TurnRole::ToolCall
    }

    pub fn is_tool_result(&self) -> bool {
        self.role == TurnRole::ToolResult
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_token_estimate_from_chars() {
        let turn = Turn::user("cnv_1", "x".repeat(400));
        assert_eq!(turn.token_estimate, 100);
    }

    #[test]
    fn test_tool_call_starts_in_flight() {
        let turn = Turn::tool_call("cnv_1", "call_1", "read_file", serde_json::json!({}));
        assert!(turn.in_flight);
        assert_eq!(turn.call_id(), Some("call_1"));
    }

    #[test]
    fn test_rollup_carries_provenance() {
        let turn = Turn::rollup("cnv_1", "summary", SeqRange::new(0, 44));
        assert_eq!(turn.role, TurnRole::RollupSummary);
        assert_eq!(turn.provenance, Some(SeqRange::new(0, 44)));
    }

    #[test]
    fn test_seq_range_overlap() {
        assert!(SeqRange::new(0, 10).overlaps(&SeqRange::new(10, 20)));
        assert!(!SeqRange::new(0, 10).overlaps(&SeqRange::new(11, 20)));
    }

    #[test]
    fn test_role_round_trip() {
        for role in [
            TurnRole::User,
            TurnRole::Assistant,
            TurnRole::ToolCall,
            TurnRole::ToolResult,
            TurnRole::RollupSummary,
        ] {
            assert_eq!(TurnRole::parse(role.as_str()), Some(role));
        }
    }

    #[test]
    fn test_content_text_renders_tool_call() {
        let turn = Turn::tool_call(
            "cnv_1",
            "call_9",
            "grep",
            serde_json::json!({"pattern": "foo"}),
        );
        let text = turn.content_text();
        assert!(text.starts_with("grep("));
        assert!(text.contains("foo"));
    }
}
