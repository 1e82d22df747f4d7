use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use distil_provider::{InvokeRequest, Provider, ProviderError};
use distil_types::{Segment, Turn, TurnRole};

/// Longest rendering of a single message body in the prompt.
const MAX_MESSAGE_CHARS: usize = 3000;
/// Tool results are usually bulk output; a short head is enough context.
const MAX_TOOL_RESULT_CHARS: usize = 500;
/// Previous rollup content appears only as a preview.
const MAX_ROLLUP_PREVIEW_CHARS: usize = 2000;
const MAX_TOOL_PARAMS: usize = 3;
const MAX_PARAM_VALUE_CHARS: usize = 50;

/// Floor for compacted output, anything shorter indicates the model did not
/// actually summarize.
pub const MIN_SUMMARY_CHARS: usize = 200;

/// Hard output ceilings for a categorization invocation.
const SUMMARY_TOKENS_FLOOR: u64 = 2000;
const SUMMARY_TOKENS_CEILING: u64 = 16_000;
const CHUNK_TOKENS_FLOOR: u64 = 500;
const CHUNK_TOKENS_CEILING: u64 = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategoryAssignment {
    Preserve,
    Compress,
    Discard,
}

/// Parsed wire format of a categorization response.
#[derive(Debug, Clone, Deserialize)]
struct WireResult {
    #[serde(default)]
    assignments: HashMap<String, CategoryAssignment>,
    #[serde(default)]
    preserved: Vec<String>,
    summary: String,
}

#[derive(Debug, Clone)]
pub struct CategorizationResult {
    /// Sequence position to assignment, for the turns the model classified.
    pub assignments: HashMap<u64, CategoryAssignment>,
    /// Verbatim content the model chose to preserve.
    pub preserved: Vec<String>,
    /// Synthesized summary of compress/discard content.
    pub summary: String,
}

impl CategorizationResult {
    /// Rollup body text: preserved content verbatim, then the summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for block in &self.preserved {
            out.push_str(block);
            out.push_str("\n\n");
        }
        out.push_str(&self.summary);
        out
    }
}

/// Tagged outcome of one categorization call. Parse failures and
/// cancellations are recovered by strategy fallback, never by resubmitting
/// the same request.
#[derive(Debug)]
pub enum CategorizeOutcome {
    Success(CategorizationResult),
    ParseFailure,
    Cancelled,
}

/// Output ceiling for a full-pass summary.
pub fn summary_max_tokens(original_tokens: u64, summary_ratio: f64, max_output: u64) -> u64 {
    let target = (original_tokens as f64 * summary_ratio) as u64;
    max_output.min(target.clamp(SUMMARY_TOKENS_FLOOR, SUMMARY_TOKENS_CEILING))
}

/// Output ceiling for a single chunk's summary.
pub fn chunk_max_tokens(chunk_tokens: u64, summary_ratio: f64) -> u64 {
    let target = (chunk_tokens as f64 * summary_ratio) as u64;
    target.clamp(CHUNK_TOKENS_FLOOR, CHUNK_TOKENS_CEILING)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}... [truncated]")
}

fn format_tool_input(input: &serde_json::Value) -> String {
    let Some(map) = input.as_object() else {
        return truncate_chars(&input.to_string(), MAX_PARAM_VALUE_CHARS);
    };

    let mut parts = Vec::new();
    for (key, value) in map.iter().take(MAX_TOOL_PARAMS) {
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        parts.push(format!("{key}={}", truncate_chars(&rendered, MAX_PARAM_VALUE_CHARS)));
    }
    if map.len() > MAX_TOOL_PARAMS {
        parts.push(format!("... +{} more", map.len() - MAX_TOOL_PARAMS));
    }
    parts.join(", ")
}

/// One turn rendered for the categorization prompt, with a role and
/// timestamp header and per-role truncation.
pub fn format_turn(turn: &Turn) -> String {
    let header = format!(
        "[{}] {} (seq {})",
        turn.created_at.format("%Y-%m-%d %H:%M:%S"),
        turn.role.as_str(),
        turn.seq,
    );

    let mut body = String::new();
    for segment in &turn.segments {
        if !body.is_empty() {
            body.push('\n');
        }
        match segment {
            Segment::Text { text } => {
                let limit = if turn.role == TurnRole::RollupSummary {
                    MAX_ROLLUP_PREVIEW_CHARS
                } else {
                    MAX_MESSAGE_CHARS
                };
                body.push_str(&truncate_chars(text, limit));
            }
            Segment::ToolCall { name, input, .. } => {
                body.push_str(&format!("tool call: {name}({})", format_tool_input(input)));
            }
            Segment::ToolResult { content, is_error, .. } => {
                let prefix = if *is_error { "tool error: " } else { "tool result: " };
                body.push_str(prefix);
                body.push_str(&truncate_chars(content, MAX_TOOL_RESULT_CHARS));
            }
        }
    }

    format!("{header}\n{body}")
}

/// Build the fixed-policy categorization prompt for a pairing-safe range.
pub fn build_prompt(turns: &[Turn], facts_annex: Option<&str>, target_tokens: u64) -> String {
    let mut rendered = String::new();
    for turn in turns {
        rendered.push_str(&format_turn(turn));
        rendered.push_str("\n\n");
    }

    let annex = facts_annex.map(|a| format!("\n{a}")).unwrap_or_default();

    format!(
        "You are compacting a conversation history. Classify each turn below and \
         produce a compact summary of roughly {target_tokens} tokens.\n\
         \n\
         Categories:\n\
         - preserve: architectural decisions, unresolved issues, user preferences, \
         active tasks, and all numeric data\n\
         - compress: resolved tasks, exploratory discussion, explanations, tool \
         outputs already summarized elsewhere\n\
         - discard: redundant, superseded, or purely conversational filler\n\
         {annex}\
         \n\
         Respond with a single JSON object:\n\
         {{\"assignments\": {{\"<seq>\": \"preserve|compress|discard\", ...}},\n\
         \"preserved\": [\"verbatim content to keep\", ...],\n\
         \"summary\": \"synthesized summary of compressed and discarded content\"}}\n\
         \n\
         Conversation:\n\
         \n\
         {rendered}"
    )
}

/// Extract the JSON object from a model response that may wrap it in code
/// fences or surrounding prose.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

/// Parse a model response into a categorization result. Any schema mismatch
/// yields None; structural correctness of the response is never assumed.
pub fn parse_response(text: &str) -> Option<CategorizationResult> {
    let json = extract_json(text)?;
    let wire: WireResult = serde_json::from_str(json).ok()?;

    let mut assignments = HashMap::new();
    for (key, assignment) in wire.assignments {
        let seq: u64 = key.parse().ok()?;
        assignments.insert(seq, assignment);
    }

    Some(CategorizationResult {
        assignments,
        preserved: wire.preserved,
        summary: wire.summary,
    })
}

/// Issue exactly one categorization invocation. Provider failures propagate
/// as errors so the caller can distinguish an actual rate-limit rejection;
/// malformed responses and cancellation are ordinary outcomes.
pub async fn categorize<P: Provider + ?Sized>(
    provider: &P,
    model_id: &str,
    prompt: String,
    max_tokens: u64,
    cancel: &CancellationToken,
) -> Result<CategorizeOutcome, ProviderError> {
    let request = InvokeRequest {
        model_id: model_id.to_string(),
        prompt,
        max_tokens,
        temperature: 0.2,
    };

    debug!(model_id, max_tokens, "issuing categorization request");

    let response = tokio::select! {
        result = provider.invoke(request) => result?,
        _ = cancel.cancelled() => {
            warn!("categorization cancelled");
            return Ok(CategorizeOutcome::Cancelled);
        }
    };

    match parse_response(&response) {
        Some(result) => Ok(CategorizeOutcome::Success(result)),
        None => {
            warn!("categorization response did not match expected structure");
            Ok(CategorizeOutcome::ParseFailure)
        }
    }
}
