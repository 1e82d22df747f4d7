use distil_types::Turn;

/// Baseline approximation for most model families.
const DEFAULT_CHARS_PER_TOKEN: u64 = 4;

/// Llama and Mistral tokenizers run denser on English text, so a smaller
/// divisor keeps the estimate conservative (never under-counts).
const DENSE_CHARS_PER_TOKEN: u64 = 3;

fn divisor_for_model(model_id: &str) -> u64 {
    let lower = model_id.to_lowercase();
    if lower.contains("llama") || lower.contains("mistral") {
        DENSE_CHARS_PER_TOKEN
    } else {
        DEFAULT_CHARS_PER_TOKEN
    }
}

/// Token estimate for an ordered sequence of turns. Deterministic and
/// side-effect free so callers can run what-if planning repeatedly.
/// Characters are summed before the single division, which keeps the
/// estimate monotone: more content never yields a smaller count.
pub fn estimate_tokens(turns: &[Turn], model_id: &str) -> u64 {
    let chars: u64 = turns.iter().map(Turn::char_len).sum();
    chars / divisor_for_model(model_id)
}

/// Token estimate for raw text, e.g. a categorization prompt.
pub fn estimate_text(text: &str, model_id: &str) -> u64 {
    text.chars().count() as u64 / divisor_for_model(model_id)
}
