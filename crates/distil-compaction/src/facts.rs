use once_cell::sync::Lazy;
use regex::Regex;

use distil_types::Turn;

/// The kind of literal an extracted fact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactKind {
    Currency,
    Percentage,
    LargeNumber,
}

/// A numeric literal that must survive compression verbatim, tied to the
/// turn it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumericFact {
    pub literal: String,
    pub kind: FactKind,
    pub source_seq: u64,
}

static CURRENCY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[$€£]\s?\d[\d,]*(?:\.\d+)?").unwrap());

static PERCENTAGE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?%").unwrap());

// Four or more digits, or comma-grouped thousands.
static LARGE_NUMBER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}(?:,\d{3})+(?:\.\d+)?\b|\b\d{4,}(?:\.\d+)?\b").unwrap());

/// Scan turn content for currency amounts, percentages, and large numbers.
/// Best effort: false positives only grow the preserved set, so prose
/// numbers slipping through is acceptable.
pub fn extract_numeric_facts(turns: &[Turn]) -> Vec<NumericFact> {
    let mut facts = Vec::new();

    for turn in turns {
        let text = turn.content_text();
        let mut claimed: Vec<(usize, usize)> = Vec::new();

        for m in CURRENCY_PATTERN.find_iter(&text) {
            claimed.push((m.start(), m.end()));
            push_unique(&mut facts, m.as_str(), FactKind::Currency, turn.seq);
        }
        for m in PERCENTAGE_PATTERN.find_iter(&text) {
            claimed.push((m.start(), m.end()));
            push_unique(&mut facts, m.as_str(), FactKind::Percentage, turn.seq);
        }
        // Skip digit runs already claimed as currency or percentage.
        for m in LARGE_NUMBER_PATTERN.find_iter(&text) {
            let overlaps = claimed
                .iter()
                .any(|&(start, end)| m.start() < end && start < m.end());
            if !overlaps {
                push_unique(&mut facts, m.as_str(), FactKind::LargeNumber, turn.seq);
            }
        }
    }

    facts
}

fn push_unique(facts: &mut Vec<NumericFact>, literal: &str, kind: FactKind, seq: u64) {
    if !facts
        .iter()
        .any(|f| f.source_seq == seq && f.literal == literal)
    {
        facts.push(NumericFact {
            literal: literal.to_string(),
            kind,
            source_seq: seq,
        });
    }
}

/// Annex injected into the categorization prompt so the model is explicitly
/// told which literals must appear verbatim in any summary. None when no
/// facts were found.
pub fn facts_annex(facts: &[NumericFact]) -> Option<String> {
    if facts.is_empty() {
        return None;
    }

    let mut annex = String::from(
        "CRITICAL - NUMERICAL DATA DETECTED\n\
         The following values MUST be retained verbatim in any summary:\n",
    );
    for fact in facts {
        annex.push_str("  - ");
        annex.push_str(&fact.literal);
        annex.push('\n');
    }
    Some(annex)
}

/// Fact literals that do not appear verbatim in the given summary text.
/// The orchestrator appends these to the rollup so the retention guarantee
/// holds even when the model drops one.
pub fn missing_literals<'a>(facts: &'a [NumericFact], summary: &str) -> Vec<&'a str> {
    let mut missing: Vec<&str> = Vec::new();
    for fact in facts {
        if !summary.contains(fact.literal.as_str()) && !missing.contains(&fact.literal.as_str()) {
            missing.push(&fact.literal);
        }
    }
    missing
}
