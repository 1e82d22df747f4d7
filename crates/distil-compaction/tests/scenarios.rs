use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use distil_compaction::{CompactionEngine, CompactionStatus, HistoryOps, MemoryHistory};
use distil_config::{CompactionConfig, CompactionSettings};
use distil_provider::{InvokeRequest, ModelLimits, Provider, ProviderError, RateLimit};
use distil_types::{Conversation, SeqRange, Strategy, Turn, TurnRole};

struct MockProvider {
    responses: Mutex<VecDeque<Result<String, ProviderError>>>,
    requests: Mutex<Vec<InvokeRequest>>,
    rate_limit: RateLimit,
}

impl MockProvider {
    fn new(rate_limit: RateLimit) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            rate_limit,
        }
    }

    fn script(self, response: Result<String, ProviderError>) -> Self {
        self.responses.lock().unwrap().push_back(response);
        self
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        "mock"
    }

    fn name(&self) -> &str {
        "Mock"
    }

    fn rate_limit(&self) -> RateLimit {
        self.rate_limit
    }

    fn model_limits(&self, _model_id: &str) -> Option<ModelLimits> {
        None
    }

    async fn invoke(&self, request: InvokeRequest) -> Result<String, ProviderError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ProviderError::EmptyResponse))
    }
}

fn engine_with(threshold: f64, ratio: f64) -> CompactionEngine {
    CompactionEngine::new(
        CompactionSettings::new(CompactionConfig {
            rollup_threshold: threshold,
            emergency_rollup_threshold: 0.95,
            summary_ratio: ratio,
            model: None,
        })
        .unwrap(),
    )
}

fn conversation(turns: usize, chars_each: usize) -> Conversation {
    let mut conv = Conversation::new("claude-sonnet-4");
    let id = conv.id.clone();
    for i in 0..turns {
        let prefix = format!("topic-{i} ");
        let filler = "x".repeat(chars_each.saturating_sub(prefix.chars().count()));
        conv.push(Turn::user(&id, format!("{prefix}{filler}")));
    }
    conv
}

fn response_with_summary(summary: &str) -> String {
    serde_json::json!({
        "assignments": {},
        "preserved": [],
        "summary": summary,
    })
    .to_string()
}

/// 45 turns at 128k tokens against a 200k window with threshold 0.3 and
/// ratio 0.3: one full-pass rollup lands near the 38.4k target and one
/// record covers all 45 source turns.
#[tokio::test]
async fn scenario_a_full_compaction_hits_ratio_target() {
    let engine = engine_with(0.3, 0.3);
    let limits = ModelLimits {
        context_window: 200_000,
        max_output: 64_000,
    };
    // 45 turns of ~11378 chars is ~128k tokens.
    let mut conv = conversation(45, 11_378);
    let tokens_before = conv.token_estimate;
    assert!((127_000..129_000).contains(&tokens_before));

    let summary = "s".repeat(153_000);
    let provider = MockProvider::new(RateLimit::Unlimited).script(Ok(response_with_summary(&summary)));
    let history = MemoryHistory::new();

    let status = engine
        .maybe_compact(&mut conv, limits, &provider, Some(&history), &CancellationToken::new())
        .await
        .unwrap();

    match status {
        CompactionStatus::Compacted {
            tokens_after,
            strategy,
            ..
        } => {
            assert_eq!(strategy, Strategy::Full);
            let target = 38_400i64;
            assert!(
                (tokens_after as i64 - target).abs() < 2000,
                "tokens_after {tokens_after} not near {target}"
            );
        }
        other => panic!("expected Compacted, got {other:?}"),
    }

    let records = history.rollup_records(&conv.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].range, SeqRange::new(0, 44));
    assert_eq!(records[0].turns_compacted, 45);
}

/// An unresolved tool call at the tail survives an emergency-threshold
/// compaction; only the pairing-safe prefix is rolled up.
#[tokio::test]
async fn scenario_b_in_flight_pair_excluded() {
    let engine = engine_with(0.5, 0.3);
    let limits = ModelLimits {
        context_window: 10_000,
        max_output: 4000,
    };
    // 16 turns of 2400 chars is 9600 tokens, over the 9500 emergency line.
    let mut conv = conversation(16, 2400);
    let id = conv.id.clone();
    conv.push(Turn::tool_call(&id, "call_open", "bash", serde_json::json!({"cmd": "make"})));

    let provider = MockProvider::new(RateLimit::Unlimited)
        .script(Ok(response_with_summary(&"s".repeat(600))));

    let status = engine
        .maybe_compact(
            &mut conv,
            limits,
            &provider,
            Option::<&MemoryHistory>::None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(status, CompactionStatus::Compacted { .. }));
    assert_eq!(conv.turns.len(), 2);
    assert_eq!(conv.turns[0].role, TurnRole::RollupSummary);
    assert_eq!(conv.turns[0].provenance, Some(SeqRange::new(0, 15)));
    assert!(conv.turns[1].is_tool_call());
    assert!(conv.turns[1].in_flight);
}

/// A full-pass request over the provider budget is skipped without any
/// model call; the next attempt runs chunked.
#[tokio::test]
async fn scenario_c_rate_limited_skip_then_chunked() {
    let engine = engine_with(0.3, 0.3);
    let limits = ModelLimits {
        context_window: 100_000,
        max_output: 8000,
    };
    // 60 turns of 3000 chars is a ~45k-token categorization request.
    let mut conv = conversation(60, 3000);
    let cancel = CancellationToken::new();

    let provider = MockProvider::new(RateLimit::per_minute(30_000));
    let status = engine
        .maybe_compact(&mut conv, limits, &provider, Option::<&MemoryHistory>::None, &cancel)
        .await
        .unwrap();

    match status {
        CompactionStatus::SkippedRateLimited { estimated, allowed } => {
            assert_eq!(allowed, 30_000);
            assert!(estimated > 40_000, "estimated was {estimated}");
        }
        other => panic!("expected SkippedRateLimited, got {other:?}"),
    }
    assert_eq!(provider.request_count(), 0, "no model call on a predicted rejection");
    assert_eq!(conv.turns.len(), 60, "skip leaves the sequence unchanged");

    // Chunk budget is 60% of 30k, so the 45k range splits into three chunks.
    let provider = MockProvider::new(RateLimit::per_minute(30_000))
        .script(Ok(response_with_summary(&"a".repeat(400))))
        .script(Ok(response_with_summary(&"b".repeat(400))))
        .script(Ok(response_with_summary(&"c".repeat(400))));
    let history = MemoryHistory::new();

    let status = engine
        .maybe_compact(&mut conv, limits, &provider, Some(&history), &cancel)
        .await
        .unwrap();

    match status {
        CompactionStatus::Compacted { strategy, .. } => assert_eq!(strategy, Strategy::Chunked),
        other => panic!("expected chunked Compacted, got {other:?}"),
    }
    assert_eq!(provider.request_count(), 3);

    let records = history.rollup_records(&conv.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].strategy, Strategy::Chunked);
    assert_eq!(records[0].range, SeqRange::new(0, 59));
}

/// A failed middle chunk keeps its original content unsummarized while the
/// surrounding chunks are summarized normally.
#[tokio::test]
async fn scenario_d_failed_chunk_retains_original() {
    let engine = engine_with(0.5, 0.3);
    let limits = ModelLimits {
        context_window: 10_000,
        max_output: 4000,
    };
    // 12 turns of 600 tokens each; the quarter-window chunk budget of 2500
    // tokens yields chunks of four turns.
    let mut conv = conversation(12, 2400);

    let provider = MockProvider::new(RateLimit::Unlimited)
        .script(Ok("no structure here".to_string())) // full pass fails
        .script(Ok(response_with_summary(&format!("summary-one {}", "a".repeat(400)))))
        .script(Ok("chunk two came back as prose".to_string()))
        .script(Ok(response_with_summary(&format!("summary-three {}", "c".repeat(400)))));

    let status = engine
        .maybe_compact(
            &mut conv,
            limits,
            &provider,
            Option::<&MemoryHistory>::None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    match status {
        CompactionStatus::Compacted { strategy, .. } => assert_eq!(strategy, Strategy::Chunked),
        other => panic!("expected chunked Compacted, got {other:?}"),
    }

    let rollup = conv.turns[0].content_text();
    assert!(rollup.contains("summary-one"));
    assert!(rollup.contains("summary-three"));
    // Chunk two (turns 4..8) survives verbatim.
    assert!(rollup.contains("topic-5"));
    assert!(rollup.contains("topic-7"));
}

/// Emergency truncation keeps at most 20% of the window from the tail of a
/// 500k-token conversation and injects a notice turn at the boundary.
#[tokio::test]
async fn scenario_e_emergency_truncation() {
    let engine = engine_with(0.5, 0.3);
    let limits = ModelLimits {
        context_window: 200_000,
        max_output: 8000,
    };
    // 250 turns of 2000 tokens each.
    let mut conv = conversation(250, 8000);
    assert!((499_000..501_000).contains(&conv.token_estimate));

    // A budget this small rejects every chunk, forcing the local strategy.
    let provider = MockProvider::new(RateLimit::per_minute(100));
    let history = MemoryHistory::new();

    let status = engine
        .maybe_compact(&mut conv, limits, &provider, Some(&history), &CancellationToken::new())
        .await
        .unwrap();

    match status {
        CompactionStatus::TruncatedEmergency {
            tokens_after,
            turns_removed,
            ..
        } => {
            assert!(tokens_after <= 41_000, "kept {tokens_after} tokens");
            assert_eq!(turns_removed, 230);
        }
        other => panic!("expected TruncatedEmergency, got {other:?}"),
    }
    assert_eq!(provider.request_count(), 0, "emergency never calls the model");

    assert_eq!(conv.turns.len(), 21);
    assert_eq!(conv.turns[0].role, TurnRole::RollupSummary);
    assert!(conv.turns[0].content_text().contains("CONVERSATION TRUNCATED"));
    assert_eq!(conv.turns[0].provenance, Some(SeqRange::new(0, 229)));

    let records = history.rollup_records(&conv.id).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].strategy, Strategy::Emergency);
}

/// Extracted numeric literals appear verbatim in the rollup even when the
/// model's summary drops them.
#[tokio::test]
async fn numeric_facts_survive_a_lossy_summary() {
    let engine = engine_with(0.5, 0.3);
    let limits = ModelLimits {
        context_window: 10_000,
        max_output: 4000,
    };
    let mut conv = conversation(9, 2400);
    let id = conv.id.clone();
    conv.push(Turn::user(
        &id,
        format!("The contract is worth $125,000.50 with a 12.5% margin. {}", "p".repeat(2300)),
    ));

    // The scripted summary mentions neither literal.
    let provider = MockProvider::new(RateLimit::Unlimited)
        .script(Ok(response_with_summary(&"money was discussed at length ".repeat(20))));

    let status = engine
        .maybe_compact(
            &mut conv,
            limits,
            &provider,
            Option::<&MemoryHistory>::None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(status, CompactionStatus::Compacted { .. }));
    let rollup = conv.turns[0].content_text();
    assert!(rollup.contains("$125,000.50"));
    assert!(rollup.contains("12.5%"));
    assert!(rollup.contains("Key numeric data"));
}

/// Repeated compactions produce disjoint provenance ranges because sequence
/// positions are never reused.
#[tokio::test]
async fn provenance_ranges_stay_disjoint() {
    let engine = engine_with(0.5, 0.3);
    let limits = ModelLimits {
        context_window: 10_000,
        max_output: 4000,
    };
    let mut conv = conversation(10, 2400);
    let cancel = CancellationToken::new();
    let history = MemoryHistory::new();

    let provider = MockProvider::new(RateLimit::Unlimited)
        .script(Ok(response_with_summary(&"first pass ".repeat(40))));
    engine
        .maybe_compact(&mut conv, limits, &provider, Some(&history), &cancel)
        .await
        .unwrap();

    // Grow past the threshold again and compact a second time.
    let id = conv.id.clone();
    for i in 0..10 {
        conv.push(Turn::user(&id, format!("later-{i} {}", "y".repeat(2400))));
    }
    let provider = MockProvider::new(RateLimit::Unlimited)
        .script(Ok(response_with_summary(&"second pass ".repeat(40))));
    engine
        .maybe_compact(&mut conv, limits, &provider, Some(&history), &cancel)
        .await
        .unwrap();

    let records = history.rollup_records(&conv.id).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(
        !records[0].range.overlaps(&records[1].range),
        "{:?} overlaps {:?}",
        records[0].range,
        records[1].range
    );
}
