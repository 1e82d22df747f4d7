use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use distil_config::CompactionSettings;
use distil_core::bus::{Bus, BusEventDef};
use distil_provider::{ModelLimits, Provider};
use distil_types::{Conversation, RollupRecord, SeqRange, Strategy, Turn};

use crate::categorize::{self, CategorizeOutcome, MIN_SUMMARY_CHARS};
use crate::estimator;
use crate::events;
use crate::facts;
use crate::pairing;
use crate::ratelimit::{Prediction, RateLimitPredictor};
use crate::rollup::{self, HistoryOps};

/// Ranges this small are not worth a model call.
const MIN_COMPACTION_TURNS: usize = 4;

/// Emergency truncation keeps the most recent turns up to this fraction of
/// the context window.
const EMERGENCY_KEEP_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub enum CompactionStatus {
    NotTriggered,
    Compacted {
        tokens_before: u64,
        tokens_after: u64,
        strategy: Strategy,
        elapsed_ms: u64,
    },
    SkippedRateLimited {
        estimated: u64,
        allowed: u64,
    },
    TruncatedEmergency {
        tokens_before: u64,
        tokens_after: u64,
        turns_removed: usize,
    },
}

#[derive(Debug, Error)]
pub enum CompactionError {
    /// Even local truncation cannot free enough budget. The conversation is
    /// left unchanged; the caller should reject further growth.
    #[error("all compaction strategies exhausted: {current} tokens cannot fit a {budget} token budget")]
    Exhausted { current: u64, budget: u64 },

    /// A selected range would separate a tool call from its result. This is
    /// a programming invariant; the attempt aborts without commit.
    #[error("tool pairing violation in range {start}..={end}")]
    PairingViolation { start: u64, end: u64 },

    #[error("history store error: {0}")]
    Storage(#[from] anyhow::Error),
}

enum StrategyOutcome {
    Committed(CompactionStatus),
    RateLimited { estimated: u64, allowed: u64 },
    Failed,
}

/// The compaction state machine. One engine instance may serve many
/// conversations; all per-attempt state is local to `maybe_compact`, only
/// the pending fallback strategy survives between attempts, keyed by
/// conversation so concurrent conversations never share strategy state.
pub struct CompactionEngine {
    settings: CompactionSettings,
    bus: Option<Arc<Bus>>,
    pending: Mutex<HashMap<String, Strategy>>,
}

impl CompactionEngine {
    pub fn new(settings: CompactionSettings) -> Self {
        Self {
            settings,
            bus: None,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_bus(mut self, bus: Arc<Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn settings(&self) -> &CompactionSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut CompactionSettings {
        &mut self.settings
    }

    /// Check the trigger conditions and, if one fires, run the strategy
    /// chain. Strategies form a strictly ordered, non-repeating sequence;
    /// each is attempted at most once per trigger. The conversation is
    /// mutated only on commit.
    pub async fn maybe_compact<P, H>(
        &self,
        conversation: &mut Conversation,
        limits: ModelLimits,
        provider: &P,
        history: Option<&H>,
        cancel: &CancellationToken,
    ) -> Result<CompactionStatus, CompactionError>
    where
        P: Provider + ?Sized,
        H: HistoryOps,
    {
        let model_id = conversation.model_id.clone();
        let current = estimator::estimate_tokens(&conversation.turns, &model_id);
        let window = limits.context_window;

        let standard = current as f64 >= self.settings.threshold * window as f64;
        let emergency = current as f64 >= self.settings.emergency_threshold * window as f64;
        let tool_loop_active = conversation.turns.iter().any(|t| t.in_flight);

        if !standard && !emergency {
            return Ok(CompactionStatus::NotTriggered);
        }
        if !emergency && tool_loop_active {
            // Standard triggers defer rather than interrupt a tool loop.
            debug!(tokens = current, "compaction deferred, tool loop in flight");
            return Ok(CompactionStatus::NotTriggered);
        }

        self.publish(
            &events::TRIGGERED,
            serde_json::json!({
                "conversation_id": conversation.id,
                "tokens": current,
                "context_window": window,
                "emergency": emergency,
            }),
        )
        .await;

        let Some(range) = pairing::eligible_range(&conversation.turns) else {
            if current > window {
                return Err(CompactionError::Exhausted {
                    current,
                    budget: window,
                });
            }
            warn!("no pairing-safe range available, skipping compaction");
            return Ok(CompactionStatus::NotTriggered);
        };

        if range.len() <= MIN_COMPACTION_TURNS && !emergency {
            debug!(turns = range.len(), "range too small to compact");
            return Ok(CompactionStatus::NotTriggered);
        }

        let started = Instant::now();
        let predictor = RateLimitPredictor::new(provider.rate_limit());
        let mut strategy = if range.len() <= MIN_COMPACTION_TURNS {
            Strategy::Emergency
        } else {
            self.pending_strategy(&conversation.id)
        };

        info!(
            conversation_id = %conversation.id,
            tokens = current,
            strategy = strategy.as_str(),
            emergency,
            "compaction triggered"
        );

        loop {
            let outcome = match strategy {
                Strategy::Full => {
                    self.try_full(
                        conversation,
                        range.clone(),
                        limits,
                        provider,
                        history,
                        &predictor,
                        cancel,
                        started,
                    )
                    .await?
                }
                Strategy::Chunked => {
                    self.try_chunked(
                        conversation,
                        range.clone(),
                        limits,
                        provider,
                        history,
                        &predictor,
                        cancel,
                        started,
                    )
                    .await?
                }
                Strategy::Emergency => {
                    let status = match self
                        .emergency_truncate(conversation, limits, history, started)
                        .await
                    {
                        Ok(status) => status,
                        Err(e) => {
                            self.publish(
                                &events::ERROR,
                                serde_json::json!({
                                    "conversation_id": conversation.id,
                                    "error": e.to_string(),
                                }),
                            )
                            .await;
                            return Err(e);
                        }
                    };
                    self.clear_pending(&conversation.id);
                    return Ok(status);
                }
            };

            match outcome {
                StrategyOutcome::Committed(status) => {
                    self.clear_pending(&conversation.id);
                    return Ok(status);
                }
                StrategyOutcome::RateLimited { estimated, allowed } => {
                    let next = match strategy {
                        Strategy::Full => Strategy::Chunked,
                        _ => Strategy::Emergency,
                    };
                    if emergency {
                        // Forced trigger cannot wait for a later attempt.
                        strategy = next;
                        continue;
                    }
                    self.set_pending(&conversation.id, next);
                    self.publish(
                        &events::WARNING,
                        serde_json::json!({
                            "conversation_id": conversation.id,
                            "reason": "rate-limited",
                            "estimated": estimated,
                            "allowed": allowed,
                        }),
                    )
                    .await;
                    warn!(
                        estimated,
                        allowed,
                        next = next.as_str(),
                        "compaction skipped, request would exceed provider budget; \
                         consider switching provider, waiting, or starting a new conversation"
                    );
                    return Ok(CompactionStatus::SkippedRateLimited { estimated, allowed });
                }
                StrategyOutcome::Failed => {
                    strategy = match strategy {
                        Strategy::Full => Strategy::Chunked,
                        _ => Strategy::Emergency,
                    };
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_full<P, H>(
        &self,
        conversation: &mut Conversation,
        range: Range<usize>,
        limits: ModelLimits,
        provider: &P,
        history: Option<&H>,
        predictor: &RateLimitPredictor,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<StrategyOutcome, CompactionError>
    where
        P: Provider + ?Sized,
        H: HistoryOps,
    {
        let model_id = conversation.model_id.clone();
        let turns = &conversation.turns[range.clone()];

        let extracted = facts::extract_numeric_facts(turns);
        let annex = facts::facts_annex(&extracted);
        let range_tokens = estimator::estimate_tokens(turns, &model_id);
        let target_tokens = (range_tokens as f64 * self.settings.summary_ratio) as u64;

        let prompt = categorize::build_prompt(turns, annex.as_deref(), target_tokens);
        let request_tokens = estimator::estimate_text(&prompt, &model_id);

        if let Prediction::Exceeds { estimated, allowed } = predictor.predict(request_tokens) {
            return Ok(StrategyOutcome::RateLimited { estimated, allowed });
        }

        self.publish(
            &events::CATEGORIZING,
            serde_json::json!({
                "conversation_id": conversation.id,
                "turns": range.len(),
                "request_tokens": request_tokens,
            }),
        )
        .await;

        let max_tokens =
            categorize::summary_max_tokens(range_tokens, self.settings.summary_ratio, limits.max_output);
        let compaction_model = self.settings.effective_model(&model_id).to_string();

        match categorize::categorize(provider, &compaction_model, prompt, max_tokens, cancel).await {
            Ok(CategorizeOutcome::Success(result)) => {
                let mut body = result.render();
                if body.chars().count() < MIN_SUMMARY_CHARS {
                    warn!("compacted content too brief, treating as failure");
                    return Ok(StrategyOutcome::Failed);
                }
                append_missing_facts(&mut body, &extracted);

                let status = self
                    .commit(conversation, range, body, Strategy::Full, history, started)
                    .await?;
                Ok(StrategyOutcome::Committed(status))
            }
            Ok(CategorizeOutcome::ParseFailure) | Ok(CategorizeOutcome::Cancelled) => {
                Ok(StrategyOutcome::Failed)
            }
            Err(e) if e.is_rate_limit() => Ok(StrategyOutcome::RateLimited {
                estimated: request_tokens,
                allowed: predictor.allowed().unwrap_or(request_tokens),
            }),
            Err(e) => {
                warn!(error = %e, "categorization call failed");
                Ok(StrategyOutcome::Failed)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_chunked<P, H>(
        &self,
        conversation: &mut Conversation,
        range: Range<usize>,
        limits: ModelLimits,
        provider: &P,
        history: Option<&H>,
        predictor: &RateLimitPredictor,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<StrategyOutcome, CompactionError>
    where
        P: Provider + ?Sized,
        H: HistoryOps,
    {
        let model_id = conversation.model_id.clone();
        let compaction_model = self.settings.effective_model(&model_id).to_string();

        // Without a published limit chunks fall back to a quarter window.
        let budget = predictor
            .chunk_budget()
            .unwrap_or(limits.context_window / 4);
        let chunks = pairing::chunk_ranges(&conversation.turns, range.clone(), budget, &model_id);
        let total = chunks.len();

        let mut parts: Vec<String> = Vec::new();

        // Chunks run strictly in order: each depends on the budget headroom
        // left by the previous within the same rate-limit window.
        for (index, chunk) in chunks.iter().enumerate() {
            let turns = &conversation.turns[chunk.clone()];

            let protected = pairing::protected_turns(turns);
            if !protected.is_empty() {
                return Err(CompactionError::PairingViolation {
                    start: turns[0].seq,
                    end: turns[turns.len() - 1].seq,
                });
            }

            self.publish(
                &events::CHUNK,
                serde_json::json!({
                    "conversation_id": conversation.id,
                    "chunk": index + 1,
                    "of": total,
                }),
            )
            .await;

            let extracted = facts::extract_numeric_facts(turns);
            let annex = facts::facts_annex(&extracted);
            let chunk_tokens = estimator::estimate_tokens(turns, &model_id);
            let target_tokens = (chunk_tokens as f64 * self.settings.summary_ratio) as u64;
            let prompt = categorize::build_prompt(turns, annex.as_deref(), target_tokens);
            let request_tokens = estimator::estimate_text(&prompt, &model_id);

            if let Prediction::Exceeds { estimated, allowed } = predictor.predict(request_tokens) {
                // Even the minimal chunk is rejected; nothing smaller exists.
                return Ok(StrategyOutcome::RateLimited { estimated, allowed });
            }

            let max_tokens = categorize::chunk_max_tokens(chunk_tokens, self.settings.summary_ratio);

            match categorize::categorize(provider, &compaction_model, prompt, max_tokens, cancel).await
            {
                Ok(CategorizeOutcome::Success(result)) => {
                    let mut part = result.render();
                    append_missing_facts(&mut part, &extracted);
                    parts.push(part);
                }
                Ok(CategorizeOutcome::ParseFailure) | Ok(CategorizeOutcome::Cancelled) => {
                    // Retaining the original beats discarding it.
                    warn!(chunk = index + 1, total, "chunk categorization failed, retaining original content");
                    parts.push(retained_content(turns));
                }
                Err(e) if e.is_rate_limit() => {
                    return Ok(StrategyOutcome::RateLimited {
                        estimated: request_tokens,
                        allowed: predictor.allowed().unwrap_or(request_tokens),
                    });
                }
                Err(e) => {
                    warn!(chunk = index + 1, total, error = %e, "chunk call failed, retaining original content");
                    parts.push(retained_content(turns));
                }
            }
        }

        let body = parts.join("\n\n");

        // Retained chunks carry their full original content, so a pass where
        // nothing summarized can come out larger than what it replaces.
        // Committing that would report success while the conversation grew.
        let range_tokens =
            estimator::estimate_tokens(&conversation.turns[range.clone()], &model_id);
        if estimator::estimate_text(&body, &model_id) >= range_tokens {
            warn!(
                range_tokens,
                "chunked pass did not shrink the range, falling through"
            );
            return Ok(StrategyOutcome::Failed);
        }

        let status = self
            .commit(conversation, range, body, Strategy::Chunked, history, started)
            .await?;
        Ok(StrategyOutcome::Committed(status))
    }

    /// Last resort, never calls the model and therefore cannot be rate
    /// limited. Keeps the most recent pair-safe turns within the keep
    /// budget and replaces everything older with a synthetic notice turn.
    async fn emergency_truncate<H>(
        &self,
        conversation: &mut Conversation,
        limits: ModelLimits,
        history: Option<&H>,
        started: Instant,
    ) -> Result<CompactionStatus, CompactionError>
    where
        H: HistoryOps,
    {
        let model_id = conversation.model_id.clone();
        let current = estimator::estimate_tokens(&conversation.turns, &model_id);
        let keep_budget = (limits.context_window as f64 * EMERGENCY_KEEP_FRACTION) as u64;

        // Walk back from the tail until the keep budget is spent.
        let mut kept_tokens: u64 = 0;
        let mut cut = conversation.turns.len();
        for index in (0..conversation.turns.len()).rev() {
            let turn_tokens =
                estimator::estimate_tokens(std::slice::from_ref(&conversation.turns[index]), &model_id);
            if kept_tokens + turn_tokens > keep_budget {
                break;
            }
            kept_tokens += turn_tokens;
            cut = index;
        }
        if cut == conversation.turns.len() && cut > 0 {
            // The newest turn alone exceeds the budget; keep it anyway.
            cut -= 1;
        }

        // The removed prefix must contain no protected turn and its boundary
        // must not separate a call from its result.
        let eligible_end = pairing::eligible_range(&conversation.turns)
            .map(|r| r.end)
            .unwrap_or(0);
        let cut = pairing::pair_safe_cut(&conversation.turns, cut.min(eligible_end));

        if cut == 0 {
            return Err(CompactionError::Exhausted {
                current,
                budget: keep_budget,
            });
        }

        let removed = &conversation.turns[0..cut];
        let removed_count = removed.len();
        let removed_tokens = estimator::estimate_tokens(removed, &model_id);
        let post_without_notice = current.saturating_sub(removed_tokens);
        if post_without_notice > limits.context_window {
            // A pathological tail that truncation cannot shrink.
            return Err(CompactionError::Exhausted {
                current,
                budget: limits.context_window,
            });
        }

        let body = format!(
            "=== CONVERSATION TRUNCATED ===\n\
             {removed_count} earlier messages (about {removed_tokens} tokens) were removed \
             because the conversation exceeded the model's context budget and \
             summarization was unavailable. Recent messages are intact; earlier \
             details must be restated if still needed.",
        );

        info!(
            conversation_id = %conversation.id,
            removed = removed_count,
            removed_tokens,
            "emergency truncation"
        );

        let status = self
            .commit(conversation, 0..cut, body, Strategy::Emergency, history, started)
            .await?;

        match status {
            CompactionStatus::Compacted {
                tokens_before,
                tokens_after,
                ..
            } => Ok(CompactionStatus::TruncatedEmergency {
                tokens_before,
                tokens_after,
                turns_removed: removed_count,
            }),
            other => Ok(other),
        }
    }

    /// The only place conversation state and rollup history are mutated.
    /// Replaces the range with one rollup turn, recomputes the token
    /// estimate from scratch, and appends one append-only record.
    async fn commit<H>(
        &self,
        conversation: &mut Conversation,
        range: Range<usize>,
        body: String,
        strategy: Strategy,
        history: Option<&H>,
        started: Instant,
    ) -> Result<CompactionStatus, CompactionError>
    where
        H: HistoryOps,
    {
        let model_id = conversation.model_id.clone();
        let turns = &conversation.turns[range.clone()];
        let seq_range = SeqRange::new(turns[0].seq, turns[turns.len() - 1].seq);
        let turn_count = turns.len();

        let protected = pairing::protected_turns(&conversation.turns);
        if turns.iter().any(|t| protected.contains(&t.seq)) {
            return Err(CompactionError::PairingViolation {
                start: seq_range.start,
                end: seq_range.end,
            });
        }

        let tokens_before = estimator::estimate_tokens(&conversation.turns, &model_id);
        let outside: u64 = conversation
            .turns
            .iter()
            .enumerate()
            .filter(|(i, _)| !range.contains(i))
            .map(|(_, t)| estimator::estimate_tokens(std::slice::from_ref(t), &model_id))
            .sum();
        let projected_after = outside + estimator::estimate_text(&body, &model_id);

        let header = rollup::rollup_header(turn_count, tokens_before, projected_after);
        let rollup_turn = Turn::rollup(&conversation.id, format!("{header}{body}"), seq_range);

        let insert_at = range.start;
        let replaced: Vec<Turn> = conversation.turns[range.clone()].to_vec();
        conversation.replace_range(range, vec![rollup_turn]);
        let committed_turn = conversation.turns[insert_at].clone();

        let tokens_after = estimator::estimate_tokens(&conversation.turns, &model_id);
        conversation.set_token_estimate(tokens_after);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let record = RollupRecord::new(
            &conversation.id,
            seq_range,
            turn_count,
            tokens_before,
            tokens_after,
            strategy,
            elapsed_ms,
        );

        if let Some(history) = history {
            // A failed persist must not leave memory ahead of the store:
            // restore the original turns and surface the error uncommitted.
            if let Err(e) = history.commit_rollup(conversation, &committed_turn, &record).await {
                conversation.turns.splice(insert_at..insert_at + 1, replaced);
                conversation.set_token_estimate(tokens_before);
                return Err(CompactionError::Storage(e));
            }
        }

        info!(
            conversation_id = %conversation.id,
            strategy = strategy.as_str(),
            tokens_before,
            tokens_after,
            reduction_pct = format!("{:.1}", record.reduction_pct),
            elapsed_ms,
            "compaction committed"
        );

        self.publish(
            &events::COMPLETED,
            serde_json::json!({
                "conversation_id": conversation.id,
                "strategy": strategy.as_str(),
                "tokens_before": tokens_before,
                "tokens_after": tokens_after,
                "reduction_pct": record.reduction_pct,
            }),
        )
        .await;

        Ok(CompactionStatus::Compacted {
            tokens_before,
            tokens_after,
            strategy,
            elapsed_ms,
        })
    }

    fn pending_strategy(&self, conversation_id: &str) -> Strategy {
        self.pending
            .lock()
            .unwrap()
            .get(conversation_id)
            .copied()
            .unwrap_or(Strategy::Full)
    }

    fn set_pending(&self, conversation_id: &str, strategy: Strategy) {
        self.pending
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), strategy);
    }

    fn clear_pending(&self, conversation_id: &str) {
        self.pending.lock().unwrap().remove(conversation_id);
    }

    async fn publish(&self, def: &BusEventDef, properties: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(def, properties).await;
        }
    }
}

/// Fallback body for a chunk whose categorization failed: the original
/// content, unsummarized.
fn retained_content(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("[{}] {}", t.role.as_str(), t.content_text()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn append_missing_facts(body: &mut String, extracted: &[facts::NumericFact]) {
    let missing = facts::missing_literals(extracted, body);
    if missing.is_empty() {
        return;
    }
    body.push_str("\n\nKey numeric data: ");
    body.push_str(&missing.join(", "));
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use distil_config::CompactionConfig;
    use distil_provider::{InvokeRequest, ProviderError, RateLimit};
    use distil_types::TurnRole;
    use std::collections::VecDeque;

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
            Some(LIMITS)
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

    const LIMITS: ModelLimits = ModelLimits {
        context_window: 10_000,
        max_output: 4000,
    };

    fn engine() -> CompactionEngine {
        CompactionEngine::new(
            CompactionSettings::new(CompactionConfig {
                rollup_threshold: 0.5,
                emergency_rollup_threshold: 0.95,
                summary_ratio: 0.3,
                model: None,
            })
            .unwrap(),
        )
    }

    fn conversation(turns: usize, chars_each: usize) -> Conversation {
        let mut conv = Conversation::new("claude-sonnet-4");
        let id = conv.id.clone();
        for i in 0..turns {
            conv.push(Turn::user(&id, format!("{i}:{}", "x".repeat(chars_each))));
        }
        conv
    }

    fn good_response() -> String {
        format!(
            "{{\"assignments\": {{}}, \"preserved\": [], \"summary\": \"{}\"}}",
            "s".repeat(400)
        )
    }

    #[tokio::test]
    async fn test_below_threshold_not_triggered() {
        let engine = engine();
        let provider = MockProvider::new(RateLimit::Unlimited);
        let mut conv = conversation(10, 100);
        let status = engine
            .maybe_compact(
                &mut conv,
                LIMITS,
                &provider,
                Option::<&rollup::MemoryHistory>::None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(status, CompactionStatus::NotTriggered);
        assert_eq!(provider.request_count(), 0);
    }

    #[tokio::test]
    async fn test_full_compaction_commits() {
        let engine = engine();
        let provider = MockProvider::new(RateLimit::Unlimited).script(Ok(good_response()));
        // 10 turns of ~2400 chars each, about 6000 tokens against a 5000 trigger.
        let mut conv = conversation(10, 2400);

        let status = engine
            .maybe_compact(
                &mut conv,
                LIMITS,
                &provider,
                Option::<&rollup::MemoryHistory>::None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match status {
            CompactionStatus::Compacted {
                tokens_before,
                tokens_after,
                strategy,
                ..
            } => {
                assert_eq!(strategy, Strategy::Full);
                assert!(tokens_after <= tokens_before);
            }
            other => panic!("expected Compacted, got {other:?}"),
        }
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.turns[0].role, TurnRole::RollupSummary);
        assert_eq!(conv.turns[0].provenance, Some(SeqRange::new(0, 9)));
    }

    #[tokio::test]
    async fn test_second_call_after_compaction_is_idempotent() {
        let engine = engine();
        let provider = MockProvider::new(RateLimit::Unlimited).script(Ok(good_response()));
        let mut conv = conversation(10, 2400);
        let cancel = CancellationToken::new();

        engine
            .maybe_compact(&mut conv, LIMITS, &provider, Option::<&rollup::MemoryHistory>::None, &cancel)
            .await
            .unwrap();
        let before = conv.turns.len();

        let status = engine
            .maybe_compact(&mut conv, LIMITS, &provider, Option::<&rollup::MemoryHistory>::None, &cancel)
            .await
            .unwrap();
        assert_eq!(status, CompactionStatus::NotTriggered);
        assert_eq!(conv.turns.len(), before);
    }

    #[tokio::test]
    async fn test_predicted_rate_limit_skips_without_model_call() {
        let engine = engine();
        // Any prompt over 1000 tokens is predicted to fail.
        let provider = MockProvider::new(RateLimit::per_minute(1000));
        let mut conv = conversation(10, 2400);

        let status = engine
            .maybe_compact(
                &mut conv,
                LIMITS,
                &provider,
                Option::<&rollup::MemoryHistory>::None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match status {
            CompactionStatus::SkippedRateLimited { estimated, allowed } => {
                assert!(estimated > allowed);
                assert_eq!(allowed, 1000);
            }
            other => panic!("expected SkippedRateLimited, got {other:?}"),
        }
        assert_eq!(provider.request_count(), 0);
        assert_eq!(engine.pending_strategy(&conv.id), Strategy::Chunked);
    }

    #[tokio::test]
    async fn test_parse_failure_falls_to_chunked() {
        let engine = engine();
        let provider = MockProvider::new(RateLimit::Unlimited)
            .script(Ok("not json at all".to_string()))
            .script(Ok(good_response()))
            .script(Ok(good_response()))
            .script(Ok(good_response()));
        let mut conv = conversation(10, 2400);

        let status = engine
            .maybe_compact(
                &mut conv,
                LIMITS,
                &provider,
                Option::<&rollup::MemoryHistory>::None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match status {
            CompactionStatus::Compacted { strategy, .. } => assert_eq!(strategy, Strategy::Chunked),
            other => panic!("expected chunked Compacted, got {other:?}"),
        }
        assert!(provider.request_count() > 1);
    }

    #[tokio::test]
    async fn test_tool_pair_never_split() {
        let engine = engine();
        let provider = MockProvider::new(RateLimit::Unlimited).script(Ok(good_response()));
        let mut conv = conversation(10, 2400);
        let id = conv.id.clone();
        conv.push(Turn::tool_call(&id, "call_1", "bash", serde_json::json!({"cmd": "ls"})));

        // Over the emergency threshold with an unresolved call at the tail.
        for _ in 0..6 {
            conv.push(Turn::user(&id, "y".repeat(2400)));
        }

        engine
            .maybe_compact(
                &mut conv,
                LIMITS,
                &provider,
                Option::<&rollup::MemoryHistory>::None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let calls: Vec<_> = conv.turns.iter().filter(|t| t.is_tool_call()).collect();
        assert_eq!(calls.len(), 1, "unresolved call must survive compaction");
    }

    #[tokio::test]
    async fn test_all_chunks_failing_never_commits_growth() {
        let engine = engine();
        // Full pass and every chunk come back as prose; retained content
        // would only make the range bigger.
        let provider = MockProvider::new(RateLimit::Unlimited)
            .script(Ok("prose".to_string()))
            .script(Ok("prose".to_string()))
            .script(Ok("prose".to_string()))
            .script(Ok("prose".to_string()));
        let mut conv = conversation(12, 2400);
        let tokens_before = conv.token_estimate;

        let status = engine
            .maybe_compact(
                &mut conv,
                LIMITS,
                &provider,
                Option::<&rollup::MemoryHistory>::None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        match status {
            CompactionStatus::TruncatedEmergency { tokens_after, .. } => {
                assert!(tokens_after < tokens_before);
            }
            other => panic!("expected TruncatedEmergency, got {other:?}"),
        }
        assert!(conv.token_estimate < tokens_before);
    }

    struct FailingHistory;

    impl HistoryOps for FailingHistory {
        async fn commit_rollup(
            &self,
            _conversation: &Conversation,
            _rollup_turn: &Turn,
            _record: &RollupRecord,
        ) -> anyhow::Result<()> {
            anyhow::bail!("store unavailable")
        }

        async fn rollup_records(&self, _conversation_id: &str) -> anyhow::Result<Vec<RollupRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_storage_failure_restores_conversation() {
        let engine = engine();
        let provider = MockProvider::new(RateLimit::Unlimited).script(Ok(good_response()));
        let mut conv = conversation(10, 2400);

        let result = engine
            .maybe_compact(
                &mut conv,
                LIMITS,
                &provider,
                Some(&FailingHistory),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(CompactionError::Storage(_))));
        assert_eq!(conv.turns.len(), 10);
        assert!(conv.turns.iter().all(|t| t.role == TurnRole::User));
        assert_eq!(conv.turns[0].seq, 0);
        assert_eq!(
            conv.token_estimate,
            estimator::estimate_tokens(&conv.turns, "claude-sonnet-4"),
        );
    }

    #[tokio::test]
    async fn test_exhausted_leaves_conversation_unchanged() {
        let engine = engine();
        let provider = MockProvider::new(RateLimit::Unlimited);
        // One giant turn the size of several windows; nothing is removable.
        let mut conv = Conversation::new("claude-sonnet-4");
        let id = conv.id.clone();
        conv.push(Turn::tool_call(&id, "call_1", "bash", serde_json::json!({})));
        conv.push(Turn::tool_result(&id, "call_1", "z".repeat(80_000), false));

        let before = conv.turns.len();
        let result = engine
            .maybe_compact(
                &mut conv,
                LIMITS,
                &provider,
                Option::<&rollup::MemoryHistory>::None,
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(CompactionError::Exhausted { .. })));
        assert_eq!(conv.turns.len(), before);
    }
}
