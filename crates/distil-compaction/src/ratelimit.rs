use distil_provider::RateLimit;

/// Fraction of the per-minute budget a single chunk may occupy. Leaves
/// headroom for the conversation's own traffic inside the same window.
pub const CHUNK_BUDGET_FACTOR: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prediction {
    Within,
    Exceeds { estimated: u64, allowed: u64 },
}

/// Advisory pre-check of a proposed request size against the provider's
/// published per-minute input-token budget. The provider itself is the real
/// gate; this exists to avoid foreseeable rejections, specifically the loop
/// where an oversized compaction request is rejected, which triggers another
/// equally oversized attempt.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPredictor {
    limit: RateLimit,
}

impl RateLimitPredictor {
    pub fn new(limit: RateLimit) -> Self {
        Self { limit }
    }

    pub fn predict(&self, request_tokens: u64) -> Prediction {
        match self.limit.allowed() {
            None => Prediction::Within,
            Some(allowed) if request_tokens <= allowed => Prediction::Within,
            Some(allowed) => Prediction::Exceeds {
                estimated: request_tokens,
                allowed,
            },
        }
    }

    pub fn allowed(&self) -> Option<u64> {
        self.limit.allowed()
    }

    /// Token budget for one chunk in chunked compaction, or None when the
    /// provider is unlimited and chunk sizing falls back to a local default.
    pub fn chunk_budget(&self) -> Option<u64> {
        self.limit
            .allowed()
            .map(|allowed| (allowed as f64 * CHUNK_BUDGET_FACTOR) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_always_within() {
        let predictor = RateLimitPredictor::new(RateLimit::Unlimited);
        assert_eq!(predictor.predict(u64::MAX), Prediction::Within);
        assert_eq!(predictor.chunk_budget(), None);
    }

    #[test]
    fn test_within_budget() {
        let predictor = RateLimitPredictor::new(RateLimit::per_minute(30_000));
        assert_eq!(predictor.predict(30_000), Prediction::Within);
    }

    #[test]
    fn test_exceeds_budget_reports_both_sides() {
        let predictor = RateLimitPredictor::new(RateLimit::per_minute(30_000));
        assert_eq!(
            predictor.predict(45_000),
            Prediction::Exceeds {
                estimated: 45_000,
                allowed: 30_000
            }
        );
    }

    #[test]
    fn test_chunk_budget_is_sixty_percent() {
        let predictor = RateLimitPredictor::new(RateLimit::per_minute(30_000));
        assert_eq!(predictor.chunk_budget(), Some(18_000));
    }
}
