//! Context compaction engine: keeps a growing multi-turn conversation
//! within a model's context window by replacing older ranges with
//! synthesized rollup summaries, degrading from a single full pass through
//! chunked summarization to network-free emergency truncation.

pub mod categorize;
pub mod estimator;
pub mod events;
pub mod facts;
pub mod orchestrator;
pub mod pairing;
pub mod ratelimit;
pub mod rollup;

pub use categorize::{CategorizationResult, CategorizeOutcome, CategoryAssignment};
pub use facts::{FactKind, NumericFact};
pub use orchestrator::{CompactionEngine, CompactionError, CompactionStatus};
pub use ratelimit::{Prediction, RateLimitPredictor};
pub use rollup::{HistoryOps, MemoryHistory};
