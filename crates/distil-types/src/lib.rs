pub mod conversation;
pub mod rollup;
pub mod turn;

pub use conversation::Conversation;
pub use rollup::{RollupRecord, Strategy};
pub use turn::{SeqRange, Segment, Turn, TurnRole};
