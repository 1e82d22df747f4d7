mod database;
mod repository;
mod schema;

pub use database::{Database, DatabaseError};
pub use repository::{ConversationSettings, HistoryRepository};
