mod loader;
mod schema;
mod settings;

pub use loader::ConfigLoader;
pub use schema::{CompactionConfig, Config, ConfigError};
pub use settings::CompactionSettings;
