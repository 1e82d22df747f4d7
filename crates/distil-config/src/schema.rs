use serde::{Deserialize, Serialize};

pub const DEFAULT_ROLLUP_THRESHOLD: f64 = 0.7;
pub const DEFAULT_EMERGENCY_THRESHOLD: f64 = 0.95;
pub const DEFAULT_SUMMARY_RATIO: f64 = 0.3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a fraction in [0, 1], got {value}")]
    FractionOutOfRange { name: &'static str, value: f64 },

    #[error(
        "emergency_rollup_threshold ({emergency}) must be >= rollup_threshold ({standard})"
    )]
    ThresholdOrder { standard: f64, emergency: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(
        rename = "logLevel",
        alias = "log_level",
        skip_serializing_if = "Option::is_none"
    )]
    pub log_level: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionConfig>,
}

impl Config {
    /// Merge another config on top of this one. Set fields win.
    pub fn merge(&mut self, other: Config) {
        if other.log_level.is_some() {
            self.log_level = other.log_level;
        }
        if other.model.is_some() {
            self.model = other.model;
        }
        match (&mut self.compaction, other.compaction) {
            (Some(existing), Some(incoming)) => existing.merge(incoming),
            (slot @ None, Some(incoming)) => *slot = Some(incoming),
            _ => {}
        }
    }
}

/// Global compaction defaults. Per-conversation overrides are layered on top
/// via `CompactionSettings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Fraction of the context window that triggers a standard compaction.
    #[serde(default = "default_threshold")]
    pub rollup_threshold: f64,

    /// Fraction that forces compaction even mid tool-use sequence.
    #[serde(default = "default_emergency")]
    pub emergency_rollup_threshold: f64,

    /// Target size of a rollup relative to the content it replaces.
    #[serde(default = "default_ratio")]
    pub summary_ratio: f64,

    /// Globally locked compaction model. When set, per-conversation model
    /// overrides are rejected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_threshold() -> f64 {
    DEFAULT_ROLLUP_THRESHOLD
}

fn default_emergency() -> f64 {
    DEFAULT_EMERGENCY_THRESHOLD
}

fn default_ratio() -> f64 {
    DEFAULT_SUMMARY_RATIO
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            rollup_threshold: DEFAULT_ROLLUP_THRESHOLD,
            emergency_rollup_threshold: DEFAULT_EMERGENCY_THRESHOLD,
            summary_ratio: DEFAULT_SUMMARY_RATIO,
            model: None,
        }
    }
}

impl CompactionConfig {
    fn merge(&mut self, other: CompactionConfig) {
        self.rollup_threshold = other.rollup_threshold;
        self.emergency_rollup_threshold = other.emergency_rollup_threshold;
        self.summary_ratio = other.summary_ratio;
        if other.model.is_some() {
            self.model = other.model;
        }
    }

    /// Thresholds are fractions and emergency must not be below standard.
    /// A misordered pair is a data entry error, rejected here rather than
    /// resolved by runtime precedence.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("rollup_threshold", self.rollup_threshold),
            (
                "emergency_rollup_threshold",
                self.emergency_rollup_threshold,
            ),
            ("summary_ratio", self.summary_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::FractionOutOfRange { name, value });
            }
        }

        if self.emergency_rollup_threshold < self.rollup_threshold {
            return Err(ConfigError::ThresholdOrder {
                standard: self.rollup_threshold,
                emergency: self.emergency_rollup_threshold,
            });
        }

        Ok(())
    }
}
