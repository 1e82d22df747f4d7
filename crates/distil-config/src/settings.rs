use serde::{Deserialize, Serialize};

use crate::schema::{CompactionConfig, ConfigError};

/// Per-conversation compaction settings layered over global defaults.
///
/// The model follows a strict priority: a globally locked model (from the
/// compaction config) beats any per-conversation override, which beats the
/// conversation's own model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionSettings {
    defaults: CompactionConfig,
    pub threshold: f64,
    pub emergency_threshold: f64,
    pub summary_ratio: f64,
    model: Option<String>,
}

impl CompactionSettings {
    pub fn new(defaults: CompactionConfig) -> Result<Self, ConfigError> {
        defaults.validate()?;
        Ok(Self {
            threshold: defaults.rollup_threshold,
            emergency_threshold: defaults.emergency_rollup_threshold,
            summary_ratio: defaults.summary_ratio,
            model: None,
            defaults,
        })
    }

    pub fn is_model_locked(&self) -> bool {
        self.defaults.model.is_some()
    }

    /// Set the per-conversation compaction model. Ignored when the model is
    /// globally locked.
    pub fn set_model(&mut self, model: impl Into<String>) {
        let model = model.into();
        if let Some(locked) = &self.defaults.model {
            tracing::warn!(locked = %locked, "compaction model is locked, ignoring override");
            return;
        }
        tracing::info!(model = %model, "compaction model override set");
        self.model = Some(model);
    }

    pub fn set_threshold(&mut self, threshold: f64) -> Result<(), ConfigError> {
        let candidate = CompactionConfig {
            rollup_threshold: threshold,
            emergency_rollup_threshold: self.emergency_threshold,
            summary_ratio: self.summary_ratio,
            model: None,
        };
        candidate.validate()?;
        self.threshold = threshold;
        Ok(())
    }

    pub fn set_summary_ratio(&mut self, ratio: f64) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::FractionOutOfRange {
                name: "summary_ratio",
                value: ratio,
            });
        }
        self.summary_ratio = ratio;
        Ok(())
    }

    /// The model to use for the categorization call, given the
    /// conversation's own model.
    pub fn effective_model<'a>(&'a self, conversation_model: &'a str) -> &'a str {
        if let Some(locked) = &self.defaults.model {
            return locked;
        }
        if let Some(model) = &self.model {
            return model;
        }
        conversation_model
    }

    pub fn reset_to_defaults(&mut self) {
        self.threshold = self.defaults.rollup_threshold;
        self.emergency_threshold = self.defaults.emergency_rollup_threshold;
        self.summary_ratio = self.defaults.summary_ratio;
        self.model = None;
        tracing::info!(
            threshold = self.threshold,
            ratio = self.summary_ratio,
            "compaction settings reset to defaults"
        );
    }
}

impl Default for CompactionSettings {
    fn default() -> Self {
        // The built-in defaults always validate.
        Self::new(CompactionConfig::default()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_model_priority() {
        let mut settings = CompactionSettings::default();
        assert_eq!(settings.effective_model("claude-conv"), "claude-conv");

        settings.set_model("claude-override");
        assert_eq!(settings.effective_model("claude-conv"), "claude-override");
    }

    #[test]
    fn test_locked_model_rejects_override() {
        let mut settings = CompactionSettings::new(CompactionConfig {
            model: Some("claude-locked".into()),
            ..Default::default()
        })
        .unwrap();

        settings.set_model("claude-override");
        assert!(settings.is_model_locked());
        assert_eq!(settings.effective_model("claude-conv"), "claude-locked");
    }

    #[test]
    fn test_set_threshold_rejects_above_emergency() {
        let mut settings = CompactionSettings::default();
        assert!(settings.set_threshold(0.98).is_err());
        assert!(settings.set_threshold(0.5).is_ok());
        assert_eq!(settings.threshold, 0.5);
    }

    #[test]
    fn test_reset_to_defaults() {
        let mut settings = CompactionSettings::default();
        settings.set_threshold(0.4).unwrap();
        settings.set_summary_ratio(0.2).unwrap();
        settings.set_model("claude-override");

        settings.reset_to_defaults();
        assert_eq!(settings.threshold, 0.7);
        assert_eq!(settings.summary_ratio, 0.3);
        assert_eq!(settings.effective_model("claude-conv"), "claude-conv");
    }

    #[test]
    fn test_new_rejects_invalid_defaults() {
        let result = CompactionSettings::new(CompactionConfig {
            rollup_threshold: 0.9,
            emergency_rollup_threshold: 0.4,
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
