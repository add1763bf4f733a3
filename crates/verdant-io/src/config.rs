//! Application configuration.
//!
//! Every section has serde defaults, so a config file only needs the
//! values it changes. Durations are written as fractional seconds.

use serde::{Deserialize, Serialize};
use verdant_pipeline::{NullClassifier, PreprocessOptions, ValidationPolicy};
use verdant_store::StoreConfig;
use verdant_worker::ModelSource;

use crate::channel::{Channel, ChannelConfig, ContextFactory};
use crate::orchestrator::Orchestrator;
use crate::timer::Timer;

/// Serde support for `std::time::Duration` as fractional seconds.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Errors loading or checking a [`VerdantConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The JSON is malformed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range or inconsistent with another.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Everything needed to build an analysis session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerdantConfig {
    /// Upload acceptance rules.
    pub validation: ValidationPolicy,
    /// Preprocessing applied before classification.
    pub preprocess: PreprocessOptions,
    /// Background channel limits.
    pub channel: ChannelConfig,
    /// Persistence threshold.
    pub store: StoreConfig,
    /// Model weights. Without a model the worker and main-thread tiers
    /// fail and classification falls through to the classical tier.
    pub model: Option<ModelSource>,
    /// Seed for the stub tier; entropy when absent.
    pub stub_seed: Option<u64>,
}

impl VerdantConfig {
    /// Parse and check a JSON config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::Invalid`] if [`validate`](Self::validate) fails.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let v = &self.validation;
        if v.max_bytes == 0 {
            return Err(ConfigError::Invalid("validation.max_bytes must be positive".into()));
        }
        if !(0.0..=255.0).contains(&v.min_brightness)
            || !(0.0..=255.0).contains(&v.max_brightness)
            || v.min_brightness >= v.max_brightness
        {
            return Err(ConfigError::Invalid(format!(
                "brightness bounds {}..{} must satisfy 0 <= min < max <= 255",
                v.min_brightness, v.max_brightness
            )));
        }
        if v.accepted_mime_types.is_empty() {
            return Err(ConfigError::Invalid(
                "validation.accepted_mime_types must not be empty".into(),
            ));
        }

        let p = &self.preprocess;
        if p.input_size == 0 {
            return Err(ConfigError::Invalid("preprocess.input_size must be positive".into()));
        }
        if !p.threshold.is_finite() || p.threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "preprocess.threshold must be a positive number, got {}",
                p.threshold
            )));
        }

        let c = &self.channel;
        if c.max_init_attempts == 0 {
            return Err(ConfigError::Invalid("channel.max_init_attempts must be at least 1".into()));
        }
        if c.init_timeout.is_zero() || c.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("channel timeouts must be positive".into()));
        }

        if self.store.min_confidence > 100 {
            return Err(ConfigError::Invalid(format!(
                "store.min_confidence must be at most 100, got {}",
                self.store.min_confidence
            )));
        }
        Ok(())
    }

    /// The stub tier, seeded when `stub_seed` is set.
    #[must_use]
    pub fn stub_classifier(&self) -> NullClassifier {
        self.stub_seed
            .map_or_else(NullClassifier::new, NullClassifier::with_seed)
    }

    /// A background channel loading the configured model. `None` without
    /// a model, since the worker tier could never succeed.
    pub fn channel<F: ContextFactory, T: Timer>(&self, factory: F, timer: T) -> Option<Channel<F, T>> {
        self.model
            .clone()
            .map(|model| Channel::new(factory, timer, model, self.channel))
    }

    /// An orchestrator over `channel` and the configured model and stub.
    pub fn orchestrator<F: ContextFactory, T: Timer>(
        &self,
        channel: Option<Channel<F, T>>,
    ) -> Orchestrator<F, T> {
        Orchestrator::new(channel, self.model.clone(), self.stub_classifier())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn defaults_are_valid() {
        VerdantConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_json_gives_defaults() {
        let config = VerdantConfig::from_json("{}").unwrap();
        assert_eq!(config, VerdantConfig::default());
        assert_eq!(config.store.min_confidence, 75);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = VerdantConfig::from_json(
            r#"{"channel": {"request_timeout": 0.5}, "stub_seed": 9, "model": {"Path": "weights.json"}}"#,
        )
        .unwrap();
        assert_eq!(config.channel.request_timeout, Duration::from_millis(500));
        assert_eq!(config.channel.max_init_attempts, 3);
        assert_eq!(config.stub_seed, Some(9));
        assert_eq!(config.model, Some(ModelSource::Path("weights.json".into())));
    }

    #[test]
    fn inverted_brightness_bounds_are_rejected() {
        let err = VerdantConfig::from_json(
            r#"{"validation": {"min_brightness": 200.0, "max_brightness": 100.0}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_attempts_are_rejected() {
        let err =
            VerdantConfig::from_json(r#"{"channel": {"max_init_attempts": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("max_init_attempts"));
    }

    #[test]
    fn no_model_means_no_channel() {
        let config = VerdantConfig::default();
        let channel = config.channel(
            crate::testing::ScriptedFactory::refusing(),
            crate::timer::TokioTimer,
        );
        assert!(channel.is_none());
    }

    #[test]
    fn seeded_stub_is_reproducible() {
        use verdant_pipeline::Classifier;

        let config = VerdantConfig::from_json(r#"{"stub_seed": 42}"#).unwrap();
        let leaf = crate::testing::leaf();
        let a = config.stub_classifier().classify(&leaf).unwrap();
        let b = config.stub_classifier().classify(&leaf).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn negative_duration_is_a_parse_error() {
        let err = VerdantConfig::from_json(r#"{"channel": {"init_timeout": -1.0}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
