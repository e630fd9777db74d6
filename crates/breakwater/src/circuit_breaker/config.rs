//! Circuit breaker configuration, builder and overlay properties.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
pub use crate::error::ErrorPredicate;
use crate::utils::option_duration_millis;

/// Which aggregation the closed-state window uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlidingWindowType {
    /// The last N call outcomes.
    #[default]
    CountBased,
    /// The outcomes of the last N seconds.
    TimeBased,
}

/// Tuning knobs for a [`CircuitBreaker`](super::CircuitBreaker).
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate (percent) at or above which the breaker opens.
    pub failure_rate_threshold: f32,
    /// Slow-call rate (percent) at or above which the breaker opens, when set.
    pub slow_call_rate_threshold: Option<f32>,
    /// Calls at least this slow count as slow calls.
    pub slow_call_duration_threshold: Duration,
    /// Window size while closed: call count (count-based) or seconds
    /// (time-based). Doubles as the minimum number of calls before rates are
    /// evaluated.
    pub ring_buffer_size_in_closed_state: u32,
    /// Number of probe calls admitted while half-open.
    pub ring_buffer_size_in_half_open_state: u32,
    /// How long the breaker stays open before probing.
    pub wait_duration_in_open_state: Duration,
    /// When set, a timer drives the open→half-open transition so monitoring
    /// sees it even without traffic.
    pub automatic_transition_from_open_to_half_open_enabled: bool,
    /// Aggregation used by the closed-state window.
    pub sliding_window_type: SlidingWindowType,
    /// When present, only matching errors count as failures; everything else
    /// is ignored.
    pub record_predicate: Option<ErrorPredicate>,
    /// When present, matching errors are ignored outright. Checked before
    /// the record predicate.
    pub ignore_predicate: Option<ErrorPredicate>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: None,
            slow_call_duration_threshold: Duration::from_secs(60),
            ring_buffer_size_in_closed_state: 100,
            ring_buffer_size_in_half_open_state: 10,
            wait_duration_in_open_state: Duration::from_secs(60),
            automatic_transition_from_open_to_half_open_enabled: false,
            sliding_window_type: SlidingWindowType::CountBased,
            record_predicate: None,
            ignore_predicate: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a configuration builder.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.failure_rate_threshold)
            || self.failure_rate_threshold == 0.0
        {
            return Err(ConfigError::invalid(
                "failure_rate_threshold must be between 0 (exclusive) and 100",
            ));
        }
        if let Some(rate) = self.slow_call_rate_threshold {
            if !(0.0..=100.0).contains(&rate) || rate == 0.0 {
                return Err(ConfigError::invalid(
                    "slow_call_rate_threshold must be between 0 (exclusive) and 100",
                ));
            }
        }
        if self.ring_buffer_size_in_closed_state == 0 {
            return Err(ConfigError::invalid(
                "ring_buffer_size_in_closed_state must be greater than 0",
            ));
        }
        if self.ring_buffer_size_in_half_open_state == 0 {
            return Err(ConfigError::invalid(
                "ring_buffer_size_in_half_open_state must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("slow_call_rate_threshold", &self.slow_call_rate_threshold)
            .field("slow_call_duration_threshold", &self.slow_call_duration_threshold)
            .field("ring_buffer_size_in_closed_state", &self.ring_buffer_size_in_closed_state)
            .field("ring_buffer_size_in_half_open_state", &self.ring_buffer_size_in_half_open_state)
            .field("wait_duration_in_open_state", &self.wait_duration_in_open_state)
            .field(
                "automatic_transition_from_open_to_half_open_enabled",
                &self.automatic_transition_from_open_to_half_open_enabled,
            )
            .field("sliding_window_type", &self.sliding_window_type)
            .field("record_predicate", &self.record_predicate.as_ref().map(|_| "<predicate>"))
            .field("ignore_predicate", &self.ignore_predicate.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}

/// Fluent builder for [`CircuitBreakerConfig`].
#[derive(Debug)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    /// Starts from an existing configuration instead of the defaults.
    pub fn from_config(config: CircuitBreakerConfig) -> Self {
        Self { config }
    }

    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = Some(percent);
        self
    }

    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    pub fn ring_buffer_size_in_closed_state(mut self, size: u32) -> Self {
        self.config.ring_buffer_size_in_closed_state = size;
        self
    }

    pub fn ring_buffer_size_in_half_open_state(mut self, size: u32) -> Self {
        self.config.ring_buffer_size_in_half_open_state = size;
        self
    }

    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    pub fn automatic_transition_from_open_to_half_open(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open_enabled = enabled;
        self
    }

    pub fn sliding_window_type(mut self, window_type: SlidingWindowType) -> Self {
        self.config.sliding_window_type = window_type;
        self
    }

    /// Only errors matching `predicate` are recorded as failures.
    pub fn record_error(
        mut self,
        predicate: impl Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.config.record_predicate = Some(Arc::new(predicate));
        self
    }

    /// Errors matching `predicate` are ignored outright.
    pub fn ignore_error(
        mut self,
        predicate: impl Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.config.ignore_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Partially-specified settings for one named instance.
///
/// All fields are optional; unset fields never overwrite the base they are
/// overlaid on. `base_config` names a shared configuration registered with
/// the registry; when absent the registry default is used.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerProperties {
    pub base_config: Option<String>,
    pub failure_rate_threshold: Option<f32>,
    pub slow_call_rate_threshold: Option<f32>,
    #[serde(with = "option_duration_millis")]
    pub slow_call_duration_threshold: Option<Duration>,
    pub ring_buffer_size_in_closed_state: Option<u32>,
    pub ring_buffer_size_in_half_open_state: Option<u32>,
    #[serde(with = "option_duration_millis")]
    pub wait_duration_in_open_state: Option<Duration>,
    pub automatic_transition_from_open_to_half_open_enabled: Option<bool>,
    pub sliding_window_type: Option<SlidingWindowType>,
}

impl CircuitBreakerProperties {
    /// Applies the explicitly set fields on top of `base`.
    pub fn overlay(&self, base: &CircuitBreakerConfig) -> CircuitBreakerConfig {
        let mut config = base.clone();
        if let Some(v) = self.failure_rate_threshold {
            config.failure_rate_threshold = v;
        }
        if let Some(v) = self.slow_call_rate_threshold {
            config.slow_call_rate_threshold = Some(v);
        }
        if let Some(v) = self.slow_call_duration_threshold {
            config.slow_call_duration_threshold = v;
        }
        if let Some(v) = self.ring_buffer_size_in_closed_state {
            config.ring_buffer_size_in_closed_state = v;
        }
        if let Some(v) = self.ring_buffer_size_in_half_open_state {
            config.ring_buffer_size_in_half_open_state = v;
        }
        if let Some(v) = self.wait_duration_in_open_state {
            config.wait_duration_in_open_state = v;
        }
        if let Some(v) = self.automatic_transition_from_open_to_half_open_enabled {
            config.automatic_transition_from_open_to_half_open_enabled = v;
        }
        if let Some(v) = self.sliding_window_type {
            config.sliding_window_type = v;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builder output matches the requested values.
    #[test]
    fn test_builder_sets_fields() {
        let config = CircuitBreakerConfig::builder()
            .failure_rate_threshold(25.0)
            .ring_buffer_size_in_closed_state(8)
            .ring_buffer_size_in_half_open_state(2)
            .wait_duration_in_open_state(Duration::from_secs(5))
            .build()
            .expect("valid config");

        assert_eq!(config.failure_rate_threshold, 25.0);
        assert_eq!(config.ring_buffer_size_in_closed_state, 8);
        assert_eq!(config.ring_buffer_size_in_half_open_state, 2);
        assert_eq!(config.wait_duration_in_open_state, Duration::from_secs(5));
    }

    /// Out-of-range thresholds and zero ring sizes are rejected.
    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(CircuitBreakerConfig::builder().failure_rate_threshold(0.0).build().is_err());
        assert!(CircuitBreakerConfig::builder().failure_rate_threshold(101.0).build().is_err());
        assert!(CircuitBreakerConfig::builder()
            .ring_buffer_size_in_closed_state(0)
            .build()
            .is_err());
        assert!(CircuitBreakerConfig::builder().slow_call_rate_threshold(0.0).build().is_err());
    }

    /// Unset property fields keep the base configuration's values.
    #[test]
    fn test_properties_overlay_keeps_unset_fields() {
        let base = CircuitBreakerConfig::builder()
            .failure_rate_threshold(30.0)
            .ring_buffer_size_in_closed_state(20)
            .build()
            .expect("valid config");

        let props = CircuitBreakerProperties {
            failure_rate_threshold: Some(60.0),
            ..Default::default()
        };
        let effective = props.overlay(&base);

        assert_eq!(effective.failure_rate_threshold, 60.0);
        assert_eq!(effective.ring_buffer_size_in_closed_state, 20);
    }

    /// Properties deserialize from their millisecond wire form.
    #[test]
    fn test_properties_deserialize() {
        let props: CircuitBreakerProperties = serde_json::from_str(
            r#"{"base_config":"shared","wait_duration_in_open_state":2500,"sliding_window_type":"time_based"}"#,
        )
        .expect("parse");

        assert_eq!(props.base_config.as_deref(), Some("shared"));
        assert_eq!(props.wait_duration_in_open_state, Some(Duration::from_millis(2500)));
        assert_eq!(props.sliding_window_type, Some(SlidingWindowType::TimeBased));
    }
}
