//! Construction-time configuration.
//!
//! Every struct has a `Default` and derives `Deserialize`, so an external
//! loader can build it from any serde format. Durations are expressed in
//! milliseconds.

use crate::error::ConfigError;
use crate::health::HealthThresholds;
use crate::metrics::DEFAULT_LATENCY_SAMPLES;
use crate::processor::attributes::AttributeRule;
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Default output queue for per-span transformation stages.
pub const DEFAULT_STAGE_QUEUE: usize = 100;

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Configuration for the adaptive sampling stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Stage name used in logs
    pub name: String,
    /// Base keep probability (0.0 - 1.0)
    pub base_sample_rate: f64,
    /// Always keep error spans
    pub always_sample_errors: bool,
    /// Always keep spans at least this slow
    #[serde(with = "duration_ms", rename = "slow_threshold_ms")]
    pub slow_threshold: Duration,
    /// Number of spans per adaptation window
    pub adaptive_window: usize,
    /// Output queue capacity
    pub queue_size: usize,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            name: "sampling".to_string(),
            base_sample_rate: 0.1,
            always_sample_errors: true,
            slow_threshold: Duration::from_secs(1),
            adaptive_window: 1000,
            queue_size: DEFAULT_STAGE_QUEUE,
        }
    }
}

impl SamplingConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_base_sample_rate(mut self, rate: f64) -> Self {
        self.base_sample_rate = rate;
        self
    }

    pub fn with_always_sample_errors(mut self, enabled: bool) -> Self {
        self.always_sample_errors = enabled;
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn with_adaptive_window(mut self, window: usize) -> Self {
        self.adaptive_window = window;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.base_sample_rate) {
            return Err(ConfigError::InvalidSampleRate(self.base_sample_rate));
        }
        if self.adaptive_window == 0 {
            return Err(ConfigError::ZeroAdaptiveWindow);
        }
        if self.queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize("sampling queue_size"));
        }
        Ok(())
    }
}

/// Configuration for the batch stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Stage name used in logs
    pub name: String,
    /// Flush period
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    /// Flush as soon as this many items are buffered
    pub send_batch_size: usize,
    /// Output queue capacity
    pub queue_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            name: "batch".to_string(),
            timeout: Duration::from_secs(1),
            send_batch_size: 1024,
            queue_size: 8192,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.queue_size == 0 {
            return Err(ConfigError::ZeroQueueSize("batch queue_size"));
        }
        Ok(())
    }
}

/// Configuration for the attribute mutation stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AttributesConfig {
    /// Stage name used in logs
    pub name: String,
    /// Rules applied in order
    pub actions: Vec<AttributeRule>,
    /// Output queue capacity
    pub queue_size: usize,
}

impl Default for AttributesConfig {
    fn default() -> Self {
        Self {
            name: "attributes".to_string(),
            actions: Vec::new(),
            queue_size: DEFAULT_STAGE_QUEUE,
        }
    }
}

/// One entry of the ordered processor chain.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProcessorConfig {
    Batch(BatchConfig),
    Attributes(AttributesConfig),
    Sampling(SamplingConfig),
}

impl ProcessorConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Batch(_) => "batch",
            Self::Attributes(_) => "attributes",
            Self::Sampling(_) => "sampling",
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            Self::Batch(c) => c.validate(),
            Self::Attributes(c) if c.queue_size == 0 => {
                Err(ConfigError::ZeroQueueSize("attributes queue_size"))
            }
            Self::Attributes(_) => Ok(()),
            Self::Sampling(c) => c.validate(),
        }
    }
}

/// Health endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub addr: String,
    pub thresholds: HealthThresholds,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8888".to_string(),
            thresholds: HealthThresholds::default(),
        }
    }
}

impl HealthConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.addr
            .parse()
            .map_err(|_| ConfigError::InvalidAddress(self.addr.clone()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        let t = &self.thresholds;
        for (name, warning, critical) in [
            ("drop", t.warning_drop, t.critical_drop),
            ("error", t.warning_error, t.critical_error),
        ] {
            for value in [warning, critical] {
                if value < 0.0 {
                    return Err(ConfigError::NegativeThreshold { name, value });
                }
            }
            if warning > critical {
                return Err(ConfigError::ThresholdOrder {
                    name,
                    warning,
                    critical,
                });
            }
        }
        Ok(())
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    /// Ingestion buffer of the in-process receiver
    pub receiver_buffer: usize,
    /// Per-exporter fan-out queue
    pub exporter_buffer: usize,
    /// How long a cancelled run waits for exporters to finish
    #[serde(with = "duration_ms", rename = "shutdown_grace_ms")]
    pub shutdown_grace: Duration,
    /// Latency samples kept by the metrics engine
    pub latency_samples: usize,
    /// Processing stages, applied in order
    pub processors: Vec<ProcessorConfig>,
    pub health: HealthConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "traces".to_string(),
            receiver_buffer: 1000,
            exporter_buffer: 1000,
            shutdown_grace: Duration::from_secs(5),
            latency_samples: DEFAULT_LATENCY_SAMPLES,
            processors: vec![
                ProcessorConfig::Sampling(SamplingConfig::default()),
                ProcessorConfig::Batch(BatchConfig::default()),
            ],
            health: HealthConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.receiver_buffer == 0 {
            return Err(ConfigError::ZeroQueueSize("receiver_buffer"));
        }
        if self.exporter_buffer == 0 {
            return Err(ConfigError::ZeroQueueSize("exporter_buffer"));
        }
        if self.latency_samples == 0 {
            return Err(ConfigError::ZeroQueueSize("latency_samples"));
        }
        self.processors.iter().try_for_each(ProcessorConfig::validate)?;
        self.health.validate()
    }
}
