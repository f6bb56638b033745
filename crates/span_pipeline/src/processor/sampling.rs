//! Adaptive sampling stage.
//!
//! Decisions are made per span, first match wins:
//!
//! 1. error spans are kept when `always_sample_errors` is set
//! 2. spans at least `slow_threshold` long are kept
//! 3. otherwise keep if `trace_id.low <= u64::MAX * rate`
//!
//! Rule 3 is a pure function of the trace id and the current rate, so every
//! span of a trace gets the same answer. The rate itself is recomputed once per
//! window of `adaptive_window` spans from the share of errors seen:
//!
//! ```text
//! observed > 5%  → rate = min(1, base * 2)
//! observed > 1%  → rate = min(1, base * 1.5)
//! otherwise      → rate = base
//! ```

use crate::config::SamplingConfig;
use crate::metrics::PipelineMetrics;
use crate::pipeline::{forward, next_item, ItemStream, Processor};
use crate::span::{Span, TraceId};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Boolean tag marking a failed span
pub const ERROR_TAG: &str = "error";
/// Integer tag carrying the HTTP response status
pub const HTTP_STATUS_TAG: &str = "http.status_code";

const HIGH_ERROR_RATE: f64 = 0.05;
const ELEVATED_ERROR_RATE: f64 = 0.01;

/// Returns `true` if the span reports an error or a 5xx response.
pub fn is_error_span(span: &Span) -> bool {
    span.tag(ERROR_TAG).and_then(|t| t.as_bool()) == Some(true)
        || span
            .tag(HTTP_STATUS_TAG)
            .and_then(|t| t.as_i64())
            .is_some_and(|code| code >= 500)
}

/// Keep threshold for the trace-id comparison.
#[inline]
pub fn rate_threshold(rate: f64) -> u64 {
    (u64::MAX as f64 * rate) as u64
}

/// Deterministic per-trace decision at `rate`.
#[inline]
pub fn keep_trace(trace_id: TraceId, rate: f64) -> bool {
    trace_id.low <= rate_threshold(rate)
}

#[derive(Debug)]
struct SamplingState {
    recent_errors: u64,
    recent_total: u64,
    adaptive_rate: f64,
}

/// Point-in-time view of a sampler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingStats {
    pub base_rate: f64,
    pub adaptive_rate: f64,
    pub recent_errors: u64,
    pub recent_total: u64,
}

/// Sampling policy plus its rolling window.
#[derive(Debug)]
pub struct Sampler {
    config: SamplingConfig,
    state: RwLock<SamplingState>,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> Self {
        let state = SamplingState {
            recent_errors: 0,
            recent_total: 0,
            adaptive_rate: config.base_sample_rate,
        };
        Self {
            config,
            state: RwLock::new(state),
        }
    }

    /// Decides whether `span` is kept and feeds it into the current window.
    pub fn should_sample(&self, span: &Span) -> bool {
        if self.config.always_sample_errors && is_error_span(span) {
            self.record_sample(true);
            return true;
        }

        if span.duration >= self.config.slow_threshold {
            self.record_sample(false);
            return true;
        }

        let keep = keep_trace(span.trace_id, self.adaptive_rate());
        self.record_sample(is_error_span(span));
        keep
    }

    /// Counts one span; closes the window once `adaptive_window` spans were seen.
    pub fn record_sample(&self, is_error: bool) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.recent_total += 1;
        if is_error {
            state.recent_errors += 1;
        }

        if state.recent_total >= self.config.adaptive_window as u64 {
            let observed = state.recent_errors as f64 / state.recent_total as f64;
            let base = self.config.base_sample_rate;
            let rate = if observed > HIGH_ERROR_RATE {
                (base * 2.0).min(1.0)
            } else if observed > ELEVATED_ERROR_RATE {
                (base * 1.5).min(1.0)
            } else {
                base
            };

            if rate != state.adaptive_rate {
                info!(
                    "Adaptive sample rate {:.4} -> {:.4} (observed error rate {:.2}%)",
                    state.adaptive_rate,
                    rate,
                    observed * 100.0
                );
            }
            state.adaptive_rate = rate;
            state.recent_errors = 0;
            state.recent_total = 0;
        }
    }

    pub fn adaptive_rate(&self) -> f64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .adaptive_rate
    }

    pub fn stats(&self) -> SamplingStats {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        SamplingStats {
            base_rate: self.config.base_sample_rate,
            adaptive_rate: state.adaptive_rate,
            recent_errors: state.recent_errors,
            recent_total: state.recent_total,
        }
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }
}

/// Drops sampled-out spans, counting each as dropped.
pub struct SamplingProcessor {
    name: String,
    sampler: Arc<Sampler>,
    queue_size: usize,
    metrics: Arc<PipelineMetrics>,
}

impl SamplingProcessor {
    pub fn new(config: SamplingConfig, metrics: Arc<PipelineMetrics>) -> Self {
        let queue_size = config.queue_size;
        Self {
            name: config.name.clone(),
            sampler: Arc::new(Sampler::new(config)),
            queue_size,
            metrics,
        }
    }

    /// The live sampler, for inspecting its window and rate.
    pub fn sampler(&self) -> &Arc<Sampler> {
        &self.sampler
    }
}

impl Processor<Span> for SamplingProcessor {
    fn process(&self, mut input: ItemStream<Span>, cancel: CancellationToken) -> ItemStream<Span> {
        let (tx, rx) = mpsc::channel(self.queue_size.max(1));
        let sampler = Arc::clone(&self.sampler);
        let metrics = Arc::clone(&self.metrics);
        let name = self.name.clone();

        tokio::spawn(async move {
            while let Some(span) = next_item(&mut input, &cancel).await {
                let started = Instant::now();
                let keep = sampler.should_sample(&span);
                metrics.record_processing_time(started.elapsed());

                if !keep {
                    metrics.record_dropped();
                    continue;
                }
                if !forward(&tx, span, &cancel).await {
                    break;
                }
            }
            let stats = sampler.stats();
            debug!("Sampling stage {} finished at rate {:.4}", name, stats.adaptive_rate);
        });

        rx
    }

    fn name(&self) -> &str {
        &self.name
    }
}
