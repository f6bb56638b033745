//! Processing stages.
//!
//! Each stage implements [`Processor`] and runs in its own task between two
//! bounded channels. Span-specific stages (attributes, sampling) record their
//! per-span processing time in the pipeline metrics; the batch stage is generic
//! and only regroups items.

pub mod attributes;
pub mod batch;
pub mod sampling;

pub use attributes::{AttributeAction, AttributeRule, AttributesProcessor};
pub use batch::{BatchMetrics, BatchProcessor, Batcher};
pub use sampling::{Sampler, SamplingProcessor, SamplingStats};

use crate::config::ProcessorConfig;
use crate::metrics::PipelineMetrics;
use crate::pipeline::Processor;
use crate::span::Span;
use std::sync::Arc;

impl ProcessorConfig {
    /// Constructs the configured stage.
    pub fn build(&self, metrics: &Arc<PipelineMetrics>) -> Box<dyn Processor<Span>> {
        match self {
            Self::Batch(config) => Box::new(BatchProcessor::new(config.clone())),
            Self::Attributes(config) => {
                Box::new(AttributesProcessor::new(config.clone(), Arc::clone(metrics)))
            }
            Self::Sampling(config) => {
                Box::new(SamplingProcessor::new(config.clone(), Arc::clone(metrics)))
            }
        }
    }
}
