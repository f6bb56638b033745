//! Streaming Trace Span Pipeline
//!
//! Moves spans from a receiver through an ordered chain of processing stages
//! (attribute rewriting, adaptive sampling, batching) and fans the result out
//! to one or more exporters. Every hop is a bounded tokio channel and every
//! blocking point honors a `CancellationToken`.
//!
//! The pipeline observes itself: a [`PipelineMetrics`] engine counts spans at
//! each boundary and keeps a rolling window of per-span processing latency,
//! and a [`HealthCheck`] turns its snapshots into a tri-state health signal
//! served over HTTP by [`HealthServer`].
//!
//! # Native async traits
//!
//! Stage traits use `impl Future + Send` return types (no `#[async_trait]`
//! macro), with object-safe `*Boxed` companions for dynamic dispatch.

pub mod config;
pub mod error;
pub mod exporter;
pub mod health;
pub mod health_server;
pub mod metrics;
pub mod pipeline;
pub mod processor;
pub mod receiver;
pub mod span;

// Re-export main types
pub use config::{
    AttributesConfig, BatchConfig, HealthConfig, PipelineConfig, ProcessorConfig, SamplingConfig,
};
pub use error::{
    ConfigError, ExportError, HealthServerError, PipelineError, ReceiverError, SubmitError,
};
pub use exporter::{JsonLinesSink, LogSink, MemorySink, NullSink, SinkExporter, SpanSink};
pub use health::{HealthCheck, HealthReport, HealthStatus, HealthThresholds};
pub use health_server::HealthServer;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use pipeline::{
    Exporter, ExporterBoxed, ItemStream, Payload, Pipeline, PipelineOptions, Processor, Receiver,
    ReceiverBoxed,
};
pub use processor::{
    AttributeAction, AttributeRule, AttributesProcessor, BatchProcessor, Sampler,
    SamplingProcessor, SamplingStats,
};
pub use receiver::{ChannelReceiver, SpanSubmitter};
pub use span::{Log, Process, RefType, Span, SpanId, SpanReference, Tag, TagValue, TraceId};
