use thiserror::Error;

/// Errors raised by a receiver's lifecycle.
#[derive(Debug, Error)]
pub enum ReceiverError {
    /// `start` was called on a receiver that is already running
    #[error("receiver already started")]
    AlreadyStarted,
    /// Any other start or stop failure
    #[error("{0}")]
    Other(String),
}

/// Error types for span export operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// Transport-layer error (network, file)
    #[error("transport error: {0}")]
    Transport(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Error types for span submission into an ingestion receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Ingestion buffer is full; the span was dropped
    #[error("ingestion buffer is full")]
    Full,
    /// Receiver is not running
    #[error("receiver is closed")]
    Closed,
}

/// Terminal error of a pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pipeline has no exporter to deliver to
    #[error("pipeline {0} has no exporters")]
    NoExporters(String),
    /// The receiver could not be started; nothing downstream was engaged
    #[error("failed to start receiver {name}: {source}")]
    ReceiverStart {
        name: String,
        #[source]
        source: ReceiverError,
    },
    /// An exporter's send loop failed
    #[error("exporter {name} failed: {source}")]
    Exporter {
        name: String,
        #[source]
        source: ExportError,
    },
    /// An exporter task panicked
    #[error("exporter {name} panicked")]
    ExporterPanicked { name: String },
    /// The run was cancelled externally
    #[error("pipeline cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Returns `true` if the run ended because of external cancellation.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Invalid construction-time configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("sample rate must be within [0.0, 1.0], got {0}")]
    InvalidSampleRate(f64),
    #[error("adaptive window must be greater than zero")]
    ZeroAdaptiveWindow,
    #[error("send batch size must be greater than zero")]
    ZeroBatchSize,
    #[error("{0} must be greater than zero")]
    ZeroQueueSize(&'static str),
    #[error("{name} threshold must be non-negative, got {value}")]
    NegativeThreshold { name: &'static str, value: f64 },
    #[error("{name} warning threshold {warning} exceeds critical threshold {critical}")]
    ThresholdOrder {
        name: &'static str,
        warning: f64,
        critical: f64,
    },
    #[error("invalid health address {0}")]
    InvalidAddress(String),
}

/// Errors from the health HTTP server.
#[derive(Debug, Error)]
pub enum HealthServerError {
    #[error("failed to bind health endpoint {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("health server I/O error: {0}")]
    Io(#[from] std::io::Error),
}
