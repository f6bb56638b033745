//! Span exporters.
//!
//! Most backends only need to deliver one span at a time; they implement
//! [`SpanSink`] and get wrapped in a [`SinkExporter`], which owns the drain loop,
//! the metrics and the cancellation handling. Exporters with their own loop
//! implement [`Exporter`] directly.
//!
//! Uses native async fn in traits instead of `#[async_trait]`.

use crate::error::ExportError;
use crate::metrics::PipelineMetrics;
use crate::pipeline::{next_item, Exporter, ItemStream};
use crate::span::Span;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-span delivery to a backend.
pub trait SpanSink: Send + Sync {
    /// Prepares the backend. A failure here is fatal to the exporter.
    fn connect(&self) -> impl Future<Output = Result<(), ExportError>> + Send {
        async { Ok(()) }
    }

    /// Delivers one span.
    fn send(&self, span: &Span) -> impl Future<Output = Result<(), ExportError>> + Send;

    fn name(&self) -> &str;
}

/// Drains a span stream into a [`SpanSink`].
///
/// Failed sends are counted and logged, then the loop moves on to the next
/// span; only a failed `connect` ends the export with an error.
pub struct SinkExporter<S> {
    sink: S,
    metrics: Arc<PipelineMetrics>,
}

impl<S: SpanSink> SinkExporter<S> {
    pub fn new(sink: S, metrics: Arc<PipelineMetrics>) -> Self {
        Self { sink, metrics }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: SpanSink> Exporter<Span> for SinkExporter<S> {
    async fn export(
        &self,
        mut input: ItemStream<Span>,
        cancel: CancellationToken,
    ) -> Result<(), ExportError> {
        self.sink.connect().await?;
        debug!("Exporter {} connected", self.sink.name());

        while let Some(span) = next_item(&mut input, &cancel).await {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.sink.send(&span) => result,
            };
            match result {
                Ok(()) => self.metrics.record_exported(),
                Err(e) => {
                    self.metrics.record_export_error();
                    warn!(
                        "Exporter {} failed to send span {}: {}",
                        self.sink.name(),
                        span.span_id,
                        e
                    );
                }
            }
        }

        debug!("Exporter {} finished", self.sink.name());
        Ok(())
    }

    fn name(&self) -> &str {
        self.sink.name()
    }
}

/// Emits one `tracing` event per span.
#[derive(Debug, Default)]
pub struct LogSink;

impl LogSink {
    pub fn new() -> Self {
        Self
    }
}

impl SpanSink for LogSink {
    async fn send(&self, span: &Span) -> Result<(), ExportError> {
        info!(
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            duration_us = span.duration.as_micros() as u64,
            tags = span.tags.len(),
            "span {}",
            span.operation_name
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Appends one JSON object per line to a file created on connect.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: tokio::sync::Mutex<Option<File>>,
}

impl JsonLinesSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SpanSink for JsonLinesSink {
    async fn connect(&self) -> Result<(), ExportError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| ExportError::Transport(format!("{}: {}", self.path.display(), e)))?;
        *self.file.lock().await = Some(file);
        Ok(())
    }

    async fn send(&self, span: &Span) -> Result<(), ExportError> {
        let mut line =
            serde_json::to_vec(span).map_err(|e| ExportError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        let file = guard
            .as_mut()
            .ok_or_else(|| ExportError::Transport("json lines sink not connected".to_string()))?;
        file.write_all(&line)
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))
    }

    fn name(&self) -> &str {
        "json_lines"
    }
}

/// Discards every span.
#[derive(Debug, Default)]
pub struct NullSink;

impl NullSink {
    pub fn new() -> Self {
        Self
    }
}

impl SpanSink for NullSink {
    async fn send(&self, _span: &Span) -> Result<(), ExportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Keeps every delivered span in memory.
#[derive(Debug, Clone)]
pub struct MemorySink {
    name: String,
    spans: Arc<Mutex<Vec<Span>>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            spans: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SpanSink for MemorySink {
    async fn send(&self, span: &Span) -> Result<(), ExportError> {
        self.spans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(span.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
