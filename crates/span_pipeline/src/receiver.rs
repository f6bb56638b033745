//! In-process ingestion receiver.
//!
//! [`ChannelReceiver`] is the boundary between span producers and a pipeline.
//! Producers hold a cloneable [`SpanSubmitter`]; the pipeline owns the read
//! side returned by `start`.

use crate::error::{ReceiverError, SubmitError};
use crate::metrics::PipelineMetrics;
use crate::pipeline::{ItemStream, Receiver};
use crate::span::Span;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{info, warn};

/// Default ingestion buffer.
pub const DEFAULT_RECEIVER_BUFFER: usize = 1000;

type SharedSender = Arc<RwLock<Option<mpsc::Sender<Span>>>>;

/// Receiver fed by in-process submitters.
#[derive(Debug)]
pub struct ChannelReceiver {
    name: String,
    capacity: usize,
    sender: SharedSender,
    started: AtomicBool,
    metrics: Arc<PipelineMetrics>,
}

impl ChannelReceiver {
    pub fn new(capacity: usize, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            name: "channel".to_string(),
            capacity: capacity.max(1),
            sender: Arc::new(RwLock::new(None)),
            started: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns a handle producers use to push spans.
    ///
    /// Handles may be created before `start`; they report `Closed` until then.
    pub fn submitter(&self) -> SpanSubmitter {
        SpanSubmitter {
            sender: Arc::clone(&self.sender),
            metrics: Arc::clone(&self.metrics),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Receiver<Span> for ChannelReceiver {
    async fn start(&self) -> Result<ItemStream<Span>, ReceiverError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ReceiverError::AlreadyStarted);
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        *self.sender.write().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        info!("Receiver {} started with buffer {}", self.name, self.capacity);
        Ok(rx)
    }

    async fn stop(&self) -> Result<(), ReceiverError> {
        let previous = self
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            info!("Receiver {} stopped", self.name);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Producer handle of a [`ChannelReceiver`].
#[derive(Debug, Clone)]
pub struct SpanSubmitter {
    sender: SharedSender,
    metrics: Arc<PipelineMetrics>,
}

impl SpanSubmitter {
    fn current(&self) -> Option<mpsc::Sender<Span>> {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Submits without waiting.
    ///
    /// When the buffer is full the span is dropped, counted as received and
    /// dropped, and `SubmitError::Full` is returned.
    pub fn try_submit(&self, span: Span) -> Result<(), SubmitError> {
        let sender = self.current().ok_or(SubmitError::Closed)?;
        match sender.try_send(span) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(span)) => {
                self.metrics.record_received();
                self.metrics.record_dropped();
                warn!("Ingestion buffer full, dropping span {}", span.span_id);
                Err(SubmitError::Full)
            }
            Err(TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    /// Submits, waiting for buffer space.
    pub async fn submit(&self, span: Span) -> Result<(), SubmitError> {
        let sender = self.current().ok_or(SubmitError::Closed)?;
        sender.send(span).await.map_err(|_| SubmitError::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.current().is_some_and(|tx| !tx.is_closed())
    }
}
