//! Pipeline orchestration.
//!
//! A [`Pipeline`] wires one [`Receiver`], an ordered chain of [`Processor`]s and
//! one or more [`Exporter`]s into a single cancellable run:
//!
//! ```text
//! receiver ─► ingress ─► processor 1 ─► … ─► processor N ─► fan-out ─┬─► exporter A
//!                                                                    └─► exporter B
//! ```
//!
//! Every hop is a bounded `tokio::sync::mpsc` channel, so a full downstream
//! queue backpressures its producer. Processors only transform the single
//! logical stream; duplication happens once, at the fan-out, where each
//! exporter gets its own bounded queue and therefore sees every item. A stalled
//! exporter only stalls the fan-out once its own queue is full.
//!
//! # Object Safety
//!
//! `Receiver` and `Exporter` use `impl Future` return types which are not
//! object-safe. The pipeline stores them as `ReceiverBoxed` / `ExporterBoxed`,
//! which every implementor gets through a blanket impl.

use crate::config::PipelineConfig;
use crate::error::{ExportError, PipelineError, ReceiverError};
use crate::metrics::PipelineMetrics;
use crate::span::Span;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Read side of one pipeline hop.
pub type ItemStream<T> = mpsc::Receiver<T>;

/// An item that can flow through a pipeline.
pub trait Payload: Clone + Send + Sync + 'static {
    /// Items that are not routable are dropped at ingress and never exported.
    fn is_routable(&self) -> bool {
        true
    }
}

impl Payload for Span {
    fn is_routable(&self) -> bool {
        self.trace_id.is_valid()
    }
}

/// Source of items: accepts data from the outside world and emits it on a stream.
pub trait Receiver<T>: Send + Sync {
    /// Starts receiving. Failing here aborts the run before anything else starts.
    fn start(&self) -> impl Future<Output = Result<ItemStream<T>, ReceiverError>> + Send;

    /// Stops receiving and closes the stream. Must be idempotent.
    fn stop(&self) -> impl Future<Output = Result<(), ReceiverError>> + Send;

    fn name(&self) -> &str;
}

/// Object-safe version of [`Receiver`] for dynamic dispatch.
pub trait ReceiverBoxed<T>: Send + Sync {
    fn start_boxed(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<ItemStream<T>, ReceiverError>> + Send + '_>>;

    fn stop_boxed(&self) -> Pin<Box<dyn Future<Output = Result<(), ReceiverError>> + Send + '_>>;

    fn name(&self) -> &str;
}

impl<T: Send + 'static, R: Receiver<T>> ReceiverBoxed<T> for R {
    fn start_boxed(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<ItemStream<T>, ReceiverError>> + Send + '_>> {
        Box::pin(self.start())
    }

    fn stop_boxed(&self) -> Pin<Box<dyn Future<Output = Result<(), ReceiverError>> + Send + '_>> {
        Box::pin(self.stop())
    }

    fn name(&self) -> &str {
        Receiver::name(self)
    }
}

/// A transformation stage: consumes one stream and produces another.
///
/// Implementations spawn their own task and return immediately. They must
/// close their output when the input closes or `cancel` fires.
pub trait Processor<T>: Send + Sync {
    fn process(&self, input: ItemStream<T>, cancel: CancellationToken) -> ItemStream<T>;

    fn name(&self) -> &str;
}

/// Sink of items: drains a stream into a backend.
pub trait Exporter<T>: Send + Sync {
    /// Runs until the stream is exhausted or `cancel` fires. Returns the first
    /// failure that makes further export impossible.
    fn export(
        &self,
        input: ItemStream<T>,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), ExportError>> + Send;

    fn name(&self) -> &str;
}

/// Object-safe version of [`Exporter`] for dynamic dispatch.
pub trait ExporterBoxed<T>: Send + Sync {
    fn export_boxed(
        &self,
        input: ItemStream<T>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>>;

    fn name(&self) -> &str;
}

impl<T: Send + 'static, E: Exporter<T>> ExporterBoxed<T> for E {
    fn export_boxed(
        &self,
        input: ItemStream<T>,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + '_>> {
        Box::pin(self.export(input, cancel))
    }

    fn name(&self) -> &str {
        Exporter::name(self)
    }
}

/// Receives the next item unless `cancel` fires first.
pub async fn next_item<T>(input: &mut ItemStream<T>, cancel: &CancellationToken) -> Option<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        item = input.recv() => item,
    }
}

/// Sends `item` downstream unless `cancel` fires first.
///
/// Returns `false` when the stage should stop: cancelled, or downstream gone.
pub async fn forward<T>(output: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        sent = output.send(item) => sent.is_ok(),
    }
}

/// Runtime knobs of the orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Capacity of the ingress hop
    pub ingress_buffer: usize,
    /// Capacity of each exporter's fan-out queue
    pub exporter_buffer: usize,
    /// How long a cancelled run waits for exporters before aborting them
    pub shutdown_grace: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            ingress_buffer: 100,
            exporter_buffer: 1000,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl From<&PipelineConfig> for PipelineOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            exporter_buffer: config.exporter_buffer,
            shutdown_grace: config.shutdown_grace,
            ..Self::default()
        }
    }
}

enum RunOutcome {
    Completed,
    Cancelled,
    Failed(PipelineError),
}

/// Orchestrates data flow from one receiver through processors to exporters.
pub struct Pipeline<T> {
    name: String,
    receiver: Arc<dyn ReceiverBoxed<T>>,
    processors: Vec<Box<dyn Processor<T>>>,
    exporters: Vec<Arc<dyn ExporterBoxed<T>>>,
    metrics: Arc<PipelineMetrics>,
    options: PipelineOptions,
}

impl<T: Payload> Pipeline<T> {
    pub fn new(
        name: impl Into<String>,
        receiver: Arc<dyn ReceiverBoxed<T>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            name: name.into(),
            receiver,
            processors: Vec::new(),
            exporters: Vec::new(),
            metrics,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Appends a processing stage; stages run in insertion order.
    pub fn add_processor(&mut self, processor: Box<dyn Processor<T>>) {
        self.processors.push(processor);
    }

    pub fn add_exporter(&mut self, exporter: Arc<dyn ExporterBoxed<T>>) {
        self.exporters.push(exporter);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metrics of this pipeline; still readable after `run` returns.
    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Runs the pipeline until the stream is exhausted, an exporter fails, or
    /// `cancel` fires.
    ///
    /// - exhaustion: `Ok(())`
    /// - cancellation: the receiver is stopped, exporters get `shutdown_grace`
    ///   to finish, then `PipelineError::Cancelled`
    /// - exporter failure: returned immediately; the rest of the run is told to
    ///   wind down but not waited on
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        if self.exporters.is_empty() {
            return Err(PipelineError::NoExporters(self.name.clone()));
        }

        let input = self
            .receiver
            .start_boxed()
            .await
            .map_err(|source| PipelineError::ReceiverStart {
                name: self.receiver.name().to_string(),
                source,
            })?;
        info!(
            "Pipeline {} started: receiver {}, {} processor(s), {} exporter(s)",
            self.name,
            self.receiver.name(),
            self.processors.len(),
            self.exporters.len()
        );

        let run_token = cancel.child_token();

        let mut stream = spawn_ingress(
            input,
            Arc::clone(&self.metrics),
            run_token.clone(),
            self.options.ingress_buffer,
        );
        for processor in &self.processors {
            debug!("Pipeline {}: chaining processor {}", self.name, processor.name());
            stream = processor.process(stream, run_token.clone());
        }

        let outputs = spawn_fanout(
            stream,
            self.exporters.len(),
            self.options.exporter_buffer,
            Arc::clone(&self.metrics),
            run_token.clone(),
        );

        let mut exporters = JoinSet::new();
        for (exporter, input) in self.exporters.iter().zip(outputs) {
            let exporter = Arc::clone(exporter);
            let cancel = run_token.clone();
            exporters.spawn(async move {
                let name = exporter.name().to_string();
                let result = AssertUnwindSafe(exporter.export_boxed(input, cancel))
                    .catch_unwind()
                    .await;
                (name, result)
            });
        }

        let outcome = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break RunOutcome::Cancelled,
                joined = exporters.join_next() => match joined {
                    None => break RunOutcome::Completed,
                    Some(Ok((name, Ok(Ok(()))))) => {
                        debug!("Pipeline {}: exporter {} finished", self.name, name);
                    }
                    Some(Ok((name, Ok(Err(source))))) => {
                        break RunOutcome::Failed(PipelineError::Exporter { name, source });
                    }
                    Some(Ok((name, Err(_)))) => {
                        break RunOutcome::Failed(PipelineError::ExporterPanicked { name });
                    }
                    Some(Err(e)) => {
                        error!("Pipeline {}: exporter task failed to join: {}", self.name, e);
                    }
                },
            }
        };

        self.stop_receiver().await;

        match outcome {
            RunOutcome::Completed => {
                info!("Pipeline {} completed: stream exhausted", self.name);
                Ok(())
            }
            RunOutcome::Cancelled => {
                info!("Pipeline {} cancelled, waiting for exporters", self.name);
                let drained = tokio::time::timeout(self.options.shutdown_grace, async {
                    while let Some(joined) = exporters.join_next().await {
                        if let Ok((name, Ok(Err(e)))) = joined {
                            warn!("Exporter {} failed during shutdown: {}", name, e);
                        }
                    }
                })
                .await;
                if drained.is_err() {
                    warn!(
                        "Pipeline {}: {} exporter(s) still running after {:?}, aborting",
                        self.name,
                        exporters.len(),
                        self.options.shutdown_grace
                    );
                    exporters.shutdown().await;
                }
                Err(PipelineError::Cancelled)
            }
            RunOutcome::Failed(err) => {
                error!("Pipeline {} failed: {}", self.name, err);
                run_token.cancel();
                exporters.detach_all();
                Err(err)
            }
        }
    }

    async fn stop_receiver(&self) {
        if let Err(e) = self.receiver.stop_boxed().await {
            warn!("Failed to stop receiver {}: {}", self.receiver.name(), e);
        }
    }
}

/// Counts every received item and drops the unroutable ones.
fn spawn_ingress<T: Payload>(
    mut input: ItemStream<T>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
    capacity: usize,
) -> ItemStream<T> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        while let Some(item) = next_item(&mut input, &cancel).await {
            metrics.record_received();
            if !item.is_routable() {
                metrics.record_dropped();
                debug!("Dropping unroutable item at ingress");
                continue;
            }
            if !forward(&tx, item, &cancel).await {
                break;
            }
        }
    });
    rx
}

/// Duplicates the processed stream into one bounded queue per exporter.
fn spawn_fanout<T: Payload>(
    mut input: ItemStream<T>,
    outputs: usize,
    capacity: usize,
    metrics: Arc<PipelineMetrics>,
    cancel: CancellationToken,
) -> Vec<ItemStream<T>> {
    let (mut senders, receivers): (Vec<_>, Vec<_>) =
        (0..outputs).map(|_| mpsc::channel(capacity.max(1))).unzip();

    tokio::spawn(async move {
        while let Some(item) = next_item(&mut input, &cancel).await {
            metrics.record_processed();

            let Some((last, rest)) = senders.split_last() else {
                break;
            };
            for tx in rest {
                if cancel.is_cancelled() {
                    return;
                }
                // a closed queue means that exporter is done; the others still get the item
                let _ = forward(tx, item.clone(), &cancel).await;
            }
            let _ = forward(last, item, &cancel).await;
            if cancel.is_cancelled() {
                return;
            }

            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                debug!("All exporters closed their inputs, stopping fan-out");
                break;
            }
        }
    });

    receivers
}
