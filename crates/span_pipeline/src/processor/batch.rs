//! Batch stage.
//!
//! [`Batcher`] is the pure buffering policy: it groups items in arrival order
//! and says when a batch is due. [`BatchProcessor`] drives it from a channel
//! task with a periodic flush timer. The stage is generic over the payload, so
//! it works the same for spans or anything else that flows through a pipeline.

use crate::config::BatchConfig;
use crate::pipeline::{forward, ItemStream, Payload, Processor};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Flush counters (plain u64, owned by the single batching task).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchMetrics {
    /// Items forwarded downstream
    pub items_flushed: u64,
    /// Non-empty flushes
    pub batches_flushed: u64,
}

/// Append-only buffer that flushes at `send_batch_size`.
#[derive(Debug)]
pub struct Batcher<T> {
    pending: Vec<T>,
    send_batch_size: usize,
    metrics: BatchMetrics,
}

impl<T> Batcher<T> {
    pub fn new(send_batch_size: usize) -> Self {
        let send_batch_size = send_batch_size.max(1);
        Self {
            pending: Vec::with_capacity(send_batch_size),
            send_batch_size,
            metrics: BatchMetrics::default(),
        }
    }

    /// Buffers one item. Returns `true` once the batch is full.
    pub fn push(&mut self, item: T) -> bool {
        self.pending.push(item);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.send_batch_size
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Takes every buffered item in arrival order.
    ///
    /// Returns `None` if nothing is pending.
    pub fn take_batch(&mut self) -> Option<Vec<T>> {
        if self.pending.is_empty() {
            return None;
        }
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.send_batch_size));
        self.metrics.items_flushed += batch.len() as u64;
        self.metrics.batches_flushed += 1;
        Some(batch)
    }

    pub fn metrics(&self) -> &BatchMetrics {
        &self.metrics
    }
}

/// Groups items into size- or time-bounded batches before forwarding them.
pub struct BatchProcessor {
    config: BatchConfig,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }
}

impl<T: Payload> Processor<T> for BatchProcessor {
    fn process(&self, mut input: ItemStream<T>, cancel: CancellationToken) -> ItemStream<T> {
        let (tx, rx) = mpsc::channel(self.config.queue_size.max(1));
        let timeout = self.config.timeout;
        let mut batcher = Batcher::new(self.config.send_batch_size);
        let name = self.config.name.clone();

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + timeout, timeout);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        debug!("Batch stage {} cancelled with {} pending item(s)", name, batcher.len());
                        return;
                    }
                    _ = ticker.tick() => {
                        if !flush(&mut batcher, &tx, &cancel).await {
                            return;
                        }
                    }
                    item = input.recv() => match item {
                        Some(item) => {
                            if batcher.push(item) && !flush(&mut batcher, &tx, &cancel).await {
                                return;
                            }
                        }
                        None => {
                            flush(&mut batcher, &tx, &cancel).await;
                            break;
                        }
                    },
                }
            }

            let m = batcher.metrics();
            debug!(
                "Batch stage {} finished: {} item(s) in {} batch(es)",
                name, m.items_flushed, m.batches_flushed
            );
        });

        rx
    }

    fn name(&self) -> &str {
        &self.config.name
    }
}

/// Forwards the pending batch in order. Returns `false` if the stage must stop.
async fn flush<T>(batcher: &mut Batcher<T>, tx: &mpsc::Sender<T>, cancel: &CancellationToken) -> bool {
    let Some(batch) = batcher.take_batch() else {
        return true;
    };
    for item in batch {
        if !forward(tx, item, cancel).await {
            return false;
        }
    }
    true
}
