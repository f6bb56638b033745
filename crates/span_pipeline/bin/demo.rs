//! # Span Pipeline Demo
//!
//! Runs a complete pipeline in-process:
//!
//! - synthetic producers submit spans into a `ChannelReceiver`
//! - the configured processor chain (sampling, then batching by default)
//! - fan-out to a `LogSink` and a `NullSink` exporter
//! - `/health`, `/metrics` and `/ready` served on the health address
//!
//! The run ends after a fixed duration or on Ctrl+C, then prints the final
//! metrics snapshot and health status.
//!
//! ## Running
//!
//! ```bash
//! # Quick mode (2 producers, 3 seconds)
//! cargo run -p span_pipeline --bin demo -- --quick
//!
//! # Full mode (4 producers, 15 seconds), per-span logs
//! RUST_LOG=span_pipeline=debug cargo run -p span_pipeline --bin demo
//!
//! # Overrides
//! PIPELINE_HEALTH_ADDR=127.0.0.1:9000 PIPELINE_BASE_SAMPLE_RATE=0.5 cargo run -p span_pipeline --bin demo
//! ```

use anyhow::Context;
use rand::Rng;
use span_pipeline::{
    ChannelReceiver, HealthCheck, HealthServer, LogSink, NullSink, Pipeline, PipelineConfig,
    PipelineMetrics, PipelineOptions, ProcessorConfig, Process, SinkExporter, Span, SpanSubmitter,
    SubmitError, TraceId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const OPERATIONS: &[&str] = &[
    "GET /api/users",
    "POST /api/orders",
    "db.query",
    "cache.get",
    "grpc.Checkout/PlaceOrder",
];

/// Reads environment overrides on top of the defaults.
fn load_config() -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::default();

    if let Ok(addr) = std::env::var("PIPELINE_HEALTH_ADDR") {
        config.health.addr = addr;
    }
    if let Ok(rate) = std::env::var("PIPELINE_BASE_SAMPLE_RATE") {
        let rate: f64 = rate
            .parse()
            .with_context(|| format!("PIPELINE_BASE_SAMPLE_RATE is not a number: {rate}"))?;
        for processor in &mut config.processors {
            if let ProcessorConfig::Sampling(sampling) = processor {
                sampling.base_sample_rate = rate;
            }
        }
    }

    config.validate()?;
    Ok(config)
}

fn synthetic_span(rng: &mut impl Rng, producer: u64, seq: u64) -> Span {
    let operation = OPERATIONS[rng.gen_range(0..OPERATIONS.len())];
    let duration = if rng.gen_bool(0.02) {
        Duration::from_millis(rng.gen_range(1000..3000))
    } else {
        Duration::from_micros(rng.gen_range(100..50_000))
    };

    let mut span = Span::new(TraceId::new(0, rng.gen::<u64>() | 1), (producer << 48) | seq, operation)
        .with_duration(duration)
        .with_process(Process::new(format!("service-{producer}")));
    if rng.gen_bool(0.8) {
        span = span.with_parent(rng.gen::<u64>() | 1);
    }
    if operation.starts_with("GET") || operation.starts_with("POST") {
        let status: i64 = if rng.gen_bool(0.05) { 503 } else { 200 };
        span = span.with_tag("http.status_code", status);
    }
    if rng.gen_bool(0.03) {
        span = span.with_tag("error", true);
    }
    span
}

/// Submits spans at roughly `rate_per_sec` until cancelled.
async fn produce(
    producer: u64,
    submitter: SpanSubmitter,
    rate_per_sec: u64,
    cancel: CancellationToken,
) -> (u64, u64) {
    let mut ticker = tokio::time::interval(Duration::from_micros(1_000_000 / rate_per_sec.max(1)));
    let (mut sent, mut overflowed) = (0u64, 0u64);
    let mut seq = 0u64;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        seq += 1;
        let span = synthetic_span(&mut rand::thread_rng(), producer, seq);
        match submitter.try_submit(span) {
            Ok(()) => sent += 1,
            Err(SubmitError::Full) => overflowed += 1,
            Err(SubmitError::Closed) => break,
        }
    }
    (sent, overflowed)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let quick = std::env::args().any(|a| a == "--quick");
    let (producers, run_for) = if quick {
        (2u64, Duration::from_secs(3))
    } else {
        (4u64, Duration::from_secs(15))
    };

    let config = load_config()?;
    info!(
        "Starting pipeline {} with {} producer(s) for {:?}",
        config.name, producers, run_for
    );

    let metrics = Arc::new(PipelineMetrics::with_capacity(config.latency_samples));
    let check = Arc::new(HealthCheck::new(
        Arc::clone(&metrics),
        config.health.thresholds,
    ));

    let cancel = CancellationToken::new();
    let health_server = HealthServer::bind(config.health.socket_addr()?, Arc::clone(&check)).await?;
    let health_task = tokio::spawn(health_server.serve(cancel.child_token()));

    let receiver = Arc::new(ChannelReceiver::new(config.receiver_buffer, Arc::clone(&metrics)));
    let submitter = receiver.submitter();

    let mut pipeline = Pipeline::<Span>::new(config.name.clone(), receiver, Arc::clone(&metrics))
        .with_options(PipelineOptions::from(&config));
    for processor in &config.processors {
        pipeline.add_processor(processor.build(&metrics));
    }
    pipeline.add_exporter(Arc::new(SinkExporter::new(LogSink::new(), Arc::clone(&metrics))));
    pipeline.add_exporter(Arc::new(SinkExporter::new(NullSink::new(), Arc::clone(&metrics))));

    let run_cancel = cancel.child_token();
    let pipeline = Arc::new(pipeline);
    let run_task = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.run(run_cancel).await })
    };

    // wait until the receiver accepts spans
    while !submitter.is_open() {
        tokio::task::yield_now().await;
    }

    let producer_cancel = cancel.child_token();
    let mut tasks = JoinSet::new();
    for id in 0..producers {
        tasks.spawn(produce(
            id,
            submitter.clone(),
            200 * (id + 1),
            producer_cancel.clone(),
        ));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C received, shutting down"),
        () = tokio::time::sleep(run_for) => info!("Demo duration elapsed, shutting down"),
    }
    cancel.cancel();

    let (mut sent, mut overflowed) = (0u64, 0u64);
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((s, o)) => {
                sent += s;
                overflowed += o;
            }
            Err(e) => warn!("Producer task failed: {e}"),
        }
    }

    match run_task.await? {
        Err(e) if e.is_cancelled() => info!("Pipeline stopped"),
        Err(e) => warn!("Pipeline ended with error: {e}"),
        Ok(()) => info!("Pipeline completed"),
    }
    health_task.await??;

    let report = check.health();
    println!("\n=== Pipeline {} ===", pipeline.name());
    println!("  Submitted:        {:>10}", sent);
    println!("  Overflowed:       {:>10}", overflowed);
    println!("  Received:         {:>10}", report.metrics.spans_received);
    println!("  Processed:        {:>10}", report.metrics.spans_processed);
    println!("  Dropped:          {:>10}", report.metrics.spans_dropped);
    println!("  Exported:         {:>10}", report.metrics.spans_exported);
    println!("  Export errors:    {:>10}", report.metrics.export_errors);
    println!("  Latency p50:      {:>10.2?}", report.metrics.latency_p50);
    println!("  Latency p95:      {:>10.2?}", report.metrics.latency_p95);
    println!("  Latency p99:      {:>10.2?}", report.metrics.latency_p99);
    println!("  Drop rate:        {:>9.2}%", report.metrics.drop_rate());
    println!("  Health:           {:>10}", report.status.as_str());
    println!("\n{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
