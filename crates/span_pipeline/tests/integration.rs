use span_pipeline::pipeline::{Exporter, ItemStream, Receiver};
use span_pipeline::{
    AttributeRule, AttributesConfig, BatchConfig, ChannelReceiver, ExportError, HealthCheck,
    HealthServer, HealthThresholds, MemorySink, Pipeline, PipelineError, PipelineMetrics,
    PipelineOptions, ProcessorConfig, ReceiverError, SamplingConfig, SinkExporter, Span,
    SpanSubmitter, TagValue, TraceId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

fn span(i: u64) -> Span {
    Span::new(TraceId::new(0, i), i, format!("op-{}", i)).with_duration(Duration::from_millis(1))
}

/// Receiver whose start always fails.
struct BrokenReceiver;

impl Receiver<Span> for BrokenReceiver {
    async fn start(&self) -> Result<ItemStream<Span>, ReceiverError> {
        Err(ReceiverError::Other("port in use".to_string()))
    }

    async fn stop(&self) -> Result<(), ReceiverError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "broken"
    }
}

/// Records whether export was ever invoked.
#[derive(Default)]
struct WitnessExporter {
    invoked: AtomicBool,
}

impl Exporter<Span> for WitnessExporter {
    async fn export(
        &self,
        _input: ItemStream<Span>,
        _cancel: CancellationToken,
    ) -> Result<(), ExportError> {
        self.invoked.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "witness"
    }
}

/// Fails as soon as it starts.
struct FailingExporter;

impl Exporter<Span> for FailingExporter {
    async fn export(
        &self,
        _input: ItemStream<Span>,
        _cancel: CancellationToken,
    ) -> Result<(), ExportError> {
        Err(ExportError::Transport("backend unreachable".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

struct PanickingExporter;

impl Exporter<Span> for PanickingExporter {
    async fn export(
        &self,
        _input: ItemStream<Span>,
        _cancel: CancellationToken,
    ) -> Result<(), ExportError> {
        panic!("exporter bug");
    }

    fn name(&self) -> &str {
        "panicking"
    }
}

/// Ignores cancellation entirely.
struct StuckExporter;

impl Exporter<Span> for StuckExporter {
    async fn export(
        &self,
        _input: ItemStream<Span>,
        _cancel: CancellationToken,
    ) -> Result<(), ExportError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }

    fn name(&self) -> &str {
        "stuck"
    }
}

fn channel_pipeline(metrics: &Arc<PipelineMetrics>) -> (Pipeline<Span>, Arc<ChannelReceiver>, SpanSubmitter) {
    let receiver = Arc::new(ChannelReceiver::new(256, Arc::clone(metrics)));
    let submitter = receiver.submitter();
    let pipeline = Pipeline::<Span>::new("test", receiver.clone(), Arc::clone(metrics));
    (pipeline, receiver, submitter)
}

async fn wait_open(submitter: &SpanSubmitter) {
    while !submitter.is_open() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_every_exporter_sees_every_span() {
    let metrics = Arc::new(PipelineMetrics::new());
    let (mut pipeline, receiver, submitter) = channel_pipeline(&metrics);

    pipeline.add_processor(
        ProcessorConfig::Attributes(AttributesConfig {
            actions: vec![AttributeRule::upsert("env", "prod")],
            ..AttributesConfig::default()
        })
        .build(&metrics),
    );
    pipeline.add_processor(
        ProcessorConfig::Batch(BatchConfig {
            send_batch_size: 16,
            ..BatchConfig::default()
        })
        .build(&metrics),
    );

    let first = MemorySink::new("first");
    let second = MemorySink::new("second");
    pipeline.add_exporter(Arc::new(SinkExporter::new(first.clone(), Arc::clone(&metrics))));
    pipeline.add_exporter(Arc::new(SinkExporter::new(second.clone(), Arc::clone(&metrics))));

    let run = tokio::spawn(async move { pipeline.run(CancellationToken::new()).await });
    wait_open(&submitter).await;

    submitter.submit(Span::new(TraceId::new(0, 0), 1, "invalid")).await.unwrap();
    for i in 1..=99 {
        submitter.submit(span(i)).await.unwrap();
    }
    receiver.stop().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("pipeline did not finish")
        .unwrap()
        .unwrap();

    for sink in [&first, &second] {
        let spans = sink.spans();
        assert_eq!(spans.len(), 99);
        let ids: Vec<u64> = spans.iter().map(|s| s.span_id.0).collect();
        assert_eq!(ids, (1..=99).collect::<Vec<_>>());
        assert!(spans
            .iter()
            .all(|s| s.tag("env").map(|t| &t.value) == Some(&TagValue::from("prod"))));
    }

    let s = metrics.snapshot();
    assert_eq!(s.spans_received, 100);
    assert_eq!(s.spans_dropped, 1);
    assert_eq!(s.spans_processed, 99);
    assert_eq!(s.spans_exported, 198);
    assert_eq!(s.export_errors, 0);
}

#[tokio::test]
async fn test_sampled_out_spans_are_dropped() {
    let metrics = Arc::new(PipelineMetrics::new());
    let (mut pipeline, receiver, submitter) = channel_pipeline(&metrics);
    pipeline.add_processor(
        ProcessorConfig::Sampling(SamplingConfig::default().with_base_sample_rate(0.0)).build(&metrics),
    );
    let sink = MemorySink::new("memory");
    pipeline.add_exporter(Arc::new(SinkExporter::new(sink.clone(), Arc::clone(&metrics))));

    let run = tokio::spawn(async move { pipeline.run(CancellationToken::new()).await });
    wait_open(&submitter).await;

    for i in 1..=10 {
        let span = Span::new(TraceId::new(0, u64::MAX - i), i, "op");
        let span = if i % 5 == 0 { span.with_tag("error", true) } else { span };
        submitter.submit(span).await.unwrap();
    }
    receiver.stop().await.unwrap();
    run.await.unwrap().unwrap();

    let kept: Vec<u64> = sink.spans().iter().map(|s| s.span_id.0).collect();
    assert_eq!(kept, [5, 10]);
    let s = metrics.snapshot();
    assert_eq!(s.spans_received, 10);
    assert_eq!(s.spans_dropped, 8);
    assert_eq!(s.spans_exported, 2);
    assert_eq!(metrics.latency_sample_count(), 10);
}

#[tokio::test]
async fn test_receiver_start_failure_engages_nothing() {
    let metrics = Arc::new(PipelineMetrics::new());
    let mut pipeline = Pipeline::<Span>::new("test", Arc::new(BrokenReceiver), Arc::clone(&metrics));
    let witness = Arc::new(WitnessExporter::default());
    pipeline.add_exporter(witness.clone());

    let err = pipeline.run(CancellationToken::new()).await.unwrap_err();
    match err {
        PipelineError::ReceiverStart { name, source } => {
            assert_eq!(name, "broken");
            assert!(matches!(source, ReceiverError::Other(_)));
        }
        other => panic!("unexpected error {:?}", other),
    }

    tokio::task::yield_now().await;
    assert!(!witness.invoked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_no_exporters_rejected() {
    let metrics = Arc::new(PipelineMetrics::new());
    let (pipeline, _receiver, submitter) = channel_pipeline(&metrics);
    assert!(matches!(
        pipeline.run(CancellationToken::new()).await,
        Err(PipelineError::NoExporters(_))
    ));
    assert!(!submitter.is_open());
}

#[tokio::test]
async fn test_first_exporter_failure_surfaces_while_others_run() {
    let metrics = Arc::new(PipelineMetrics::new());
    let (mut pipeline, _receiver, submitter) = channel_pipeline(&metrics);
    pipeline.add_exporter(Arc::new(SinkExporter::new(
        MemorySink::new("healthy"),
        Arc::clone(&metrics),
    )));
    pipeline.add_exporter(Arc::new(FailingExporter));

    // the receiver is never stopped, so only the failure can end the run
    let err = tokio::time::timeout(Duration::from_secs(5), pipeline.run(CancellationToken::new()))
        .await
        .expect("failure was not surfaced")
        .unwrap_err();
    match err {
        PipelineError::Exporter { name, source } => {
            assert_eq!(name, "failing");
            assert_eq!(source, ExportError::Transport("backend unreachable".to_string()));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!submitter.is_open());
}

#[tokio::test]
async fn test_exporter_panic_is_reported_by_name() {
    let metrics = Arc::new(PipelineMetrics::new());
    let (mut pipeline, _receiver, _submitter) = channel_pipeline(&metrics);
    pipeline.add_exporter(Arc::new(PanickingExporter));

    let err = pipeline.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, PipelineError::ExporterPanicked { ref name } if name == "panicking"));
}

#[tokio::test]
async fn test_cancellation_returns_cancelled_and_keeps_metrics() {
    let metrics = Arc::new(PipelineMetrics::new());
    let (mut pipeline, _receiver, submitter) = channel_pipeline(&metrics);
    let sink = MemorySink::new("memory");
    pipeline.add_exporter(Arc::new(SinkExporter::new(sink.clone(), Arc::clone(&metrics))));

    let cancel = CancellationToken::new();
    let pipeline = Arc::new(pipeline);
    let run = {
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        tokio::spawn(async move { pipeline.run(cancel).await })
    };
    wait_open(&submitter).await;

    for i in 1..=5 {
        submitter.submit(span(i)).await.unwrap();
    }
    while sink.len() < 5 {
        tokio::task::yield_now().await;
    }
    cancel.cancel();

    let err = run.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(!submitter.is_open());
    assert_eq!(pipeline.metrics().snapshot().spans_exported, 5);
}

#[tokio::test]
async fn test_cancellation_aborts_stuck_exporter_after_grace() {
    let metrics = Arc::new(PipelineMetrics::new());
    let (pipeline, _receiver, submitter) = channel_pipeline(&metrics);
    let mut pipeline = pipeline.with_options(PipelineOptions {
        shutdown_grace: Duration::from_millis(50),
        ..PipelineOptions::default()
    });
    pipeline.add_exporter(Arc::new(StuckExporter));

    let cancel = CancellationToken::new();
    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { pipeline.run(cancel).await })
    };
    wait_open(&submitter).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("stuck exporter was not aborted")
        .unwrap();
    assert!(matches!(result, Err(PipelineError::Cancelled)));
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_health_server_over_http() {
    let metrics = Arc::new(PipelineMetrics::new());
    let check = Arc::new(HealthCheck::new(Arc::clone(&metrics), HealthThresholds::default()));

    let server = HealthServer::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&check))
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    assert!(check.is_ready());

    let cancel = CancellationToken::new();
    let serving = tokio::spawn(server.serve(cancel.clone()));

    let ready = http_get(addr, "/ready").await;
    assert!(ready.starts_with("HTTP/1.1 200"), "{ready}");
    assert!(ready.ends_with("ready"));

    let health = http_get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200"), "{health}");
    assert!(health.contains(r#""status":"healthy""#));

    for _ in 0..10 {
        metrics.record_received();
    }
    metrics.record_dropped();
    let health = http_get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 503"), "{health}");
    assert!(health.contains(r#""status":"unhealthy""#));

    let metrics_body = http_get(addr, "/metrics").await;
    assert!(metrics_body.contains(r#""spans_received":10"#));

    let missing = http_get(addr, "/nope").await;
    assert!(missing.starts_with("HTTP/1.1 404"), "{missing}");

    cancel.cancel();
    serving.await.unwrap().unwrap();
    assert!(!check.is_ready());
}
