use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use span_pipeline::{
    ChannelReceiver, NullSink, Pipeline, PipelineMetrics, ProcessorConfig, Sampler,
    SamplingConfig, SinkExporter, Span, TraceId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SPANS: u64 = 10_000;

fn spans(n: u64) -> Vec<Span> {
    (1..=n)
        .map(|i| {
            let span = Span::new(TraceId::new(0, i.wrapping_mul(0x9E37_79B9_7F4A_7C15)), i, "op")
                .with_duration(Duration::from_micros(i % 2000));
            if i % 50 == 0 {
                span.with_tag("error", true)
            } else {
                span
            }
        })
        .collect()
}

fn bench_sampler(c: &mut Criterion) {
    let mut group = c.benchmark_group("sampler");
    let input = spans(SPANS);
    group.throughput(Throughput::Elements(SPANS));

    for rate in [0.01, 0.1, 1.0] {
        group.bench_with_input(BenchmarkId::from_parameter(rate), &rate, |b, &rate| {
            let sampler = Sampler::new(SamplingConfig::default().with_base_sample_rate(rate));
            b.iter(|| {
                let kept = input.iter().filter(|s| sampler.should_sample(s)).count();
                black_box(kept);
            });
        });
    }

    group.finish();
}

fn bench_metrics(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics");

    group.bench_function("record_processing_time", |b| {
        let metrics = PipelineMetrics::new();
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            metrics.record_processing_time(Duration::from_nanos(n % 10_000));
        });
    });

    group.bench_function("snapshot_full_window", |b| {
        let metrics = PipelineMetrics::new();
        for i in 0..1000u64 {
            metrics.record_processing_time(Duration::from_nanos(i * 7 % 1000));
        }
        b.iter(|| black_box(metrics.snapshot()));
    });

    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    let rt = tokio::runtime::Runtime::new().unwrap();
    group.throughput(Throughput::Elements(SPANS));
    group.sample_size(20);

    for exporters in [1usize, 3] {
        group.bench_with_input(
            BenchmarkId::new("end_to_end", format!("{}_exporters", exporters)),
            &exporters,
            |b, &exporters| {
                b.to_async(&rt).iter(|| async move {
                    let metrics = Arc::new(PipelineMetrics::new());
                    let receiver = Arc::new(ChannelReceiver::new(1024, Arc::clone(&metrics)));
                    let submitter = receiver.submitter();

                    let mut pipeline = Pipeline::<Span>::new("bench", receiver.clone(), Arc::clone(&metrics));
                    pipeline.add_processor(
                        ProcessorConfig::Sampling(SamplingConfig::default()).build(&metrics),
                    );
                    for _ in 0..exporters {
                        pipeline.add_exporter(Arc::new(SinkExporter::new(
                            NullSink::new(),
                            Arc::clone(&metrics),
                        )));
                    }

                    let run = tokio::spawn(async move { pipeline.run(CancellationToken::new()).await });
                    while !submitter.is_open() {
                        tokio::task::yield_now().await;
                    }
                    for span in spans(SPANS) {
                        submitter.submit(span).await.unwrap();
                    }
                    span_pipeline::Receiver::stop(receiver.as_ref()).await.unwrap();
                    run.await.unwrap().unwrap();
                    black_box(metrics.snapshot());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_sampler, bench_metrics, bench_pipeline);
criterion_main!(benches);
