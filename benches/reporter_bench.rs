// ============================================================================
// PULSE REPORTER - PERFORMANCE BENCHMARKS
// ============================================================================
// Hot-path benchmarks: series identity hashing and the synchronous reporting
// call (fast-path merge into a live aggregate).
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pulse_reporter::{
    tags, Driver, MemoryDriver, MetricReporter, ReporterConfig, SeriesId, Tag, Tags,
};

fn bench_series_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("series_id");

    let untagged = Tags::new();
    group.bench_function("compute_untagged", |b| {
        b.iter(|| SeriesId::compute(black_box("http.request.latency"), black_box(&untagged)))
    });

    for tag_count in [1usize, 4, 8] {
        let tags: Tags = (0..tag_count)
            .map(|i| Tag::new(format!("key{i}"), format!("value{i}")))
            .collect();
        group.bench_with_input(
            BenchmarkId::new("compute_tagged", tag_count),
            &tags,
            |b, tags| b.iter(|| SeriesId::compute(black_box("http.request.latency"), tags)),
        );
    }

    group.finish();
}

fn quiet_reporter(runtime: &tokio::runtime::Runtime) -> MetricReporter {
    let config = ReporterConfig {
        flush_interval: Duration::from_secs(3600),
        sweep_interval: Duration::from_secs(3600),
        ..ReporterConfig::default()
    };
    let driver = Arc::new(MemoryDriver::new());
    let _guard = runtime.enter();
    MetricReporter::new(
        config,
        vec![driver.clone() as Arc<dyn Driver>],
        vec![driver as Arc<dyn Driver>],
    )
    .expect("reporter should start")
}

fn bench_report(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime");

    let mut group = c.benchmark_group("report");

    {
        let reporter = quiet_reporter(&runtime);
        // Warm the series so iterations measure the fast-path merge.
        reporter.metric("latency", 1.0, tags! { "route" => "/a" });
        group.bench_function("metric_fast_path", |b| {
            b.iter(|| reporter.metric(black_box("latency"), black_box(1.0), tags! { "route" => "/a" }))
        });
    }

    {
        let reporter = quiet_reporter(&runtime);
        reporter.counter("requests", 1.0, Tags::new());
        group.bench_function("counter_untagged", |b| {
            b.iter(|| reporter.counter(black_box("requests"), black_box(1.0), Tags::new()))
        });
    }

    {
        let reporter = quiet_reporter(&runtime);
        let mut n = 0u64;
        group.bench_function("metric_new_series", |b| {
            b.iter(|| {
                n += 1;
                reporter.metric(black_box(&format!("series.{n}")), black_box(1.0), Tags::new())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_series_id, bench_report);
criterion_main!(benches);
