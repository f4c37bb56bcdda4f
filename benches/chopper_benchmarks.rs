use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use rask_apm_client::buffer::ChoppedStream;
use rask_apm_client::domain::EventKind;
use rask_apm_client::sender::{EventEncoder, Truncation};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;

fn sample_span(i: usize) -> serde_json::Value {
    json!({
        "id": format!("{i:016x}"),
        "trace_id": "0af7651916cd43dd8448eb211c80319c",
        "name": "SELECT FROM carts",
        "type": "db",
        "subtype": "postgresql",
        "duration": 3.2,
        "timestamp": 1_700_000_000_000_000u64 + i as u64,
        "context": {"db": {"statement": "SELECT * FROM carts WHERE user_id = $1", "type": "sql"}}
    })
}

fn benchmark_event_encoding(c: &mut Criterion) {
    let encoder = EventEncoder::new(Truncation::from_tunables(&Default::default()));
    let line_len = encoder
        .encode(EventKind::Span, sample_span(0))
        .map(|line| line.len())
        .unwrap_or(0);

    let mut group = c.benchmark_group("event_encoding");
    group.throughput(Throughput::Bytes(line_len as u64));
    group.bench_function("span_with_truncation", |b| {
        b.iter(|| encoder.encode(EventKind::Span, std::hint::black_box(sample_span(1))));
    });

    let untruncated = EventEncoder::new(Truncation::disabled());
    group.bench_function("span_without_truncation", |b| {
        b.iter(|| untruncated.encode(EventKind::Span, std::hint::black_box(sample_span(1))));
    });
    group.finish();
}

fn benchmark_chopped_stream(c: &mut Criterion) {
    let encoder = EventEncoder::new(Truncation::disabled());
    let lines: Vec<_> = (0..1000)
        .filter_map(|i| encoder.encode(EventKind::Span, sample_span(i)).ok())
        .collect();
    let total: usize = lines.iter().map(|line| line.len()).sum();
    let metadata = br#"{"metadata":{"service":{"name":"bench","agent":{"name":"rust","version":"0.1.0"}}}}
"#;

    let mut group = c.benchmark_group("chopped_stream");
    group.throughput(Throughput::Bytes(total as u64));

    group.bench_function("1000_spans_batched_sync", |b| {
        b.iter(|| {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut stream = ChoppedStream::open(metadata, tx).ok()?;
            for batch in lines.chunks(50) {
                for line in batch {
                    stream.write_line(line).ok()?;
                }
                stream.sync().ok()?;
            }
            let bytes = stream.finish(Duration::from_secs(10)).ok()?;
            while rx.try_recv().is_ok() {}
            Some(bytes)
        });
    });

    group.bench_function("1000_spans_single_sync", |b| {
        b.iter(|| {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut stream = ChoppedStream::open(metadata, tx).ok()?;
            for line in &lines {
                stream.write_line(line).ok()?;
            }
            let bytes = stream.finish(Duration::from_secs(10)).ok()?;
            while rx.try_recv().is_ok() {}
            Some(bytes)
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_event_encoding, benchmark_chopped_stream);
criterion_main!(benches);
