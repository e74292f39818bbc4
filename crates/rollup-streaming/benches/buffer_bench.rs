use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rollup_common::config::BufferConfig;
use rollup_common::event::Event;
use rollup_streaming::IngestionBuffer;
use tokio::runtime::Runtime;

fn sample_event(i: u64) -> Event {
    Event::new(format!("evt-{i}"), "bench-user", "page_view", 1_700_000_000_000)
        .with_property("path", "/pricing")
        .with_property("duration_ms", 1_250_i64)
}

fn bench_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let config = BufferConfig {
        max_records: usize::MAX,
        max_bytes: usize::MAX,
        fsync: false,
        ..Default::default()
    };

    let buffer = IngestionBuffer::new(config.clone());
    let mut i = 0;
    c.bench_function("append_in_memory", |b| {
        b.to_async(&rt).iter(|| {
            i += 1;
            let event = sample_event(i);
            let buffer = &buffer;
            async move {
                buffer.append(black_box(event)).await.unwrap();
            }
        })
    });

    // Use temp dirs
    let dir = tempfile::tempdir().unwrap();
    let durable = IngestionBuffer::open(BufferConfig {
        dir: Some(dir.path().to_string_lossy().to_string()),
        ..config
    })
    .expect("Failed to open buffer");
    let mut i = 0;
    c.bench_function("append_segment_file", |b| {
        b.to_async(&rt).iter(|| {
            i += 1;
            let event = sample_event(i);
            let durable = &durable;
            async move {
                durable.append(black_box(event)).await.unwrap();
            }
        })
    });
}

fn bench_read(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let buffer = IngestionBuffer::new(BufferConfig {
        fsync: false,
        ..Default::default()
    });
    rt.block_on(async {
        for i in 0..10_000 {
            buffer.append(sample_event(i)).await.unwrap();
        }
    });

    let mut group = c.benchmark_group("read_batch");
    for size in [1, 100, 500] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| buffer.read_batch(black_box("bench-user"), 0, size).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append, bench_read);
criterion_main!(benches);
