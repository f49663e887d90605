use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use concurrency::Executor;

/// Measures the cost of the admission path itself: instant, already-complete
/// tasks, so the number dominating the timing is how many workers the pool
/// has to reuse versus spawn versus queue, not task work.
fn benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("admission");
    for high in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("execute", high), &high, |b, &high| {
            let exec = Executor::new(high, high, 1024, Duration::from_secs(10));
            b.iter(|| {
                black_box(exec.execute(|| {}));
            });
            exec.stop(true);
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
