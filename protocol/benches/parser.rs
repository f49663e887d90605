use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use protocol::text::MemcachedParser;
use protocol::Parser;

const LINES: [&[u8]; 3] = [
    b"get k\r\n",
    b"set x 0 0 3\r\naaa\r\n",
    b"delete some-fairly-long-key-name\r\n",
];

fn benchmark(c: &mut Criterion) {
    for line in LINES {
        c.bench_with_input(
            BenchmarkId::new("parse", String::from_utf8_lossy(line).replace("\r\n", "\\r\\n")),
            black_box(&line),
            |b, i| {
                b.iter(|| {
                    let mut parser = MemcachedParser::new();
                    let (done, _) = parser.parse(i).unwrap();
                    if done {
                        let _ = parser.build().unwrap();
                    }
                })
            },
        );
    }
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
