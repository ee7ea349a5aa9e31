use comet_rt::{channel::Channel, fiber::Fiber, shared_state::SharedState, value::Value, Config};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

pub fn bench_fibers(c: &mut Criterion) {
    let mut group = c.benchmark_group("fibers");
    group.sample_size(20);

    let shared = SharedState::new(Config {
        fiber_stacks: 4,
        concurrent_marking: false,
        ..Config::default()
    });
    let _main = shared.attach_current_thread("bench").unwrap();

    for count in [2usize, 4, 16].iter() {
        // more fibers than slots forces stack images through their heap copies
        group.bench_function(BenchmarkId::new("resume/yield", count), |b| {
            let fibers = (0..*count)
                .map(|_| {
                    Fiber::create(&shared, |_| loop {
                        Fiber::yield_(vec![])?;
                    })
                })
                .collect::<Vec<_>>();
            b.iter(|| {
                for fib in fibers.iter() {
                    let _ = fib.resume(vec![]);
                }
            });
        });
    }

    group.bench_function("channel send/receive", |b| {
        let channel = Channel::new(&shared);
        b.iter(|| {
            for i in 0..100 {
                channel.send(Value::Int(i));
            }
            for _ in 0..100 {
                let _ = channel.receive();
            }
        });
    });

    group.bench_function("synchronous collection", |b| {
        b.iter_batched(
            || {
                for i in 0..1000 {
                    shared.allocate(vec![Value::Int(i)]);
                }
            },
            |_| shared.collect_garbage(),
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
    shared.shutdown();
}

criterion_group!(benches, bench_fibers);
criterion_main!(benches);
