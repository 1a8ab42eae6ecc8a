use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use std::time::{Duration, Instant};

use cyclert::prelude::{Blocking, CycleWait, ManagedThread, State, WaitMode};

fn run_hot_loop(total_iters: u64) -> Duration {
    let thread = ManagedThread::new("bench-hot", move |ctl| {
        let mut left = total_iters;
        while ctl.checkpoint().is_continue() {
            if left == 0 {
                ctl.set_self_exiting()?;
                continue;
            }
            left = black_box(left - 1);
        }
        Ok(())
    })
    .with_cycle_wait(CycleWait::Absolute, Duration::ZERO);
    thread.set_internal_logging_enabled(false);

    thread.start(Blocking::On).unwrap();
    let start = Instant::now();
    thread.run(Blocking::Off).unwrap();
    thread.state_wait(State::Exited, WaitMode::Forever).unwrap();
    start.elapsed()
}

pub fn bench_hot_loop(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_hot_loop");

    for &iters in &[100_000_u64, 1_000_000_u64] {
        group.bench_function(BenchmarkId::from_parameter(iters), |b| {
            b.iter_custom(|n| {
                let mut total = Duration::ZERO;
                for _ in 0..n {
                    total += run_hot_loop(iters);
                }
                total
            });
        });
    }

    group.finish();
}

pub fn bench_one_cycle(c: &mut Criterion) {
    let thread = ManagedThread::new("bench-step", |ctl| {
        while ctl.checkpoint().is_continue() {
            black_box(ctl.cycle_count());
        }
        Ok(())
    })
    .with_cycle_wait(CycleWait::Indefinite, Duration::ZERO);
    thread.set_internal_logging_enabled(false);
    thread.start(Blocking::On).unwrap();

    c.bench_function("run_one_cycle_from_idle", |b| {
        b.iter(|| thread.run_one_cycle(Blocking::On).unwrap());
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_millis(500))
        .measurement_time(Duration::from_secs(3))
        .sample_size(12);
    targets = bench_hot_loop, bench_one_cycle
}
criterion_main!(benches);
