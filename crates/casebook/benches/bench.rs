use casebook::{Attributor, Entry, IdPool, Ledger, LedgerOptions, TimeSource, pack_result};
use core::hint::black_box;
use criterion::{BatchSize, Criterion, Throughput, criterion_group, criterion_main};
use std::{
    sync::{Arc, Barrier},
    thread::scope,
    time::Instant,
};

struct FixedMockTime {
    millis: u64,
}

impl TimeSource for FixedMockTime {
    fn current_millis(&self) -> u64 {
        self.millis
    }
}

// Records per benchmark iteration (per-thread for multi-threaded).
const TOTAL_RECORDS: usize = 4096;
const THREADS: usize = 4;

fn ledger(records: usize) -> Ledger {
    LedgerOptions::new()
        .with_clock(FixedMockTime {
            millis: 1_700_000_000_000,
        })
        .in_memory((1..=records as u64).map(|p| p << 5))
        .unwrap()
}

/// Claims every record of a fresh ledger, then solves it.
fn bench_claim_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger/sequential");
    group.throughput(Throughput::Elements(TOTAL_RECORDS as u64));
    let solver = Attributor::shared("bench");

    group.bench_function(format!("claim_solve/{TOTAL_RECORDS}"), |b| {
        b.iter_batched(
            || ledger(TOTAL_RECORDS),
            |ledger| {
                while let Some(entry) = ledger.claim_next() {
                    black_box(entry.solve(&solver, pack_result(entry.spec(), 1, 2)));
                }
            },
            BatchSize::SmallInput,
        );
    });
    group.finish();
}

/// Several threads draining one ledger.
fn bench_contended_claim_solve(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger/contended");
    group.throughput(Throughput::Elements((TOTAL_RECORDS * THREADS) as u64));

    group.bench_function(format!("threads/{THREADS}"), |b| {
        b.iter_custom(|iters| {
            let mut total = core::time::Duration::ZERO;
            for _ in 0..iters {
                let ledger = ledger(TOTAL_RECORDS * THREADS);
                let barrier = Arc::new(Barrier::new(THREADS + 1));
                let start = scope(|s| {
                    for t in 0..THREADS {
                        let ledger = ledger.clone();
                        let barrier = Arc::clone(&barrier);
                        s.spawn(move || {
                            let solver = Attributor::shared(format!("bench-{t}"));
                            barrier.wait();
                            while let Some(entry) = ledger.claim_next() {
                                black_box(entry.solve(&solver, 1));
                            }
                        });
                    }
                    barrier.wait();
                    Instant::now()
                });
                total += start.elapsed();
            }
            total
        });
    });
    group.finish();
}

/// Churns owners through a full pool so every mapping sweeps zombies.
fn bench_id_pool_churn(c: &mut Criterion) {
    const CAPACITY: usize = 4096;
    let mut group = c.benchmark_group("id_pool");
    group.throughput(Throughput::Elements(CAPACITY as u64));

    group.bench_function(format!("churn/{CAPACITY}"), |b| {
        let mut pool = IdPool::new(CAPACITY);
        let mut owners: Vec<Arc<usize>> = (0..CAPACITY).map(Arc::new).collect();
        for owner in &owners {
            pool.map(owner).unwrap();
        }
        b.iter(|| {
            for i in 0..CAPACITY {
                owners[i] = Arc::new(i);
                black_box(pool.map(&owners[i]).unwrap());
            }
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_claim_solve,
    bench_contended_claim_solve,
    bench_id_pool_churn,
);
criterion_main!(benches);
