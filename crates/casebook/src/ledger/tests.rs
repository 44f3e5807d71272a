use super::*;
use crate::ManualClock;
use std::{collections::HashSet, thread};

// 2023-11-14 22:13:20 UTC
const T0: u64 = 1_700_000_000_000;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn bytes(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn ledger(payloads: impl IntoIterator<Item = u64>) -> (Ledger, ManualClock) {
    let clock = ManualClock::new(T0);
    let ledger = LedgerOptions::new()
        .with_clock(clock.clone())
        .in_memory(payloads)
        .unwrap();
    (ledger, clock)
}

#[test]
fn claims_in_order_until_exhausted() {
    let (ledger, _) = ledger([10, 20, 30]);
    let specs: Vec<_> = core::iter::from_fn(|| ledger.claim_next())
        .map(|e| e.spec())
        .collect();
    assert_eq!(specs, [10, 20, 30]);
    assert!(ledger.claim_next().is_none());
    assert_eq!(ledger.cursor(), 3);

    let record = ledger.record(0).unwrap();
    assert!(record.is_taken());
    assert_eq!(record.stamp(), ClaimStamp::from_millis(T0));
}

#[test]
fn claim_skips_taken_and_solved_records() {
    let (ledger, _) = ledger([1, 2, 3]);
    let first = ledger.claim_next().unwrap();
    assert!(first.solve(&Attributor::shared("a"), 5));
    ledger.untake_all();
    // cursor did not move back: nothing was cleared
    assert_eq!(ledger.cursor(), 1);
    assert_eq!(ledger.claim_next().unwrap().spec(), 2);
}

#[test]
fn concurrent_solves_merge_once() {
    let dups = SharedBuf::default();
    let ledger = LedgerOptions::new()
        .with_clock(ManualClock::new(T0))
        .with_duplicate_log(dups.clone())
        .in_memory([42])
        .unwrap();
    let entry = ledger.claim_next().unwrap();
    let solver = Attributor::shared("racer");

    let served: Vec<bool> = thread::scope(|s| {
        let handles: Vec<_> = (1..=8u64)
            .map(|result| {
                let entry = entry.clone();
                let solver = Arc::clone(&solver);
                s.spawn(move || entry.solve(&solver, result))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(served.iter().all(|&ok| ok));
    let record = ledger.record(0).unwrap();
    assert!((1..=8).contains(&record.result()));
    assert_eq!(ledger.duplicates(), 7);
    assert_eq!(dups.bytes().len(), 7 * Record::SIZE);
}

#[test]
fn concurrent_claims_are_exclusive() {
    let (ledger, _) = ledger(1..=1_000);
    let claimed: Vec<usize> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                s.spawn(move || {
                    core::iter::from_fn(|| ledger.claim_next())
                        .map(|e| e.index())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect()
    });
    let unique: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 1_000);
    assert_eq!(unique.len(), 1_000);
}

#[test]
fn duplicate_never_overwrites() {
    let dups = SharedBuf::default();
    let ledger = LedgerOptions::new()
        .with_clock(ManualClock::new(T0))
        .with_duplicate_log(dups.clone())
        .in_memory([7])
        .unwrap();
    let entry = ledger.claim_next().unwrap();
    let a = Attributor::shared("a");
    let b = Attributor::shared("b");

    assert!(entry.solve(&a, pack_result(100, 1, 2)));
    let before = ledger.record(0).unwrap();

    for n in 1..=3 {
        assert!(entry.solve(&b, pack_result(200 + n, 0, 0)));
        assert_eq!(ledger.record(0).unwrap().result_word(), before.result_word());
        assert_eq!(ledger.duplicates(), n);
    }

    let bytes = dups.bytes();
    assert_eq!(bytes.len(), 3 * Record::SIZE);
    let mut first = [0; Record::SIZE];
    first.copy_from_slice(&bytes[..Record::SIZE]);
    let logged = Record::from_be_bytes(first);
    assert_eq!(logged.payload(), 7);
    assert_eq!(logged.count(), 201);
}

#[test]
fn generation_mismatch_is_refused() {
    let (ledger, _) = ledger([7]);
    let real = ledger.claim_next().unwrap();
    let stale = LedgerEntry {
        inner: Arc::clone(&real.inner),
        index: real.index(),
        spec: 8,
    };
    assert!(!stale.solve(&Attributor::shared("late"), 1));
    assert!(!ledger.record(0).unwrap().is_solved());
    assert!(real.solve(&Attributor::shared("on time"), 1));
}

#[test]
fn oversized_result_is_refused() {
    let (ledger, _) = ledger([7]);
    let entry = ledger.claim_next().unwrap();
    assert!(!entry.solve(&Attributor::shared("x"), 1 << RESULT_BITS));
    assert!(!ledger.record(0).unwrap().is_solved());
}

#[test]
fn solver_ids_are_attributed_and_logged_once() {
    let log = SharedBuf::default();
    let ledger = LedgerOptions::new()
        .with_clock(ManualClock::new(T0))
        .with_solver_log(log.clone())
        .in_memory([1, 2, 3])
        .unwrap();
    let alpha = Attributor::shared("alpha");
    let beta = Attributor::shared("beta");

    assert!(ledger.claim_next().unwrap().solve(&alpha, 1));
    assert!(ledger.claim_next().unwrap().solve(&alpha, 2));
    assert!(ledger.claim_next().unwrap().solve(&beta, 3));

    assert_eq!(ledger.record(0).unwrap().solver(), Some(0));
    assert_eq!(ledger.record(1).unwrap().solver(), Some(0));
    assert_eq!(ledger.record(2).unwrap().solver(), Some(1));

    let text = String::from_utf8(log.bytes()).unwrap();
    assert_eq!(
        text,
        "2023-11-14 22:13 SOLVER #0: alpha\n2023-11-14 22:13 SOLVER #1: beta\n"
    );
}

#[test]
fn stale_claims_are_reclaimed_and_rewind_cursor() {
    let (ledger, clock) = ledger([1, 2, 3, 4]);
    let old = ledger.claim_next().unwrap();
    clock.advance(Duration::from_secs(2 * 3600));
    let fresh = ledger.claim_next().unwrap();
    assert_eq!(ledger.cursor(), 2);

    assert_eq!(ledger.reclaim_stale(Duration::from_secs(3600)), 1);
    assert_eq!(ledger.cursor(), 0);
    assert!(ledger.record(0).unwrap().is_available());
    assert!(ledger.record(1).unwrap().is_taken());

    let again = ledger.claim_next().unwrap();
    assert_eq!(again.index(), old.index());
    assert_eq!(ledger.claim_next().unwrap().index(), 2);
    assert!(fresh.solve(&Attributor::shared("s"), 1));
}

#[test]
fn renew_restamps_only_live_claims() {
    let (ledger, clock) = ledger([1, 2]);
    let entry = ledger.claim_next().unwrap();
    clock.advance(Duration::from_secs(3 * 3600));
    assert!(entry.renew());
    let renewed = ledger.record(0).unwrap();
    assert_eq!(renewed.stamp(), ClaimStamp::from_millis(T0 + 3 * 3_600_000));
    assert_eq!(ledger.reclaim_stale(Duration::from_secs(3600)), 0);

    let other = ledger.claim_next().unwrap();
    assert!(other.solve(&Attributor::shared("s"), 3));
    assert!(!other.renew());
    let moved = LedgerEntry {
        inner: Arc::clone(&entry.inner),
        index: entry.index(),
        spec: 9,
    };
    assert!(!moved.renew());
    assert_eq!(ledger.record(0).unwrap(), renewed);
}

#[test]
fn stats_count_gaps_and_sums() {
    let (ledger, _) = ledger([1, 2, 3, 4, 5]);
    let solver = Attributor::shared("s");
    let entries: Vec<_> = core::iter::from_fn(|| ledger.claim_next()).collect();
    assert!(entries[1].solve(&solver, pack_result(10, 0, 0)));
    assert!(entries[3].solve(&solver, pack_result(32, 0, 0)));
    assert!(entries[3].solve(&solver, pack_result(99, 0, 0)));

    let stats = ledger.stats();
    assert_eq!(
        stats,
        LedgerStats {
            total: 5,
            taken: 3,
            solved: 2,
            gap_entries: 2,
            result_sum: 42,
            duplicates: 1,
        }
    );

    assert_eq!(ledger.untake_all(), 3);
    assert_eq!(ledger.stats().taken, 0);
}

#[test]
fn invalid_pool_capacity_is_rejected() {
    let err = LedgerOptions::new()
        .with_pool_capacity(SOLVER_ID_CAPACITY + 1)
        .in_memory([1])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidConfig { .. }));
}

#[test]
fn file_backed_ledger_persists_solves() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cases.ledger");
    Ledger::create(&path, [0xA, 0xB, 0xC]).unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 48);

    {
        let ledger = LedgerOptions::new()
            .with_clock(ManualClock::new(T0))
            .open(&path)
            .unwrap();
        let entry = ledger.claim_next().unwrap();
        assert!(entry.solve(&Attributor::shared("disk"), pack_result(5, 1, 1)));
        ledger.claim_next().unwrap();
        ledger.flush().unwrap();
    }

    let ledger = Ledger::open(&path).unwrap();
    let solved = ledger.record(0).unwrap();
    assert_eq!(solved.payload(), 0xA);
    assert_eq!(solved.count(), 5);
    assert!(ledger.record(1).unwrap().is_taken());
    assert!(ledger.record(2).unwrap().is_available());

    // a restarted ledger scans from the start but skips custody it sees
    assert_eq!(ledger.claim_next().unwrap().spec(), 0xC);
}

#[tokio::test]
async fn ledger_is_a_database() {
    let (ledger, _) = ledger([3]);
    let entry = ledger.fetch_unsolved().await.unwrap();
    assert_eq!(entry.spec(), 3);
    assert!(ledger.fetch_unsolved().await.is_none());
}
