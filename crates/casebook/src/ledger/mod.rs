//! The persistent claim/solve ledger.
//!
//! A [`Ledger`] owns a fixed array of [`Record`]s, either memory-mapped from a
//! file or held on the heap. It hands out unclaimed records one at a time via
//! [`Ledger::claim_next`] and durably records at most one result per record
//! through [`LedgerEntry::solve`].
//!
//! # Locking
//!
//! * The scan cursor sits behind a coarse lock held only while scanning.
//! * Record contents are split into 4 MiB segments, each behind its own lock,
//!   so solves against different segments never contend.
//! * Side-log writes happen after the segment lock is released.

mod journal;
mod record;
mod stamp;
mod storage;
#[cfg(test)]
mod tests;

pub use record::*;
pub use stamp::*;

use crate::{
    Attributor, Database, DEFAULT_POOL_CAPACITY, Entry, Error, IdPool, MonotonicClock, Result,
    TimeSource,
};
use core::fmt;
use journal::{Journal, Sink};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use storage::{RECORDS_PER_SEGMENT, Storage};
use tracing::{debug, error, info, instrument, warn};

/// Summary counts over a ledger, as reported by [`Ledger::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    /// Number of records.
    pub total: usize,
    /// Claimed but not solved.
    pub taken: usize,
    pub solved: usize,
    /// Unsolved records lying before the last solved record.
    pub gap_entries: usize,
    /// Sum of the count fields of all solved records.
    pub result_sum: u128,
    /// Duplicate reports seen since the ledger was opened.
    pub duplicates: u64,
}

impl fmt::Display for LedgerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} records, {} solved, {} taken, {} gaps, result sum {}, {} duplicates",
            self.total, self.solved, self.taken, self.gap_entries, self.result_sum, self.duplicates
        )
    }
}

/// Options for opening a [`Ledger`].
///
/// ```
/// use casebook::{LedgerOptions, ManualClock};
///
/// let ledger = LedgerOptions::new()
///     .with_clock(ManualClock::new(1_600_000_000_000))
///     .with_pool_capacity(16)
///     .in_memory([1, 2, 3])
///     .unwrap();
/// assert_eq!(ledger.len(), 3);
/// ```
pub struct LedgerOptions {
    clock: Arc<dyn TimeSource>,
    pool_capacity: usize,
    duplicate_log: Option<Sink>,
    solver_log: Option<Sink>,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            clock: Arc::new(MonotonicClock::new()),
            pool_capacity: DEFAULT_POOL_CAPACITY,
            duplicate_log: None,
            solver_log: None,
        }
    }
}

impl LedgerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Time source used for claim and solve stamps.
    pub fn with_clock(mut self, clock: impl TimeSource + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Capacity of the solver ID pool. At most [`SOLVER_ID_CAPACITY`].
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    /// Sink receiving the raw words of every duplicate report.
    pub fn with_duplicate_log(mut self, sink: impl Write + Send + 'static) -> Self {
        self.duplicate_log = Some(Box::new(sink));
        self
    }

    /// Sink receiving one line per newly assigned solver ID.
    pub fn with_solver_log(mut self, sink: impl Write + Send + 'static) -> Self {
        self.solver_log = Some(Box::new(sink));
        self
    }

    /// Maps an existing ledger file for in-place mutation.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or mapped, if its size is not a
    /// positive multiple of 16 bytes, or if the pool capacity is invalid.
    pub fn open(self, path: impl AsRef<Path>) -> Result<Ledger> {
        let path = path.as_ref();
        let storage = Storage::open(path)?;
        info!(path = %path.display(), records = storage.len(), "opened ledger");
        self.build(storage)
    }

    /// Builds a heap-backed ledger with one available record per payload.
    pub fn in_memory(self, payloads: impl IntoIterator<Item = u64>) -> Result<Ledger> {
        self.build(Storage::in_memory(payloads.into_iter().map(Record::new)))
    }

    fn build(self, storage: Storage) -> Result<Ledger> {
        if self.pool_capacity == 0 || self.pool_capacity > SOLVER_ID_CAPACITY {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "solver pool capacity must be in 1..={SOLVER_ID_CAPACITY}, got {}",
                    self.pool_capacity
                ),
            });
        }
        Ok(Ledger {
            inner: Arc::new(Inner {
                storage,
                cursor: Mutex::new(0),
                solvers: Mutex::new(IdPool::new(self.pool_capacity)),
                journal: Journal::new(self.duplicate_log, self.solver_log),
                clock: self.clock,
                duplicates: AtomicU64::new(0),
            }),
        })
    }
}

struct Inner {
    storage: Storage,
    cursor: Mutex<usize>,
    solvers: Mutex<IdPool<Attributor>>,
    journal: Journal,
    clock: Arc<dyn TimeSource>,
    duplicates: AtomicU64,
}

/// A fixed-size array of work records shared by every consumer.
///
/// Cloning a `Ledger` is cheap and yields another handle to the same records.
#[derive(Clone)]
pub struct Ledger {
    inner: Arc<Inner>,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("len", &self.len())
            .field("cursor", &*self.inner.cursor.lock())
            .finish()
    }
}

impl Ledger {
    /// Maps `path` with default options.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        LedgerOptions::default().open(path)
    }

    /// Heap-backed ledger with default options.
    pub fn in_memory(payloads: impl IntoIterator<Item = u64>) -> Result<Self> {
        LedgerOptions::default().in_memory(payloads)
    }

    /// Writes a fresh ledger file holding one available record per payload.
    ///
    /// An existing file at `path` is truncated. Payloads are truncated to
    /// [`PAYLOAD_BITS`] bits.
    pub fn create(path: impl AsRef<Path>, payloads: impl IntoIterator<Item = u64>) -> Result<()> {
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        let mut written = 0usize;
        for payload in payloads {
            out.write_all(&Record::new(payload).to_be_bytes())?;
            written += 1;
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        info!(path = %path.as_ref().display(), records = written, "created ledger");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the record at `index`.
    pub fn record(&self, index: usize) -> Option<Record> {
        self.inner.storage.load(index)
    }

    /// Snapshot of every record, in order.
    pub fn records(&self) -> impl Iterator<Item = Record> + '_ {
        (0..self.len()).filter_map(|i| self.record(i))
    }

    /// Index the next claim scan starts from.
    pub fn cursor(&self) -> usize {
        *self.inner.cursor.lock()
    }

    /// Duplicate reports seen since the ledger was opened.
    pub fn duplicates(&self) -> u64 {
        self.inner.duplicates.load(Ordering::Relaxed)
    }

    /// Claims the first available record at or after the cursor.
    ///
    /// Returns `None` once the scan reaches the end of the array; the cursor
    /// only moves backward through [`Self::reclaim_stale`] and
    /// [`Self::untake_all`].
    pub fn claim_next(&self) -> Option<LedgerEntry> {
        let stamp = ClaimStamp::from_millis(self.inner.clock.current_millis());
        let len = self.len();
        let mut cursor = self.inner.cursor.lock();
        while *cursor < len {
            let index = *cursor;
            *cursor += 1;
            let (segment, slot) = Storage::locate(index);
            let mut segment = self.inner.storage.segment(segment);
            let record = segment.load(slot);
            if record.is_available() {
                segment.store(slot, record.with_stamp(stamp));
                debug!(index, spec = record.payload(), "claimed record");
                return Some(LedgerEntry {
                    inner: Arc::clone(&self.inner),
                    index,
                    spec: record.payload(),
                });
            }
        }
        None
    }

    /// Clears the claim of every unsolved record whose claim is older than
    /// `window`, then rewinds the cursor to the first cleared record.
    ///
    /// Returns the number of records made available again.
    #[instrument(level = "debug", skip(self))]
    pub fn reclaim_stale(&self, window: Duration) -> usize {
        let now = self.inner.clock.current_millis();
        self.clear_claims(|record| record.stamp().is_older_than(window, now))
    }

    /// Clears the claim of every unsolved record.
    ///
    /// Only safe while no consumer holds a claim, e.g. right after startup.
    pub fn untake_all(&self) -> usize {
        self.clear_claims(|_| true)
    }

    fn clear_claims(&self, mut stale: impl FnMut(&Record) -> bool) -> usize {
        let storage = &self.inner.storage;
        let mut cleared = 0;
        let mut first = None;
        for s in 0..storage.segment_count() {
            let mut segment = storage.segment(s);
            for slot in 0..segment.len() {
                let record = segment.load(slot);
                if record.is_taken() && stale(&record) {
                    segment.store(slot, record.cleared());
                    first.get_or_insert(s * RECORDS_PER_SEGMENT + slot);
                    cleared += 1;
                }
            }
        }
        if let Some(first) = first {
            let mut cursor = self.inner.cursor.lock();
            *cursor = (*cursor).min(first);
            info!(cleared, cursor = *cursor, "released claims");
        }
        cleared
    }

    pub fn stats(&self) -> LedgerStats {
        let mut stats = LedgerStats {
            total: self.len(),
            duplicates: self.duplicates(),
            ..LedgerStats::default()
        };
        let mut unsolved_run = 0;
        for record in self.records() {
            if record.is_solved() {
                stats.solved += 1;
                stats.result_sum += u128::from(record.count());
                stats.gap_entries += unsolved_run;
                unsolved_run = 0;
            } else {
                unsolved_run += 1;
                if record.is_taken() {
                    stats.taken += 1;
                }
            }
        }
        stats
    }

    /// Flushes mapped segments to disk. A no-op for in-memory ledgers.
    pub fn flush(&self) -> Result<()> {
        Ok(self.inner.storage.flush()?)
    }
}

impl Database for Ledger {
    type Entry = LedgerEntry;

    async fn fetch_unsolved(&self) -> Option<LedgerEntry> {
        self.claim_next()
    }
}

/// A claimed record, bound to its index and the payload observed at claim.
#[derive(Clone)]
pub struct LedgerEntry {
    inner: Arc<Inner>,
    index: usize,
    spec: u64,
}

impl fmt::Debug for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerEntry")
            .field("index", &self.index)
            .field("spec", &self.spec)
            .finish()
    }
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.storage.load(self.index) {
            Some(record) => write!(f, "#{} {record}", self.index),
            None => write!(f, "#{} <out of range>", self.index),
        }
    }
}

impl LedgerEntry {
    pub fn index(&self) -> usize {
        self.index
    }

    fn solver_id(&self, solver: &Arc<Attributor>, now: u64) -> Option<u32> {
        let (id, fresh) = {
            let mut pool = self.inner.solvers.lock();
            match pool.try_get(solver) {
                Some(id) => (id, false),
                None => match pool.map(solver) {
                    Ok(id) => (id, true),
                    Err(e) => {
                        error!(solver = %solver, error = %e, "cannot attribute result");
                        return None;
                    }
                },
            }
        };
        if fresh {
            info!(solver = %solver, id, "new solver");
            if let Err(e) = self.inner.journal.solver(id, solver.name(), now) {
                warn!(error = %e, "solver log write failed");
            }
        }
        Some(id)
    }

    fn journal_duplicate(&self, spec_word: u64, result_word: u64) -> io::Result<()> {
        self.inner.duplicates.fetch_add(1, Ordering::Relaxed);
        self.inner.journal.duplicate(spec_word, result_word)
    }
}

impl Entry for LedgerEntry {
    fn spec(&self) -> u64 {
        self.spec
    }

    fn solve(&self, solver: &Arc<Attributor>, result: u64) -> bool {
        if result & !RESULT_MASK != 0 {
            warn!(spec = self.spec, result, "oversized result rejected");
            return false;
        }
        let now = self.inner.clock.current_millis();
        let Some(id) = self.solver_id(solver, now) else {
            return false;
        };

        let result_word = (u64::from(id) << SOLVER_SHIFT) | result;
        let solved = Record::from_words(self.spec << STAMP_BITS, result_word)
            .with_stamp(ClaimStamp::from_millis(now));

        let (segment, slot) = Storage::locate(self.index);
        let current = {
            let mut segment = self.inner.storage.segment(segment);
            let current = segment.load(slot);
            if current.payload() != self.spec {
                None
            } else {
                if !current.is_solved() {
                    segment.store(slot, solved);
                }
                Some(current)
            }
        };

        match current {
            Some(current) if !current.is_solved() => {
                debug!(index = self.index, spec = self.spec, solver = id, "solved");
                true
            }
            Some(_) => {
                warn!(index = self.index, spec = self.spec, solver = %solver, "duplicate result");
                if let Err(e) = self.journal_duplicate(solved.spec_word(), result_word) {
                    warn!(error = %e, "duplicate log write failed");
                }
                true
            }
            None => {
                warn!(index = self.index, spec = self.spec, solver = %solver, "result report error");
                false
            }
        }
    }
    /// Restamps the claim with the current time, re-taking the record if a
    /// sweep released it meanwhile.
    ///
    /// Returns `false` if the record was solved or now holds another case.
    fn renew(&self) -> bool {
        let stamp = ClaimStamp::from_millis(self.inner.clock.current_millis());
        let (segment, slot) = Storage::locate(self.index);
        let mut segment = self.inner.storage.segment(segment);
        let record = segment.load(slot);
        if record.payload() != self.spec || record.is_solved() {
            debug!(index = self.index, spec = self.spec, "claim not renewed");
            return false;
        }
        segment.store(slot, record.with_stamp(stamp));
        true
    }
}
