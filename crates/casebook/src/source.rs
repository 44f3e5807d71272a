//! Engine-facing, flow-controlled case source.
//!
//! A [`CaseSource`] sits between a computation engine and any [`Database`].
//! It bounds the number of cases the engine may hold without reporting,
//! forgets cases that stay unreported for too long, and hands the engine a
//! reduced token instead of the raw ledger payload.
//!
//! Engines typically run a loop like:
//!
//! ```no_run
//! # use casebook::{Attributor, CaseSource, Ledger, SourceConfig};
//! # use std::sync::Arc;
//! # async fn run(source: Arc<CaseSource<Ledger>>) {
//! loop {
//!     let token = source.fetch_case().await;
//!     if token == 0 {
//!         break; // stopped or out of work
//!     }
//!     let result = token.count_ones() as u64; // the engine's real work
//!     source.log_count(token, result);
//! }
//! # }
//! ```

use crate::{
    Attributor, Database, Entry, Error, ExpiryQueue, MonotonicClock, ParityReduction, Reduction,
    Result, TimeSource,
};
use core::fmt;
use parking_lot::{Mutex, MutexGuard};
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{sync::Notify, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Flow-control settings of a [`CaseSource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    /// Maximum number of cases handed out and not yet reported.
    pub limit: usize,
    /// Time after which an unreported case no longer counts against `limit`.
    pub timeout: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            limit: 16,
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl SourceConfig {
    pub const fn new(limit: usize, timeout: Duration) -> Self {
        Self { limit, timeout }
    }

    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(Error::InvalidConfig {
                reason: "pending case limit must be positive".into(),
            });
        }
        if self.timeout.is_zero() {
            return Err(Error::InvalidConfig {
                reason: "pending case timeout must be positive".into(),
            });
        }
        Ok(())
    }
}

struct State<D: Database> {
    db: Option<Arc<D>>,
    cancel: CancellationToken,
    pending: ExpiryQueue<u64, D::Entry>,
    /// Slots claimed by fetches still waiting on the database.
    reserved: usize,
}

/// Flow-controlled adapter feeding one engine from a [`Database`].
///
/// Results are attributed to the source's own [`Attributor`].
///
/// # Cancellation
///
/// [`CaseSource::stop`] wakes every task blocked in
/// [`CaseSource::fetch_case`], including ones waiting on the database;
/// those calls return the no-work token `0`.
pub struct CaseSource<D: Database, R = ParityReduction> {
    config: SourceConfig,
    attributor: Arc<Attributor>,
    reduction: R,
    clock: Arc<dyn TimeSource>,
    state: Mutex<State<D>>,
    space: Notify,
    solved: AtomicU64,
}

impl<D: Database> CaseSource<D> {
    /// Creates a stopped source using [`ParityReduction`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for a zero limit or timeout.
    pub fn new(attributor: Arc<Attributor>, config: SourceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            attributor,
            reduction: ParityReduction,
            clock: Arc::new(MonotonicClock::new()),
            state: Mutex::new(State {
                db: None,
                cancel: CancellationToken::new(),
                pending: ExpiryQueue::new(),
                reserved: 0,
            }),
            space: Notify::new(),
            solved: AtomicU64::new(0),
        })
    }
}

impl<D: Database, R: Reduction> CaseSource<D, R> {
    /// Replaces the payload reduction.
    pub fn with_reduction<R2: Reduction>(self, reduction: R2) -> CaseSource<D, R2> {
        CaseSource {
            config: self.config,
            attributor: self.attributor,
            reduction,
            clock: self.clock,
            state: self.state,
            space: self.space,
            solved: self.solved,
        }
    }

    /// Replaces the time source used for pending-case deadlines.
    pub fn with_clock(mut self, clock: impl TimeSource + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn attributor(&self) -> &Arc<Attributor> {
        &self.attributor
    }

    /// Binds the source to `db`. Cases pending from an earlier binding stay
    /// pending.
    pub fn start(&self, db: Arc<D>) {
        let mut state = self.state.lock();
        state.db = Some(db);
        state.cancel = CancellationToken::new();
    }

    /// Unbinds the source and releases every task blocked in
    /// [`Self::fetch_case`].
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.db = None;
        state.cancel.cancel();
        drop(state);
        self.space.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().db.is_some()
    }

    /// Number of cases handed out and not yet reported or expired.
    pub fn active_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Number of results accepted by the underlying database.
    pub fn solved_count(&self) -> u64 {
        self.solved.load(Ordering::Relaxed)
    }

    /// Fetches the next case token, waiting while the engine holds `limit`
    /// unreported cases.
    ///
    /// While at the limit, the oldest pending case is dropped once its
    /// deadline passes. Returns `0` when the source is stopped (or stops
    /// while waiting) or when the database has no more work.
    pub async fn fetch_case(&self) -> u64 {
        let (db, cancel) = loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (cancel, wait) = {
                let mut state = self.state.lock();
                let Some(db) = state.db.clone() else {
                    return 0;
                };
                if state.pending.len() + state.reserved < self.config.limit {
                    state.reserved += 1;
                    break (db, state.cancel.clone());
                }
                let now = self.clock.current_millis();
                if let Some((token, _)) = state.pending.pop_expired(now) {
                    warn!(token = %Token(token), "pending case timed out");
                    state.reserved += 1;
                    break (db, state.cancel.clone());
                }
                let wait = state
                    .pending
                    .next_deadline()
                    .map_or(self.config.timeout, |deadline| {
                        Duration::from_millis(deadline.saturating_sub(now))
                    });
                (state.cancel.clone(), wait)
            };

            tokio::select! {
                () = &mut notified => {}
                () = sleep(wait) => {}
                () = cancel.cancelled() => return 0,
            }
        };

        let reservation = Reservation {
            state: &self.state,
            space: &self.space,
            armed: true,
        };
        // the armed reservation hands the slot back if stopped here
        let entry = tokio::select! {
            entry = db.fetch_unsolved() => entry,
            () = cancel.cancelled() => return 0,
        };
        let now = self.clock.current_millis();
        let mut state = reservation.release();
        let Some(entry) = entry else {
            drop(state);
            self.space.notify_waiters();
            return 0;
        };

        let token = self.reduction.reduce(entry.spec());
        debug!(spec = entry.spec(), token = %Token(token), "handing out case");
        let deadline = now.saturating_add(self.config.timeout.as_millis() as u64);
        if state.pending.insert(token, entry, deadline).is_some() {
            warn!(token = %Token(token), "token collision, older case dropped");
        }
        token
    }

    /// Reports `result` for a token previously returned by
    /// [`Self::fetch_case`].
    ///
    /// Returns `false`, after logging, if the token is not pending (never
    /// handed out, already reported, or timed out) or if the database
    /// refused the result.
    pub fn log_count(&self, token: u64, result: u64) -> bool {
        let entry = self.state.lock().pending.remove(&token);
        if let Some(entry) = entry {
            self.space.notify_waiters();
            if entry.solve(&self.attributor, result) {
                self.solved.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
        warn!(token = %Token(token), result, "unlogged result");
        false
    }
}

impl<D: Database, R> fmt::Debug for CaseSource<D, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaseSource")
            .field("attributor", &self.attributor.name())
            .field("config", &self.config)
            .field("solved", &self.solved.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// A slot held while a fetch waits on the database. Dropping an armed
/// reservation (the fetch was cancelled) returns the slot.
struct Reservation<'a, D: Database> {
    state: &'a Mutex<State<D>>,
    space: &'a Notify,
    armed: bool,
}

impl<'a, D: Database> Reservation<'a, D> {
    fn release(mut self) -> MutexGuard<'a, State<D>> {
        self.armed = false;
        let mut state = self.state.lock();
        state.reserved -= 1;
        state
    }
}

impl<D: Database> Drop for Reservation<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            self.state.lock().reserved -= 1;
            self.space.notify_waiters();
        }
    }
}

struct Token(u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:010X}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IdentityReduction, Ledger, LedgerOptions};
    use tokio::time::timeout;

    fn source(
        payloads: impl IntoIterator<Item = u64>,
        limit: usize,
        case_timeout: Duration,
    ) -> (Arc<CaseSource<Ledger, IdentityReduction>>, Ledger) {
        let clock = MonotonicClock::new();
        let ledger = LedgerOptions::new()
            .with_clock(clock.clone())
            .in_memory(payloads)
            .unwrap();
        let source = CaseSource::new(
            Attributor::shared("engine"),
            SourceConfig::new(limit, case_timeout),
        )
        .unwrap()
        .with_reduction(IdentityReduction)
        .with_clock(clock);
        source.start(Arc::new(ledger.clone()));
        (Arc::new(source), ledger)
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_source_hands_out_nothing() {
        let (source, _) = source([1, 2], 4, Duration::from_secs(60));
        source.stop();
        assert!(!source.is_running());
        assert_eq!(source.fetch_case().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn limit_blocks_until_a_result_arrives() {
        let (source, ledger) = source([1, 2, 3], 2, Duration::from_secs(600));
        assert_eq!(source.fetch_case().await, 1);
        assert_eq!(source.fetch_case().await, 2);
        assert_eq!(source.active_count(), 2);

        let blocked = tokio::spawn({
            let source = Arc::clone(&source);
            async move { source.fetch_case().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!blocked.is_finished());
        assert_eq!(source.active_count(), 2);

        assert!(source.log_count(1, 77));
        assert_eq!(blocked.await.unwrap(), 3);
        assert_eq!(source.solved_count(), 1);
        assert_eq!(ledger.record(0).unwrap().count(), 77);
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_case_times_out_at_the_limit() {
        let (source, _) = source([1, 2], 1, Duration::from_secs(10));
        assert_eq!(source.fetch_case().await, 1);

        let early = timeout(Duration::from_secs(5), source.fetch_case()).await;
        assert!(early.is_err());

        assert_eq!(source.fetch_case().await, 2);
        assert_eq!(source.active_count(), 1);
        // the timed-out token is no longer tracked
        assert!(!source.log_count(1, 5));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_blocked_fetches() {
        let (source, _) = source([1, 2], 1, Duration::from_secs(3600));
        assert_eq!(source.fetch_case().await, 1);

        let blocked = tokio::spawn({
            let source = Arc::clone(&source);
            async move { source.fetch_case().await }
        });
        tokio::task::yield_now().await;
        source.stop();
        assert_eq!(blocked.await.unwrap(), 0);
    }

    /// A database that never answers, like a remote one stuck reconnecting.
    struct Unreachable;

    impl Database for Unreachable {
        type Entry = crate::LedgerEntry;

        async fn fetch_unsolved(&self) -> Option<Self::Entry> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_pending_database_fetch() {
        let config = SourceConfig::new(1, Duration::from_secs(60));
        let source = Arc::new(CaseSource::new(Attributor::shared("engine"), config).unwrap());
        source.start(Arc::new(Unreachable));

        let fetch = tokio::spawn({
            let source = Arc::clone(&source);
            async move { source.fetch_case().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fetch.is_finished());

        source.stop();
        let token = timeout(Duration::from_secs(2), fetch).await;
        assert_eq!(token.unwrap().unwrap(), 0);
        assert_eq!(source.state.lock().reserved, 0);
        assert_eq!(source.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_database_frees_the_slot() {
        let (source, _) = source([9], 1, Duration::from_secs(60));
        assert_eq!(source.fetch_case().await, 9);
        assert!(source.log_count(9, 1));
        assert_eq!(source.fetch_case().await, 0);
        assert_eq!(source.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_token_is_unlogged() {
        let (source, _) = source([1], 1, Duration::from_secs(60));
        assert!(!source.log_count(0xDEAD, 1));
        assert_eq!(source.solved_count(), 0);
    }

    #[test]
    fn zero_limit_is_rejected() {
        let err = CaseSource::<Ledger>::new(
            Attributor::shared("x"),
            SourceConfig::new(0, Duration::from_secs(1)),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn parity_reduction_is_the_default() {
        let clock = MonotonicClock::new();
        let ledger = LedgerOptions::new()
            .with_clock(clock.clone())
            .in_memory([3 << 5])
            .unwrap();
        let source = CaseSource::new(Attributor::shared("p"), SourceConfig::default())
            .unwrap()
            .with_clock(clock);
        source.start(Arc::new(ledger.clone()));
        let token = source.fetch_case().await;
        assert_eq!(token, 3 | ParityReduction::PARITY_BIT);
        assert!(source.log_count(token, 12));
        assert_eq!(ledger.record(0).unwrap().count(), 12);
    }
}
