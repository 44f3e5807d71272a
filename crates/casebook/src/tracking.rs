use crate::{Attributor, Database, Entry, ExpiryQueue, MonotonicClock, TimeSource};
use core::fmt;
use parking_lot::Mutex;
use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tracing::{debug, info};

/// Default time a fetched case may stay unsolved before it is re-offered.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(360 * 60);

type LeaseSet<E> = Mutex<ExpiryQueue<u64, Arc<Lease<E>>>>;

/// A [`Database`] wrapper that re-offers cases whose lease has expired.
///
/// Every entry handed out is wrapped in a [`Lease`] held in an
/// insertion-ordered set. On each fetch the oldest lease is checked first:
/// once it has outlived the lease timeout its case is handed out again under
/// a fresh lease, without consulting the wrapped source. Only when no lease
/// has expired does the fetch fall through to the source.
///
/// A re-offer renews the wrapped entry first, so a ledger claim stays fresh
/// for as long as some lease holds it and a stale sweep with a window longer
/// than the lease timeout never releases it.
///
/// The set holds the only long-lived strong reference to each lease.
/// Re-offering drops the old `Arc<Lease>`, so holders that kept just a
/// [`Weak`] (like server sessions) see the old offer disappear.
pub struct Tracking<D: Database> {
    source: D,
    leases: Arc<LeaseSet<D::Entry>>,
    timeout: Duration,
    clock: Arc<dyn TimeSource>,
    next_id: AtomicU64,
}

impl<D: Database> Tracking<D> {
    pub fn new(source: D, timeout: Duration) -> Self {
        Self::with_clock(source, timeout, MonotonicClock::new())
    }

    pub fn with_clock(source: D, timeout: Duration, clock: impl TimeSource + 'static) -> Self {
        Self {
            source,
            leases: Arc::new(Mutex::new(ExpiryQueue::new())),
            timeout,
            clock: Arc::new(clock),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &D {
        &self.source
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of leases currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.leases.lock().len()
    }

    fn lease(&self, entry: D::Entry) -> Arc<Lease<D::Entry>> {
        Arc::new(Lease {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            entry,
            set: Arc::downgrade(&self.leases),
        })
    }

    fn deadline(&self, now: u64) -> u64 {
        now.saturating_add(self.timeout.as_millis() as u64)
    }
}

impl<D> Database for Tracking<D>
where
    D: Database,
    D::Entry: Clone,
{
    type Entry = Arc<Lease<D::Entry>>;

    async fn fetch_unsolved(&self) -> Option<Self::Entry> {
        let now = self.clock.current_millis();
        {
            let mut leases = self.leases.lock();
            while let Some((_, expired)) = leases.pop_expired(now) {
                if !expired.entry.renew() {
                    debug!(spec = expired.spec(), "expired lease already settled");
                    continue;
                }
                let lease = self.lease(expired.entry.clone());
                info!(spec = lease.spec(), "lease expired, re-offering case");
                leases.insert(lease.id, Arc::clone(&lease), self.deadline(now));
                return Some(lease);
            }
        }

        let entry = self.source.fetch_unsolved().await?;
        let lease = self.lease(entry);
        debug!(spec = lease.spec(), "leased case");
        self.leases
            .lock()
            .insert(lease.id, Arc::clone(&lease), self.deadline(now));
        Some(lease)
    }
}

/// One leased entry of a [`Tracking`] database.
///
/// Solving a lease removes it from the outstanding set and forwards to the
/// wrapped entry.
pub struct Lease<E> {
    id: u64,
    entry: E,
    set: Weak<LeaseSet<E>>,
}

impl<E> Lease<E> {
    pub fn inner(&self) -> &E {
        &self.entry
    }
}

impl<E: Entry> fmt::Debug for Lease<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("spec", &self.entry.spec())
            .finish()
    }
}

impl<E: Entry> Entry for Lease<E> {
    fn spec(&self) -> u64 {
        self.entry.spec()
    }

    fn solve(&self, solver: &Arc<Attributor>, result: u64) -> bool {
        if let Some(set) = self.set.upgrade() {
            set.lock().remove(&self.id);
        }
        self.entry.solve(solver, result)
    }

    fn renew(&self) -> bool {
        self.entry.renew()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClaimStamp, Ledger, LedgerOptions, ManualClock};

    const T0: u64 = 1_700_000_000_000;
    const TIMEOUT: Duration = Duration::from_secs(60);

    fn tracking(payloads: impl IntoIterator<Item = u64>) -> (Tracking<Ledger>, ManualClock) {
        let clock = ManualClock::new(T0);
        let ledger = LedgerOptions::new()
            .with_clock(clock.clone())
            .in_memory(payloads)
            .unwrap();
        (Tracking::with_clock(ledger, TIMEOUT, clock.clone()), clock)
    }

    #[tokio::test]
    async fn expired_lease_is_preferred_over_fresh_work() {
        let (db, clock) = tracking([1, 2, 3]);
        let first = db.fetch_unsolved().await.unwrap();
        assert_eq!(first.spec(), 1);
        let weak = Arc::downgrade(&first);
        drop(first);

        clock.advance(TIMEOUT / 2);
        assert_eq!(db.fetch_unsolved().await.unwrap().spec(), 2);

        clock.advance(TIMEOUT);
        let again = db.fetch_unsolved().await.unwrap();
        assert_eq!(again.spec(), 1);
        assert!(weak.upgrade().is_none(), "old lease must be released");
        assert_eq!(db.outstanding(), 2);
        assert_eq!(db.source().cursor(), 2);
    }

    #[tokio::test]
    async fn solving_removes_the_lease() {
        let (db, _) = tracking([5, 6]);
        let lease = db.fetch_unsolved().await.unwrap();
        assert_eq!(db.outstanding(), 1);
        assert!(lease.solve(&Attributor::shared("s"), 9));
        assert_eq!(db.outstanding(), 0);
        assert_eq!(db.source().record(0).unwrap().count(), 9);
        assert_eq!(lease.inner().index(), 0);
    }

    #[tokio::test]
    async fn solved_case_is_not_reoffered() {
        let (db, clock) = tracking([5]);
        let lease = db.fetch_unsolved().await.unwrap();
        assert!(lease.solve(&Attributor::shared("s"), 1));
        clock.advance(TIMEOUT * 2);
        assert!(db.fetch_unsolved().await.is_none());
    }

    #[tokio::test]
    async fn reoffer_renews_the_ledger_claim() {
        let (db, clock) = tracking([1, 2]);
        drop(db.fetch_unsolved().await.unwrap());
        let claimed = db.source().record(0).unwrap().stamp();

        clock.advance(Duration::from_secs(60 * 60));
        let again = db.fetch_unsolved().await.unwrap();
        assert_eq!(again.spec(), 1);
        let renewed = db.source().record(0).unwrap();
        assert!(renewed.is_taken());
        assert_eq!(renewed.stamp(), ClaimStamp::from_millis(T0 + 3_600_000));
        assert_ne!(renewed.stamp(), claimed);
    }

    #[tokio::test]
    async fn stale_sweep_spares_a_reoffered_lease() {
        let clock = ManualClock::new(T0);
        let ledger = LedgerOptions::new()
            .with_clock(clock.clone())
            .in_memory([1, 2])
            .unwrap();
        let hour = Duration::from_secs(60 * 60);
        let db = Tracking::with_clock(ledger.clone(), hour, clock.clone());

        drop(db.fetch_unsolved().await.unwrap());
        clock.advance(hour + Duration::from_secs(60));
        let reoffered = db.fetch_unsolved().await.unwrap();
        assert_eq!(reoffered.spec(), 1);

        // the re-offer is still live: its deadline is two hours and a minute in
        clock.advance(hour - Duration::from_secs(30));
        assert_eq!(ledger.reclaim_stale(hour * 2), 0);
        assert!(ledger.record(0).unwrap().is_taken());

        let next = db.fetch_unsolved().await.unwrap();
        assert_eq!(next.spec(), 2);
        assert_eq!(db.outstanding(), 2);
        assert!(db.fetch_unsolved().await.is_none());
    }

    #[tokio::test]
    async fn swept_claim_is_retaken_on_reoffer() {
        let (db, clock) = tracking([1, 2]);
        drop(db.fetch_unsolved().await.unwrap());
        clock.advance(Duration::from_secs(3 * 60 * 60));
        assert_eq!(db.source().reclaim_stale(TIMEOUT), 1);

        // the expired lease wins over the rewound cursor
        assert_eq!(db.fetch_unsolved().await.unwrap().spec(), 1);
        assert!(db.source().record(0).unwrap().is_taken());
        assert_eq!(db.fetch_unsolved().await.unwrap().spec(), 2);
        assert!(db.fetch_unsolved().await.is_none());
    }

    #[tokio::test]
    async fn expired_lease_of_a_settled_case_is_dropped() {
        let (db, clock) = tracking([1, 2]);
        let lease = db.fetch_unsolved().await.unwrap();
        // solved through the raw entry, bypassing the lease
        assert!(lease.inner().solve(&Attributor::shared("s"), 4));
        drop(lease);

        clock.advance(TIMEOUT * 2);
        assert_eq!(db.fetch_unsolved().await.unwrap().spec(), 2);
        assert_eq!(db.outstanding(), 1);
    }

    #[tokio::test]
    async fn exhausted_source_yields_none() {
        let (db, _) = tracking(std::iter::empty());
        assert!(db.fetch_unsolved().await.is_none());
        assert_eq!(db.outstanding(), 0);
    }
}
