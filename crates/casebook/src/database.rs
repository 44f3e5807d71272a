use core::fmt;
use std::sync::Arc;

/// The identity a result is attributed to.
///
/// Attributors are compared by *pointer identity*, never by name: two engines
/// announcing the same display name are still two solvers. Ledgers and
/// connections assign them small numeric IDs through an [`IdPool`] that only
/// holds weak references, so an attributor's ID is released once every
/// `Arc<Attributor>` to it has been dropped.
///
/// [`IdPool`]: crate::IdPool
#[derive(Debug)]
pub struct Attributor {
    name: String,
}

impl Attributor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Convenience constructor for the common `Arc<Attributor>` form.
    pub fn shared(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Attributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A claimed unit of work handed out by a [`Database`].
///
/// Holding an entry means holding custody of its case until the entry is
/// solved or its lease expires upstream.
pub trait Entry: Send + Sync {
    /// The 44-bit case payload.
    fn spec(&self) -> u64;

    /// Reports `result` for this case on behalf of `solver`.
    ///
    /// Returns `true` when the case is considered served, which includes the
    /// case of a duplicate report that was logged but not merged. Returns
    /// `false` when the report could not be honored at all (generation
    /// mismatch, oversized result).
    fn solve(&self, solver: &Arc<Attributor>, result: u64) -> bool;

    /// Refreshes custody before the case is handed out again.
    ///
    /// Returns `false` if the case no longer needs serving, e.g. it was
    /// solved elsewhere. Sources without durable custody keep the default.
    fn renew(&self) -> bool {
        true
    }
}

impl<T: Entry + ?Sized> Entry for Arc<T> {
    fn spec(&self) -> u64 {
        (**self).spec()
    }

    fn solve(&self, solver: &Arc<Attributor>, result: u64) -> bool {
        (**self).solve(solver, result)
    }

    fn renew(&self) -> bool {
        (**self).renew()
    }
}

/// A source of unsolved cases.
///
/// Implemented by the persistent [`Ledger`], the lease-tracking [`Tracking`]
/// wrapper, and the network-backed remote adapter. `fetch_unsolved` resolves
/// to `None` when no work is available; for a local ledger that happens
/// immediately, a remote source may first wait for its prefetch queue.
///
/// The returned future is required to be `Send` so callers can drive engines
/// from spawned Tokio tasks regardless of the concrete source.
///
/// [`Ledger`]: crate::Ledger
/// [`Tracking`]: crate::Tracking
pub trait Database: Send + Sync {
    type Entry: Entry + 'static;

    fn fetch_unsolved(&self) -> impl Future<Output = Option<Self::Entry>> + Send;
}
