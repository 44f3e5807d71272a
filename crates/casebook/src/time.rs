use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::time::Instant;

/// A trait for time sources that return a wall-clock aligned timestamp in
/// **milliseconds since the Unix epoch**.
///
/// Lease expiry, pending-case deadlines and ledger claim stamps all read time
/// through this trait so tests can drive them with a mocked clock.
///
/// # Example
///
/// ```
/// use casebook::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn current_millis(&self) -> u64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.current_millis(), 1234);
/// ```
pub trait TimeSource: Send + Sync {
    /// Returns the current time in milliseconds since 1970-01-01 UTC.
    fn current_millis(&self) -> u64;
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }
}

/// A monotonic time source anchored to the wall clock at construction.
///
/// The wall-clock offset is captured once, and every later reading adds the
/// elapsed monotonic time since then. Timestamps therefore never go backward
/// even if the system clock is adjusted, while still lining up with calendar
/// time closely enough for the 4-minute resolution of ledger claim stamps.
///
/// Elapsed time is measured with [`tokio::time::Instant`], so a paused Tokio
/// test runtime advances this clock together with its timers.
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    start: Instant,
    epoch_offset: u64, // in milliseconds
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    /// Constructs a clock whose zero point is the Unix epoch.
    ///
    /// A system clock set before 1970 is treated as the epoch itself.
    pub fn new() -> Self {
        let epoch_offset = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        Self {
            start: Instant::now(),
            epoch_offset,
        }
    }
}

impl TimeSource for MonotonicClock {
    fn current_millis(&self) -> u64 {
        self.epoch_offset + self.start.elapsed().as_millis() as u64
    }
}

/// A manually driven time source for tests and simulations.
///
/// Clones share the same underlying instant, so a test can hand one clone to
/// the component under test and keep another to advance time.
///
/// ```
/// use casebook::{ManualClock, TimeSource};
///
/// let clock = ManualClock::new(1_000);
/// let shared = clock.clone();
/// clock.advance(std::time::Duration::from_secs(1));
/// assert_eq!(shared.current_millis(), 2_000);
/// ```
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }
}

impl TimeSource for ManualClock {
    fn current_millis(&self) -> u64 {
        self.millis.load(Ordering::Acquire)
    }
}
