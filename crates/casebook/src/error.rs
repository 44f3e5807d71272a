use std::io;

/// A result type defaulting to the crate's [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors `casebook` can surface.
///
/// Reporting inconsistencies (duplicate results, generation mismatches,
/// unknown tokens) are *not* errors: they are logged and answered
/// with a `bool` from [`Entry::solve`]. What remains here are failures the
/// caller has to act on.
///
/// [`Entry::solve`]: crate::Entry::solve
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Reading, mapping or flushing the ledger file failed.
    #[error("ledger I/O error: {0}")]
    Io(#[from] io::Error),

    /// The ledger file is empty or its size is not a whole number of records.
    #[error("truncated ledger: {len} bytes is not a positive multiple of 16")]
    TruncatedLedger { len: u64 },

    /// Every identity in an [`IdPool`](crate::IdPool) is held by a live owner.
    #[error("ID pool exhausted (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}
