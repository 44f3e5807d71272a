use super::stamp::ClaimStamp;
use core::fmt;

/// Width of the case payload held in the high bits of the spec word.
pub const PAYLOAD_BITS: u32 = 44;
/// Width of the claim stamp held in the low bits of the spec word.
pub const STAMP_BITS: u32 = 20;
/// Mask selecting the claim stamp of a spec word.
pub const STAMP_MASK: u64 = (1 << STAMP_BITS) - 1;
/// Largest representable case payload.
pub const MAX_PAYLOAD: u64 = (1 << PAYLOAD_BITS) - 1;

/// Number of low result-word bits supplied by the reporting engine.
pub const RESULT_BITS: u32 = 52;
/// Mask selecting the caller-supplied part of a result word.
pub const RESULT_MASK: u64 = (1 << RESULT_BITS) - 1;
/// Mask selecting the count field of a result word.
pub const COUNT_MASK: u64 = (1 << 44) - 1;
/// Bit offset of the attributing solver ID in a result word.
pub const SOLVER_SHIFT: u32 = 52;
/// Number of distinct solver IDs a result word can carry.
pub const SOLVER_ID_CAPACITY: usize = 1 << (64 - SOLVER_SHIFT);

/// Packs the caller-supplied part of a result word.
///
/// ```text
///  Bit Index:  51     48 47     44 43                       0
///              +--------+---------+--------------------------+
///  Field:      | tag_hi | tag_lo  |          count           |
///              +--------+---------+--------------------------+
/// ```
///
/// Both tags are opaque 4-bit values; only their low nibble is kept. The
/// count is truncated to 44 bits.
pub const fn pack_result(count: u64, tag_lo: u8, tag_hi: u8) -> u64 {
    ((tag_hi as u64 & 0xF) << 48) | ((tag_lo as u64 & 0xF) << 44) | (count & COUNT_MASK)
}

/// One ledger record: a pair of 64-bit words stored big-endian on disk.
///
/// ```text
///  spec word:    63                     20 19              0
///               +-------------------------+-----------------+
///               |      case payload       |   claim stamp   |
///               +-------------------------+-----------------+
///
///  result word:  63        52 51                            0
///               +------------+------------------------------+
///               | solver ID  |   result (see pack_result)   |
///               +------------+------------------------------+
/// ```
///
/// A record is *available* when its claim stamp is zero and its result word
/// is zero; *taken* when it carries a claim stamp but no result; and
/// *solved* once the result word is non-zero. A solved record is never
/// overwritten.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Record {
    spec_word: u64,
    result_word: u64,
}

impl Record {
    /// Size of one record in bytes.
    pub const SIZE: usize = 16;

    /// A fresh, available record for `payload`.
    pub const fn new(payload: u64) -> Self {
        Self {
            spec_word: (payload & MAX_PAYLOAD) << STAMP_BITS,
            result_word: 0,
        }
    }

    pub const fn from_words(spec_word: u64, result_word: u64) -> Self {
        Self {
            spec_word,
            result_word,
        }
    }

    pub fn from_be_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let (spec, result) = bytes.split_at(8);
        Self {
            spec_word: u64::from_be_bytes(spec.try_into().unwrap_or_default()),
            result_word: u64::from_be_bytes(result.try_into().unwrap_or_default()),
        }
    }

    pub fn to_be_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        out[..8].copy_from_slice(&self.spec_word.to_be_bytes());
        out[8..].copy_from_slice(&self.result_word.to_be_bytes());
        out
    }

    pub const fn spec_word(&self) -> u64 {
        self.spec_word
    }

    pub const fn result_word(&self) -> u64 {
        self.result_word
    }

    pub const fn payload(&self) -> u64 {
        self.spec_word >> STAMP_BITS
    }

    pub const fn stamp(&self) -> ClaimStamp {
        ClaimStamp::from_raw((self.spec_word & STAMP_MASK) as u32)
    }

    pub const fn is_claimed(&self) -> bool {
        self.spec_word & STAMP_MASK != 0
    }

    pub const fn is_solved(&self) -> bool {
        self.result_word != 0
    }

    pub const fn is_available(&self) -> bool {
        !self.is_claimed() && !self.is_solved()
    }

    /// Claimed but not (yet) solved.
    pub const fn is_taken(&self) -> bool {
        self.is_claimed() && !self.is_solved()
    }

    pub const fn solver(&self) -> Option<u32> {
        if self.is_solved() {
            Some((self.result_word >> SOLVER_SHIFT) as u32)
        } else {
            None
        }
    }

    /// The caller-supplied part of the result word.
    pub const fn result(&self) -> u64 {
        self.result_word & RESULT_MASK
    }

    pub const fn count(&self) -> u64 {
        self.result_word & COUNT_MASK
    }

    pub const fn tag_lo(&self) -> u8 {
        ((self.result_word >> 44) & 0xF) as u8
    }

    pub const fn tag_hi(&self) -> u8 {
        ((self.result_word >> 48) & 0xF) as u8
    }

    pub(crate) const fn with_stamp(self, stamp: ClaimStamp) -> Self {
        Self {
            spec_word: (self.spec_word & !STAMP_MASK) | stamp.raw() as u64,
            result_word: self.result_word,
        }
    }

    pub(crate) const fn cleared(self) -> Self {
        Self {
            spec_word: self.spec_word & !STAMP_MASK,
            result_word: self.result_word,
        }
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:011X}: ", self.payload())?;
        if self.is_claimed() {
            write!(f, "{} ", self.stamp())?;
        }
        match self.solver() {
            Some(solver) => write!(
                f,
                "SOLVED by [{solver}]: {:15} [{:2},{:2}]",
                self.count(),
                self.tag_hi(),
                self.tag_lo()
            ),
            None if self.is_claimed() => f.write_str("TAKEN"),
            None => f.write_str("?"),
        }
    }
}
