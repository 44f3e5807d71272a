/// Maps a 44-bit ledger payload to the token an engine works on.
///
/// The mapping must be injective over the payloads a single source hands out
/// since the token is the key results are reported back under.
pub trait Reduction: Send + Sync {
    fn reduce(&self, spec: u64) -> u64;
}

impl<F> Reduction for F
where
    F: Fn(u64) -> u64 + Send + Sync,
{
    fn reduce(&self, spec: u64) -> u64 {
        self(spec)
    }
}

/// Strips the five low bookkeeping bits of a payload and forces the token to
/// odd parity by setting [`ParityReduction::PARITY_BIT`] when needed.
///
/// ```
/// use casebook::{ParityReduction, Reduction};
///
/// assert_eq!(ParityReduction.reduce(0b1_00000), 0b1);
/// assert_eq!(ParityReduction.reduce(0b11_00000), 0b11 | ParityReduction::PARITY_BIT);
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct ParityReduction;

impl ParityReduction {
    pub const PARITY_BIT: u64 = 1 << 39;
}

impl Reduction for ParityReduction {
    fn reduce(&self, spec: u64) -> u64 {
        let token = spec >> 5;
        if token.count_ones() % 2 == 0 {
            token | Self::PARITY_BIT
        } else {
            token
        }
    }
}

/// Hands payloads to the engine unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityReduction;

impl Reduction for IdentityReduction {
    fn reduce(&self, spec: u64) -> u64 {
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_tokens_are_always_odd() {
        for spec in [0u64, 1 << 5, 0xFFFF_FFE0, 0x0FFF_FFFF_FFFF] {
            assert_eq!(ParityReduction.reduce(spec).count_ones() % 2, 1, "{spec:#x}");
        }
    }

    #[test]
    fn closures_reduce() {
        let double = |spec: u64| spec * 2;
        assert_eq!(double.reduce(21), 42);
        assert_eq!(IdentityReduction.reduce(7), 7);
    }
}
