//! Two-accumulator summing checksum.
//!
//! Both accumulators start at `0x7E`. Each byte is added to the first, and the
//! first is added to the second, all modulo 256. The result packs them as
//! `second - ((first + second) << 8)` in 16 bits.

const SEED: u8 = 0x7E;

/// Checksum of `data`.
pub fn calculate(data: &[u8]) -> u16 {
    let (first, second) = data.iter().fold((SEED, SEED), |(first, second), &b| {
        let first = first.wrapping_add(b);
        (first, second.wrapping_add(first))
    });
    let folded = (u16::from(first) + u16::from(second)) << 8;
    u16::from(second).wrapping_sub(folded)
}

/// True if `data` checksums to `expected`.
pub fn verify(data: &[u8], expected: u16) -> bool {
    calculate(data) == expected
}
