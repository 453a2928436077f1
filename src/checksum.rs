//! UNI-TELWAY block check character.
//!
//! The BCC is the sum modulo 256 of every frame byte as it appears on the
//! wire, `<DLE>` doubling included, from the leading `<DLE> <STX>` up to the
//! last data byte. The BCC itself is not covered.

/// Compute the BCC of `bytes`.
pub fn compute(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Check `bytes` against a received BCC.
pub fn verify(bytes: &[u8], bcc: u8) -> bool {
    compute(bytes) == bcc
}
