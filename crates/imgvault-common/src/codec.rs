//! Numeric packing helpers
//!
//! Two narrow values are packed into one wider integer as `hi << width | lo`.
//! The packing is used to build stable identifiers (disk ids, ring keys) and
//! must never change: every node in the cluster derives ring positions from it.

/// Pack two 16-bit values into a 32-bit value
#[inline]
#[must_use]
pub const fn combine16(hi: u16, lo: u16) -> u32 {
    ((hi as u32) << 16) | lo as u32
}

/// Split a 32-bit value into its high and low 16-bit halves
#[inline]
#[must_use]
pub const fn split16(v: u32) -> (u16, u16) {
    ((v >> 16) as u16, v as u16)
}

/// Pack two 32-bit values into a 64-bit value
#[inline]
#[must_use]
pub const fn combine32(hi: u32, lo: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

/// Split a 64-bit value into its high and low 32-bit halves
#[inline]
#[must_use]
pub const fn split32(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}
