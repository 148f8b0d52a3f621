//! # Identity Hashing
//!
//! 64-bit FNV-1a accumulation for effect identities and signature hashes.
//!
//! Effect ids are hashed from an identifier string (`package/module/Name`
//! or an explicit id) and split into two 32-bit halves so they fit the
//! 32-bit word formats of the effect table and the exchange buffer.
//!
//! ```text
//! EffectId(0x1234_5678_9abc_def0)
//!   hi = 0x1234_5678
//!   lo = 0x9abc_def0
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// FNV-1a 64-bit offset basis.
pub const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime.
pub const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Incremental FNV-1a accumulator.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a {
    state: u64,
}

impl Fnv1a {
    pub fn new() -> Self {
        Self {
            state: FNV_OFFSET_BASIS,
        }
    }

    /// Feed raw bytes.
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.state ^= u64::from(byte);
            self.state = self.state.wrapping_mul(FNV_PRIME);
        }
    }

    /// Feed a single tag byte.
    pub fn update_u8(&mut self, value: u8) {
        self.update(&[value]);
    }

    /// Feed a u32 value (little-endian).
    pub fn update_u32(&mut self, value: u32) {
        self.update(&value.to_le_bytes());
    }

    /// Feed a u64 value (little-endian).
    pub fn update_u64(&mut self, value: u64) {
        self.update(&value.to_le_bytes());
    }

    /// Feed a length-prefixed string, so adjacent strings cannot collide by
    /// shifting bytes between them.
    pub fn update_str(&mut self, value: &str) {
        self.update_u32(value.len() as u32);
        self.update(value.as_bytes());
    }

    pub fn finish(&self) -> u64 {
        self.state
    }

    /// Fold the 64-bit state into 32 bits (`hi ^ lo`).
    pub fn finish_u32(&self) -> u32 {
        fold32(self.state)
    }
}

impl Default for Fnv1a {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a byte string with 64-bit FNV-1a.
pub fn fnv1a64(data: &[u8]) -> u64 {
    let mut hasher = Fnv1a::new();
    hasher.update(data);
    hasher.finish()
}

/// Fold a 64-bit hash into 32 bits.
pub fn fold32(value: u64) -> u32 {
    ((value >> 32) as u32) ^ (value as u32)
}

/// Stable 64-bit identity of an effect declaration.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EffectId(u64);

impl EffectId {
    /// Hash an identifier string. The string is hashed verbatim (no length
    /// prefix) so ids can be reproduced from the identifier alone.
    pub fn from_identifier(identifier: &str) -> Self {
        Self(fnv1a64(identifier.as_bytes()))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn from_parts(hi: u32, lo: u32) -> Self {
        Self((u64::from(hi) << 32) | u64::from(lo))
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn hi(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn lo(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EffectId({:#018x})", self.0)
    }
}

impl fmt::Display for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv_reference_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = Fnv1a::new();
        hasher.update(b"foo");
        hasher.update(b"bar");
        assert_eq!(hasher.finish(), fnv1a64(b"foobar"));
    }

    #[test]
    fn test_effect_id_split() {
        let id = EffectId::from_raw(0x1234_5678_9abc_def0);
        assert_eq!(id.hi(), 0x1234_5678);
        assert_eq!(id.lo(), 0x9abc_def0);
        assert_eq!(EffectId::from_parts(id.hi(), id.lo()), id);
    }

    #[test]
    fn test_effect_id_is_deterministic() {
        let a = EffectId::from_identifier("app/io/Async");
        let b = EffectId::from_identifier("app/io/Async");
        let c = EffectId::from_identifier("app/io/Log");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_length_prefix_separates_strings() {
        let mut ab = Fnv1a::new();
        ab.update_str("ab");
        ab.update_str("c");
        let mut a = Fnv1a::new();
        a.update_str("a");
        a.update_str("bc");
        assert_ne!(ab.finish(), a.finish());
    }
}
