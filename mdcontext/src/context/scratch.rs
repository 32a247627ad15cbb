// SPDX-License-Identifier: AGPL-3.0-only

//! Host staging memory for bulk transfers.
//!
//! Each use gets its own region, sized for that use alone, so adding a
//! new transfer path cannot silently alias an existing one. Regions are
//! backed by `u64` words and therefore 8-byte aligned for every element
//! type the context transfers.

use crate::error::{ContextError, Result};
use std::collections::HashMap;

/// What a scratch region is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchUse {
    /// Initial velocities and inverse masses.
    Velocities,
    /// Energy partial sums read back after reduction.
    Energy,
    /// Fixed-point force accumulators.
    LongForces,
}

#[derive(Debug, Default)]
struct Region {
    words: Vec<u64>,
    bytes: usize,
}

/// Named host staging regions.
#[derive(Debug, Default)]
pub struct ScratchArena {
    regions: HashMap<ScratchUse, Region>,
}

impl ScratchArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure the region for `usage` holds at least `bytes` bytes.
    pub fn reserve(&mut self, usage: ScratchUse, bytes: usize) {
        let region = self.regions.entry(usage).or_default();
        if bytes > region.bytes {
            region.words.resize(bytes.div_ceil(8), 0);
            region.bytes = bytes;
        }
    }

    /// Bytes reserved for `usage`; zero if never reserved.
    #[must_use]
    pub fn capacity(&self, usage: ScratchUse) -> usize {
        self.regions.get(&usage).map_or(0, |r| r.bytes)
    }

    /// The first `len` bytes of a region.
    ///
    /// # Errors
    ///
    /// [`ContextError::InvalidState`] if the region is smaller than `len`.
    pub fn bytes_mut(&mut self, usage: ScratchUse, len: usize) -> Result<&mut [u8]> {
        let region = self
            .regions
            .get_mut(&usage)
            .filter(|r| r.bytes >= len)
            .ok_or_else(|| {
                ContextError::InvalidState(format!("scratch region {usage:?} holds fewer than {len} bytes"))
            })?;
        let all: &mut [u8] = bytemuck::cast_slice_mut(&mut region.words);
        Ok(&mut all[..len])
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn regions_are_independent() {
        let mut s = ScratchArena::new();
        s.reserve(ScratchUse::Velocities, 64);
        s.reserve(ScratchUse::Energy, 12);
        s.bytes_mut(ScratchUse::Velocities, 64).unwrap().fill(0xaa);
        assert!(s.bytes_mut(ScratchUse::Energy, 12).unwrap().iter().all(|&b| b == 0));
        assert_eq!(s.capacity(ScratchUse::Energy), 12);
    }

    #[test]
    fn reserve_only_grows() {
        let mut s = ScratchArena::new();
        s.reserve(ScratchUse::LongForces, 100);
        s.reserve(ScratchUse::LongForces, 10);
        assert_eq!(s.capacity(ScratchUse::LongForces), 100);
    }

    #[test]
    fn oversized_request_is_invalid_state() {
        let mut s = ScratchArena::new();
        assert!(matches!(
            s.bytes_mut(ScratchUse::Energy, 4),
            Err(ContextError::InvalidState(_))
        ));
        s.reserve(ScratchUse::Energy, 4);
        assert!(s.bytes_mut(ScratchUse::Energy, 8).is_err());
    }

    #[test]
    fn regions_are_eight_byte_aligned() {
        let mut s = ScratchArena::new();
        s.reserve(ScratchUse::Velocities, 24);
        let bytes = s.bytes_mut(ScratchUse::Velocities, 24).unwrap();
        let doubles: &mut [f64] = bytemuck::cast_slice_mut(bytes);
        doubles[2] = 1.5;
        assert_eq!(doubles.len(), 3);
    }
}
