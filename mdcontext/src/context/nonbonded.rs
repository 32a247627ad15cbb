// SPDX-License-Identifier: AGPL-3.0-only

//! Interaction partition and neighbor-list capacity of one context.
//!
//! The pairwise kernels themselves live elsewhere; this is the state they
//! share with the multi-device orchestrator. Atoms are grouped into
//! 32-atom blocks and block pairs into tiles (upper triangle including the
//! diagonal). A context owns the slice of blocks and tiles given by its
//! partition fractions.

use super::defines::TILE_SIZE;
use crate::array::DeviceArray;
use crate::backend::ComputeBackend;
use crate::error::{ContextError, Result};
use std::sync::Arc;

/// Tiles allotted per atom block before the first neighbor-list build.
const INITIAL_TILES_PER_BLOCK: usize = 20;

/// Head room added when the neighbor list overflows.
const GROWTH_FACTOR: f64 = 1.2;

/// The block and tile slice a context computes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AtomBlockRange {
    pub start_fraction: f64,
    pub end_fraction: f64,
    pub start_block: usize,
    pub num_blocks: usize,
    pub start_tile: usize,
    pub num_tiles: usize,
}

#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn fraction_of(total: usize, f: f64) -> usize {
    (f * total as f64).floor() as usize
}

/// Partition plus neighbor-list arrays.
#[derive(Debug)]
pub struct NonbondedPartition {
    periodic: bool,
    num_atom_blocks: usize,
    range: AtomBlockRange,
    max_tiles: usize,
    interaction_count: DeviceArray,
    interacting_tiles: DeviceArray,
}

impl NonbondedPartition {
    /// Whole-system partition for `padded_atoms` atoms.
    ///
    /// # Errors
    ///
    /// [`ContextError::Allocation`] if the neighbor-list arrays do not fit.
    pub fn new(backend: &Arc<dyn ComputeBackend>, padded_atoms: usize, periodic: bool) -> Result<Self> {
        let num_atom_blocks = padded_atoms.div_ceil(TILE_SIZE);
        let total_tiles = num_atom_blocks * (num_atom_blocks + 1) / 2;
        let max_tiles = if periodic {
            (INITIAL_TILES_PER_BLOCK * num_atom_blocks).min(total_tiles)
        } else {
            total_tiles
        };
        let interaction_count = DeviceArray::create_typed::<u32>(backend, 1, "interactionCount")?;
        interaction_count.upload(&[0u32], true)?;
        let interacting_tiles =
            DeviceArray::create_typed::<i32>(backend, max_tiles.max(1), "interactingTiles")?;
        let mut partition = Self {
            periodic,
            num_atom_blocks,
            range: AtomBlockRange {
                start_fraction: 0.0,
                end_fraction: 1.0,
                start_block: 0,
                num_blocks: 0,
                start_tile: 0,
                num_tiles: 0,
            },
            max_tiles,
            interaction_count,
            interacting_tiles,
        };
        partition.set_atom_block_range(0.0, 1.0)?;
        Ok(partition)
    }

    /// Restrict this context to the `[start, end)` fraction of the work.
    ///
    /// # Errors
    ///
    /// [`ContextError::IllegalArgument`] unless `0 <= start <= end <= 1`.
    pub fn set_atom_block_range(&mut self, start: f64, end: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&start) || !(start..=1.0).contains(&end) {
            return Err(ContextError::IllegalArgument(format!(
                "atom block range [{start}, {end}) is not a sub-range of [0, 1]"
            )));
        }
        let blocks = self.num_atom_blocks;
        let total_tiles = self.total_tiles();
        let start_block = fraction_of(blocks, start);
        let start_tile = fraction_of(total_tiles, start);
        self.range = AtomBlockRange {
            start_fraction: start,
            end_fraction: end,
            start_block,
            num_blocks: fraction_of(blocks, end) - start_block,
            start_tile,
            num_tiles: fraction_of(total_tiles, end) - start_tile,
        };
        log::debug!(
            "atom block range [{start:.4}, {end:.4}): blocks {}+{}, tiles {}+{}",
            self.range.start_block,
            self.range.num_blocks,
            self.range.start_tile,
            self.range.num_tiles
        );
        Ok(())
    }

    #[must_use]
    pub const fn range(&self) -> &AtomBlockRange {
        &self.range
    }

    #[must_use]
    pub const fn periodic(&self) -> bool {
        self.periodic
    }

    #[must_use]
    pub const fn num_atom_blocks(&self) -> usize {
        self.num_atom_blocks
    }

    /// Block pairs in the upper triangle, diagonal included.
    #[must_use]
    pub const fn total_tiles(&self) -> usize {
        self.num_atom_blocks * (self.num_atom_blocks + 1) / 2
    }

    /// Tiles the neighbor list can hold.
    #[must_use]
    pub const fn max_tiles(&self) -> usize {
        self.max_tiles
    }

    /// Device counter the neighbor-list kernel writes its tile count to.
    #[must_use]
    pub const fn interaction_count(&self) -> &DeviceArray {
        &self.interaction_count
    }

    #[must_use]
    pub const fn interacting_tiles(&self) -> &DeviceArray {
        &self.interacting_tiles
    }

    /// Read the tile count of the last neighbor-list build.
    ///
    /// # Errors
    ///
    /// Transfer failures from the backend.
    pub fn download_interaction_count(&self) -> Result<usize> {
        let mut count = [0u32];
        self.interaction_count.download_into(&mut count)?;
        Ok(count[0] as usize)
    }

    /// Grow the neighbor list after `observed` tiles overflowed it.
    ///
    /// Returns whether the capacity changed.
    ///
    /// # Errors
    ///
    /// [`ContextError::Allocation`] if the larger list does not fit.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn update_neighbor_list_size(&mut self, observed: usize) -> Result<bool> {
        if observed <= self.max_tiles {
            return Ok(false);
        }
        let grown = (GROWTH_FACTOR * observed as f64) as usize;
        log::info!(
            "neighbor list overflow: {observed} tiles, capacity {} -> {grown}",
            self.max_tiles
        );
        self.max_tiles = grown;
        self.interacting_tiles.resize(grown)?;
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::{DeviceInfo, HostBackend};

    fn backend() -> Arc<dyn ComputeBackend> {
        Arc::new(HostBackend::new(DeviceInfo {
            name: "test".into(),
            vendor: "Host".into(),
            max_buffer_bytes: 1 << 30,
            max_work_group_size: 256,
            supports_fp64: true,
            supports_timestamps: false,
        }))
    }

    #[test]
    fn whole_range_covers_every_tile() {
        let p = NonbondedPartition::new(&backend(), 320, false).unwrap();
        assert_eq!(p.num_atom_blocks(), 10);
        assert_eq!(p.total_tiles(), 55);
        assert_eq!(p.range().num_blocks, 10);
        assert_eq!(p.range().num_tiles, 55);
        assert_eq!(p.max_tiles(), 55);
    }

    #[test]
    fn periodic_capacity_starts_small() {
        let p = NonbondedPartition::new(&backend(), 32 * 100, true).unwrap();
        assert_eq!(p.max_tiles(), 2000);
        assert_eq!(p.interacting_tiles().size(), 2000);
    }

    #[test]
    fn halves_partition_every_tile_once() {
        let mut a = NonbondedPartition::new(&backend(), 32 * 7, false).unwrap();
        let mut b = NonbondedPartition::new(&backend(), 32 * 7, false).unwrap();
        a.set_atom_block_range(0.0, 0.5).unwrap();
        b.set_atom_block_range(0.5, 1.0).unwrap();
        assert_eq!(a.range().num_tiles + b.range().num_tiles, 28);
        assert_eq!(a.range().start_tile + a.range().num_tiles, b.range().start_tile);
        assert_eq!(a.range().num_blocks + b.range().num_blocks, 7);
    }

    #[test]
    fn rejects_inverted_range() {
        let mut p = NonbondedPartition::new(&backend(), 64, false).unwrap();
        assert!(matches!(
            p.set_atom_block_range(0.6, 0.4),
            Err(ContextError::IllegalArgument(_))
        ));
    }

    #[test]
    fn overflow_grows_by_twenty_percent() {
        let mut p = NonbondedPartition::new(&backend(), 32 * 100, true).unwrap();
        assert!(!p.update_neighbor_list_size(1500).unwrap());
        assert!(p.update_neighbor_list_size(2500).unwrap());
        assert_eq!(p.max_tiles(), 3000);
        assert_eq!(p.interacting_tiles().size(), 3000);
    }

    #[test]
    fn interaction_count_starts_at_zero() {
        let p = NonbondedPartition::new(&backend(), 64, true).unwrap();
        assert_eq!(p.download_interaction_count().unwrap(), 0);
    }
}
