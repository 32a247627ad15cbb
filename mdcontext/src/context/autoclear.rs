// SPDX-License-Identifier: AGPL-3.0-only

//! Buffers zeroed before every force/energy evaluation.
//!
//! Registration order is kept. Clearing is planned in groups of up to
//! six buffers per dispatch; each dispatch covers the largest word count
//! in its group.

use crate::backend::BufferBinding;

/// Buffers cleared by one kernel invocation.
pub const MAX_BUFFERS_PER_CLEAR: usize = 6;

/// One registered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoclearEntry {
    pub binding: BufferBinding,
    /// 4-byte words to zero.
    pub words: u32,
}

/// Ordered set of buffers to clear.
#[derive(Debug, Default, Clone)]
pub struct AutoclearRegistry {
    entries: Vec<AutoclearEntry>,
}

impl AutoclearRegistry {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a byte range. Ranges shorter than a word clear nothing.
    pub fn add(&mut self, binding: BufferBinding) {
        let words = u32::try_from(binding.size / 4).unwrap_or(u32::MAX);
        self.entries.push(AutoclearEntry { binding, words });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[AutoclearEntry] {
        &self.entries
    }

    /// Dispatch plan: full groups of six, then the remainder as one group.
    pub fn batches(&self) -> impl Iterator<Item = ClearBatch<'_>> {
        self.entries.chunks(MAX_BUFFERS_PER_CLEAR).map(|entries| ClearBatch {
            entries,
            max_words: entries.iter().map(|e| e.words).max().unwrap_or(0),
        })
    }
}

/// Buffers cleared together by one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct ClearBatch<'a> {
    pub entries: &'a [AutoclearEntry],
    /// Work units of the dispatch.
    pub max_words: u32,
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::backend::AllocationId;
    use proptest::prelude::*;

    fn binding(id: u64, size: u64) -> BufferBinding {
        BufferBinding {
            allocation: AllocationId(id),
            offset: 0,
            size,
        }
    }

    #[test]
    fn words_are_bytes_over_four() {
        let mut r = AutoclearRegistry::new();
        r.add(binding(1, 40));
        r.add(binding(2, 3));
        assert_eq!(r.entries()[0].words, 10);
        assert_eq!(r.entries()[1].words, 0);
    }

    #[test]
    fn thirteen_buffers_make_six_six_one() {
        let mut r = AutoclearRegistry::new();
        for i in 0..13 {
            r.add(binding(i, 4 * (i + 1)));
        }
        let sizes: Vec<usize> = r.batches().map(|b| b.entries.len()).collect();
        assert_eq!(sizes, [6, 6, 1]);
        let maxima: Vec<u32> = r.batches().map(|b| b.max_words).collect();
        assert_eq!(maxima, [6, 12, 13]);
    }

    #[test]
    fn empty_registry_plans_nothing() {
        assert_eq!(AutoclearRegistry::new().batches().count(), 0);
    }

    proptest! {
        #[test]
        fn every_entry_is_planned_once_in_order(n in 0usize..40) {
            let mut r = AutoclearRegistry::new();
            for i in 0..n as u64 {
                r.add(binding(i, 64));
            }
            let planned: Vec<AllocationId> = r
                .batches()
                .flat_map(|b| b.entries.iter().map(|e| e.binding.allocation))
                .collect();
            let expected: Vec<AllocationId> = (0..n as u64).map(AllocationId).collect();
            prop_assert_eq!(planned, expected);
            prop_assert!(r.batches().all(|b| (1..=MAX_BUFFERS_PER_CLEAR).contains(&b.entries.len())));
        }
    }
}
