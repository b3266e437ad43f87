/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::collections::BTreeMap;

use crate::extent::Extent;

/// Index of unallocated extents, ordered by ascending offset.
///
/// Free extents never overlap and never touch: an extent that is returned
/// next to an existing free extent is merged with it right away.
/// The index is a cache, it can always be rebuilt from the live regions
/// (see [`FreeSpaceIndex::rebuild`]).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeSpaceIndex {
    /// offset -> length
    extents: BTreeMap<u64, u64>,
    free_bytes: u64,
}

impl FreeSpaceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an index where all of `span` is free
    pub fn with_span(span: Extent) -> Self {
        let mut index = Self::new();
        if !span.is_empty() {
            index.extents.insert(span.offset, span.length);
            index.free_bytes = span.length;
        }
        index
    }

    /// Recomputes the free extents of `span` given all extents that are in use.
    ///
    /// `live` does not have to be sorted. Overlapping live extents are tolerated,
    /// they simply cover the union of both.
    pub fn rebuild<I: IntoIterator<Item = Extent>>(span: Extent, live: I) -> Self {
        let mut used: Vec<Extent> = live.into_iter().filter(|e| !e.is_empty()).collect();
        used.sort_by_key(|e| e.offset);

        let mut index = Self::new();
        let mut cursor = span.offset;
        for extent in used {
            if extent.offset > cursor {
                index.push_unchecked(Extent::new(cursor, extent.offset.min(span.end()) - cursor));
            }
            cursor = cursor.max(extent.end());
            if cursor >= span.end() {
                break;
            }
        }

        if cursor < span.end() {
            index.push_unchecked(Extent::new(cursor, span.end() - cursor));
        }

        index
    }

    fn push_unchecked(&mut self, extent: Extent) {
        self.extents.insert(extent.offset, extent.length);
        self.free_bytes += extent.length;
    }

    /// Iterates over all free extents in ascending offset order
    pub fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.extents
            .iter()
            .map(|(offset, length)| Extent::new(*offset, *length))
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    pub fn largest(&self) -> u64 {
        self.extents.values().copied().max().unwrap_or(0)
    }

    /// Returns the free extent that contains `offset`
    fn containing(&self, offset: u64) -> Option<Extent> {
        self.extents
            .range(..=offset)
            .next_back()
            .map(|(start, length)| Extent::new(*start, *length))
            .filter(|free| offset < free.end())
    }

    /// Returns `true` if every byte of `extent` is free
    pub fn is_free(&self, extent: &Extent) -> bool {
        self.containing(extent.offset)
            .map(|free| free.contains(extent))
            .unwrap_or(false)
    }

    /// Removes `[offset, offset + length)` from the free space.
    ///
    /// The whole range has to lie inside a single free extent, what is left
    /// of that extent before and after the range stays free.
    pub fn take(&mut self, offset: u64, length: u64) -> Option<Extent> {
        let wanted = Extent::new(offset, length);
        let free = self.containing(offset)?;
        if wanted.is_empty() || !free.contains(&wanted) {
            return None;
        }

        self.extents.remove(&free.offset);
        if free.offset < wanted.offset {
            self.extents.insert(free.offset, wanted.offset - free.offset);
        }
        if wanted.end() < free.end() {
            self.extents.insert(wanted.end(), free.end() - wanted.end());
        }
        self.free_bytes -= length;

        Some(wanted)
    }

    /// Returns `extent` to the free space and merges it with its neighbours.
    ///
    /// If `extent` overlaps free space it was not allocated (or was already
    /// returned), the overlapping free extent is returned as error and nothing changes.
    pub fn insert(&mut self, extent: Extent) -> Result<(), Extent> {
        if extent.is_empty() {
            return Ok(());
        }

        let prev = self
            .extents
            .range(..extent.end())
            .next_back()
            .map(|(offset, length)| Extent::new(*offset, *length));

        if let Some(prev) = prev {
            if prev.overlaps(&extent) {
                return Err(prev);
            }
        }

        let mut merged = extent;

        // merge with the extent right before
        if let Some(prev) = prev.filter(|prev| prev.end() == extent.offset) {
            self.extents.remove(&prev.offset);
            merged = Extent::new(prev.offset, prev.length + merged.length);
        }

        // merge with the extent right after
        if let Some(next_length) = self.extents.remove(&extent.end()) {
            merged = Extent::new(merged.offset, merged.length + next_length);
        }

        self.extents.insert(merged.offset, merged.length);
        self.free_bytes += extent.length;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rand::{rngs::SmallRng, seq::SliceRandom, SeedableRng};

    use super::FreeSpaceIndex;
    use crate::extent::Extent;

    const SPAN: Extent = Extent::new(0, 1024);

    fn extents(index: &FreeSpaceIndex) -> Vec<Extent> {
        index.iter().collect()
    }

    #[test]
    fn test_take_splits_extent() {
        let mut index = FreeSpaceIndex::with_span(SPAN);

        assert_eq!(index.take(0, 64), Some(Extent::new(0, 64)));
        assert_eq!(index.take(128, 64), Some(Extent::new(128, 64)));
        assert_eq!(
            extents(&index),
            vec![Extent::new(64, 64), Extent::new(192, 832)]
        );
        assert_eq!(index.free_bytes(), 1024 - 128);
        assert_eq!(index.largest(), 832);

        // not free anymore
        assert!(index.take(0, 64).is_none());
        // crosses a used extent
        assert!(index.take(64, 128).is_none());
        // zero sized
        assert!(index.take(64, 0).is_none());
        assert_eq!(index.free_bytes(), 1024 - 128);
    }

    #[test]
    fn test_insert_coalesces_neighbours() {
        let mut index = FreeSpaceIndex::with_span(SPAN);
        for i in 0..4 {
            index.take(i * 256, 256).unwrap();
        }
        assert!(index.is_empty());

        index.insert(Extent::new(0, 256)).unwrap();
        index.insert(Extent::new(512, 256)).unwrap();
        assert_eq!(index.len(), 2);

        // fills the hole: all three merge into one
        index.insert(Extent::new(256, 256)).unwrap();
        assert_eq!(extents(&index), vec![Extent::new(0, 768)]);

        index.insert(Extent::new(768, 256)).unwrap();
        assert_eq!(extents(&index), vec![SPAN]);
        assert_eq!(index.free_bytes(), SPAN.length);
    }

    #[test]
    fn test_insert_rejects_double_release() {
        let mut index = FreeSpaceIndex::with_span(SPAN);
        index.take(0, 512).unwrap();
        index.insert(Extent::new(0, 256)).unwrap();

        let before = index.clone();
        assert_eq!(index.insert(Extent::new(0, 256)), Err(Extent::new(0, 256)));
        assert_eq!(index.insert(Extent::new(128, 256)), Err(Extent::new(0, 256)));
        // overlaps the free tail [512, 1024)
        assert_eq!(index.insert(Extent::new(256, 512)), Err(Extent::new(512, 512)));
        assert_eq!(index, before);
    }

    #[test]
    fn test_rebuild_matches_incremental_state() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let mut index = FreeSpaceIndex::with_span(SPAN);
        let mut live: Vec<Extent> = (0..16).map(|i| index.take(i * 64, 64).unwrap()).collect();
        live.shuffle(&mut rng);

        while let Some(extent) = live.pop() {
            index.insert(extent).unwrap();
            assert_eq!(index, FreeSpaceIndex::rebuild(SPAN, live.iter().copied()));

            if live.len() % 3 == 0 {
                // consistency with is_free
                assert!(index.is_free(&extent));
                assert!(live.iter().all(|e| !index.is_free(e)));
            }
        }
    }

    #[test]
    fn test_rebuild_with_overlapping_and_edge_extents() {
        let live = [Extent::new(0, 100), Extent::new(50, 100), Extent::new(1000, 100)];
        let index = FreeSpaceIndex::rebuild(SPAN, live);
        assert_eq!(extents(&index), vec![Extent::new(150, 850)]);
        assert_eq!(index.free_bytes(), 850);
    }
}
