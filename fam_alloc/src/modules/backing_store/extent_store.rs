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

use log::trace;

use super::{BackingStoreModule, StoreError};
use crate::{
    extent::Extent,
    modules::{free_space::FreeSpaceIndex, placement::PlacementModule},
};

/// Backing store that only manages address space.
///
/// Nothing is mapped, offsets are handed to a fabric driver that owns the
/// actual memory.
#[derive(Debug, Clone)]
pub struct ExtentBackingStore {
    capacity: u64,
    free: FreeSpaceIndex,
}

impl ExtentBackingStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            free: FreeSpaceIndex::with_span(Extent::new(0, capacity)),
        }
    }
}

impl BackingStoreModule for ExtentBackingStore {
    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn reserve(&mut self, length: u64, placement: &dyn PlacementModule) -> Result<Extent, StoreError> {
        debug_assert_ne!(length, 0, "zero sized reservations are rejected by the caller");

        let extent = match placement.select(&self.free, length) {
            Some(offset) => self.free.take(offset, length),
            None => None,
        };
        let extent = extent.ok_or_else(|| StoreError::NoSpace {
            requested: length,
            largest_free: self.free.largest(),
        })?;

        trace!(
            "reserved {} ({:?}), {} bytes free",
            extent,
            placement.kind(),
            self.free.free_bytes()
        );

        Ok(extent)
    }

    fn release(&mut self, extent: Extent) -> Result<(), StoreError> {
        if !matches!(extent.offset.checked_add(extent.length), Some(end) if end <= self.capacity) {
            return Err(StoreError::OutOfBounds {
                extent,
                capacity: self.capacity,
            });
        }

        self.free
            .insert(extent)
            .map_err(|free| StoreError::DoubleRelease { extent, free })?;

        trace!("released {}, {} bytes free", extent, self.free.free_bytes());
        Ok(())
    }

    fn free_bytes(&self) -> u64 {
        self.free.free_bytes()
    }

    fn largest_free(&self) -> u64 {
        self.free.largest()
    }

    fn free_extents(&self) -> Vec<Extent> {
        self.free.iter().collect()
    }

    fn rebuild(&mut self, live: &[Extent]) {
        self.free = FreeSpaceIndex::rebuild(Extent::new(0, self.capacity), live.iter().copied());
    }
}
