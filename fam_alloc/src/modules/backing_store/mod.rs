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

mod extent_store;
#[cfg(all(feature = "use_libc", unix))]
mod mmap;

pub use extent_store::ExtentBackingStore;
#[cfg(all(feature = "use_libc", unix))]
pub use mmap::MmapBackingStore;

use thiserror::Error;

use super::placement::PlacementModule;
use crate::extent::Extent;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No contiguous free extent of the requested length exists.
    #[error("no free extent of {requested} bytes (largest free extent is {largest_free} bytes)")]
    NoSpace { requested: u64, largest_free: u64 },

    /// The released extent was (partly) free already.
    #[error("extent {extent} overlaps free extent {free}")]
    DoubleRelease { extent: Extent, free: Extent },

    /// The extent does not lie inside the store.
    #[error("extent {extent} lies outside of the store capacity {capacity}")]
    OutOfBounds { extent: Extent, capacity: u64 },

    /// Setting up or changing the underlying memory failed.
    #[error("backing memory operation failed: {0}")]
    Memory(#[from] std::io::Error),
}

/// A contiguous addressable extent of physical or virtual memory that regions are carved from.
///
/// Implementations do no locking of their own, callers have to serialize access.
pub trait BackingStoreModule: Send {
    /// Total number of bytes this store manages
    fn capacity(&self) -> u64;

    /// Granularity every reserved extent is aligned to.
    ///
    /// Callers round lengths up to a multiple of this before calling `reserve`.
    fn alignment(&self) -> u64 {
        1
    }

    /// Reserves `length` contiguous bytes at a position chosen by `placement`
    fn reserve(&mut self, length: u64, placement: &dyn PlacementModule) -> Result<Extent, StoreError>;

    /// Returns a previously reserved extent
    fn release(&mut self, extent: Extent) -> Result<(), StoreError>;

    /// Number of bytes that are currently not reserved
    fn free_bytes(&self) -> u64;

    /// Length of the largest free extent
    fn largest_free(&self) -> u64;

    /// All free extents in ascending offset order
    fn free_extents(&self) -> Vec<Extent>;

    /// Discards the free space bookkeeping and recomputes it from the extents that are in use
    fn rebuild(&mut self, live: &[Extent]);
}

#[cfg(test)]
pub(crate) mod test {
    use super::{BackingStoreModule, StoreError};
    use crate::{
        extent::Extent,
        modules::placement::{BestFitPlacement, FirstFitPlacement},
    };

    /// Reserve/release cycle every store has to pass.
    ///
    /// `unit` has to be a multiple of the store's alignment and the store
    /// needs a capacity of exactly `8 * unit`.
    pub(crate) fn test_backing_store_generic<B: BackingStoreModule>(mut store: B, unit: u64) {
        assert_eq!(store.capacity(), 8 * unit);
        assert_eq!(store.free_bytes(), store.capacity());

        let a = store.reserve(2 * unit, &FirstFitPlacement).unwrap();
        let b = store.reserve(unit, &FirstFitPlacement).unwrap();
        let c = store.reserve(unit, &FirstFitPlacement).unwrap();
        assert_eq!(a, Extent::new(0, 2 * unit));
        assert_eq!(b, Extent::new(2 * unit, unit));
        assert_eq!(c, Extent::new(3 * unit, unit));
        assert_eq!(store.free_bytes(), 4 * unit);

        // hole of one unit at the front of b
        store.release(b).unwrap();
        assert_eq!(store.free_extents(), vec![b, Extent::new(4 * unit, 4 * unit)]);

        // best fit goes into the hole, first fit too
        let d = store.reserve(unit, &BestFitPlacement).unwrap();
        assert_eq!(d, b);

        match store.reserve(5 * unit, &FirstFitPlacement) {
            Err(StoreError::NoSpace {
                requested,
                largest_free,
            }) => {
                assert_eq!(requested, 5 * unit);
                assert_eq!(largest_free, 4 * unit);
            }
            other => panic!("expected NoSpace, got {:?}", other),
        }

        store.release(a).unwrap();
        assert!(matches!(
            store.release(a),
            Err(StoreError::DoubleRelease { .. })
        ));
        assert!(matches!(
            store.release(Extent::new(8 * unit, unit)),
            Err(StoreError::OutOfBounds { .. })
        ));

        store.release(c).unwrap();
        store.release(d).unwrap();
        assert_eq!(store.free_extents(), vec![Extent::new(0, 8 * unit)]);
        assert_eq!(store.free_bytes(), store.capacity());

        // rebuild from a live set
        let live = [Extent::new(unit, unit), Extent::new(6 * unit, 2 * unit)];
        store.rebuild(&live);
        assert_eq!(
            store.free_extents(),
            vec![Extent::new(0, unit), Extent::new(2 * unit, 4 * unit)]
        );
        assert_eq!(store.largest_free(), 4 * unit);
    }
}
