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

use serde::{Deserialize, Serialize};

use super::free_space::FreeSpaceIndex;

/// Decides which free extent a new region is carved from.
///
/// The region is always placed at the start of the chosen extent.
pub trait PlacementModule: Send + Sync {
    /// Returns the offset of the free extent to carve `length` bytes from,
    /// or `None` if no free extent is big enough
    fn select(&self, free: &FreeSpaceIndex, length: u64) -> Option<u64>;

    fn kind(&self) -> PlacementKind;
}

/// First free extent (by ascending offset) that is big enough
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstFitPlacement;

impl PlacementModule for FirstFitPlacement {
    fn select(&self, free: &FreeSpaceIndex, length: u64) -> Option<u64> {
        free.iter()
            .find(|extent| extent.length >= length)
            .map(|extent| extent.offset)
    }

    fn kind(&self) -> PlacementKind {
        PlacementKind::FirstFit
    }
}

/// Smallest free extent that is big enough, ties go to the lowest offset
#[derive(Debug, Clone, Copy, Default)]
pub struct BestFitPlacement;

impl PlacementModule for BestFitPlacement {
    fn select(&self, free: &FreeSpaceIndex, length: u64) -> Option<u64> {
        // iter() is ordered by offset and min_by_key keeps the first minimum
        free.iter()
            .filter(|extent| extent.length >= length)
            .min_by_key(|extent| extent.length)
            .map(|extent| extent.offset)
    }

    fn kind(&self) -> PlacementKind {
        PlacementKind::BestFit
    }
}

/// Configurable name of a placement policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementKind {
    #[default]
    FirstFit,
    BestFit,
}

static FIRST_FIT: FirstFitPlacement = FirstFitPlacement;
static BEST_FIT: BestFitPlacement = BestFitPlacement;

impl PlacementKind {
    pub fn module(self) -> &'static dyn PlacementModule {
        match self {
            PlacementKind::FirstFit => &FIRST_FIT,
            PlacementKind::BestFit => &BEST_FIT,
        }
    }
}

#[cfg(test)]
mod test {
    use super::{BestFitPlacement, FirstFitPlacement, PlacementKind, PlacementModule};
    use crate::{extent::Extent, modules::free_space::FreeSpaceIndex};

    /// free extents: [0, 96) [128, 160) [192, 224) [256, 1024)
    fn fragmented() -> FreeSpaceIndex {
        let mut index = FreeSpaceIndex::with_span(Extent::new(0, 1024));
        index.take(96, 32).unwrap();
        index.take(160, 32).unwrap();
        index.take(224, 32).unwrap();
        index
    }

    #[test]
    fn test_first_fit_takes_lowest_offset() {
        let index = fragmented();
        assert_eq!(FirstFitPlacement.select(&index, 32), Some(0));
        assert_eq!(FirstFitPlacement.select(&index, 96), Some(0));
        assert_eq!(FirstFitPlacement.select(&index, 97), Some(256));
        assert_eq!(FirstFitPlacement.select(&index, 769), None);
    }

    #[test]
    fn test_best_fit_takes_smallest_then_lowest() {
        let index = fragmented();
        // [128, 160) and [192, 224) tie, lower offset wins
        assert_eq!(BestFitPlacement.select(&index, 32), Some(128));
        assert_eq!(BestFitPlacement.select(&index, 33), Some(0));
        assert_eq!(BestFitPlacement.select(&index, 100), Some(256));
        assert_eq!(BestFitPlacement.select(&index, 2048), None);
    }

    #[test]
    fn test_kind_lookup() {
        assert_eq!(PlacementKind::FirstFit.module().kind(), PlacementKind::FirstFit);
        assert_eq!(PlacementKind::BestFit.module().kind(), PlacementKind::BestFit);
        assert_eq!(
            serde_json::from_str::<PlacementKind>("\"best_fit\"").unwrap(),
            PlacementKind::BestFit
        );
    }
}
