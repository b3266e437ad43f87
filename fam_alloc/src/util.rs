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

use crate::extent::Extent;

#[inline]
pub(crate) const fn round_up_to_nearest(num: u64, multiple: u64) -> Option<u64> {
    match num.checked_add(multiple - 1) {
        Some(sum) => Some((sum / multiple) * multiple),
        None => None,
    }
}

/// Returns the first pair of overlapping extents in `extents`, if there is one
pub(crate) fn find_overlap(extents: &[Extent]) -> Option<(Extent, Extent)> {
    let mut sorted: Vec<Extent> = extents.to_vec();
    sorted.sort_by_key(|extent| extent.offset);

    sorted
        .windows(2)
        .find(|pair| pair[0].overlaps(&pair[1]))
        .map(|pair| (pair[0], pair[1]))
}

#[cfg(test)]
mod test {
    use super::{find_overlap, round_up_to_nearest};
    use crate::extent::Extent;

    #[test]
    fn test_round_up_to_nearest() {
        assert_eq!(round_up_to_nearest(0, 64), Some(0));
        assert_eq!(round_up_to_nearest(1, 64), Some(64));
        assert_eq!(round_up_to_nearest(64, 64), Some(64));
        assert_eq!(round_up_to_nearest(100, 64), Some(128));
        assert_eq!(round_up_to_nearest(u64::MAX, 64), None);
    }

    #[test]
    fn test_find_overlap() {
        let disjoint = [Extent::new(128, 64), Extent::new(0, 64), Extent::new(64, 64)];
        assert_eq!(find_overlap(&disjoint), None);

        let overlapping = [Extent::new(0, 100), Extent::new(200, 8), Extent::new(96, 8)];
        assert_eq!(
            find_overlap(&overlapping),
            Some((Extent::new(0, 100), Extent::new(96, 8)))
        );
    }
}
