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

use core::ptr::{null_mut, NonNull};
use std::io;

use libc::{
    c_void, madvise, mmap, munmap, sysconf, MADV_DONTNEED, MAP_ANONYMOUS, MAP_FAILED,
    MAP_PRIVATE, PROT_READ, PROT_WRITE, _SC_PAGESIZE,
};
use log::{debug, error};

use super::{BackingStoreModule, ExtentBackingStore, StoreError};
use crate::{extent::Extent, modules::placement::PlacementModule, util::round_up_to_nearest};

/// Size of a huge page on x86_64 and aarch64 (with 4 KiB base pages)
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Backing store over an anonymous memory mapping.
///
/// Every extent is page aligned. When an extent is released its pages are
/// dropped with `madvise(MADV_DONTNEED)`, so the next region placed there
/// starts out zeroed and never sees data of a previous holder.
pub struct MmapBackingStore {
    base: NonNull<u8>,
    mapped_size: usize,
    page_size: u64,
    extents: ExtentBackingStore,
}

// the mapping is owned exclusively by this struct and only touched through `&mut self`
unsafe impl Send for MmapBackingStore {}

impl MmapBackingStore {
    /// Maps `capacity` bytes (rounded up to whole pages).
    ///
    /// With `huge_pages` the mapping uses 2 MiB pages, which requires
    /// preallocated huge pages on the host.
    pub fn new(capacity: u64, huge_pages: bool) -> Result<Self, StoreError> {
        let page_size = if huge_pages {
            HUGE_PAGE_SIZE
        } else {
            system_page_size()?
        };

        let mapped_size = round_up_to_nearest(capacity, page_size)
            .and_then(|size| usize::try_from(size).ok())
            .filter(|size| *size > 0)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("can not map a store of {} bytes", capacity),
                )
            })?;

        let flags = MAP_PRIVATE | MAP_ANONYMOUS | huge_page_flags(huge_pages)?;
        let base_ptr = unsafe { mmap(null_mut(), mapped_size, PROT_READ | PROT_WRITE, flags, -1, 0) };
        if base_ptr == MAP_FAILED {
            return Err(StoreError::Memory(io::Error::last_os_error()));
        }

        let base = NonNull::new(base_ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;

        debug!(
            "mapped backing store of {} bytes at {:p} (page size {})",
            mapped_size, base, page_size
        );

        Ok(Self {
            base,
            mapped_size,
            page_size,
            extents: ExtentBackingStore::new(mapped_size as u64),
        })
    }

    /// Start of `extent` inside the mapping, so a fabric driver can register it.
    ///
    /// Returns `None` if `extent` does not lie inside the mapping.
    pub fn region_ptr(&self, extent: &Extent) -> Option<NonNull<u8>> {
        if !matches!(extent.offset.checked_add(extent.length), Some(end) if end <= self.mapped_size as u64) {
            return None;
        }

        // in bounds of the mapping, checked above
        NonNull::new(unsafe { self.base.as_ptr().add(extent.offset as usize) })
    }

    fn discard(&mut self, extent: &Extent) -> Result<(), StoreError> {
        let ptr = self.region_ptr(extent).ok_or(StoreError::OutOfBounds {
            extent: *extent,
            capacity: self.mapped_size as u64,
        })?;

        let code = unsafe { madvise(ptr.as_ptr() as *mut c_void, extent.length as usize, MADV_DONTNEED) };
        if code != 0 {
            return Err(StoreError::Memory(io::Error::last_os_error()));
        }

        Ok(())
    }
}

impl BackingStoreModule for MmapBackingStore {
    fn capacity(&self) -> u64 {
        self.mapped_size as u64
    }

    fn alignment(&self) -> u64 {
        self.page_size
    }

    fn reserve(&mut self, length: u64, placement: &dyn PlacementModule) -> Result<Extent, StoreError> {
        debug_assert_eq!(length % self.page_size, 0, "length has to be page aligned");
        self.extents.reserve(length, placement)
    }

    fn release(&mut self, extent: Extent) -> Result<(), StoreError> {
        // check before touching the pages, madvise on live data would zero it
        if extent.end() <= self.mapped_size as u64 && extent.end() >= extent.offset {
            let free = self.extents.free_extents();
            if let Some(free) = free.into_iter().find(|free| free.overlaps(&extent)) {
                return Err(StoreError::DoubleRelease { extent, free });
            }

            self.discard(&extent)?;
        }

        self.extents.release(extent)
    }

    fn free_bytes(&self) -> u64 {
        self.extents.free_bytes()
    }

    fn largest_free(&self) -> u64 {
        self.extents.largest_free()
    }

    fn free_extents(&self) -> Vec<Extent> {
        self.extents.free_extents()
    }

    fn rebuild(&mut self, live: &[Extent]) {
        self.extents.rebuild(live)
    }
}

impl Drop for MmapBackingStore {
    fn drop(&mut self) {
        let code = unsafe { munmap(self.base.as_ptr() as *mut c_void, self.mapped_size) };

        if code != 0 {
            error!(
                "could not unmap backing store at {:p}: {}",
                self.base,
                io::Error::last_os_error()
            );
        }
    }
}

fn system_page_size() -> Result<u64, StoreError> {
    let size = unsafe { sysconf(_SC_PAGESIZE) };
    if size <= 0 {
        return Err(StoreError::Memory(io::Error::last_os_error()));
    }

    Ok(size as u64)
}

#[cfg(target_os = "linux")]
fn huge_page_flags(huge_pages: bool) -> Result<i32, StoreError> {
    Ok(if huge_pages {
        libc::MAP_HUGETLB | libc::MAP_HUGE_2MB
    } else {
        0
    })
}

#[cfg(not(target_os = "linux"))]
fn huge_page_flags(huge_pages: bool) -> Result<i32, StoreError> {
    if huge_pages {
        return Err(StoreError::Memory(io::Error::new(
            io::ErrorKind::Unsupported,
            "huge pages are only supported on linux",
        )));
    }

    Ok(0)
}
