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

use std::sync::Arc;

use log::{debug, error, info, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    clock::Clock,
    error::FamError,
    extent::Extent,
    identifiers::{ClientId, RegionId},
    modules::{
        backing_store::{BackingStoreModule, StoreError},
        placement::PlacementKind,
    },
    region_table::{transition_locked, RegionSlot, RegionState, RegionStatus, RegionTable},
    util::{find_overlap, round_up_to_nearest},
};

/// Placement preference a client can attach to an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationHint {
    /// Use the configured default policy
    #[default]
    None,
    /// Prefer the smallest free extent that fits (best-fit)
    SpaceEfficient,
}

/// What a successful free did to the region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreeOutcome {
    /// The region had no leases and is gone
    Freed,
    /// The region waits for its remaining leases to be detached
    Draining,
}

/// Who asked for a region to be freed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FreeOrigin {
    Client,
    /// The monitor, on behalf of an owner that was lost
    Reclaim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub capacity: u64,
    pub free_bytes: u64,
    pub largest_free: u64,
    pub regions: usize,
}

/// Decides where regions go and when they are destroyed.
///
/// The backing store sits behind its own mutex, which is always the last lock
/// taken. Reserving space and inserting into the region table never happen
/// under the same lock, so a new region is re-validated against every region
/// in the table before it is committed.
pub struct AllocatorEngine<B: BackingStoreModule> {
    table: RegionTable,
    store: Mutex<B>,
    capacity: u64,
    alignment: u64,
    default_placement: PlacementKind,
    clock: Arc<dyn Clock>,
}

impl<B: BackingStoreModule> AllocatorEngine<B> {
    /// `alignment` has to be a power of two, the effective alignment is the
    /// larger of it and the store's own alignment
    pub fn new(
        store: B,
        table: RegionTable,
        alignment: u64,
        default_placement: PlacementKind,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = store.capacity();
        let alignment = alignment.max(store.alignment()).max(1);

        Self {
            table,
            store: Mutex::new(store),
            capacity,
            alignment,
            default_placement,
            clock,
        }
    }

    pub fn table(&self) -> &RegionTable {
        &self.table
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Carves a new `Active` region of at least `length` bytes for `owner`
    pub fn allocate(
        &self,
        length: u64,
        owner: ClientId,
        hint: AllocationHint,
    ) -> Result<RegionId, FamError> {
        if length == 0 {
            return Err(FamError::InvalidLength { length: 0 });
        }

        let aligned = match round_up_to_nearest(length, self.alignment) {
            Some(aligned) if aligned <= self.capacity => aligned,
            _ => {
                return Err(FamError::NoSpace {
                    requested: length,
                    largest_free: self.store.lock().largest_free(),
                })
            }
        };

        let placement = match hint {
            AllocationHint::SpaceEfficient => PlacementKind::BestFit,
            AllocationHint::None => self.default_placement,
        };

        let extent = self
            .store
            .lock()
            .reserve(aligned, placement.module())
            .map_err(|err| match err {
                StoreError::NoSpace {
                    requested,
                    largest_free,
                } => FamError::NoSpace {
                    requested,
                    largest_free,
                },
                other => {
                    error!("backing store failed to reserve {} bytes: {}", aligned, other);
                    FamError::internal(other.to_string())
                }
            })?;

        if let Some(live) = self
            .table
            .live_extents()
            .into_iter()
            .find(|live| live.overlaps(&extent))
        {
            error!(
                "backing store handed out {} which overlaps live region extent {}",
                extent, live
            );
            self.release_extent(extent);
            return Err(FamError::internal(format!(
                "reserved extent {} overlaps live extent {}",
                extent, live
            )));
        }

        let id = match self.table.insert(extent, length, owner, self.clock.now_ms()) {
            Ok(id) => id,
            Err(err) => {
                error!("could not record region for {}: {}", extent, err);
                self.release_extent(extent);
                return Err(err);
            }
        };

        if let Err(err) = self
            .table
            .transition(id, RegionState::Allocating, RegionState::Active)
        {
            error!("could not commit region {}: {}", id, err);
            if self.table.remove(id).is_some() {
                self.release_extent(extent);
            }
            return Err(FamError::internal(format!("commit of region {} failed: {}", id, err)));
        }

        debug!(
            "allocated region {} at {} ({} bytes) for client {}",
            id, extent, length, owner
        );
        Ok(id)
    }

    /// Frees a region on behalf of its owner.
    ///
    /// A region without leases is destroyed right away, otherwise it drains
    /// until the last lease is detached. Freeing a draining region again is
    /// accepted and changes nothing.
    pub fn free(&self, id: RegionId, client: ClientId) -> Result<FreeOutcome, FamError> {
        self.free_as(id, client, FreeOrigin::Client, |_| Ok(()))
    }

    /// Frees a region whose owner `lost_client` is gone
    pub fn reclaim(&self, id: RegionId, lost_client: ClientId) -> Result<FreeOutcome, FamError> {
        self.free_as(id, lost_client, FreeOrigin::Reclaim, |_| Ok(()))
    }

    /// Frees a region for `client`.
    ///
    /// `prepare` runs under the region lock once ownership is confirmed and
    /// before the reference count decides between draining and freeing.
    pub(crate) fn free_as(
        &self,
        id: RegionId,
        client: ClientId,
        origin: FreeOrigin,
        prepare: impl FnOnce(&mut RegionStatus) -> Result<(), FamError>,
    ) -> Result<FreeOutcome, FamError> {
        let slot = self.table.slot(id)?;
        let mut status = slot.lock();

        match status.state {
            RegionState::Allocating | RegionState::Freed => {
                return Err(FamError::RegionNotFound { region: id })
            }
            RegionState::Active | RegionState::Draining => {}
        }

        if slot.owner != client {
            return Err(FamError::NotOwner {
                region: id,
                client,
                owner: slot.owner,
            });
        }

        prepare(&mut *status)?;

        if status.ref_count > 0 {
            if status.state == RegionState::Draining {
                trace!("region {} is already draining ({:?})", id, origin);
                return Ok(FreeOutcome::Draining);
            }

            transition_locked(id, &mut status, RegionState::Active, RegionState::Draining)?;
            debug!(
                "region {} is draining, {} lease(s) left ({:?})",
                id, status.ref_count, origin
            );
            return Ok(FreeOutcome::Draining);
        }

        self.retire_locked(&slot, &mut status)?;
        debug!("freed region {} ({:?})", id, origin);
        Ok(FreeOutcome::Freed)
    }

    /// Destroys a region whose lock the caller holds and whose reference count is zero.
    ///
    /// State change, removal from the table and release of the extent all
    /// happen while the region lock is held, so nobody can observe a freed
    /// region that still occupies space or attach to one that is going away.
    pub(crate) fn retire_locked(
        &self,
        slot: &RegionSlot,
        status: &mut RegionStatus,
    ) -> Result<(), FamError> {
        if status.ref_count != 0 {
            return Err(FamError::internal(format!(
                "region {} retired with {} lease(s)",
                slot.id, status.ref_count
            )));
        }

        let from = status.state;
        transition_locked(slot.id, status, from, RegionState::Freed)?;

        if self.table.remove(slot.id).is_none() {
            error!("region {} vanished from the table before it was freed", slot.id);
        }

        self.store.lock().release(slot.extent).map_err(|err| {
            error!("could not release {} of region {}: {}", slot.extent, slot.id, err);
            FamError::internal(format!("release of region {} failed: {}", slot.id, err))
        })
    }

    fn release_extent(&self, extent: Extent) {
        if let Err(err) = self.store.lock().release(extent) {
            error!("could not roll back reservation of {}: {}", extent, err);
        }
    }

    /// Recomputes the free space of the backing store from the region table
    pub fn rebuild_index(&self) {
        let live = self.table.live_extents();
        if let Some((first, second)) = find_overlap(&live) {
            error!(
                "live regions at {} and {} overlap, rebuilding from their union",
                first, second
            );
        }

        let mut store = self.store.lock();
        store.rebuild(&live);
        info!(
            "rebuilt free space index from {} region(s), {} bytes free",
            live.len(),
            store.free_bytes()
        );
    }

    pub fn free_bytes(&self) -> u64 {
        self.store.lock().free_bytes()
    }

    pub fn free_extents(&self) -> Vec<Extent> {
        self.store.lock().free_extents()
    }

    pub fn stats(&self) -> EngineStats {
        let regions = self.table.len();
        let store = self.store.lock();
        EngineStats {
            capacity: self.capacity,
            free_bytes: store.free_bytes(),
            largest_free: store.largest_free(),
            regions,
        }
    }

    /// Runs `f` with exclusive access to the backing store
    pub fn with_store<R>(&self, f: impl FnOnce(&B) -> R) -> R {
        f(&self.store.lock())
    }
}
