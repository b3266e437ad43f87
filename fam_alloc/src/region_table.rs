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

use std::{collections::HashMap, sync::Arc};

use log::{debug, error};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    error::FamError,
    extent::Extent,
    identifiers::{ClientId, RegionId},
    modules::id_store::{IdStoreError, IdStoreModule},
};

/// Lifecycle of a region.
///
/// ```text
/// Allocating --commit--> Active --free, leases > 0--> Draining
///                          |                              |
///                          +--free, no leases--+   last detach
///                                              v          v
///                                             Freed <-----+
/// ```
///
/// `Freed` is terminal, a freed region is no longer in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionState {
    Allocating,
    Active,
    Draining,
    Freed,
}

impl RegionState {
    pub const fn is_live(self) -> bool {
        matches!(self, RegionState::Active | RegionState::Draining)
    }

    pub const fn can_transition_to(self, next: RegionState) -> bool {
        matches!(
            (self, next),
            (RegionState::Allocating, RegionState::Active)
                | (RegionState::Active, RegionState::Draining)
                | (RegionState::Active, RegionState::Freed)
                | (RegionState::Draining, RegionState::Freed)
        )
    }
}

/// Point in time view of a region
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub id: RegionId,
    /// Reserved span, `length` rounded up to the alignment
    pub extent: Extent,
    /// Requested length in bytes
    pub length: u64,
    pub created_at_ms: u64,
    pub state: RegionState,
    pub owner: ClientId,
    pub ref_count: u32,
}

impl Region {
    pub fn offset(&self) -> u64 {
        self.extent.offset
    }
}

/// Mutable part of a region, guarded by the region's own lock
#[derive(Debug)]
pub(crate) struct RegionStatus {
    pub(crate) state: RegionState,
    pub(crate) ref_count: u32,
}

/// A region record. Everything but the status is fixed at creation.
#[derive(Debug)]
pub(crate) struct RegionSlot {
    pub(crate) id: RegionId,
    pub(crate) extent: Extent,
    pub(crate) length: u64,
    pub(crate) owner: ClientId,
    pub(crate) created_at_ms: u64,
    status: Mutex<RegionStatus>,
}

impl RegionSlot {
    pub(crate) fn lock(&self) -> MutexGuard<'_, RegionStatus> {
        self.status.lock()
    }

    pub(crate) fn snapshot(&self, status: &RegionStatus) -> Region {
        Region {
            id: self.id,
            extent: self.extent,
            length: self.length,
            created_at_ms: self.created_at_ms,
            state: status.state,
            owner: self.owner,
            ref_count: status.ref_count,
        }
    }
}

/// Hands out region ids in blocks backed by an [`IdStoreModule`]
struct IdAllocator {
    next: u64,
    reserved_until: u64,
    block_size: u64,
    store: Box<dyn IdStoreModule>,
}

impl IdAllocator {
    fn new(mut store: Box<dyn IdStoreModule>, block_size: u64) -> Result<Self, IdStoreError> {
        let watermark = store.load()?;
        Ok(Self {
            next: watermark + 1,
            reserved_until: watermark,
            block_size,
            store,
        })
    }

    fn next_id(&mut self) -> Result<RegionId, IdStoreError> {
        if self.next > self.reserved_until {
            let watermark = self.reserved_until + self.block_size;
            self.store.store(watermark)?;
            debug!("reserved region ids up to {}", watermark);
            self.reserved_until = watermark;
        }

        let id = self.next;
        self.next += 1;
        Ok(RegionId::from_raw(id))
    }
}

/// The authoritative map of regions.
///
/// Every region carries its own lock for state and reference count, the map
/// lock is only held to find, insert or remove a slot. Code that holds a
/// region lock may take the map lock, never the other way around.
pub struct RegionTable {
    capacity: u64,
    regions: RwLock<HashMap<RegionId, Arc<RegionSlot>>>,
    ids: Mutex<IdAllocator>,
}

impl RegionTable {
    pub fn new(
        capacity: u64,
        id_store: Box<dyn IdStoreModule>,
        id_block_size: u64,
    ) -> Result<Self, IdStoreError> {
        Ok(Self {
            capacity,
            regions: RwLock::new(HashMap::new()),
            ids: Mutex::new(IdAllocator::new(id_store, id_block_size)?),
        })
    }

    /// Adds a new region in state `Allocating` and returns its id
    pub fn insert(
        &self,
        extent: Extent,
        length: u64,
        owner: ClientId,
        now_ms: u64,
    ) -> Result<RegionId, FamError> {
        let fits = matches!(extent.offset.checked_add(extent.length), Some(end) if end <= self.capacity);
        if !fits || length > extent.length {
            return Err(FamError::internal(format!(
                "extent {:?} for {} bytes does not fit a capacity of {}",
                extent, length, self.capacity
            )));
        }

        let id = self
            .ids
            .lock()
            .next_id()
            .map_err(|err| FamError::internal(format!("could not reserve region id: {}", err)))?;

        let slot = Arc::new(RegionSlot {
            id,
            extent,
            length,
            owner,
            created_at_ms: now_ms,
            status: Mutex::new(RegionStatus {
                state: RegionState::Allocating,
                ref_count: 0,
            }),
        });

        let mut regions = self.regions.write();
        if regions.contains_key(&id) {
            error!("region id {} was handed out twice", id);
            return Err(FamError::internal(format!("duplicate region id {}", id)));
        }
        regions.insert(id, slot);

        Ok(id)
    }

    pub(crate) fn slot(&self, id: RegionId) -> Result<Arc<RegionSlot>, FamError> {
        self.regions
            .read()
            .get(&id)
            .cloned()
            .ok_or(FamError::RegionNotFound { region: id })
    }

    /// Removes the slot from the map. The caller holds the slot's lock.
    pub(crate) fn remove(&self, id: RegionId) -> Option<Arc<RegionSlot>> {
        self.regions.write().remove(&id)
    }

    pub fn lookup(&self, id: RegionId) -> Result<Region, FamError> {
        let slot = self.slot(id)?;
        let status = slot.lock();
        if status.state == RegionState::Freed {
            return Err(FamError::RegionNotFound { region: id });
        }

        Ok(slot.snapshot(&status))
    }

    /// Compare-and-swap on the state of a region.
    ///
    /// Moving to `Freed` returns the extent to the backing store, which the
    /// table does not own, so that transition goes through the allocator
    /// engine and is rejected here.
    pub fn transition(
        &self,
        id: RegionId,
        expected: RegionState,
        next: RegionState,
    ) -> Result<(), FamError> {
        if next == RegionState::Freed {
            return Err(FamError::internal(format!(
                "region {} can only be freed through the allocator engine",
                id
            )));
        }

        let slot = self.slot(id)?;
        let mut status = slot.lock();
        transition_locked(id, &mut status, expected, next)
    }

    /// All regions that are `Active` or `Draining`, ordered by id
    pub fn list_active(&self) -> Vec<Region> {
        let mut regions: Vec<Region> = self
            .slots()
            .iter()
            .filter_map(|slot| {
                let status = slot.lock();
                status.state.is_live().then(|| slot.snapshot(&status))
            })
            .collect();

        regions.sort_by_key(|region| region.id);
        regions
    }

    /// Extents of every region in the table, including ones still `Allocating`
    pub fn live_extents(&self) -> Vec<Extent> {
        self.regions.read().values().map(|slot| slot.extent).collect()
    }

    /// Ids of every region `client` owns
    pub fn owned_by(&self, client: ClientId) -> Vec<RegionId> {
        let mut ids: Vec<RegionId> = self
            .regions
            .read()
            .values()
            .filter(|slot| slot.owner == client)
            .map(|slot| slot.id)
            .collect();

        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Clones the slot handles so no region lock is taken while the map is locked
    fn slots(&self) -> Vec<Arc<RegionSlot>> {
        self.regions.read().values().cloned().collect()
    }
}

/// Compare-and-swap on an already locked region status
pub(crate) fn transition_locked(
    id: RegionId,
    status: &mut RegionStatus,
    expected: RegionState,
    next: RegionState,
) -> Result<(), FamError> {
    if status.state != expected {
        return Err(FamError::Conflict {
            region: id,
            expected,
            actual: status.state,
        });
    }

    if !expected.can_transition_to(next) {
        return Err(FamError::internal(format!(
            "illegal transition of region {} from {:?} to {:?}",
            id, expected, next
        )));
    }

    status.state = next;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{RegionState, RegionTable};
    use crate::{
        error::FamError,
        extent::Extent,
        identifiers::{ClientId, RegionId},
        modules::id_store::MemoryIdStore,
    };

    const CLIENT: ClientId = ClientId::from_raw(1);

    fn table() -> RegionTable {
        RegionTable::new(4096, Box::new(MemoryIdStore::new()), 4).unwrap()
    }

    #[test]
    fn test_insert_and_lookup() {
        let table = table();
        let id = table.insert(Extent::new(0, 128), 100, CLIENT, 5).unwrap();
        assert_eq!(id, RegionId::from_raw(1));

        let region = table.lookup(id).unwrap();
        assert_eq!(region.state, RegionState::Allocating);
        assert_eq!(region.offset(), 0);
        assert_eq!(region.length, 100);
        assert_eq!(region.created_at_ms, 5);
        assert_eq!(region.ref_count, 0);

        // allocating regions are not listed
        assert!(table.list_active().is_empty());
        assert_eq!(table.live_extents(), vec![Extent::new(0, 128)]);

        assert!(matches!(
            table.lookup(RegionId::from_raw(99)),
            Err(FamError::RegionNotFound { .. })
        ));
    }

    #[test]
    fn test_insert_rejects_out_of_bounds() {
        let table = table();
        assert!(matches!(
            table.insert(Extent::new(4000, 128), 128, CLIENT, 0),
            Err(FamError::Internal { .. })
        ));
        assert!(matches!(
            table.insert(Extent::new(0, 64), 65, CLIENT, 0),
            Err(FamError::Internal { .. })
        ));
        assert!(table.is_empty());
    }

    #[test]
    fn test_transition_compare_and_swap() {
        let table = table();
        let id = table.insert(Extent::new(0, 64), 64, CLIENT, 0).unwrap();

        table
            .transition(id, RegionState::Allocating, RegionState::Active)
            .unwrap();

        // lost race: state is no longer Allocating
        assert_eq!(
            table.transition(id, RegionState::Allocating, RegionState::Active),
            Err(FamError::Conflict {
                region: id,
                expected: RegionState::Allocating,
                actual: RegionState::Active
            })
        );

        // not a legal edge
        assert!(matches!(
            table.transition(id, RegionState::Active, RegionState::Allocating),
            Err(FamError::Internal { .. })
        ));
        assert!(matches!(
            table.transition(id, RegionState::Active, RegionState::Freed),
            Err(FamError::Internal { .. })
        ));

        table
            .transition(id, RegionState::Active, RegionState::Draining)
            .unwrap();
        assert_eq!(table.list_active().len(), 1);
        assert_eq!(table.list_active()[0].state, RegionState::Draining);
    }

    #[test]
    fn test_ids_are_monotonic_and_persisted_in_blocks() {
        let table = table();
        let ids: Vec<u64> = (0..10)
            .map(|i| table.insert(Extent::new(i * 64, 64), 64, CLIENT, 0).unwrap().get())
            .collect();
        assert_eq!(ids, (1..=10).collect::<Vec<u64>>());

        // removed ids are not reused
        table.remove(RegionId::from_raw(10));
        let next = table.insert(Extent::new(640, 64), 64, CLIENT, 0).unwrap();
        assert_eq!(next.get(), 11);
    }

    #[test]
    fn test_ids_continue_after_restart() {
        // watermark left behind by a previous instance
        let table = RegionTable::new(4096, Box::new(MemoryIdStore::starting_at(8)), 8).unwrap();
        let id = table.insert(Extent::new(0, 64), 64, CLIENT, 0).unwrap();
        assert_eq!(id.get(), 9);
    }

    #[test]
    fn test_owned_by() {
        let table = table();
        let other = ClientId::from_raw(2);
        let a = table.insert(Extent::new(0, 64), 64, CLIENT, 0).unwrap();
        let _ = table.insert(Extent::new(64, 64), 64, other, 0).unwrap();
        let c = table.insert(Extent::new(128, 64), 64, CLIENT, 0).unwrap();

        assert_eq!(table.owned_by(CLIENT), vec![a, c]);
        assert_eq!(table.len(), 3);
        assert_eq!(table.capacity(), 4096);
    }
}
