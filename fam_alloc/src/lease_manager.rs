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

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use log::{debug, error, trace};
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    allocator_engine::{AllocatorEngine, FreeOrigin, FreeOutcome},
    clock::Clock,
    error::FamError,
    identifiers::{ClientId, LeaseToken, LeaseTokenGenerator, RegionId},
    modules::backing_store::BackingStoreModule,
    region_table::{RegionSlot, RegionState, RegionStatus},
};

/// A client's claim on a region
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub token: LeaseToken,
    pub region: RegionId,
    pub client: ClientId,
    pub acquired_at_ms: u64,
    pub deadline_ms: u64,
}

impl Lease {
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.deadline_ms
    }
}

/// Why a lease went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Detached,
    Expired,
    SessionLost,
}

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    deadline_ms: u64,
    expired_at_ms: u64,
}

#[derive(Debug, Default)]
struct LeaseBook {
    leases: HashMap<LeaseToken, Lease>,
    by_pair: HashMap<(RegionId, ClientId), LeaseToken>,
    by_client: HashMap<ClientId, HashSet<LeaseToken>>,
    by_region: HashMap<RegionId, HashSet<LeaseToken>>,
    expired: HashMap<LeaseToken, Tombstone>,
}

impl LeaseBook {
    fn insert(&mut self, lease: Lease) {
        self.by_pair.insert((lease.region, lease.client), lease.token);
        self.by_client.entry(lease.client).or_default().insert(lease.token);
        self.by_region.entry(lease.region).or_default().insert(lease.token);
        self.leases.insert(lease.token, lease);
    }

    fn remove(&mut self, token: LeaseToken) -> Option<Lease> {
        let lease = self.leases.remove(&token)?;
        self.by_pair.remove(&(lease.region, lease.client));
        remove_from_set(&mut self.by_client, &lease.client, token);
        remove_from_set(&mut self.by_region, &lease.region, token);
        Some(lease)
    }

    fn bury(&mut self, lease: &Lease, now_ms: u64) {
        self.expired.insert(
            lease.token,
            Tombstone {
                deadline_ms: lease.deadline_ms,
                expired_at_ms: now_ms,
            },
        );
    }
}

fn remove_from_set<K: Eq + std::hash::Hash>(
    map: &mut HashMap<K, HashSet<LeaseToken>>,
    key: &K,
    token: LeaseToken,
) {
    if let Some(tokens) = map.get_mut(key) {
        tokens.remove(&token);
        if tokens.is_empty() {
            map.remove(key);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LeaseSettings {
    /// Lifetime of a fresh or re-attached lease
    pub lease_duration_ms: u64,
    /// A renew never pushes the deadline further than this past now
    pub max_lease_duration_ms: u64,
    /// How long an expired token keeps answering renew with `Expired`
    pub expired_token_retention_ms: u64,
}

/// Owns all leases and keeps region reference counts in step with them.
///
/// Every change to a region's reference count is made while holding that
/// region's lock and then the lease book lock, in that order. The book lock
/// is never held while a region lock is acquired.
pub struct LeaseManager {
    book: Mutex<LeaseBook>,
    tokens: LeaseTokenGenerator,
    settings: LeaseSettings,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(settings: LeaseSettings, clock: Arc<dyn Clock>) -> Self {
        Self::with_generator(settings, clock, LeaseTokenGenerator::new())
    }

    pub(crate) fn with_generator(
        settings: LeaseSettings,
        clock: Arc<dyn Clock>,
        tokens: LeaseTokenGenerator,
    ) -> Self {
        Self {
            book: Mutex::new(LeaseBook::default()),
            tokens,
            settings,
            clock,
        }
    }

    /// Grants `client` a lease on an `Active` region.
    ///
    /// If the client already holds a live lease on the region that lease is
    /// extended and returned, the reference count does not change. An
    /// expired one is reclaimed and replaced by a lease with a new token.
    pub fn attach<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        region: RegionId,
        client: ClientId,
    ) -> Result<Lease, FamError> {
        self.attach_reaping(engine, region, client, &mut Vec::new())
    }

    /// [`attach`](Self::attach) that hands out the expired leases of the
    /// region it reclaimed on the way, also when the attach fails
    pub(crate) fn attach_reaping<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        region: RegionId,
        client: ClientId,
        reaped: &mut Vec<Lease>,
    ) -> Result<Lease, FamError> {
        let slot = engine.table().slot(region)?;
        let mut status = slot.lock();

        if !status.state.is_live() {
            return Err(FamError::RegionNotFound { region });
        }

        let now = self.clock.now_ms();
        reaped.extend(self.reap_locked(region, &mut status, now)?);

        if status.state == RegionState::Draining {
            if self.retire_if_drained(engine, &slot, &mut status)? {
                return Err(FamError::RegionNotFound { region });
            }
            return Err(FamError::RegionDraining { region });
        }

        let deadline = now.saturating_add(self.settings.lease_duration_ms);
        let mut book = self.book.lock();

        // an expired lease of this pair was reaped above
        if let Some(token) = book.by_pair.get(&(region, client)).copied() {
            let lease = book
                .leases
                .get_mut(&token)
                .ok_or_else(|| FamError::internal(format!("lease index points to missing lease {}", token)))?;

            lease.deadline_ms = lease.deadline_ms.max(deadline);
            trace!("client {} re-attached to region {} with {}", client, region, token);
            return Ok(lease.clone());
        }

        let ref_count = status
            .ref_count
            .checked_add(1)
            .ok_or_else(|| FamError::internal(format!("reference count of region {} overflowed", region)))?;

        let lease = Lease {
            token: self.tokens.next(),
            region,
            client,
            acquired_at_ms: now,
            deadline_ms: deadline,
        };
        book.insert(lease.clone());
        status.ref_count = ref_count;

        debug!(
            "client {} attached to region {} with {} ({} lease(s))",
            client, region, lease.token, ref_count
        );
        Ok(lease)
    }

    /// Frees `region` for its owner once the region's expired leases are
    /// reclaimed, so a lease past its deadline never keeps a region draining
    pub(crate) fn free_reaping<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        region: RegionId,
        client: ClientId,
        origin: FreeOrigin,
        reaped: &mut Vec<Lease>,
    ) -> Result<FreeOutcome, FamError> {
        let now = self.clock.now_ms();
        engine.free_as(region, client, origin, |status| {
            reaped.extend(self.reap_locked(region, status, now)?);
            Ok(())
        })
    }

    /// Reclaims the expired leases of `region` now instead of at the next sweep.
    ///
    /// A draining region that loses its last lease this way is freed.
    pub fn reap_region<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        region: RegionId,
    ) -> Result<Vec<Lease>, FamError> {
        let slot = engine.table().slot(region)?;
        let mut status = slot.lock();

        if !status.state.is_live() {
            return Err(FamError::RegionNotFound { region });
        }

        let reaped = self.reap_locked(region, &mut status, self.clock.now_ms())?;
        self.retire_if_drained(engine, &slot, &mut status)?;
        Ok(reaped)
    }

    /// Releases the leases of `region` that are past their deadline. The
    /// caller holds the region lock and decides what happens to the region.
    fn reap_locked(
        &self,
        region: RegionId,
        status: &mut RegionStatus,
        now_ms: u64,
    ) -> Result<Vec<Lease>, FamError> {
        let mut guard = self.book.lock();
        let book = &mut *guard;

        let due: Vec<LeaseToken> = book
            .by_region
            .get(&region)
            .into_iter()
            .flatten()
            .filter(|token| {
                book.leases
                    .get(*token)
                    .map_or(false, |lease| lease.is_expired(now_ms))
            })
            .copied()
            .collect();

        let mut reaped = Vec::with_capacity(due.len());
        for token in due {
            if let Some(lease) = book.remove(token) {
                book.bury(&lease, now_ms);
                decrement(status, region)?;
                reaped.push(lease);
            }
        }

        if !reaped.is_empty() {
            debug!(
                "reclaimed {} expired lease(s) on region {}, {} lease(s) left",
                reaped.len(),
                region,
                status.ref_count
            );
        }
        Ok(reaped)
    }

    /// Frees a draining region without leases, returns whether it did
    fn retire_if_drained<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        slot: &RegionSlot,
        status: &mut RegionStatus,
    ) -> Result<bool, FamError> {
        if status.ref_count != 0 || status.state != RegionState::Draining {
            return Ok(false);
        }

        engine.retire_locked(slot, status)?;
        debug!("last lease of draining region {} is gone, region freed", slot.id);
        Ok(true)
    }

    /// Gives up a lease. Dropping the last lease of a draining region frees it.
    pub fn detach<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        token: LeaseToken,
    ) -> Result<Lease, FamError> {
        self.release(engine, token, ReleaseReason::Detached)
    }

    /// Releases a lease for `reason`, exactly like a detach by its holder
    pub fn release<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        token: LeaseToken,
        reason: ReleaseReason,
    ) -> Result<Lease, FamError> {
        self.release_if(engine, token, reason, |_| true)?
            .ok_or(FamError::LeaseNotFound { token })
    }

    /// Releases the lease if `condition` holds for it once all locks are taken.
    ///
    /// Returns `Ok(None)` if the condition did not hold.
    fn release_if<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        token: LeaseToken,
        reason: ReleaseReason,
        condition: impl Fn(&Lease) -> bool,
    ) -> Result<Option<Lease>, FamError> {
        let region = self
            .book
            .lock()
            .leases
            .get(&token)
            .map(|lease| lease.region)
            .ok_or(FamError::LeaseNotFound { token })?;

        let slot = match engine.table().slot(region) {
            Ok(slot) => slot,
            Err(_) => {
                // the region went away together with this lease while no lock was held
                if self.book.lock().remove(token).is_none() {
                    return Err(FamError::LeaseNotFound { token });
                }
                error!("lease {} pointed to missing region {}, dropped it", token, region);
                return Err(FamError::internal(format!(
                    "lease {} outlived region {}",
                    token, region
                )));
            }
        };

        let mut status = slot.lock();
        let now = self.clock.now_ms();

        let lease = {
            let mut book = self.book.lock();
            match book.leases.get(&token) {
                // released by somebody else while the region lock was taken
                None => return Err(FamError::LeaseNotFound { token }),
                Some(lease) if !condition(lease) => return Ok(None),
                Some(_) => {}
            }

            let lease = book
                .remove(token)
                .ok_or(FamError::LeaseNotFound { token })?;
            if reason == ReleaseReason::Expired {
                book.bury(&lease, now);
            }
            lease
        };

        decrement(&mut status, region)?;
        debug!(
            "lease {} of client {} on region {} released ({:?}), {} lease(s) left",
            token, lease.client, region, reason, status.ref_count
        );

        self.retire_if_drained(engine, &slot, &mut status)?;
        Ok(Some(lease))
    }

    /// Moves the deadline of a live lease to `new_deadline_ms`.
    ///
    /// The deadline is capped at now plus the maximum lease duration and never
    /// moves backwards. A lease that is already past its deadline is reclaimed
    /// and `Expired` is reported, also for a while after it was reclaimed.
    pub fn renew<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        token: LeaseToken,
        new_deadline_ms: u64,
    ) -> Result<Lease, FamError> {
        self.renew_reaping(engine, token, new_deadline_ms, &mut Vec::new())
    }

    /// [`renew`](Self::renew) that hands out the lease it reclaimed because it ran out
    pub(crate) fn renew_reaping<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        token: LeaseToken,
        new_deadline_ms: u64,
        reaped: &mut Vec<Lease>,
    ) -> Result<Lease, FamError> {
        let now = self.clock.now_ms();

        let expired_deadline = {
            let mut guard = self.book.lock();
            let book = &mut *guard;
            match book.leases.get_mut(&token) {
                Some(lease) if !lease.is_expired(now) => {
                    let cap = now.saturating_add(self.settings.max_lease_duration_ms);
                    lease.deadline_ms = lease.deadline_ms.max(new_deadline_ms.min(cap));
                    trace!("renewed {} until {}", token, lease.deadline_ms);
                    return Ok(lease.clone());
                }
                Some(lease) => lease.deadline_ms,
                None => {
                    return Err(match book.expired.get(&token) {
                        Some(tombstone) => FamError::Expired {
                            token,
                            deadline_ms: tombstone.deadline_ms,
                        },
                        None => FamError::LeaseNotFound { token },
                    })
                }
            }
        };

        match self.release_if(engine, token, ReleaseReason::Expired, |lease| {
            lease.is_expired(now)
        }) {
            Ok(Some(lease)) => reaped.push(lease),
            Ok(None) | Err(FamError::LeaseNotFound { .. }) => {}
            Err(err) => return Err(err),
        }

        Err(FamError::Expired {
            token,
            deadline_ms: expired_deadline,
        })
    }

    /// Releases every lease that is past its deadline, as if its holder had
    /// detached it, and forgets tombstones older than the retention period.
    pub fn sweep_expired<B: BackingStoreModule>(&self, engine: &AllocatorEngine<B>) -> Vec<Lease> {
        let now = self.clock.now_ms();

        let candidates: Vec<LeaseToken> = {
            let mut book = self.book.lock();
            let retention = self.settings.expired_token_retention_ms;
            book.expired
                .retain(|_, tombstone| now.saturating_sub(tombstone.expired_at_ms) < retention);

            book.leases
                .values()
                .filter(|lease| lease.is_expired(now))
                .map(|lease| lease.token)
                .collect()
        };

        let mut released = Vec::with_capacity(candidates.len());
        for token in candidates {
            match self.release_if(engine, token, ReleaseReason::Expired, |lease| {
                lease.is_expired(now)
            }) {
                Ok(Some(lease)) => released.push(lease),
                // renewed in the meantime
                Ok(None) => {}
                Err(FamError::LeaseNotFound { .. }) => {
                    debug!("expired lease {} was released concurrently", token)
                }
                Err(err) => error!("could not reclaim expired lease {}: {}", token, err),
            }
        }

        released
    }

    pub fn lease(&self, token: LeaseToken) -> Option<Lease> {
        self.book.lock().leases.get(&token).cloned()
    }

    /// Tokens of all leases `client` holds
    pub fn tokens_of(&self, client: ClientId) -> Vec<LeaseToken> {
        self.book
            .lock()
            .by_client
            .get(&client)
            .map(|tokens| tokens.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Clients holding a lease on `region`
    pub fn holders(&self, region: RegionId) -> Vec<ClientId> {
        let book = self.book.lock();
        let mut clients: Vec<ClientId> = book
            .by_region
            .get(&region)
            .into_iter()
            .flatten()
            .filter_map(|token| book.leases.get(token).map(|lease| lease.client))
            .collect();

        clients.sort();
        clients
    }

    pub fn len(&self) -> usize {
        self.book.lock().leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.book.lock().leases.is_empty()
    }

    pub fn settings(&self) -> LeaseSettings {
        self.settings
    }
}

fn decrement(status: &mut RegionStatus, region: RegionId) -> Result<(), FamError> {
    status.ref_count = status.ref_count.checked_sub(1).ok_or_else(|| {
        error!("reference count of region {} dropped below zero", region);
        FamError::internal(format!("reference count of region {} underflowed", region))
    })?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{LeaseManager, LeaseSettings, ReleaseReason};
    use crate::{
        allocator_engine::{AllocationHint, AllocatorEngine, FreeOrigin, FreeOutcome},
        clock::ManualClock,
        error::FamError,
        identifiers::{ClientId, LeaseToken, LeaseTokenGenerator, RegionId},
        modules::{
            backing_store::ExtentBackingStore, id_store::MemoryIdStore, placement::PlacementKind,
        },
        region_table::{RegionState, RegionTable},
    };

    const A: ClientId = ClientId::from_raw(1);
    const B: ClientId = ClientId::from_raw(2);

    const SETTINGS: LeaseSettings = LeaseSettings {
        lease_duration_ms: 1_000,
        max_lease_duration_ms: 5_000,
        expired_token_retention_ms: 2_000,
    };

    struct Fixture {
        clock: Arc<ManualClock>,
        engine: AllocatorEngine<ExtentBackingStore>,
        leases: LeaseManager,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(10_000));
        let table = RegionTable::new(4096, Box::new(MemoryIdStore::new()), 16).unwrap();
        let engine = AllocatorEngine::new(
            ExtentBackingStore::new(4096),
            table,
            64,
            PlacementKind::FirstFit,
            clock.clone(),
        );
        let leases = LeaseManager::with_generator(SETTINGS, clock.clone(), LeaseTokenGenerator::seeded(3));
        Fixture { clock, engine, leases }
    }

    fn ref_count(f: &Fixture, region: RegionId) -> u32 {
        f.engine.table().lookup(region).unwrap().ref_count
    }

    #[test]
    fn test_attach_counts_references() {
        let f = fixture();
        let region = f.engine.allocate(100, A, AllocationHint::None).unwrap();

        let a = f.leases.attach(&f.engine, region, A).unwrap();
        let b = f.leases.attach(&f.engine, region, B).unwrap();
        assert_ne!(a.token, b.token);
        assert_eq!(a.deadline_ms, 11_000);
        assert_eq!(ref_count(&f, region), 2);
        assert_eq!(f.leases.holders(region), vec![A, B]);
        assert_eq!(f.leases.tokens_of(A), vec![a.token]);

        // re-attach renews the existing lease
        f.clock.advance(500);
        let again = f.leases.attach(&f.engine, region, A).unwrap();
        assert_eq!(again.token, a.token);
        assert_eq!(again.deadline_ms, 11_500);
        assert_eq!(ref_count(&f, region), 2);
        assert_eq!(f.leases.len(), 2);
    }

    #[test]
    fn test_attach_unknown_or_draining() {
        let f = fixture();
        assert_eq!(
            f.leases.attach(&f.engine, RegionId::from_raw(42), A),
            Err(FamError::RegionNotFound {
                region: RegionId::from_raw(42)
            })
        );

        let region = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        let lease = f.leases.attach(&f.engine, region, B).unwrap();
        assert_eq!(f.engine.free(region, A), Ok(FreeOutcome::Draining));

        assert_eq!(
            f.leases.attach(&f.engine, region, A),
            Err(FamError::RegionDraining { region })
        );
        // also for a client that already holds a lease
        assert_eq!(
            f.leases.attach(&f.engine, region, B),
            Err(FamError::RegionDraining { region })
        );
        assert_eq!(ref_count(&f, region), 1);

        f.leases.detach(&f.engine, lease.token).unwrap();
        assert_eq!(
            f.leases.attach(&f.engine, region, B),
            Err(FamError::RegionNotFound { region })
        );
    }

    #[test]
    fn test_last_detach_frees_draining_region() {
        let f = fixture();
        let region = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        let a = f.leases.attach(&f.engine, region, A).unwrap();
        let b = f.leases.attach(&f.engine, region, B).unwrap();

        f.engine.free(region, A).unwrap();
        f.leases.detach(&f.engine, a.token).unwrap();
        assert_eq!(f.engine.table().lookup(region).unwrap().state, RegionState::Draining);
        assert_eq!(f.engine.free_bytes(), 4096 - 64);

        let released = f.leases.detach(&f.engine, b.token).unwrap();
        assert_eq!(released.client, B);
        assert!(f.engine.table().lookup(region).is_err());
        assert_eq!(f.engine.free_bytes(), 4096);
        assert!(f.leases.is_empty());

        assert_eq!(
            f.leases.detach(&f.engine, b.token),
            Err(FamError::LeaseNotFound { token: b.token })
        );
    }

    #[test]
    fn test_detach_active_region_keeps_it() {
        let f = fixture();
        let region = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        let lease = f.leases.attach(&f.engine, region, B).unwrap();
        f.leases
            .release(&f.engine, lease.token, ReleaseReason::SessionLost)
            .unwrap();

        let snapshot = f.engine.table().lookup(region).unwrap();
        assert_eq!(snapshot.state, RegionState::Active);
        assert_eq!(snapshot.ref_count, 0);
        assert!(f.leases.tokens_of(B).is_empty());
    }

    #[test]
    fn test_renew_extends_and_caps() {
        let f = fixture();
        let region = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        let lease = f.leases.attach(&f.engine, region, A).unwrap();

        let renewed = f.leases.renew(&f.engine, lease.token, 13_000).unwrap();
        assert_eq!(renewed.deadline_ms, 13_000);

        // capped at now + max duration
        let renewed = f.leases.renew(&f.engine, lease.token, u64::MAX).unwrap();
        assert_eq!(renewed.deadline_ms, 15_000);

        // never moves backwards
        let renewed = f.leases.renew(&f.engine, lease.token, 10_001).unwrap();
        assert_eq!(renewed.deadline_ms, 15_000);

        let unknown = LeaseToken::from_parts(999, 1);
        assert_eq!(
            f.leases.renew(&f.engine, unknown, 12_000),
            Err(FamError::LeaseNotFound { token: unknown })
        );
    }

    #[test]
    fn test_renew_after_deadline_expires_lease() {
        let f = fixture();
        let region = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        let lease = f.leases.attach(&f.engine, region, A).unwrap();

        f.clock.advance(1_000);
        assert_eq!(
            f.leases.renew(&f.engine, lease.token, 20_000),
            Err(FamError::Expired {
                token: lease.token,
                deadline_ms: 11_000
            })
        );
        assert_eq!(ref_count(&f, region), 0);
        assert!(f.leases.lease(lease.token).is_none());

        // still reported as expired until the tombstone is swept
        assert!(matches!(
            f.leases.renew(&f.engine, lease.token, 20_000),
            Err(FamError::Expired { .. })
        ));
        f.clock.advance(2_000);
        f.leases.sweep_expired(&f.engine);
        assert_eq!(
            f.leases.renew(&f.engine, lease.token, 20_000),
            Err(FamError::LeaseNotFound { token: lease.token })
        );

        // attaching again gives a new token
        let fresh = f.leases.attach(&f.engine, region, A).unwrap();
        assert_ne!(fresh.token, lease.token);
        assert_eq!(ref_count(&f, region), 1);
    }

    #[test]
    fn test_reattach_after_deadline_issues_new_token() {
        let f = fixture();
        let region = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        let old = f.leases.attach(&f.engine, region, A).unwrap();

        f.clock.advance(5_000);
        let new = f.leases.attach(&f.engine, region, A).unwrap();
        assert_ne!(new.token, old.token);
        assert_eq!(new.acquired_at_ms, 15_000);
        assert_eq!(ref_count(&f, region), 1);
        assert!(matches!(
            f.leases.renew(&f.engine, old.token, 0),
            Err(FamError::Expired { .. })
        ));
    }

    #[test]
    fn test_sweep_releases_expired_leases() {
        let f = fixture();
        let region = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        let short = f.leases.attach(&f.engine, region, A).unwrap();
        let long = f.leases.attach(&f.engine, region, B).unwrap();
        f.leases.renew(&f.engine, long.token, 14_000).unwrap();
        f.engine.free(region, A).unwrap();

        f.clock.advance(1_500);
        let released = f.leases.sweep_expired(&f.engine);
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].token, short.token);
        assert_eq!(ref_count(&f, region), 1);

        f.clock.advance(3_000);
        let released = f.leases.sweep_expired(&f.engine);
        assert_eq!(released.len(), 1);
        assert!(f.engine.table().lookup(region).is_err());
        assert_eq!(f.engine.free_bytes(), 4096);
    }

    #[test]
    fn test_free_reclaims_expired_leases_first() {
        let f = fixture();
        let region = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        let lease = f.leases.attach(&f.engine, region, B).unwrap();

        f.clock.advance(1_001);
        let mut reaped = Vec::new();
        assert_eq!(
            f.leases
                .free_reaping(&f.engine, region, A, FreeOrigin::Client, &mut reaped),
            Ok(FreeOutcome::Freed)
        );
        assert_eq!(reaped, vec![lease.clone()]);
        assert_eq!(f.engine.free_bytes(), 4096);
        assert!(f.leases.is_empty());

        assert!(matches!(
            f.leases.renew(&f.engine, lease.token, 20_000),
            Err(FamError::Expired { .. })
        ));
        assert_eq!(
            f.leases.attach(&f.engine, region, B),
            Err(FamError::RegionNotFound { region })
        );
    }

    #[test]
    fn test_free_keeps_draining_for_live_leases() {
        let f = fixture();
        let region = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        f.leases.attach(&f.engine, region, A).unwrap();
        let long = f.leases.attach(&f.engine, region, B).unwrap();
        f.leases.renew(&f.engine, long.token, 14_000).unwrap();

        f.clock.advance(1_500);
        let mut reaped = Vec::new();
        assert_eq!(
            f.leases
                .free_reaping(&f.engine, region, A, FreeOrigin::Client, &mut reaped),
            Ok(FreeOutcome::Draining)
        );
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].client, A);
        assert_eq!(ref_count(&f, region), 1);
    }

    #[test]
    fn test_attach_frees_draining_region_whose_leases_expired() {
        let f = fixture();
        let region = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        let lease = f.leases.attach(&f.engine, region, B).unwrap();
        assert_eq!(f.engine.free(region, A), Ok(FreeOutcome::Draining));

        f.clock.advance(999);
        assert_eq!(
            f.leases.attach(&f.engine, region, A),
            Err(FamError::RegionDraining { region })
        );

        f.clock.advance(1);
        let mut reaped = Vec::new();
        assert_eq!(
            f.leases.attach_reaping(&f.engine, region, A, &mut reaped),
            Err(FamError::RegionNotFound { region })
        );
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].token, lease.token);
        assert!(f.engine.table().lookup(region).is_err());
        assert_eq!(f.engine.free_bytes(), 4096);
    }

    #[test]
    fn test_reap_region_only_touches_expired_leases() {
        let f = fixture();
        let region = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        let other = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        let short = f.leases.attach(&f.engine, region, A).unwrap();
        let long = f.leases.attach(&f.engine, region, B).unwrap();
        f.leases.renew(&f.engine, long.token, 14_000).unwrap();
        f.leases.attach(&f.engine, other, A).unwrap();

        f.clock.advance(1_000);
        let reaped = f.leases.reap_region(&f.engine, region).unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].token, short.token);
        assert_eq!(ref_count(&f, region), 1);
        assert_eq!(f.leases.holders(region), vec![B]);

        // expired too, but not asked for
        assert_eq!(ref_count(&f, other), 1);
        assert_eq!(
            f.leases.reap_region(&f.engine, RegionId::from_raw(42)),
            Err(FamError::RegionNotFound {
                region: RegionId::from_raw(42)
            })
        );
    }

    #[test]
    fn test_renew_hands_out_reclaimed_lease() {
        let f = fixture();
        let region = f.engine.allocate(64, A, AllocationHint::None).unwrap();
        let lease = f.leases.attach(&f.engine, region, B).unwrap();

        f.clock.advance(1_000);
        let mut reaped = Vec::new();
        assert!(matches!(
            f.leases.renew_reaping(&f.engine, lease.token, 30_000, &mut reaped),
            Err(FamError::Expired { .. })
        ));
        assert_eq!(reaped, vec![lease.clone()]);

        // the tombstone answers, nothing is reclaimed twice
        reaped.clear();
        assert!(matches!(
            f.leases.renew_reaping(&f.engine, lease.token, 30_000, &mut reaped),
            Err(FamError::Expired { .. })
        ));
        assert!(reaped.is_empty());
    }
}
