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

use log::{debug, error, trace};
use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use thiserror::Error;

use crate::{
    allocator_engine::{AllocationHint, AllocatorEngine, EngineStats, FreeOrigin, FreeOutcome},
    clock::{Clock, SystemClock},
    config::{ConfigError, FamConfig},
    error::{FamError, Status},
    identifiers::{ClientId, LeaseToken, RegionId},
    lease_manager::{Lease, LeaseManager, LeaseSettings},
    modules::{
        backing_store::{BackingStoreModule, ExtentBackingStore},
        id_store::{FileIdStore, IdStoreError, IdStoreModule, MemoryIdStore},
    },
    region_table::{Region, RegionTable},
    session_monitor::{LivenessProbe, MonitorHandle, MonitorSettings, SessionMonitor, SweepReport, TeardownReport},
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not load region id watermark: {0}")]
    IdStore(#[from] IdStoreError),

    #[error("backing store holds {store} bytes, configuration asks for {configured}")]
    CapacityMismatch { store: u64, configured: u64 },
}

/// A request as it arrives from the transport.
///
/// On the wire: `{"type": "ALLOCATE", "message": {"length": 100, "client_id": 1}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Request {
    Ping,
    Heartbeat {
        client_id: ClientId,
    },
    Allocate {
        length: i64,
        client_id: ClientId,
        #[serde(default)]
        hint: AllocationHint,
    },
    Free {
        region_id: RegionId,
        client_id: ClientId,
    },
    Attach {
        region_id: RegionId,
        client_id: ClientId,
    },
    Detach {
        lease_token: String,
    },
    Renew {
        lease_token: String,
        new_deadline: u64,
    },
}

/// Reply to a [`Request`], success fields are only set with status `OK`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_id: Option<RegionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<LeaseToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            region_id: None,
            lease_token: None,
            message: None,
        }
    }

    fn region(region_id: RegionId) -> Self {
        Self {
            region_id: Some(region_id),
            ..Self::ok()
        }
    }

    fn lease(lease_token: LeaseToken) -> Self {
        Self {
            lease_token: Some(lease_token),
            ..Self::ok()
        }
    }

    pub fn error(err: &FamError) -> Self {
        Self {
            status: err.status(),
            message: Some(err.to_string()),
            ..Self::ok()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    #[serde(flatten)]
    pub engine: EngineStats,
    pub leases: usize,
    pub sessions: usize,
}

/// The allocation service for one domain.
///
/// Shared between request threads as `Arc<FamService<B>>`, all methods take
/// `&self`.
pub struct FamService<B: BackingStoreModule> {
    config: FamConfig,
    clock: Arc<dyn Clock>,
    engine: AllocatorEngine<B>,
    leases: LeaseManager,
    monitor: SessionMonitor,
}

assert_impl_all!(FamService<ExtentBackingStore>: Send, Sync);

impl<B: BackingStoreModule> FamService<B> {
    /// Creates a service that uses the system clock and keeps the region id
    /// watermark in `config.id_watermark_path`, or in memory if there is none
    pub fn new(config: FamConfig, store: B) -> Result<Self, InitError> {
        let id_store: Box<dyn IdStoreModule> = match &config.id_watermark_path {
            Some(path) => Box::new(FileIdStore::new(path.clone())),
            None => Box::new(MemoryIdStore::new()),
        };

        Self::with_parts(config, store, Arc::new(SystemClock), id_store)
    }

    pub fn with_parts(
        config: FamConfig,
        store: B,
        clock: Arc<dyn Clock>,
        id_store: Box<dyn IdStoreModule>,
    ) -> Result<Self, InitError> {
        config.validate()?;
        if store.capacity() < config.capacity {
            return Err(InitError::CapacityMismatch {
                store: store.capacity(),
                configured: config.capacity,
            });
        }

        let table = RegionTable::new(store.capacity(), id_store, config.id_block_size)?;
        let engine = AllocatorEngine::new(
            store,
            table,
            config.alignment,
            config.default_placement,
            clock.clone(),
        );
        let leases = LeaseManager::new(
            LeaseSettings {
                lease_duration_ms: config.lease_duration_ms,
                max_lease_duration_ms: config.max_lease_duration_ms,
                expired_token_retention_ms: config.expired_token_retention_ms,
            },
            clock.clone(),
        );
        let monitor = SessionMonitor::new(MonitorSettings {
            heartbeat_timeout_ms: config.heartbeat_timeout_ms,
            reclaim_owned_regions: config.reclaim_owned_regions,
        });

        debug!(
            "service ready with {} bytes, alignment {}",
            engine.capacity(),
            engine.alignment()
        );

        Ok(Self {
            config,
            clock,
            engine,
            leases,
            monitor,
        })
    }

    /// Adds an external liveness signal to the monitor
    pub fn with_liveness_probe(mut self, probe: Box<dyn LivenessProbe>) -> Self {
        self.monitor.set_probe(probe);
        self
    }

    pub fn config(&self) -> &FamConfig {
        &self.config
    }

    pub fn engine(&self) -> &AllocatorEngine<B> {
        &self.engine
    }

    pub fn leases(&self) -> &LeaseManager {
        &self.leases
    }

    pub fn monitor(&self) -> &SessionMonitor {
        &self.monitor
    }

    /// Dispatches a request and maps the outcome to a status code
    pub fn handle(&self, request: Request) -> Response {
        trace!("handling {:?}", request);

        let result = match request {
            Request::Ping => Ok(Response::ok()),
            Request::Heartbeat { client_id } => {
                self.heartbeat(client_id);
                Ok(Response::ok())
            }
            Request::Allocate {
                length,
                client_id,
                hint,
            } => self.allocate(length, client_id, hint).map(Response::region),
            Request::Free {
                region_id,
                client_id,
            } => self.free(region_id, client_id).map(|_| Response::ok()),
            Request::Attach {
                region_id,
                client_id,
            } => self.attach(region_id, client_id).map(Response::lease),
            Request::Detach { lease_token } => parse_token(&lease_token)
                .and_then(|token| self.detach(token))
                .map(|_| Response::ok()),
            Request::Renew {
                lease_token,
                new_deadline,
            } => parse_token(&lease_token)
                .and_then(|token| self.renew(token, new_deadline))
                .map(|_| Response::ok()),
        };

        result.unwrap_or_else(|err| {
            match err.status() {
                Status::Internal => error!("request failed: {}", err),
                _ => debug!("request failed: {}", err),
            }
            Response::error(&err)
        })
    }

    /// Allocates a region of `length` bytes owned by `client`
    pub fn allocate(
        &self,
        length: i64,
        client: ClientId,
        hint: AllocationHint,
    ) -> Result<RegionId, FamError> {
        if length <= 0 {
            return Err(FamError::InvalidLength { length });
        }

        self.monitor.touch(client, self.clock.now_ms());
        self.engine.allocate(length as u64, client, hint)
    }

    /// Frees a region, leases of it that ran out do not keep it draining
    pub fn free(&self, region: RegionId, client: ClientId) -> Result<FreeOutcome, FamError> {
        check_region_id(region)?;
        self.monitor.touch(client, self.clock.now_ms());

        let mut reaped = Vec::new();
        let outcome = self
            .leases
            .free_reaping(&self.engine, region, client, FreeOrigin::Client, &mut reaped);
        self.monitor.forget_leases(&reaped);
        outcome
    }

    pub fn attach(&self, region: RegionId, client: ClientId) -> Result<LeaseToken, FamError> {
        check_region_id(region)?;
        self.monitor.touch(client, self.clock.now_ms());

        let mut reaped = Vec::new();
        let lease = self
            .leases
            .attach_reaping(&self.engine, region, client, &mut reaped);
        self.monitor.forget_leases(&reaped);

        let lease = lease?;
        self.monitor
            .record_lease(client, lease.token, self.clock.now_ms());
        Ok(lease.token)
    }

    pub fn detach(&self, token: LeaseToken) -> Result<(), FamError> {
        let lease = self.leases.detach(&self.engine, token)?;
        self.monitor.forget_lease(lease.client, token);
        self.monitor.touch(lease.client, self.clock.now_ms());
        Ok(())
    }

    /// Moves the deadline of a lease, returns the deadline that was granted
    pub fn renew(&self, token: LeaseToken, new_deadline_ms: u64) -> Result<u64, FamError> {
        let mut reaped = Vec::new();
        let lease = self
            .leases
            .renew_reaping(&self.engine, token, new_deadline_ms, &mut reaped);
        self.monitor.forget_leases(&reaped);

        let lease = lease?;
        self.monitor.touch(lease.client, self.clock.now_ms());
        Ok(lease.deadline_ms)
    }

    pub fn heartbeat(&self, client: ClientId) {
        self.monitor.touch(client, self.clock.now_ms());
    }

    /// Reclaims everything `client` holds, e.g. after the transport lost its connection
    pub fn disconnect(&self, client: ClientId) -> TeardownReport {
        self.monitor.disconnect(&self.engine, &self.leases, client)
    }

    /// Runs one monitor pass now
    pub fn sweep(&self) -> Option<SweepReport> {
        self.monitor
            .sweep(&self.engine, &self.leases, self.clock.now_ms())
    }

    /// Looks up a region. Its expired leases are reclaimed first, so the
    /// reference count only covers leases that are still valid.
    pub fn region(&self, region: RegionId) -> Result<Region, FamError> {
        check_region_id(region)?;
        let reaped = self.leases.reap_region(&self.engine, region)?;
        self.monitor.forget_leases(&reaped);
        self.engine.table().lookup(region)
    }

    pub fn lease(&self, token: LeaseToken) -> Option<Lease> {
        self.leases.lease(token)
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            engine: self.engine.stats(),
            leases: self.leases.len(),
            sessions: self.monitor.len(),
        }
    }
}

impl<B: BackingStoreModule + 'static> FamService<B> {
    /// Starts the background sweep, it stops when the handle is dropped
    pub fn spawn_monitor(self: &Arc<Self>) -> std::io::Result<MonitorHandle> {
        MonitorHandle::spawn(Arc::clone(self))
    }
}

fn check_region_id(region: RegionId) -> Result<(), FamError> {
    if region.is_reserved() {
        return Err(FamError::RegionNotFound { region });
    }
    Ok(())
}

fn parse_token(raw: &str) -> Result<LeaseToken, FamError> {
    raw.parse()
        .map_err(|_| FamError::MalformedIdentifier { value: raw.to_string() })
}
