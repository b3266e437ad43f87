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
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use serde::Serialize;
use try_lock::TryLock;

use crate::{
    allocator_engine::{AllocatorEngine, FreeOrigin, FreeOutcome},
    error::FamError,
    identifiers::{ClientId, LeaseToken},
    lease_manager::{Lease, LeaseManager, ReleaseReason},
    modules::backing_store::BackingStoreModule,
    service::FamService,
};

/// What the monitor knows about one client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub client: ClientId,
    pub last_heartbeat_ms: u64,
    pub tokens: HashSet<LeaseToken>,
}

/// External signal whether a client process is still alive, e.g. from the transport
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, client: ClientId) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub client: Option<ClientId>,
    pub leases_released: usize,
    pub regions_freed: usize,
    pub regions_draining: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_leases: usize,
    pub lost_clients: Vec<TeardownReport>,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub heartbeat_timeout_ms: u64,
    pub reclaim_owned_regions: bool,
}

/// Tracks client liveness and reclaims everything a lost client held.
///
/// The monitor goes through the lease manager and allocator engine exactly
/// like a client request would, so a reclamation racing with a client's own
/// detach or free simply finds nothing left to do.
pub struct SessionMonitor {
    sessions: Mutex<HashMap<ClientId, Session>>,
    probe: Option<Box<dyn LivenessProbe>>,
    settings: MonitorSettings,
    sweeping: TryLock<()>,
}

impl SessionMonitor {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            probe: None,
            settings,
            sweeping: TryLock::new(()),
        }
    }

    pub fn set_probe(&mut self, probe: Box<dyn LivenessProbe>) {
        self.probe = Some(probe);
    }

    /// Records a sign of life, opening a session on first contact
    pub fn touch(&self, client: ClientId, now_ms: u64) {
        let mut sessions = self.sessions.lock();
        let session = sessions.entry(client).or_insert_with(|| {
            debug!("opened session for client {}", client);
            Session {
                client,
                last_heartbeat_ms: now_ms,
                tokens: HashSet::new(),
            }
        });
        session.last_heartbeat_ms = session.last_heartbeat_ms.max(now_ms);
    }

    pub fn record_lease(&self, client: ClientId, token: LeaseToken, now_ms: u64) {
        self.touch(client, now_ms);
        if let Some(session) = self.sessions.lock().get_mut(&client) {
            session.tokens.insert(token);
        }
    }

    pub fn forget_lease(&self, client: ClientId, token: LeaseToken) {
        if let Some(session) = self.sessions.lock().get_mut(&client) {
            session.tokens.remove(&token);
        }
    }

    /// Drops tokens of leases that were released without their holder asking
    pub fn forget_leases(&self, leases: &[Lease]) {
        if leases.is_empty() {
            return;
        }

        let mut sessions = self.sessions.lock();
        for lease in leases {
            if let Some(session) = sessions.get_mut(&lease.client) {
                session.tokens.remove(&lease.token);
            }
        }
    }

    pub fn session(&self, client: ClientId) -> Option<Session> {
        self.sessions.lock().get(&client).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Clients that missed their heartbeat or that the probe reports as gone
    pub fn lost_clients(&self, now_ms: u64) -> Vec<ClientId> {
        let (mut lost, alive): (Vec<ClientId>, Vec<ClientId>) = {
            let sessions = self.sessions.lock();
            let (lost, alive): (Vec<&Session>, Vec<&Session>) = sessions.values().partition(|session| {
                now_ms.saturating_sub(session.last_heartbeat_ms) >= self.settings.heartbeat_timeout_ms
            });
            (
                lost.iter().map(|session| session.client).collect(),
                alive.iter().map(|session| session.client).collect(),
            )
        };

        // the probe is foreign code, it runs without the session lock
        if let Some(probe) = &self.probe {
            lost.extend(alive.into_iter().filter(|client| !probe.is_alive(*client)));
        }

        lost.sort();
        lost
    }

    /// Tears down the session of `client` right away, e.g. when the transport saw it disconnect
    pub fn disconnect<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        leases: &LeaseManager,
        client: ClientId,
    ) -> TeardownReport {
        info!("client {} disconnected", client);
        self.teardown(engine, leases, client)
    }

    /// Releases every lease of `client` and, if configured, frees the regions it owns.
    ///
    /// The session is removed first, a request of the client that arrives
    /// afterwards opens a new one.
    pub fn teardown<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        leases: &LeaseManager,
        client: ClientId,
    ) -> TeardownReport {
        let mut tokens: HashSet<LeaseToken> = self
            .sessions
            .lock()
            .remove(&client)
            .map(|session| session.tokens)
            .unwrap_or_default();
        tokens.extend(leases.tokens_of(client));

        let mut report = TeardownReport {
            client: Some(client),
            ..Default::default()
        };

        for token in tokens {
            match leases.release(engine, token, ReleaseReason::SessionLost) {
                Ok(_) => report.leases_released += 1,
                Err(FamError::LeaseNotFound { .. }) => {
                    debug!("lease {} of lost client {} was already gone", token, client)
                }
                Err(err) => error!("could not release lease {} of lost client {}: {}", token, client, err),
            }
        }

        if self.settings.reclaim_owned_regions {
            let mut reaped = Vec::new();
            for region in engine.table().owned_by(client) {
                match leases.free_reaping(engine, region, client, FreeOrigin::Reclaim, &mut reaped) {
                    Ok(FreeOutcome::Freed) => report.regions_freed += 1,
                    Ok(FreeOutcome::Draining) => report.regions_draining += 1,
                    Err(FamError::RegionNotFound { .. }) => {
                        debug!("region {} of lost client {} was already freed", region, client)
                    }
                    Err(err) => error!("could not reclaim region {} of lost client {}: {}", region, client, err),
                }
            }
            self.forget_leases(&reaped);
        }

        info!(
            "reclaimed client {}: {} lease(s) released, {} region(s) freed, {} draining",
            client, report.leases_released, report.regions_freed, report.regions_draining
        );
        report
    }

    /// One monitor pass: expire leases, then tear down lost clients.
    ///
    /// Returns `None` without doing anything if another sweep is running.
    pub fn sweep<B: BackingStoreModule>(
        &self,
        engine: &AllocatorEngine<B>,
        leases: &LeaseManager,
        now_ms: u64,
    ) -> Option<SweepReport> {
        let Some(_guard) = self.sweeping.try_lock() else {
            trace!("sweep skipped, previous sweep still running");
            return None;
        };

        let expired = leases.sweep_expired(engine);
        self.forget_leases(&expired);

        let lost_clients = self
            .lost_clients(now_ms)
            .into_iter()
            .map(|client| {
                warn!("client {} is gone, reclaiming its resources", client);
                self.teardown(engine, leases, client)
            })
            .collect();

        let report = SweepReport {
            expired_leases: expired.len(),
            lost_clients,
        };
        if report.expired_leases > 0 || !report.lost_clients.is_empty() {
            debug!(
                "sweep expired {} lease(s) and reclaimed {} client(s)",
                report.expired_leases,
                report.lost_clients.len()
            );
        }

        Some(report)
    }
}

/// Runs the monitor sweep of a service on a background thread.
///
/// Dropping the handle stops the thread and waits for it.
pub struct MonitorHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn spawn<B: BackingStoreModule + 'static>(service: Arc<FamService<B>>) -> io::Result<Self> {
        let interval = Duration::from_millis(service.config().sweep_interval_ms);
        let (stop, stopped) = bounded::<()>(1);

        let thread = thread::Builder::new()
            .name("fam-monitor".to_string())
            .spawn(move || {
                debug!("monitor started, sweeping every {:?}", interval);
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            service.sweep();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("monitor stopped");
            })?;

        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    /// Stops the thread and waits for the running sweep to finish
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // disconnecting the channel wakes the thread
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
