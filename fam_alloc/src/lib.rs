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

mod allocator_engine;
mod clock;
mod config;
mod error;
mod extent;
mod identifiers;
mod lease_manager;
mod region_table;
mod service;
mod session_monitor;
mod util;

#[cfg(test)]
mod test;

pub use crate::allocator_engine::{AllocationHint, AllocatorEngine, EngineStats, FreeOutcome};
pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::error::{FamError, Status};
pub use crate::extent::Extent;
pub use crate::identifiers::{ClientId, LeaseToken, ParseTokenError, RegionId};
pub use crate::lease_manager::{Lease, LeaseManager, LeaseSettings, ReleaseReason};
pub use crate::region_table::{Region, RegionState, RegionTable};
pub use crate::service::{FamService, InitError, Request, Response, ServiceStats};
pub use crate::session_monitor::{
    LivenessProbe, MonitorHandle, MonitorSettings, Session, SessionMonitor, SweepReport, TeardownReport,
};
pub use config::{ConfigError, FamConfig};
pub mod modules;
