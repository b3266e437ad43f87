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

use crate::{
    clock::ManualClock,
    config::FamConfig,
    modules::{backing_store::ExtentBackingStore, id_store::MemoryIdStore},
    service::FamService,
};


pub(crate) const TEST_CAPACITY: u64 = 64 * 1024;

/// Service over a 64 KiB address space with a clock that only moves when told to
pub(crate) fn get_test_service(config: FamConfig) -> (Arc<ManualClock>, FamService<ExtentBackingStore>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let clock = Arc::new(ManualClock::new(1_000_000));
    let service = FamService::with_parts(
        config,
        ExtentBackingStore::new(TEST_CAPACITY),
        clock.clone(),
        Box::new(MemoryIdStore::new()),
    )
    .unwrap();

    (clock, service)
}

pub(crate) fn test_config() -> FamConfig {
    FamConfig {
        capacity: TEST_CAPACITY,
        alignment: 64,
        lease_duration_ms: 1_000,
        max_lease_duration_ms: 10_000,
        heartbeat_timeout_ms: 5_000,
        expired_token_retention_ms: 3_000,
        ..Default::default()
    }
}
