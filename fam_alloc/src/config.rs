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

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::placement::PlacementKind;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid configuration: {field} {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },

    #[error("could not read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Configuration of one allocation domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FamConfig {
    /// Size of the backing store in bytes
    pub capacity: u64,

    /// Region lengths are rounded up to a multiple of this (power of two)
    pub alignment: u64,

    /// Back the store with 2 MiB pages (mmap store only)
    pub huge_pages: bool,

    /// Policy used when an allocation carries no hint
    pub default_placement: PlacementKind,

    /// Lifetime of a fresh lease
    pub lease_duration_ms: u64,

    /// Upper bound for the deadline a renew may ask for, relative to now
    pub max_lease_duration_ms: u64,

    /// A client that was silent this long is considered gone
    pub heartbeat_timeout_ms: u64,

    /// Period of the background sweep
    pub sweep_interval_ms: u64,

    /// How long tokens reclaimed by expiry keep answering renew with `Expired`
    pub expired_token_retention_ms: u64,

    /// Number of region ids reserved per watermark write
    pub id_block_size: u64,

    /// Free the regions of a lost client as well, not just its leases
    pub reclaim_owned_regions: bool,

    /// Where to persist the region id watermark, `None` keeps it in memory
    pub id_watermark_path: Option<PathBuf>,
}

impl Default for FamConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024 * 1024,
            alignment: 64,
            huge_pages: false,
            default_placement: PlacementKind::FirstFit,
            lease_duration_ms: 30_000,
            max_lease_duration_ms: 300_000,
            heartbeat_timeout_ms: 10_000,
            sweep_interval_ms: 1_000,
            expired_token_retention_ms: 60_000,
            id_block_size: 1024,
            reclaim_owned_regions: true,
            id_watermark_path: None,
        }
    }
}

impl FamConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: FamConfig = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
            Err(ConfigError::Invalid {
                field,
                reason: reason.into(),
            })
        }

        if self.capacity == 0 {
            return invalid("capacity", "must not be zero");
        }
        if !self.alignment.is_power_of_two() {
            return invalid("alignment", format!("{} is not a power of two", self.alignment));
        }
        if self.capacity < self.alignment {
            return invalid(
                "capacity",
                format!("{} is smaller than the alignment {}", self.capacity, self.alignment),
            );
        }
        if self.lease_duration_ms == 0 {
            return invalid("lease_duration_ms", "must not be zero");
        }
        if self.max_lease_duration_ms < self.lease_duration_ms {
            return invalid(
                "max_lease_duration_ms",
                format!("must be at least lease_duration_ms ({})", self.lease_duration_ms),
            );
        }
        if self.heartbeat_timeout_ms == 0 {
            return invalid("heartbeat_timeout_ms", "must not be zero");
        }
        if self.sweep_interval_ms == 0 {
            return invalid("sweep_interval_ms", "must not be zero");
        }
        if self.id_block_size == 0 {
            return invalid("id_block_size", "must not be zero");
        }

        Ok(())
    }
}
