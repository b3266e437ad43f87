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

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    identifiers::{ClientId, LeaseToken, RegionId},
    region_table::RegionState,
};

/// Status code carried by every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Ok,
    /// Malformed request, the client must not retry it unchanged
    InvalidLength,
    /// Transient, the client may retry after backing off
    NoSpace,
    /// Unknown or already freed identifier
    NotFound,
    NotOwner,
    /// Transient, a free is pending on the region
    RegionDraining,
    /// The lease was reclaimed, the client has to attach again
    Expired,
    /// An invariant was violated inside the service
    Internal,
}

impl Status {
    /// Returns `true` for failures a client may retry later
    pub const fn is_retryable(self) -> bool {
        matches!(self, Status::NoSpace | Status::RegionDraining)
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

/// Errors that can occur during region and lease operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FamError {
    /// Requested length was zero or negative.
    #[error("invalid region length {length}")]
    InvalidLength {
        /// The requested length as received.
        length: i64,
    },

    /// No contiguous free extent is big enough.
    #[error("no space for {requested} bytes (largest free extent is {largest_free} bytes)")]
    NoSpace {
        /// Requested length after alignment.
        requested: u64,
        /// Largest free extent at the time of the request.
        largest_free: u64,
    },

    /// The region does not exist or was freed already.
    #[error("region {region} not found")]
    RegionNotFound {
        /// The region id that was not found.
        region: RegionId,
    },

    /// The lease does not exist (never issued, detached or reclaimed).
    #[error("lease {token} not found")]
    LeaseNotFound {
        /// The token that was not found.
        token: LeaseToken,
    },

    /// An identifier in the request could not be parsed.
    #[error("malformed identifier {value:?}")]
    MalformedIdentifier {
        /// The raw value as received.
        value: String,
    },

    /// Free was requested by a client that does not own the region.
    #[error("client {client} does not own region {region} (owner is {owner})")]
    NotOwner {
        region: RegionId,
        client: ClientId,
        owner: ClientId,
    },

    /// A free is pending on the region, no new leases are accepted.
    #[error("region {region} is draining")]
    RegionDraining {
        /// The draining region.
        region: RegionId,
    },

    /// The lease is past its deadline.
    #[error("lease {token} has expired at {deadline_ms}")]
    Expired {
        /// The expired token.
        token: LeaseToken,
        /// Deadline the lease had (Unix millis), `0` if no longer known.
        deadline_ms: u64,
    },

    /// A compare-and-swap state transition lost a race.
    #[error("region {region} is {actual:?}, expected {expected:?}")]
    Conflict {
        region: RegionId,
        expected: RegionState,
        actual: RegionState,
    },

    /// Invariant violation.
    #[error("internal error: {reason}")]
    Internal {
        /// What went wrong.
        reason: String,
    },
}

impl FamError {
    pub(crate) fn internal(reason: impl Into<String>) -> Self {
        FamError::Internal {
            reason: reason.into(),
        }
    }

    /// Maps this error onto the status code reported to clients
    pub fn status(&self) -> Status {
        match self {
            FamError::InvalidLength { .. } => Status::InvalidLength,
            FamError::NoSpace { .. } => Status::NoSpace,
            FamError::RegionNotFound { .. }
            | FamError::LeaseNotFound { .. }
            | FamError::MalformedIdentifier { .. } => Status::NotFound,
            FamError::NotOwner { .. } => Status::NotOwner,
            FamError::RegionDraining { .. } => Status::RegionDraining,
            FamError::Expired { .. } => Status::Expired,
            FamError::Conflict { .. } | FamError::Internal { .. } => Status::Internal,
        }
    }
}
