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

use core::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Identifier of a region.
///
/// Region ids are handed out monotonically and never reused, `0` is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionId(u64);

impl RegionId {
    /// Reserved value that never names a region
    pub const RESERVED: RegionId = RegionId(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_reserved(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Identifier of a client process, assigned by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(u64);

impl ClientId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Opaque token a client presents to detach or renew its lease.
///
/// The upper 64 bits are a sequence number (so tokens are unique for the
/// lifetime of a service), the lower 64 bits are a random nonce (so tokens
/// can not be guessed from each other). On the wire a token is 32 hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseToken(u128);

impl LeaseToken {
    pub const fn from_parts(sequence: u64, nonce: u64) -> Self {
        Self(((sequence as u128) << 64) | nonce as u128)
    }

    pub const fn sequence(self) -> u64 {
        (self.0 >> 64) as u64
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LeaseToken({:032x})", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed lease token {value:?}: expected 32 hex digits")]
pub struct ParseTokenError {
    pub value: String,
}

impl FromStr for LeaseToken {
    type Err = ParseTokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ParseTokenError {
            value: s.to_string(),
        };

        // from_str_radix would also accept a leading '+'
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(malformed());
        }

        u128::from_str_radix(s, 16)
            .map(LeaseToken)
            .map_err(|_| malformed())
    }
}

impl Serialize for LeaseToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LeaseToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// Source of fresh lease tokens
pub(crate) struct LeaseTokenGenerator {
    sequence: AtomicU64,
    rng: Mutex<StdRng>,
}

impl LeaseTokenGenerator {
    pub(crate) fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    #[cfg(test)]
    pub(crate) fn seeded(seed: u64) -> Self {
        Self {
            sequence: AtomicU64::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub(crate) fn next(&self) -> LeaseToken {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let nonce: u64 = self.rng.lock().gen();
        LeaseToken::from_parts(sequence, nonce)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::{LeaseToken, LeaseTokenGenerator, RegionId};

    #[test]
    fn test_lease_token_text_form() {
        let token = LeaseToken::from_parts(7, 0xdead_beef);
        let text = token.to_string();
        assert_eq!(text, "000000000000000700000000deadbeef");
        assert_eq!(text.parse::<LeaseToken>().unwrap(), token);
        assert_eq!(token.sequence(), 7);

        let json = serde_json::to_string(&token).unwrap();
        assert_eq!(json, format!("\"{}\"", text));
        assert_eq!(serde_json::from_str::<LeaseToken>(&json).unwrap(), token);
    }

    #[test]
    fn test_lease_token_rejects_malformed() {
        for input in [
            "",
            "1234",
            "+00000000000000700000000deadbeef",
            "000000000000000700000000deadbeefaa",
            "00000000000000070000000zdeadbeef",
        ] {
            assert!(input.parse::<LeaseToken>().is_err(), "accepted {:?}", input);
        }
        assert!(serde_json::from_str::<LeaseToken>("\"abc\"").is_err());
    }

    #[test]
    fn test_generator_tokens_are_unique() {
        let generator = LeaseTokenGenerator::seeded(42);
        let tokens: HashSet<LeaseToken> = (0..1000).map(|_| generator.next()).collect();
        assert_eq!(tokens.len(), 1000);
        assert!(tokens.iter().all(|token| token.sequence() >= 1));
    }

    #[test]
    fn test_region_id_reserved() {
        assert!(RegionId::RESERVED.is_reserved());
        assert!(!RegionId::from_raw(1).is_reserved());
        assert_eq!(RegionId::from_raw(3).to_string(), "R3");
    }
}
