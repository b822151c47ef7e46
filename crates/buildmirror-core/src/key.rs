//! Composite cache keys shared by every table.
//!
//! A [`CompositeKey`] packs a server mask into the high 32 bits and the
//! CI server's raw build id into the low 32 bits, so several servers can
//! share one store without their build ids colliding.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-bit identifier for one CI server, placed in the high half of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerMask(pub u32);

impl ServerMask {
    /// Derive the mask for a server id string.
    ///
    /// The mask is the first four bytes of the BLAKE3 digest of `server_id`,
    /// so it is stable across processes and releases.
    #[must_use]
    pub fn for_server(server_id: &str) -> Self {
        let digest = blake3::hash(server_id.as_bytes());
        let bytes = digest.as_bytes();
        Self(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Key for `build_id` on this server.
    #[must_use]
    pub const fn key(self, build_id: u32) -> CompositeKey {
        CompositeKey::new(self, build_id)
    }

    /// Whether `key` belongs to this server.
    #[must_use]
    pub const fn owns(self, key: CompositeKey) -> bool {
        key.server().0 == self.0
    }
}

impl fmt::Display for ServerMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// `serverMask << 32 | rawBuildId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CompositeKey(u64);

impl CompositeKey {
    #[must_use]
    pub const fn new(server: ServerMask, build_id: u32) -> Self {
        Self(((server.0 as u64) << 32) | build_id as u64)
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn server(self) -> ServerMask {
        ServerMask((self.0 >> 32) as u32)
    }

    #[must_use]
    pub const fn build_id(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// Split back into `(server, build_id)`.
    #[must_use]
    pub const fn unmask(self) -> (ServerMask, u32) {
        (self.server(), self.build_id())
    }

    /// SQLite stores `INTEGER` as `i64`; the bit pattern is kept as is.
    #[must_use]
    pub const fn to_sql(self) -> i64 {
        i64::from_ne_bytes(self.0.to_ne_bytes())
    }

    #[must_use]
    pub const fn from_sql(value: i64) -> Self {
        Self(u64::from_ne_bytes(value.to_ne_bytes()))
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.server(), self.build_id())
    }
}
