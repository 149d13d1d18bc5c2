//! Core data model: publication reservations and their snapshots.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one snapshot attempt.
///
/// Wraps a UUIDv7 so ids are globally unique and ordered by creation time.
/// The embedded timestamp lets garbage collection select stale publishes by
/// comparing ids against [`PublishId::floor`] without touching a timestamp
/// column. The canonical hyphenated form preserves byte order, so string
/// comparison in the database matches creation order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublishId(Uuid);

impl PublishId {
    /// Generates a fresh id stamped with the current time.
    pub fn new() -> Self {
        PublishId(Uuid::now_v7())
    }

    /// The smallest possible id for the given instant.
    ///
    /// Every id created before `at` sorts strictly below the returned value.
    pub fn floor(at: SystemTime) -> Self {
        let millis = at
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as u64;
        let mut bytes = [0u8; 16];
        bytes[..6].copy_from_slice(&millis.to_be_bytes()[2..8]);
        // version 7, RFC 4122 variant, all random bits zeroed
        bytes[6] = 0x70;
        bytes[8] = 0x80;
        PublishId(Uuid::from_bytes(bytes))
    }
}

impl Default for PublishId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PublishId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.as_hyphenated().fmt(f)
    }
}

impl FromStr for PublishId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PublishId(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a [`Publish`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PublishStatus {
    /// Reserved, waiting for its archive upload.
    Created = 0,
    /// Upload finished, snapshot is live.
    Published = 1,
    /// Superseded or orphaned, awaiting garbage collection.
    ReadyToDelete = 2,
}

impl PublishStatus {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for PublishStatus {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PublishStatus::Created),
            1 => Ok(PublishStatus::Published),
            2 => Ok(PublishStatus::ReadyToDelete),
            other => Err(other),
        }
    }
}

/// A reservation binding (identity, space, inner object) to a public URI.
///
/// The primary key is derived: `identity + "/" + uri`. The unique index on it
/// is what enforces URI uniqueness per identity, so the derivation must never
/// be hidden behind an application-side check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    /// `{identity}/{uri}`
    pub id: String,
    pub identity: String,
    pub space_id: String,
    pub object_id: String,
    pub uri: String,
    /// Unix seconds of the reservation.
    pub created_at: i64,
    /// Currently served snapshot, if any upload ever completed.
    pub active_publish_id: Option<PublishId>,
}

impl Object {
    pub fn derived_id(identity: &str, uri: &str) -> String {
        format!("{identity}/{uri}")
    }
}

/// Key of an object as addressed by its owner: (identity, space, inner object).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHandle {
    pub identity: String,
    pub space_id: String,
    pub object_id: String,
    pub uri: String,
}

/// One snapshot attempt for an [`Object`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub id: PublishId,
    /// Derived id of the owning object.
    pub object_id: String,
    pub status: PublishStatus,
    /// Opaque client-supplied version string.
    pub version: String,
    /// One-shot secret the uploader must present; cleared on finalization.
    pub upload_key: String,
    /// Total uncompressed bytes of the uploaded blobs, set on finalization.
    pub size: i64,
}

/// An object together with its hydrated active publish, when one exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectWithPublish {
    pub object: Object,
    pub publish: Option<Publish>,
}

/// Current unix time in seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as i64
}
