//! Hybrid logical clock.
//!
//! An [`Hlc`] combines wall-clock milliseconds with a logical counter and the
//! id of the replica that produced it. The derived ordering compares
//! `(physical_ms, logical, replica)` lexicographically, which gives a total
//! order across all replicas.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tether_codec::{CodecError, CodecResult, FromValue, MapReader, ToValue, Value};
use uuid::Uuid;

/// Length of [`Hlc::to_bytes`].
pub const HLC_BYTES_LEN: usize = 28;

/// Identifier of a replica (a satellite or the server).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ReplicaId([u8; 16]);

impl ReplicaId {
    /// Wraps raw id bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Builds an id from a slice, which must be 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaId({self})")
    }
}

/// A hybrid logical clock timestamp.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Hlc {
    /// Wall-clock milliseconds since the Unix epoch.
    pub physical_ms: u64,
    /// Logical counter within one millisecond.
    pub logical: u32,
    /// Replica that issued the timestamp.
    pub replica: ReplicaId,
}

impl Hlc {
    /// Creates a timestamp.
    pub const fn new(physical_ms: u64, logical: u32, replica: ReplicaId) -> Self {
        Self {
            physical_ms,
            logical,
            replica,
        }
    }

    /// True when both timestamps share physical and logical time.
    ///
    /// Two such timestamps differ only by replica and are concurrent.
    pub fn same_instant(&self, other: &Hlc) -> bool {
        self.physical_ms == other.physical_ms && self.logical == other.logical
    }

    /// Fixed-width big-endian encoding whose bytewise order matches `Ord`.
    pub fn to_bytes(&self) -> [u8; HLC_BYTES_LEN] {
        let mut out = [0u8; HLC_BYTES_LEN];
        out[..8].copy_from_slice(&self.physical_ms.to_be_bytes());
        out[8..12].copy_from_slice(&self.logical.to_be_bytes());
        out[12..].copy_from_slice(self.replica.as_bytes());
        out
    }

    /// Parses the encoding produced by [`Hlc::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() != HLC_BYTES_LEN {
            return Err(CodecError::invalid_structure(format!(
                "hlc must be {HLC_BYTES_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut physical = [0u8; 8];
        physical.copy_from_slice(&bytes[..8]);
        let mut logical = [0u8; 4];
        logical.copy_from_slice(&bytes[8..12]);
        let replica = ReplicaId::from_slice(&bytes[12..])
            .ok_or_else(|| CodecError::invalid_structure("hlc replica must be 16 bytes"))?;
        Ok(Self {
            physical_ms: u64::from_be_bytes(physical),
            logical: u32::from_be_bytes(logical),
            replica,
        })
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.physical_ms, self.logical, self.replica)
    }
}

impl ToValue for Hlc {
    #[allow(clippy::cast_possible_wrap)]
    fn to_value(&self) -> Value {
        Value::text_map(vec![
            ("physical_ms", Value::Integer(self.physical_ms as i64)),
            ("logical", Value::from(self.logical)),
            ("replica", Value::Bytes(self.replica.as_bytes().to_vec())),
        ])
    }
}

impl FromValue for Hlc {
    fn from_value(value: &Value) -> CodecResult<Self> {
        let reader = MapReader::new(value, "Hlc")?;
        Ok(Self {
            physical_ms: reader.u64("physical_ms")?,
            logical: reader.u32("logical")?,
            replica: ReplicaId::new(reader.byte_array::<16>("replica")?),
        })
    }
}

/// Source of wall-clock time for an [`HlcClock`].
pub trait WallClock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl WallClock for SystemClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A manually driven clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(now_ms),
        }
    }

    /// Sets the current reading.
    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Moves the reading forward.
    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl WallClock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Per-replica HLC generator.
///
/// Every value returned by [`now`](Self::now) or [`observe`](Self::observe)
/// is strictly greater than every value previously returned by this clock.
#[derive(Debug)]
pub struct HlcClock {
    replica: ReplicaId,
    wall: Arc<dyn WallClock>,
    last: Mutex<(u64, u32)>,
}

impl HlcClock {
    /// Creates a clock reading the system time.
    pub fn new(replica: ReplicaId) -> Self {
        Self::with_wall_clock(replica, Arc::new(SystemClock))
    }

    /// Creates a clock reading an injected wall clock.
    pub fn with_wall_clock(replica: ReplicaId, wall: Arc<dyn WallClock>) -> Self {
        Self {
            replica,
            wall,
            last: Mutex::new((0, 0)),
        }
    }

    /// Replica this clock stamps.
    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Most recently issued (or seeded) timestamp.
    pub fn last(&self) -> Hlc {
        let (physical_ms, logical) = *self.last.lock();
        Hlc::new(physical_ms, logical, self.replica)
    }

    /// Raises the clock to at least `floor` without issuing a timestamp.
    ///
    /// Used at start-up with the largest timestamp found in durable state.
    pub fn seed(&self, floor: &Hlc) {
        let mut last = self.last.lock();
        if (floor.physical_ms, floor.logical) > *last {
            *last = (floor.physical_ms, floor.logical);
        }
    }

    /// Issues a timestamp for a local event.
    pub fn now(&self) -> Hlc {
        let wall = self.wall.now_ms();
        let mut last = self.last.lock();
        *last = if wall > last.0 {
            (wall, 0)
        } else {
            tick(last.0, last.1)
        };
        Hlc::new(last.0, last.1, self.replica)
    }

    /// Merges a received timestamp and issues a timestamp after it.
    pub fn observe(&self, remote: &Hlc) -> Hlc {
        let wall = self.wall.now_ms();
        let mut last = self.last.lock();
        let (local_p, local_l) = *last;
        let physical = wall.max(local_p).max(remote.physical_ms);

        *last = if physical == local_p && physical == remote.physical_ms {
            tick(physical, local_l.max(remote.logical))
        } else if physical == local_p {
            tick(physical, local_l)
        } else if physical == remote.physical_ms {
            tick(physical, remote.logical)
        } else {
            (physical, 0)
        };
        Hlc::new(last.0, last.1, self.replica)
    }
}

fn tick(physical: u64, logical: u32) -> (u64, u32) {
    match logical.checked_add(1) {
        Some(next) => (physical, next),
        None => (physical.saturating_add(1), 0),
    }
}
