//! Serialization and snapshot support for the transport engine.
//!
//! Provides binary serialization via `bitcode` with a versioned header and
//! a fixed-capacity snapshot buffer for checkpoint/rewind workflows. Parcel
//! history grows without bound during a run; callers checkpoint here and
//! truncate the store to keep long runs in memory.

use crate::engine::{Engine, EngineConfig, StepError};
use crate::network::RiverNetwork;
use crate::sim::SimState;
use crate::store::ParcelStore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying an alluvium engine snapshot.
pub const SNAPSHOT_MAGIC: u32 = 0xA11D_0001;

/// Current format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during serialization.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
}

/// Errors that can occur during deserialization.
#[derive(Debug, thiserror::Error)]
pub enum DeserializeError {
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", SNAPSHOT_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("snapshot from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
    #[error("snapshot state rejected: {0}")]
    Rejected(#[from] StepError),
    #[error("state hash mismatch after restore: stored {stored:#018x}, recomputed {recomputed:#018x}")]
    HashMismatch { stored: u64, recomputed: u64 },
}

// ---------------------------------------------------------------------------
// Snapshot header
// ---------------------------------------------------------------------------

/// Header prepended to every serialized snapshot. Enables format detection
/// and version checking before attempting to use the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// Magic number for format detection.
    pub magic: u32,
    /// Format version for forward compatibility.
    pub version: u32,
    /// Step count at the time the snapshot was taken.
    pub step: u64,
}

impl SnapshotHeader {
    /// Create a header for the current format version.
    pub fn new(step: u64) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: FORMAT_VERSION,
            step,
        }
    }

    /// Validate the header. Returns `Ok(())` if valid.
    pub fn validate(&self) -> Result<(), DeserializeError> {
        if self.magic != SNAPSHOT_MAGIC {
            return Err(DeserializeError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(DeserializeError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(DeserializeError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

/// Read the snapshot header from serialized data.
///
/// bitcode does not support partial deserialization, so this decodes the
/// full snapshot and returns only the header; use it for version detection
/// before deciding how to handle the payload.
pub fn read_snapshot_header(data: &[u8]) -> Result<SnapshotHeader, DeserializeError> {
    let snapshot: EngineSnapshot =
        bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
    Ok(snapshot.header)
}

// ---------------------------------------------------------------------------
// Serializable engine state
// ---------------------------------------------------------------------------

/// The serializable portion of the engine state. The capacity formula is
/// excluded (trait object) and rebuilt from `config.formula`; per-step
/// reach scratch (flows, layers) is excluded and recomputed on the next
/// step.
#[derive(Debug, Serialize, Deserialize)]
struct EngineSnapshot {
    header: SnapshotHeader,
    network: RiverNetwork,
    store: ParcelStore,
    config: EngineConfig,
    sim_state: SimState,
    last_state_hash: u64,
}

// ---------------------------------------------------------------------------
// SnapshotBuffer
// ---------------------------------------------------------------------------

/// A fixed-capacity buffer of serialized engine snapshots.
///
/// When the buffer is full, the oldest snapshot is evicted. Each entry
/// stores the serialized bytes and the step at which it was taken.
#[derive(Debug)]
pub struct SnapshotBuffer {
    /// Stored snapshots, oldest first.
    entries: VecDeque<SnapshotEntry>,
    capacity: usize,
    /// Total snapshots ever taken (including evicted).
    total_taken: u64,
}

/// A single entry in the snapshot buffer.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    /// Step at which the snapshot was taken.
    pub step: u64,
    /// Serialized engine state (bitcode bytes).
    pub data: Vec<u8>,
}

impl SnapshotBuffer {
    /// Create a buffer with the given capacity. A capacity of 0 is clamped
    /// to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            total_taken: 0,
        }
    }

    /// Push a snapshot. If full, the oldest entry is evicted.
    pub fn push(&mut self, entry: SnapshotEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        self.total_taken += 1;
    }

    /// The maximum number of snapshots this buffer can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of snapshots currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total snapshots ever taken (including evicted).
    pub fn total_taken(&self) -> u64 {
        self.total_taken
    }

    /// Get a snapshot by index (0 = oldest, len-1 = newest).
    pub fn get(&self, index: usize) -> Option<&SnapshotEntry> {
        self.entries.get(index)
    }

    /// The most recent snapshot.
    pub fn latest(&self) -> Option<&SnapshotEntry> {
        self.entries.back()
    }

    /// Drop all stored snapshots. `total_taken` is not reset.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ---------------------------------------------------------------------------
// Engine serialization methods
// ---------------------------------------------------------------------------

impl Engine {
    /// Serialize the engine state to a binary blob via bitcode.
    ///
    /// The capacity formula is not serialized; on deserialize it is rebuilt
    /// from the config. A formula installed with `set_capacity_formula` that
    /// does not correspond to a [`crate::capacity::FormulaKind`] must be
    /// re-installed after restore.
    pub fn serialize(&self) -> Result<Vec<u8>, SerializeError> {
        let (network, store, config, sim_state) = self.parts();
        let snapshot = EngineSnapshot {
            header: SnapshotHeader::new(sim_state.step),
            network: network.clone(),
            store: store.clone(),
            config: config.clone(),
            sim_state: sim_state.clone(),
            last_state_hash: self.state_hash(),
        };
        bitcode::serialize(&snapshot).map_err(|e| SerializeError::Encode(e.to_string()))
    }

    /// Deserialize an engine from a binary blob.
    ///
    /// Validates the header (magic number, version), revalidates the state
    /// against the config, and verifies the stored state hash against a
    /// recomputation, so a corrupted or hand-edited snapshot fails here
    /// rather than desyncing silently later.
    pub fn deserialize(data: &[u8]) -> Result<Self, DeserializeError> {
        let snapshot: EngineSnapshot =
            bitcode::deserialize(data).map_err(|e| DeserializeError::Decode(e.to_string()))?;
        snapshot.header.validate()?;

        let engine = Engine::from_parts(
            snapshot.network,
            snapshot.store,
            snapshot.config,
            snapshot.sim_state,
        )?;
        if engine.state_hash() != snapshot.last_state_hash {
            return Err(DeserializeError::HashMismatch {
                stored: snapshot.last_state_hash,
                recomputed: engine.state_hash(),
            });
        }
        Ok(engine)
    }

    /// Take a snapshot of the current state into the buffer.
    pub fn take_snapshot(&self, buffer: &mut SnapshotBuffer) -> Result<(), SerializeError> {
        let data = self.serialize()?;
        buffer.push(SnapshotEntry {
            step: self.sim_state().step,
            data,
        });
        Ok(())
    }

    /// Restore an engine from a snapshot in the buffer.
    ///
    /// `index` is 0-based from oldest (0) to newest (len-1). Returns
    /// `Ok(None)` if the index is out of range.
    pub fn restore_snapshot(
        buffer: &SnapshotBuffer,
        index: usize,
    ) -> Result<Option<Engine>, DeserializeError> {
        let Some(entry) = buffer.get(index) else {
            return Ok(None);
        };
        let engine = Engine::deserialize(&entry.data)?;
        Ok(Some(engine))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
