//! Step counter, step summaries, and the desync-detection state hash.

use crate::id::ParcelId;

// ---------------------------------------------------------------------------
// Simulation state
// ---------------------------------------------------------------------------

/// Mutable clock state tracked by the engine. The step counter is explicit
/// context, never process-wide state; it always equals the store's latest
/// recorded step.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SimState {
    /// Completed steps since construction.
    pub step: u64,
    /// Accumulated model time, s.
    pub model_time: f64,
}

impl SimState {
    /// Fresh state at step 0.
    pub fn new() -> Self {
        Self {
            step: 0,
            model_time: 0.0,
        }
    }
}

impl Default for SimState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Step summary
// ---------------------------------------------------------------------------

/// Result of one `Engine::run_one_step` call.
#[derive(Debug, Clone, Default)]
pub struct StepSummary {
    /// Absolute index of the step just completed.
    pub step: u64,
    /// Timestep length, s.
    pub dt: f64,
    /// Parcels inside an active layer this step.
    pub active_parcels: usize,
    /// Active parcels above the mobility threshold.
    pub mobile_parcels: usize,
    /// Parcels that crossed the outlet this step, in processing order.
    /// Callers relocate these to implement recycling.
    pub exited: Vec<ParcelId>,
    /// Summed in-network travel distance, m.
    pub total_distance: f64,
    /// Total volume lost to abrasion, m^3.
    pub abraded_volume: f64,
    /// State hash after the step.
    pub state_hash: u64,
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// A simple deterministic hash of simulation state for desync detection.
///
/// Uses FNV-1a (64-bit) for speed and simplicity. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(pub u64);

impl StateHash {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    /// Start a new hash.
    pub fn new() -> Self {
        Self(Self::FNV_OFFSET)
    }

    /// Feed bytes into the hash.
    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::FNV_PRIME);
        }
    }

    /// Feed a u64 into the hash.
    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    /// Feed a u32 into the hash.
    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    /// Feed an f64 into the hash, by bit pattern.
    pub fn write_f64(&mut self, v: f64) {
        self.write(&v.to_bits().to_le_bytes());
    }

    /// Finalize and return the hash value.
    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}
