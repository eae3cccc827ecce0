//! Read-only query API for inspecting simulation state.
//!
//! Provides snapshot types that aggregate engine state into convenient views
//! for analysis and plotting. All types are owned copies -- no references
//! into internal engine storage.

use crate::id::{ParcelId, ReachId};
use crate::parcel::Location;

/// Grain diameter below which a parcel counts as sand, m.
pub const SAND_THRESHOLD: f64 = 0.002;

// ---------------------------------------------------------------------------
// Reach statistics
// ---------------------------------------------------------------------------

/// Aggregated sediment statistics for one reach at the most recent step.
///
/// Active-layer figures cover only parcels flagged as layer members; a reach
/// whose surface is fully buried under immobile sediment still reports its
/// total load through `parcel_count` and `total_volume`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReachSedimentStats {
    /// The reach these statistics describe.
    pub reach: ReachId,
    /// In-network parcels currently in the reach.
    pub parcel_count: usize,
    /// Total sediment volume in the reach, m^3.
    pub total_volume: f64,
    /// Parcels in the active layer.
    pub active_count: usize,
    /// Sediment volume in the active layer, m^3.
    pub active_volume: f64,
    /// Volume-weighted mean grain diameter of active-layer parcels, m.
    /// Zero when the layer is empty.
    pub mean_active_grain_size: f64,
    /// Fraction of active-layer volume finer than [`SAND_THRESHOLD`].
    /// Zero when the layer is empty.
    pub sand_fraction: f64,
}

// ---------------------------------------------------------------------------
// Parcel time series
// ---------------------------------------------------------------------------

/// The retained history of one parcel, one entry per stored step.
///
/// Entries run from `first_step` to the store's latest step inclusive;
/// steps before the parcel existed (or dropped by history truncation) are
/// not represented. All vectors share the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct ParcelSeries {
    pub parcel: ParcelId,
    /// Step of the first entry.
    pub first_step: u64,
    /// Location at each step.
    pub locations: Vec<Location>,
    /// Fractional position at each step.
    pub positions: Vec<f64>,
    /// Volume at each step, m^3.
    pub volumes: Vec<f64>,
    /// Cumulative travel distance at each step, m.
    pub distances: Vec<f64>,
    /// Shear-stress ratio at each step. Zero when buried or out of network.
    pub stress_ratios: Vec<f64>,
}

impl ParcelSeries {
    /// Number of stored steps in the series.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Step of the last entry.
    pub fn last_step(&self) -> u64 {
        self.first_step + self.len().saturating_sub(1) as u64
    }
}
