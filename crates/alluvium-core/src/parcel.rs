//! Sediment parcels: discrete tracked volumes of bed material.
//!
//! A parcel splits into two parts. [`ParcelAttributes`] never change after
//! creation. [`ParcelRecord`] is the per-timestep state the store keeps one
//! copy of per elapsed step.

use crate::id::{PropertyId, ReachId, SourceTag};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Where a parcel currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    /// Inside a reach of the network.
    InReach(ReachId),
    /// Past the outlet. Excluded from transport until relocated back in.
    OutOfNetwork,
}

impl Location {
    /// The containing reach, if any.
    pub fn reach(&self) -> Option<ReachId> {
        match self {
            Location::InReach(r) => Some(*r),
            Location::OutOfNetwork => None,
        }
    }

    pub fn is_out_of_network(&self) -> bool {
        matches!(self, Location::OutOfNetwork)
    }
}

/// Stratigraphic ordering key: when a parcel arrived in its current reach.
///
/// `seq` is issued globally by the store on every arrival event, so parcels
/// arriving in the same step still have a total order. Larger key = arrived
/// later = sits nearer the bed surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArrivalKey {
    pub step: u64,
    pub seq: u64,
}

/// Attributes fixed at parcel creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelAttributes {
    /// Median grain diameter, m.
    pub grain_size: f64,
    /// Sediment density, kg/m^3.
    pub density: f64,
    /// Abrasion coefficient, 1/m of travel.
    pub abrasion_rate: f64,
    /// Provenance label, opaque to the engine.
    pub source: SourceTag,
    /// Reach the parcel was created in.
    pub origin_reach: ReachId,
    /// Step the parcel entered the store.
    pub birth_step: u64,
    /// Open extension fields (e.g. lithology class, tracer mass).
    /// Validated once when the parcel is added, never per access.
    #[serde(default)]
    pub properties: BTreeMap<PropertyId, f64>,
}

impl ParcelAttributes {
    pub fn set_property(&mut self, id: PropertyId, value: f64) {
        self.properties.insert(id, value);
    }

    pub fn get_property(&self, id: PropertyId) -> Option<f64> {
        self.properties.get(&id).copied()
    }
}

/// Per-timestep state of one parcel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParcelRecord {
    pub location: Location,
    /// Fractional position in the reach: 0 = upstream end, 1 = downstream
    /// end. Meaningless when out of network.
    pub position: f64,
    /// Current volume, m^3. Non-increasing over time.
    pub volume: f64,
    /// Whether the parcel sits inside the active layer this step.
    pub in_active_layer: bool,
    /// Arrival into the current reach.
    pub arrival: ArrivalKey,
    /// Cumulative travel distance since birth, m.
    pub distance_total: f64,
    /// Shear-stress ratio (reach stress over this parcel's critical stress)
    /// computed this step. Zero when out of network or outside the layer.
    pub stress_ratio: f64,
}

/// Everything needed to create one parcel. Passed to the store in batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParcelSpec {
    pub reach: ReachId,
    /// Fractional starting position in [0, 1].
    pub position: f64,
    /// Initial volume, m^3. Positive.
    pub volume: f64,
    pub grain_size: f64,
    pub density: f64,
    pub abrasion_rate: f64,
    pub source: SourceTag,
    #[serde(default)]
    pub properties: BTreeMap<PropertyId, f64>,
}

impl ParcelSpec {
    /// Reject values the engine cannot run with. Called once per parcel when
    /// it is added to the store.
    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if !(self.position >= 0.0 && self.position <= 1.0) {
            return Err("position outside [0, 1]");
        }
        if !(self.volume > 0.0) {
            return Err("non-positive volume");
        }
        if !(self.grain_size > 0.0) {
            return Err("non-positive grain size");
        }
        if !(self.density > 0.0) {
            return Err("non-positive density");
        }
        if !(self.abrasion_rate >= 0.0) {
            return Err("negative abrasion rate");
        }
        if self.properties.values().any(|v| !v.is_finite()) {
            return Err("non-finite extension property");
        }
        Ok(())
    }
}
