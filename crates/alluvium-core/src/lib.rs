//! Alluvium Core -- a particle-tracking sediment-routing engine for river
//! networks.
//!
//! This crate provides the river-network topology, a parcel store with full
//! time history, the active-layer model, shear-stress transport capacity,
//! deterministic stepping, queries, and versioned serialization that
//! sediment-routing applications depend on.
//!
//! # Seven-Phase Step Pipeline
//!
//! Each call to [`engine::Engine::run_one_step`] advances the model by one
//! timestep through the following phases:
//!
//! 1. **Hydraulics** -- Depth-slope shear stress and layer thickness per reach.
//! 2. **Active layer** -- Surface-first layer fill; membership flags written.
//! 3. **Mobility** -- Stress ratios and travel distances for active parcels.
//! 4. **Advection** -- Positions advance, cascading through downstream reaches.
//! 5. **Abrasion** -- Exponential volume loss over distance travelled.
//! 6. **Elevation** -- Net flux divergence moves junction beds; slopes recomputed.
//! 7. **Bookkeeping** -- Step counter, model time, and the state hash.
//!
//! # History Pattern
//!
//! Parcel state is one column per elapsed timestep. A step stages a new
//! column and works only inside it; a fatal mid-step error discards the
//! staged column, so the last committed step stays the valid state:
//!
//! ```rust,ignore
//! let summary = engine.run_one_step(dt)?;
//! let series = engine.parcel_series(parcel)?; // full trajectory
//! let stats = engine.reach_stats(reach);      // per-reach aggregate
//! ```
//!
//! # Key Types
//!
//! - [`engine::Engine`] -- Owns the network and parcel store; drives the
//!   step pipeline.
//! - [`network::RiverNetwork`] -- Validated reach/junction topology with
//!   downstream routing resolved at build.
//! - [`store::ParcelStore`] -- Per-step parcel history with staged-column
//!   rollback.
//! - [`active_layer::ThicknessPolicy`] -- Fixed or flow-dependent layer
//!   thickness.
//! - [`capacity::CapacityFormula`] -- Transport capacity seam; Meyer-Peter
//!   Muller and Wilcock-Crowe built in.
//! - [`query::ReachSedimentStats`] and [`query::ParcelSeries`] -- Aggregate
//!   and trajectory queries over the recorded history.
//! - [`serialize`] -- Versioned snapshot support via bitcode.
//! - [`validation`] -- State diffs and determinism checking.

pub mod active_layer;
pub mod capacity;
#[cfg(feature = "data-loader")]
pub mod data_loader;
pub mod engine;
pub mod id;
pub mod network;
pub mod parcel;
pub mod profiling;
pub mod query;
pub mod serialize;
pub mod sim;
pub mod store;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
