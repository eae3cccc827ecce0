//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::engine::{Engine, EngineConfig};
use crate::id::{ParcelId, ReachId, SourceTag};
use crate::network::{NetworkBuilder, ReachSpec, RiverNetwork};
use crate::parcel::{Location, ParcelSpec};
use crate::store::ParcelStore;
use std::collections::BTreeMap;

// ===========================================================================
// Network builders
// ===========================================================================

/// Build `n` reaches in series draining to a single outlet, with uniform
/// geometry. Junction bed elevations follow the slope; bedrock sits far
/// below so it never interferes.
pub fn chain_network(n: usize, length: f64, slope: f64, depth: f64) -> (RiverNetwork, Vec<ReachId>) {
    let mut b = NetworkBuilder::new();
    let drop = slope * length;
    let nodes: Vec<_> = (0..=n)
        .map(|i| b.add_junction(drop * (n - i) as f64, -1000.0))
        .collect();
    let reaches: Vec<_> = (0..n)
        .map(|i| {
            b.add_reach(ReachSpec {
                from_node: nodes[i],
                to_node: nodes[i + 1],
                length,
                width: 10.0,
                slope,
                flow_depth: depth,
            })
        })
        .collect();
    (b.build().unwrap(), reaches)
}

/// Build a Y-shaped network: two tributaries meeting at a junction that
/// drains through a single main-stem reach to the outlet.
/// Returns `(network, [left, right, main])`.
pub fn confluence_network(slope: f64, depth: f64) -> (RiverNetwork, [ReachId; 3]) {
    let mut b = NetworkBuilder::new();
    let left_head = b.add_junction(slope * 200.0, -1000.0);
    let right_head = b.add_junction(slope * 200.0, -1000.0);
    let meet = b.add_junction(slope * 100.0, -1000.0);
    let outlet = b.add_junction(0.0, -1000.0);
    let spec = |from, to| ReachSpec {
        from_node: from,
        to_node: to,
        length: 100.0,
        width: 10.0,
        slope,
        flow_depth: depth,
    };
    let left = b.add_reach(spec(left_head, meet));
    let right = b.add_reach(spec(right_head, meet));
    let main = b.add_reach(spec(meet, outlet));
    (b.build().unwrap(), [left, right, main])
}

// ===========================================================================
// Parcel spec constructors
// ===========================================================================

/// A 20 mm gravel parcel of one cubic meter, no abrasion.
pub fn gravel_spec(reach: ReachId, position: f64) -> ParcelSpec {
    ParcelSpec {
        reach,
        position,
        volume: 1.0,
        grain_size: 0.02,
        density: 2650.0,
        abrasion_rate: 0.0,
        source: SourceTag(0),
        properties: BTreeMap::new(),
    }
}

/// A 1 mm sand parcel of one cubic meter, no abrasion.
pub fn sand_spec(reach: ReachId, position: f64) -> ParcelSpec {
    ParcelSpec {
        grain_size: 0.001,
        ..gravel_spec(reach, position)
    }
}

/// `count` gravel parcels spread round-robin across `reaches` with
/// staggered positions.
pub fn uniform_batch(reaches: &[ReachId], count: usize) -> Vec<ParcelSpec> {
    (0..count)
        .map(|i| {
            let reach = reaches[i % reaches.len()];
            let position = (i % 10) as f64 / 10.0;
            gravel_spec(reach, position)
        })
        .collect()
}

// ===========================================================================
// Engine builders
// ===========================================================================

/// Default test configuration: MPM capacity, fixed 0.1 m layer.
pub fn test_config() -> EngineConfig {
    EngineConfig::default()
}

/// Build a chain engine with transporting hydraulics (1% slope, 2 m depth,
/// 100 m reaches) seeded with `parcel_count` gravel parcels.
pub fn chain_engine(
    reach_count: usize,
    parcel_count: usize,
) -> (Engine, Vec<ReachId>, Vec<ParcelId>) {
    let (net, reaches) = chain_network(reach_count, 100.0, 0.01, 2.0);
    let mut engine = Engine::new(net, ParcelStore::new(), test_config()).unwrap();
    let parcels = engine
        .add_parcels(&uniform_batch(&reaches, parcel_count), 0)
        .unwrap();
    (engine, reaches, parcels)
}

// ===========================================================================
// Query helpers
// ===========================================================================

/// Parcels still inside the network at the latest step.
pub fn in_network_count(engine: &Engine) -> usize {
    let store = engine.store();
    store
        .parcel_ids()
        .filter(|&pid| {
            store
                .latest_record(pid)
                .map(|rec| !rec.location.is_out_of_network())
                .unwrap_or(false)
        })
        .count()
}

/// Total volume of parcels still inside the network at the latest step.
pub fn total_in_network_volume(engine: &Engine) -> f64 {
    let store = engine.store();
    store
        .parcel_ids()
        .filter_map(|pid| {
            let rec = store.latest_record(pid).ok()?;
            match rec.location {
                Location::InReach(_) => Some(rec.volume),
                Location::OutOfNetwork => None,
            }
        })
        .sum()
}
