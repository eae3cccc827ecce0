//! State comparison and determinism checking.
//!
//! Provides utilities for comparing two engine states to find divergences,
//! and for validating that running the same snapshot twice produces
//! identical results. Useful when hunting non-determinism introduced by a
//! custom capacity formula or by floating-point reassociation.

use crate::engine::{Engine, StepError};
use crate::id::{ParcelId, ReachId};
use crate::serialize::DeserializeError;
use crate::sim::StateHash;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Restore(#[from] DeserializeError),
    #[error("step {step} failed during determinism run: {source}")]
    Step {
        step: u64,
        #[source]
        source: StepError,
    },
}

// ---------------------------------------------------------------------------
// State digests
// ---------------------------------------------------------------------------

/// Per-subsystem state hashes. When two engines diverge, comparing digests
/// pinpoints which subsystem is responsible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateDigest {
    /// Network structure: reaches, junction wiring, routing.
    pub topology: u64,
    /// Per-reach slope and flow depth.
    pub hydraulics: u64,
    /// Junction bed and bedrock elevations.
    pub elevations: u64,
    /// The latest parcel column.
    pub parcels: u64,
    /// Step counter and model time.
    pub sim: u64,
}

fn key_bits<K: slotmap::Key>(key: K) -> u64 {
    key.data().as_ffi()
}

/// Compute per-subsystem digests for one engine.
pub fn state_digest(engine: &Engine) -> StateDigest {
    let net = engine.network();

    let mut topology = StateHash::new();
    topology.write_u64(net.reach_count() as u64);
    topology.write_u64(net.node_count() as u64);
    for (rid, r) in net.reaches() {
        topology.write_u64(key_bits(rid));
        topology.write_u64(key_bits(r.from_node));
        topology.write_u64(key_bits(r.to_node));
        topology.write_f64(r.length);
        topology.write_f64(r.width);
        match r.downstream {
            crate::network::RoutingTarget::Downstream(next) => {
                topology.write_u32(1);
                topology.write_u64(key_bits(next));
            }
            crate::network::RoutingTarget::OutOfNetwork => topology.write_u32(0),
        }
    }

    let mut hydraulics = StateHash::new();
    for (rid, r) in net.reaches() {
        hydraulics.write_u64(key_bits(rid));
        hydraulics.write_f64(r.slope);
        hydraulics.write_f64(r.flow_depth);
    }

    let mut elevations = StateHash::new();
    for (nid, j) in net.nodes() {
        elevations.write_u64(key_bits(nid));
        elevations.write_f64(j.bed_elevation);
        elevations.write_f64(j.bedrock_elevation);
    }

    let store = engine.store();
    let slice = store.latest_slice();
    let mut parcels = StateHash::new();
    for &pid in store.parcel_order() {
        let rec = &slice[pid];
        parcels.write_u64(key_bits(pid));
        match rec.location {
            crate::parcel::Location::InReach(r) => {
                parcels.write_u32(1);
                parcels.write_u64(key_bits(r));
            }
            crate::parcel::Location::OutOfNetwork => parcels.write_u32(0),
        }
        parcels.write_f64(rec.position);
        parcels.write_f64(rec.volume);
        parcels.write_u32(rec.in_active_layer as u32);
        parcels.write_u64(rec.arrival.step);
        parcels.write_u64(rec.arrival.seq);
        parcels.write_f64(rec.distance_total);
        parcels.write_f64(rec.stress_ratio);
    }

    let mut sim = StateHash::new();
    sim.write_u64(engine.sim_state().step);
    sim.write_f64(engine.sim_state().model_time);

    StateDigest {
        topology: topology.finish(),
        hydraulics: hydraulics.finish(),
        elevations: elevations.finish(),
        parcels: parcels.finish(),
        sim: sim.finish(),
    }
}

// ---------------------------------------------------------------------------
// State diff types
// ---------------------------------------------------------------------------

/// Difference between two engine states at the reach level.
#[derive(Debug, Clone)]
pub enum ReachDiff {
    OnlyInA(ReachId),
    OnlyInB(ReachId),
    /// Reach exists in both but has different state.
    StateMismatch { reach: ReachId, description: String },
}

/// Difference between two engine states at the parcel level.
#[derive(Debug, Clone)]
pub enum ParcelDiff {
    OnlyInA(ParcelId),
    OnlyInB(ParcelId),
    /// Parcel exists in both but its latest record differs.
    StateMismatch { parcel: ParcelId, description: String },
}

/// Per-subsystem match results.
#[derive(Debug, Clone)]
pub struct DigestDiff {
    pub topology_matches: bool,
    pub hydraulics_match: bool,
    pub elevations_match: bool,
    pub parcels_match: bool,
    pub sim_matches: bool,
}

/// Full state diff between two engines.
#[derive(Debug, Clone)]
pub struct StateDiff {
    pub is_identical: bool,
    pub digest_diff: DigestDiff,
    pub reach_diffs: Vec<ReachDiff>,
    pub parcel_diffs: Vec<ParcelDiff>,
}

// ---------------------------------------------------------------------------
// Quick compare (digest-level only)
// ---------------------------------------------------------------------------

/// Quick subsystem-level comparison using digests.
pub fn quick_compare(a: &Engine, b: &Engine) -> DigestDiff {
    let da = state_digest(a);
    let db = state_digest(b);
    DigestDiff {
        topology_matches: da.topology == db.topology,
        hydraulics_match: da.hydraulics == db.hydraulics,
        elevations_match: da.elevations == db.elevations,
        parcels_match: da.parcels == db.parcels,
        sim_matches: da.sim == db.sim,
    }
}

// ---------------------------------------------------------------------------
// Full diff
// ---------------------------------------------------------------------------

/// Compute a detailed diff between two engine states.
pub fn diff_engines(a: &Engine, b: &Engine) -> StateDiff {
    let digest_diff = quick_compare(a, b);

    let mut reach_diffs = Vec::new();
    for rid in a.network().reach_ids() {
        if !b.network().contains_reach(rid) {
            reach_diffs.push(ReachDiff::OnlyInA(rid));
            continue;
        }
        let ra = a.network().reach(rid).ok();
        let rb = b.network().reach(rid).ok();
        if let (Some(ra), Some(rb)) = (ra, rb) {
            let mut mismatches = Vec::new();
            if ra.slope != rb.slope {
                mismatches.push("slope");
            }
            if ra.flow_depth != rb.flow_depth {
                mismatches.push("flow_depth");
            }
            if ra.length != rb.length || ra.width != rb.width {
                mismatches.push("geometry");
            }
            if ra.downstream != rb.downstream {
                mismatches.push("routing");
            }
            if !mismatches.is_empty() {
                reach_diffs.push(ReachDiff::StateMismatch {
                    reach: rid,
                    description: mismatches.join(", "),
                });
            }
        }
    }
    for rid in b.network().reach_ids() {
        if !a.network().contains_reach(rid) {
            reach_diffs.push(ReachDiff::OnlyInB(rid));
        }
    }

    let mut parcel_diffs = Vec::new();
    for pid in a.store().parcel_ids() {
        let Ok(rec_a) = a.store().latest_record(pid) else {
            continue;
        };
        let Ok(rec_b) = b.store().latest_record(pid) else {
            parcel_diffs.push(ParcelDiff::OnlyInA(pid));
            continue;
        };
        let mut mismatches = Vec::new();
        if rec_a.location != rec_b.location {
            mismatches.push("location");
        }
        if rec_a.position != rec_b.position {
            mismatches.push("position");
        }
        if rec_a.volume != rec_b.volume {
            mismatches.push("volume");
        }
        if rec_a.in_active_layer != rec_b.in_active_layer {
            mismatches.push("active_layer");
        }
        if rec_a.arrival != rec_b.arrival {
            mismatches.push("arrival");
        }
        if rec_a.distance_total != rec_b.distance_total {
            mismatches.push("distance");
        }
        if !mismatches.is_empty() {
            parcel_diffs.push(ParcelDiff::StateMismatch {
                parcel: pid,
                description: mismatches.join(", "),
            });
        }
    }
    for pid in b.store().parcel_ids() {
        if a.store().latest_record(pid).is_err() {
            parcel_diffs.push(ParcelDiff::OnlyInB(pid));
        }
    }

    let is_identical = reach_diffs.is_empty()
        && parcel_diffs.is_empty()
        && digest_diff.topology_matches
        && digest_diff.hydraulics_match
        && digest_diff.elevations_match
        && digest_diff.parcels_match
        && digest_diff.sim_matches;

    StateDiff {
        is_identical,
        digest_diff,
        reach_diffs,
        parcel_diffs,
    }
}

// ---------------------------------------------------------------------------
// Determinism validation
// ---------------------------------------------------------------------------

/// Result of a determinism validation run.
#[derive(Debug)]
pub struct DeterminismResult {
    /// Whether the two runs produced identical results.
    pub is_deterministic: bool,
    /// Step at which divergence was first detected (if any).
    pub divergence_step: Option<u64>,
    /// Hash log: (step, hash_run1, hash_run2) for each step.
    pub hash_log: Vec<(u64, u64, u64)>,
}

/// Validate that running the same snapshot twice with the same `dt`
/// produces identical results.
pub fn validate_determinism(
    snapshot_data: &[u8],
    steps: u64,
    dt: f64,
) -> Result<DeterminismResult, ValidationError> {
    let mut engine_a = Engine::deserialize(snapshot_data)?;
    let mut engine_b = Engine::deserialize(snapshot_data)?;

    let mut hash_log = Vec::new();
    let mut divergence_step = None;

    for _ in 0..steps {
        let staged = engine_a.sim_state().step + 1;
        let sa = engine_a
            .run_one_step(dt)
            .map_err(|source| ValidationError::Step { step: staged, source })?;
        let sb = engine_b
            .run_one_step(dt)
            .map_err(|source| ValidationError::Step { step: staged, source })?;

        hash_log.push((sa.step, sa.state_hash, sb.state_hash));
        if sa.state_hash != sb.state_hash && divergence_step.is_none() {
            divergence_step = Some(sa.step);
        }
    }

    Ok(DeterminismResult {
        is_deterministic: divergence_step.is_none(),
        divergence_step,
        hash_log,
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{chain_engine, chain_network, gravel_spec, test_config};
    use crate::store::ParcelStore;

    #[test]
    fn diff_identical_engines() {
        let (engine_a, _, _) = chain_engine(4, 10);
        let data = engine_a.serialize().unwrap();
        let engine_b = Engine::deserialize(&data).unwrap();

        let diff = diff_engines(&engine_a, &engine_b);
        assert!(diff.is_identical);
        assert!(diff.reach_diffs.is_empty());
        assert!(diff.parcel_diffs.is_empty());
    }

    #[test]
    fn diff_detects_step_count_mismatch() {
        let (mut engine_a, _, _) = chain_engine(4, 10);
        let (engine_b, _, _) = chain_engine(4, 10);

        engine_a.run_one_step(20.0).unwrap();

        let diff = diff_engines(&engine_a, &engine_b);
        assert!(!diff.is_identical);
        assert!(!diff.digest_diff.sim_matches);
    }

    #[test]
    fn diff_detects_extra_parcels() {
        let (engine_a, _, _) = chain_engine(3, 8);
        let (engine_b, _, _) = chain_engine(3, 5);

        let diff = diff_engines(&engine_a, &engine_b);
        assert!(!diff.is_identical);
        assert!(diff
            .parcel_diffs
            .iter()
            .any(|d| matches!(d, ParcelDiff::OnlyInA(_))));
    }

    #[test]
    fn diff_describes_moved_parcels() {
        let (engine_a, _, _) = chain_engine(4, 10);
        let data = engine_a.serialize().unwrap();
        let mut engine_b = Engine::deserialize(&data).unwrap();

        engine_b.run_one_step(20.0).unwrap();

        let diff = diff_engines(&engine_a, &engine_b);
        assert!(!diff.is_identical);
        let described = diff.parcel_diffs.iter().any(|d| {
            matches!(d, ParcelDiff::StateMismatch { description, .. } if description.contains("position"))
        });
        assert!(described);
    }

    #[test]
    fn quick_compare_pinpoints_subsystem() {
        // Zero slope: stepping changes parcel layer flags and the step
        // counter, but elevations and hydraulics stay put.
        let (net, reaches) = chain_network(2, 100.0, 0.0, 1.0);
        let mut engine_a =
            Engine::new(net, ParcelStore::new(), test_config()).unwrap();
        engine_a.add_parcels(&[gravel_spec(reaches[0], 0.5)], 0).unwrap();
        let data = engine_a.serialize().unwrap();
        let mut engine_b = Engine::deserialize(&data).unwrap();

        engine_b.run_one_step(20.0).unwrap();

        let result = quick_compare(&engine_a, &engine_b);
        assert!(result.topology_matches);
        assert!(result.hydraulics_match);
        assert!(result.elevations_match);
        assert!(!result.parcels_match);
        assert!(!result.sim_matches);
    }

    #[test]
    fn digests_stable_for_same_engine() {
        let (engine, _, _) = chain_engine(5, 20);
        assert_eq!(state_digest(&engine), state_digest(&engine));
    }

    #[test]
    fn validate_determinism_passes() {
        let (mut engine, _, _) = chain_engine(5, 30);
        engine.run_one_step(20.0).unwrap();
        let data = engine.serialize().unwrap();

        let result = validate_determinism(&data, 20, 20.0).unwrap();
        assert!(result.is_deterministic);
        assert!(result.divergence_step.is_none());
        assert_eq!(result.hash_log.len(), 20);
        for (_, h1, h2) in &result.hash_log {
            assert_eq!(h1, h2);
        }
        // Steps continue from the snapshot.
        assert_eq!(result.hash_log[0].0, 2);
    }

    #[test]
    fn validate_determinism_surfaces_step_failures() {
        let (engine, _, _) = chain_engine(2, 4);
        let data = engine.serialize().unwrap();

        let err = validate_determinism(&data, 5, -1.0);
        assert!(matches!(err, Err(ValidationError::Step { step: 1, .. })));
    }
}
