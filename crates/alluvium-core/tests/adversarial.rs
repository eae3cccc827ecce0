//! Adversarial input tests for the Alluvium engine.
//!
//! Edge cases that should either return errors or be handled gracefully
//! without panics.

use alluvium_core::engine::{Engine, EngineConfig, StepError};
use alluvium_core::id::ReachId;
use alluvium_core::network::{NetworkBuilder, NetworkError, ReachSpec};
use alluvium_core::parcel::{Location, ParcelSpec};
use alluvium_core::store::ParcelStore;
use alluvium_core::test_utils::*;

/// A reach from a junction to itself can never drain.
#[test]
fn self_loop_reach_is_rejected() {
    let mut b = NetworkBuilder::new();
    let node = b.add_junction(10.0, -100.0);
    b.add_reach(ReachSpec {
        from_node: node,
        to_node: node,
        length: 100.0,
        width: 10.0,
        slope: 0.01,
        flow_depth: 2.0,
    });
    assert!(matches!(b.build(), Err(NetworkError::NoRouteToOutlet(_))));
}

/// Two reaches feeding each other form a closed loop with no outlet.
#[test]
fn reach_cycle_is_rejected() {
    let mut b = NetworkBuilder::new();
    let a = b.add_junction(10.0, -100.0);
    let c = b.add_junction(9.0, -100.0);
    let spec = |from, to| ReachSpec {
        from_node: from,
        to_node: to,
        length: 100.0,
        width: 10.0,
        slope: 0.01,
        flow_depth: 2.0,
    };
    b.add_reach(spec(a, c));
    b.add_reach(spec(c, a));
    assert!(matches!(b.build(), Err(NetworkError::NoRouteToOutlet(_))));
}

/// One junction cannot feed two downstream reaches.
#[test]
fn divergent_junction_is_rejected() {
    let mut b = NetworkBuilder::new();
    let head = b.add_junction(10.0, -100.0);
    let left = b.add_junction(5.0, -100.0);
    let right = b.add_junction(5.0, -100.0);
    let spec = |from, to| ReachSpec {
        from_node: from,
        to_node: to,
        length: 100.0,
        width: 10.0,
        slope: 0.01,
        flow_depth: 2.0,
    };
    b.add_reach(spec(head, left));
    b.add_reach(spec(head, right));
    assert!(matches!(b.build(), Err(NetworkError::DivergentJunction(_))));
}

/// One bad spec in a batch must keep the whole batch out.
#[test]
fn parcel_batch_rejection_is_atomic() {
    let (net, reaches) = chain_network(3, 100.0, 0.01, 2.0);
    let mut engine = Engine::new(net, ParcelStore::new(), test_config()).unwrap();

    let batch = [
        gravel_spec(reaches[0], 0.2),
        ParcelSpec {
            volume: -1.0,
            ..gravel_spec(reaches[1], 0.5)
        },
        gravel_spec(reaches[2], 0.8),
    ];
    assert!(engine.add_parcels(&batch, 0).is_err());
    assert_eq!(engine.store().parcel_count(), 0);

    // The valid specs alone go through.
    let ok = [gravel_spec(reaches[0], 0.2), gravel_spec(reaches[2], 0.8)];
    assert_eq!(engine.add_parcels(&ok, 0).unwrap().len(), 2);
}

/// Sediment lighter than water has no meaning in a shear-driven model.
#[test]
fn buoyant_sediment_is_rejected() {
    let (net, reaches) = chain_network(2, 100.0, 0.01, 2.0);
    let mut engine = Engine::new(net, ParcelStore::new(), test_config()).unwrap();
    let pumice = ParcelSpec {
        density: 800.0,
        ..gravel_spec(reaches[0], 0.5)
    };
    assert!(engine.add_parcels(&[pumice], 0).is_err());
    assert_eq!(engine.store().parcel_count(), 0);
}

/// A spec naming a reach from some other network is caught up front.
#[test]
fn foreign_reach_in_spec_is_rejected() {
    let (net, _) = chain_network(2, 100.0, 0.01, 2.0);
    let mut engine = Engine::new(net, ParcelStore::new(), test_config()).unwrap();
    let spec = gravel_spec(ReachId::default(), 0.5);
    assert!(matches!(
        engine.add_parcels(&[spec], 0),
        Err(StepError::Network(NetworkError::InvalidReach(_)))
    ));
    assert_eq!(engine.store().parcel_count(), 0);
}

/// An absurdly large timestep flushes everything out the outlet in one
/// step instead of wedging the cascade.
#[test]
fn extreme_timestep_flushes_cleanly() {
    let (mut engine, _, parcels) = chain_engine(5, 25);
    let summary = engine.run_one_step(1.0e9).unwrap();

    assert_eq!(summary.exited.len(), 25);
    assert!(summary.total_distance.is_finite());
    for &pid in &parcels {
        let rec = engine.store().latest_record(pid).unwrap();
        assert_eq!(rec.location, Location::OutOfNetwork);
        // In-network travel is capped by the channel actually available.
        assert!(rec.distance_total <= 5.0 * 100.0 + 1e-6);
    }
}

/// With a tight hop bound the same flush is a fatal error, and the engine
/// rolls back to the previous step.
#[test]
fn cascade_bound_trips_and_rolls_back() {
    let (net, reaches) = chain_network(10, 100.0, 0.01, 2.0);
    let config = EngineConfig {
        max_cascade_hops: 2,
        ..test_config()
    };
    let mut engine = Engine::new(net, ParcelStore::new(), config).unwrap();
    engine
        .add_parcels(&[gravel_spec(reaches[0], 0.0)], 0)
        .unwrap();
    let hash_before = engine.state_hash();

    assert!(matches!(
        engine.run_one_step(1.0e9),
        Err(StepError::DegenerateTopology { hops: 3, .. })
    ));
    assert_eq!(engine.sim_state().step, 0);
    assert_eq!(engine.store().latest_step(), 0);
    assert_eq!(engine.state_hash(), hash_before);

    // A sane timestep still works afterwards.
    let summary = engine.run_one_step(10.0).unwrap();
    assert_eq!(summary.step, 1);
}

/// A meter-wide boulder is far past the entrainment threshold and must
/// never move.
#[test]
fn boulder_never_moves() {
    let (net, reaches) = chain_network(3, 100.0, 0.01, 2.0);
    let mut engine = Engine::new(net, ParcelStore::new(), test_config()).unwrap();
    let boulder = ParcelSpec {
        grain_size: 1.0,
        volume: 5.0,
        ..gravel_spec(reaches[1], 0.5)
    };
    let pid = engine.add_parcels(&[boulder], 0).unwrap()[0];

    for _ in 0..20 {
        let summary = engine.run_one_step(10.0).unwrap();
        assert_eq!(summary.mobile_parcels, 0);
    }
    let rec = engine.store().latest_record(pid).unwrap();
    assert_eq!(rec.location, Location::InReach(reaches[1]));
    assert_eq!(rec.position, 0.5);
    assert_eq!(rec.distance_total, 0.0);
}

/// Zero flow depth means zero shear everywhere; stepping a dry network is
/// valid and moves nothing.
#[test]
fn dry_network_is_inert() {
    let (mut engine, reaches, _) = chain_engine(4, 20);
    for &rid in &reaches {
        engine.network_mut().set_flow_depth(rid, 0.0).unwrap();
    }
    for _ in 0..5 {
        let summary = engine.run_one_step(10.0).unwrap();
        assert_eq!(summary.mobile_parcels, 0);
        assert!(summary.exited.is_empty());
    }
}

/// A vanishingly small timestep is not an error and leaves the load where
/// it was for all practical purposes.
#[test]
fn tiny_timestep_is_harmless() {
    let (mut engine, _, parcels) = chain_engine(3, 15);
    for _ in 0..50 {
        engine.run_one_step(1.0e-12).unwrap();
    }
    assert_eq!(in_network_count(&engine), 15);
    for &pid in &parcels {
        let rec = engine.store().latest_record(pid).unwrap();
        assert!((0.0..=1.0).contains(&rec.position));
    }
}
