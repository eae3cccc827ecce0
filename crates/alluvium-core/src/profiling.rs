//! Profiling and diagnostic instrumentation for the transport engine.
//!
//! - [`StepProfile`] captures per-phase timing from the most recent step.
//!   Only available when the `profiling` feature is enabled.
//! - [`ParcelDiagnostics`] explains why a parcel is or is not moving.
//!   Always available (not feature-gated).

use std::time::Duration;

use crate::engine::ReachFlow;
use crate::id::ParcelId;
use crate::parcel::Location;

/// Per-phase timing from the most recent step.
/// Only available when the `profiling` feature is enabled.
#[derive(Debug, Clone, Default)]
pub struct StepProfile {
    pub hydraulics: Duration,
    pub active_layer: Duration,
    pub mobility: Duration,
    pub advection: Duration,
    pub abrasion: Duration,
    pub elevation: Duration,
    pub bookkeeping: Duration,
    pub total: Duration,
    pub step: u64,
}

impl StepProfile {
    /// Returns the name and duration of the slowest phase.
    pub fn bottleneck_phase(&self) -> (&'static str, Duration) {
        let phases = [
            ("hydraulics", self.hydraulics),
            ("active_layer", self.active_layer),
            ("mobility", self.mobility),
            ("advection", self.advection),
            ("abrasion", self.abrasion),
            ("elevation", self.elevation),
            ("bookkeeping", self.bookkeeping),
        ];
        phases.into_iter().max_by_key(|(_, d)| *d).unwrap()
    }
}

/// Why a parcel did or did not move in the most recent step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MobilityStatus {
    /// Past the outlet; excluded from transport until relocated back in.
    OutOfNetwork,
    /// Abraded to zero volume; takes no further part in transport.
    Depleted,
    /// Below the active-layer surface, shielded from the flow.
    Buried,
    /// In the active layer but the reach stress is at or below this
    /// parcel's critical stress.
    BelowThreshold,
    /// In the active layer and above the entrainment threshold.
    Mobile,
}

/// Diagnostic breakdown of one parcel's transport state.
/// Always available (not feature-gated).
///
/// Reflects the most recent completed step; before the first step every
/// in-network parcel reads as buried because no layer has been filled yet.
#[derive(Debug, Clone)]
pub struct ParcelDiagnostics {
    pub parcel: ParcelId,
    pub location: Location,
    pub status: MobilityStatus,
    /// Median grain diameter, m.
    pub grain_size: f64,
    /// Current volume, m^3.
    pub volume: f64,
    /// Reach stress over this parcel's critical stress, from the last step.
    pub stress_ratio: f64,
    /// Cumulative travel distance since birth, m.
    pub distance_total: f64,
    /// Hydraulics of the containing reach from the last step. `None` when
    /// out of network or before the first step.
    pub reach_flow: Option<ReachFlow>,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::active_layer::ThicknessPolicy;
    use crate::engine::{Engine, EngineConfig};
    use crate::parcel::ParcelSpec;
    use crate::store::ParcelStore;
    use crate::test_utils::{chain_engine, chain_network, gravel_spec, test_config};

    // =======================================================================
    // StepProfile unit tests (always available)
    // =======================================================================

    #[test]
    fn step_profile_default_all_zeros() {
        let p = StepProfile::default();
        assert_eq!(p.hydraulics, Duration::ZERO);
        assert_eq!(p.active_layer, Duration::ZERO);
        assert_eq!(p.mobility, Duration::ZERO);
        assert_eq!(p.advection, Duration::ZERO);
        assert_eq!(p.abrasion, Duration::ZERO);
        assert_eq!(p.elevation, Duration::ZERO);
        assert_eq!(p.bookkeeping, Duration::ZERO);
        assert_eq!(p.total, Duration::ZERO);
        assert_eq!(p.step, 0);
    }

    #[test]
    fn bottleneck_phase_returns_largest() {
        let p = StepProfile {
            hydraulics: Duration::from_micros(10),
            active_layer: Duration::from_micros(50),
            mobility: Duration::from_micros(20),
            advection: Duration::from_micros(200),
            abrasion: Duration::from_micros(5),
            elevation: Duration::from_micros(30),
            bookkeeping: Duration::from_micros(2),
            total: Duration::from_micros(317),
            step: 1,
        };
        let (name, dur) = p.bottleneck_phase();
        assert_eq!(name, "advection");
        assert_eq!(dur, Duration::from_micros(200));
    }

    #[test]
    fn bottleneck_phase_tie_goes_to_last() {
        // max_by_key returns the later element on a tie.
        let p = StepProfile {
            hydraulics: Duration::from_micros(100),
            active_layer: Duration::from_micros(100),
            total: Duration::from_micros(200),
            step: 1,
            ..StepProfile::default()
        };
        let (name, dur) = p.bottleneck_phase();
        assert_eq!(name, "active_layer");
        assert_eq!(dur, Duration::from_micros(100));
    }

    // =======================================================================
    // Profiling feature-gated tests
    // =======================================================================

    #[cfg(feature = "profiling")]
    #[test]
    fn last_profile_none_before_step() {
        let (engine, _, _) = chain_engine(3, 5);
        assert!(engine.last_profile().is_none());
    }

    #[cfg(feature = "profiling")]
    #[test]
    fn last_profile_some_after_step() {
        let (mut engine, _, _) = chain_engine(3, 5);
        engine.run_one_step(10.0).unwrap();
        let profile = engine.last_profile().unwrap();
        assert_eq!(profile.step, 1);
    }

    #[cfg(feature = "profiling")]
    #[test]
    fn profile_total_positive_with_parcels() {
        let (mut engine, _, _) = chain_engine(5, 40);
        engine.run_one_step(10.0).unwrap();

        let profile = engine.last_profile().unwrap();
        assert!(
            profile.total > Duration::ZERO,
            "total should be positive after stepping with parcels, got {:?}",
            profile.total
        );
    }

    #[cfg(feature = "profiling")]
    #[test]
    fn profile_updates_each_step() {
        let (mut engine, _, _) = chain_engine(3, 5);

        engine.run_one_step(10.0).unwrap();
        let step1 = engine.last_profile().unwrap().step;

        engine.run_one_step(10.0).unwrap();
        let step2 = engine.last_profile().unwrap().step;

        assert_ne!(step1, step2, "profile step should differ between steps");
        assert_eq!(step2, step1 + 1);
    }

    // =======================================================================
    // ParcelDiagnostics tests (always available)
    // =======================================================================

    #[test]
    fn diagnose_unknown_parcel_returns_none() {
        let (engine, _, _) = chain_engine(2, 3);
        let ghost = ParcelId::default();
        assert!(engine.diagnose_parcel(ghost).is_none());
    }

    #[test]
    fn diagnose_before_first_step_reads_buried() {
        let (engine, reaches, parcels) = chain_engine(2, 1);

        let diag = engine.diagnose_parcel(parcels[0]).unwrap();
        assert_eq!(diag.parcel, parcels[0]);
        assert_eq!(diag.location, Location::InReach(reaches[0]));
        assert_eq!(diag.status, MobilityStatus::Buried);
        assert_eq!(diag.stress_ratio, 0.0);
        assert!(diag.reach_flow.is_none());
    }

    #[test]
    fn diagnose_mobile_parcel() {
        let (mut engine, reaches, parcels) = chain_engine(3, 1);
        engine.run_one_step(10.0).unwrap();

        let diag = engine.diagnose_parcel(parcels[0]).unwrap();
        assert_eq!(diag.status, MobilityStatus::Mobile);
        assert_eq!(diag.location, Location::InReach(reaches[0]));
        assert!(diag.stress_ratio > 1.0);
        assert!(diag.distance_total > 0.0);

        // Slope 0.01, depth 2: tau = 1000 * 9.81 * 2 * 0.01.
        let flow = diag.reach_flow.unwrap();
        assert!((flow.shear_stress - 196.2).abs() < 1e-9);
    }

    #[test]
    fn diagnose_below_threshold_in_still_water() {
        let (net, reaches) = chain_network(2, 100.0, 0.0, 1.0);
        let mut engine = Engine::new(net, ParcelStore::new(), test_config()).unwrap();
        let parcels = engine
            .add_parcels(&[gravel_spec(reaches[0], 0.5)], 0)
            .unwrap();

        engine.run_one_step(10.0).unwrap();

        let diag = engine.diagnose_parcel(parcels[0]).unwrap();
        assert_eq!(diag.status, MobilityStatus::BelowThreshold);
        assert_eq!(diag.stress_ratio, 0.0);
    }

    #[test]
    fn diagnose_buried_parcel() {
        // Layer capacity 0.0015 * 10 * 100 = 1.5 m^3: only the later
        // arrival fits, the first parcel stays buried beneath it.
        let (net, reaches) = chain_network(1, 100.0, 0.01, 2.0);
        let config = EngineConfig {
            thickness_policy: ThicknessPolicy::FixedThickness { thickness: 0.0015 },
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(net, ParcelStore::new(), config).unwrap();
        let parcels = engine
            .add_parcels(
                &[gravel_spec(reaches[0], 0.2), gravel_spec(reaches[0], 0.4)],
                0,
            )
            .unwrap();

        engine.run_one_step(10.0).unwrap();

        let diag = engine.diagnose_parcel(parcels[0]).unwrap();
        assert_eq!(diag.status, MobilityStatus::Buried);
        assert_eq!(diag.stress_ratio, 0.0);

        let surface = engine.diagnose_parcel(parcels[1]).unwrap();
        assert_ne!(surface.status, MobilityStatus::Buried);
    }

    #[test]
    fn diagnose_exited_parcel() {
        let (net, reaches) = chain_network(1, 10.0, 0.01, 2.0);
        let mut engine = Engine::new(net, ParcelStore::new(), test_config()).unwrap();
        let parcels = engine
            .add_parcels(&[gravel_spec(reaches[0], 0.5)], 0)
            .unwrap();

        // ~19 m of travel against 5 m to the outlet.
        engine.run_one_step(30.0).unwrap();

        let diag = engine.diagnose_parcel(parcels[0]).unwrap();
        assert_eq!(diag.status, MobilityStatus::OutOfNetwork);
        assert_eq!(diag.location, Location::OutOfNetwork);
        assert!(diag.reach_flow.is_none());
    }

    #[test]
    fn diagnose_depleted_parcel() {
        // Abrasion rate extreme enough that exp underflows to zero volume.
        let (net, reaches) = chain_network(3, 100.0, 0.01, 2.0);
        let mut engine = Engine::new(net, ParcelStore::new(), test_config()).unwrap();
        let spec = ParcelSpec {
            abrasion_rate: 200.0,
            ..gravel_spec(reaches[0], 0.0)
        };
        let parcels = engine.add_parcels(&[spec], 0).unwrap();

        engine.run_one_step(10.0).unwrap();

        let diag = engine.diagnose_parcel(parcels[0]).unwrap();
        assert_eq!(diag.volume, 0.0);
        assert_eq!(diag.status, MobilityStatus::Depleted);
        assert!(diag.distance_total > 0.0);
    }
}
