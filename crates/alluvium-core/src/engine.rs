//! The transport engine: owns the network and parcel store and drives the
//! per-step routing pipeline.
//!
//! # Architecture
//!
//! The `Engine` owns:
//! - A [`RiverNetwork`] (reaches and junctions, validated at build)
//! - A [`ParcelStore`] (per-step parcel history)
//! - An [`EngineConfig`] plus the capacity formula it names
//! - A [`SimState`] (step counter, model time)
//!
//! # Step Pipeline
//!
//! Each `run_one_step(dt)` stages a new history column and runs:
//! 1. **Hydraulics** -- depth-slope shear stress and layer thickness per
//!    reach; rejects negative depth or stress fatally
//! 2. **Active layer** -- surface-first layer fill per reach, membership
//!    flags written
//! 3. **Mobility** -- stress ratio per active parcel; travel distance for
//!    parcels above threshold
//! 4. **Advection** -- advance positions, cascading through downstream
//!    reaches, hop-bounded; arrival keys reissued oldest-first so
//!    stratigraphic order survives the crossing
//! 5. **Abrasion** -- exponential volume decay over distance moved,
//!    cumulative distance bookkeeping
//! 6. **Elevation** -- net flux divergence to junction elevations, slopes
//!    recomputed
//! 7. **Bookkeeping** -- step counter, state hash
//!
//! Phases 1-4 can fail; nothing observable is written outside the staged
//! column until they are done. A fatal error discards the staged column, so
//! the previous step remains the last valid state.

use crate::active_layer::{fill_layer, ActiveLayer, LayerFlow, ThicknessPolicy};
use crate::capacity::{CapacityFormula, FormulaKind, TransportInput};
use crate::id::{ParcelId, ReachId};
use crate::network::{NetworkError, RiverNetwork, RoutingTarget};
use crate::parcel::{ArrivalKey, Location, ParcelSpec};
use crate::query::{ParcelSeries, ReachSedimentStats, SAND_THRESHOLD};
use crate::sim::{SimState, StateHash, StepSummary};
use crate::store::{ParcelStore, StoreError};
use slotmap::SecondaryMap;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised by engine construction, parcel intake, and stepping.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("invalid timestep dt = {0}; must be finite and positive")]
    InvalidTimestep(f64),
    #[error("invalid engine config: {0}")]
    InvalidConfig(&'static str),
    #[error("parcel {0:?} rejected: {1}")]
    InvalidParcel(ParcelId, &'static str),
    #[error("reach {reach:?} has invalid hydraulics: {quantity} = {value}")]
    InvalidHydraulicState {
        reach: ReachId,
        quantity: &'static str,
        value: f64,
    },
    #[error("parcel {parcel:?} exceeded {hops} cascade hops at reach {reach:?}")]
    DegenerateTopology {
        parcel: ParcelId,
        reach: ReachId,
        hops: u32,
    },
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Physical and numerical parameters of the engine. All SI.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EngineConfig {
    /// Gravitational acceleration, m/s^2.
    pub gravity: f64,
    /// Water density, kg/m^3.
    pub water_density: f64,
    /// Critical Shields number for incipient motion.
    pub critical_shields: f64,
    /// Bed porosity (pore fraction of deposited sediment).
    pub bed_porosity: f64,
    /// Active-layer thickness policy.
    pub thickness_policy: ThicknessPolicy,
    /// Capacity formula used for travel distances.
    pub formula: FormulaKind,
    /// Most downstream-reach entries one parcel may make in one step.
    pub max_cascade_hops: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gravity: 9.81,
            water_density: 1000.0,
            critical_shields: 0.045,
            bed_porosity: 0.4,
            thickness_policy: ThicknessPolicy::default(),
            formula: FormulaKind::MeyerPeterMuller,
            max_cascade_hops: 256,
        }
    }
}

impl EngineConfig {
    /// Reject parameter combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), StepError> {
        if !(self.gravity > 0.0 && self.gravity.is_finite()) {
            return Err(StepError::InvalidConfig("gravity must be finite and positive"));
        }
        if !(self.water_density > 0.0 && self.water_density.is_finite()) {
            return Err(StepError::InvalidConfig("water density must be finite and positive"));
        }
        if !(self.critical_shields > 0.0 && self.critical_shields.is_finite()) {
            return Err(StepError::InvalidConfig("critical Shields number must be finite and positive"));
        }
        if !(self.bed_porosity >= 0.0 && self.bed_porosity < 1.0) {
            return Err(StepError::InvalidConfig("bed porosity must lie in [0, 1)"));
        }
        if self.max_cascade_hops == 0 {
            return Err(StepError::InvalidConfig("max cascade hops must be at least 1"));
        }
        match self.thickness_policy {
            ThicknessPolicy::FixedThickness { thickness } => {
                if !(thickness >= 0.0 && thickness.is_finite()) {
                    return Err(StepError::InvalidConfig("fixed layer thickness must be finite and non-negative"));
                }
            }
            ThicknessPolicy::FlowDependent {
                coefficient,
                exponent,
                minimum,
            } => {
                if !(coefficient > 0.0 && exponent > 0.0) {
                    return Err(StepError::InvalidConfig("flow-dependent layer coefficients must be positive"));
                }
                if !(minimum > 0.0 && minimum.is_finite()) {
                    return Err(StepError::InvalidConfig("flow-dependent layer minimum must be finite and positive"));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-step reach state
// ---------------------------------------------------------------------------

/// Hydraulic state of one reach for the current step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReachFlow {
    /// Depth-slope bed shear stress, Pa.
    pub shear_stress: f64,
    /// Volume-weighted mean grain diameter of parcels present, m. Zero for
    /// an empty reach.
    pub mean_grain_size: f64,
    /// Volume-weighted mean sediment density, kg/m^3. Zero for an empty
    /// reach.
    pub mean_density: f64,
    /// Shields stress on the mean grain. Zero for an empty reach.
    pub shields_stress: f64,
    /// Configured critical Shields number.
    pub critical_shields: f64,
    /// Active-layer thickness chosen this step, m.
    pub thickness: f64,
}

/// Per-reach volume bookkeeping for the elevation phase, m^3.
#[derive(Debug, Clone, Copy, Default)]
struct FluxTally {
    incoming: f64,
    outgoing: f64,
    abraded: f64,
}

fn tally(map: &mut SecondaryMap<ReachId, FluxTally>, reach: ReachId) -> &mut FluxTally {
    if !map.contains_key(reach) {
        map.insert(reach, FluxTally::default());
    }
    &mut map[reach]
}

/// A mobile parcel's requested movement.
#[derive(Debug, Clone, Copy)]
struct Motion {
    parcel: ParcelId,
    reach: ReachId,
    /// Requested travel distance, m.
    distance: f64,
}

/// A motion after cascade resolution.
#[derive(Debug, Clone, Copy)]
struct ResolvedMotion {
    parcel: ParcelId,
    from_reach: ReachId,
    /// Arrival key before this step's movement; orders same-step arrivals.
    old_arrival: ArrivalKey,
    /// Reach the parcel finished in, or exited from.
    last_reach: ReachId,
    final_loc: Location,
    final_pos: f64,
    /// In-network distance actually travelled, m.
    moved: f64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The sediment-routing engine.
#[derive(Debug)]
pub struct Engine {
    network: RiverNetwork,
    store: ParcelStore,
    config: EngineConfig,
    formula: Box<dyn CapacityFormula>,
    sim_state: SimState,
    last_state_hash: u64,

    // -- Scratch recomputed every step, readable until the next one --
    flows: SecondaryMap<ReachId, ReachFlow>,
    layers: SecondaryMap<ReachId, ActiveLayer>,

    /// Timing profile for the most recent step (profiling feature only).
    #[cfg(feature = "profiling")]
    pub(crate) last_profile: Option<crate::profiling::StepProfile>,
}

impl Engine {
    /// Build an engine over a validated network and an initial store.
    ///
    /// The store's contents are checked against the network and config:
    /// every in-network parcel must sit in an existing reach, and sediment
    /// density must exceed water density (the mobility threshold is
    /// undefined otherwise).
    pub fn new(
        network: RiverNetwork,
        store: ParcelStore,
        config: EngineConfig,
    ) -> Result<Self, StepError> {
        config.validate()?;
        for pid in store.parcel_ids() {
            let attrs = store.attributes(pid)?;
            if attrs.density <= config.water_density {
                return Err(StepError::InvalidParcel(pid, "density must exceed water density"));
            }
            if let Location::InReach(r) = store.latest_record(pid)?.location
                && !network.contains_reach(r)
            {
                return Err(NetworkError::InvalidReach(r).into());
            }
        }

        let formula = config.formula.instantiate();
        let mut engine = Self {
            network,
            store,
            config,
            formula,
            sim_state: SimState::new(),
            last_state_hash: 0,
            flows: SecondaryMap::new(),
            layers: SecondaryMap::new(),
            #[cfg(feature = "profiling")]
            last_profile: None,
        };
        engine.last_state_hash = engine.compute_state_hash();
        Ok(engine)
    }

    /// Rebuild from snapshot parts. The store's step counter state must
    /// match `sim_state`.
    pub(crate) fn from_parts(
        network: RiverNetwork,
        store: ParcelStore,
        config: EngineConfig,
        sim_state: SimState,
    ) -> Result<Self, StepError> {
        let mut engine = Self::new(network, store, config)?;
        engine.sim_state = sim_state;
        engine.last_state_hash = engine.compute_state_hash();
        Ok(engine)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn network(&self) -> &RiverNetwork {
        &self.network
    }

    /// Mutable network access for between-step updates (flow depths from an
    /// external hydrology source, manual elevation edits). Never call during
    /// a step; there is no way to, since `run_one_step` holds `&mut self`.
    pub fn network_mut(&mut self) -> &mut RiverNetwork {
        &mut self.network
    }

    pub fn store(&self) -> &ParcelStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sim_state(&self) -> &SimState {
        &self.sim_state
    }

    /// Hash of the state after the most recent step (or of the initial
    /// state before any step).
    pub fn state_hash(&self) -> u64 {
        self.last_state_hash
    }

    /// Hydraulic state of a reach from the most recent step.
    pub fn reach_flow(&self, reach: ReachId) -> Option<&ReachFlow> {
        self.flows.get(reach)
    }

    /// Active layer of a reach from the most recent step.
    pub fn active_layer(&self, reach: ReachId) -> Option<&ActiveLayer> {
        self.layers.get(reach)
    }

    /// Replace the capacity formula. Takes effect from the next step.
    pub fn set_capacity_formula(&mut self, formula: Box<dyn CapacityFormula>) {
        self.formula = formula;
    }

    /// Timing of the most recent step.
    #[cfg(feature = "profiling")]
    pub fn last_profile(&self) -> Option<&crate::profiling::StepProfile> {
        self.last_profile.as_ref()
    }

    /// Diagnose why a parcel is or is not moving, from the latest recorded
    /// state. Always available (not feature-gated).
    pub fn diagnose_parcel(
        &self,
        parcel: ParcelId,
    ) -> Option<crate::profiling::ParcelDiagnostics> {
        let record = self.store.latest_record(parcel).ok()?;
        let attrs = self.store.attributes(parcel).ok()?;

        use crate::profiling::MobilityStatus;
        let status = match record.location {
            Location::OutOfNetwork => MobilityStatus::OutOfNetwork,
            Location::InReach(_) if record.volume <= 0.0 => MobilityStatus::Depleted,
            Location::InReach(_) if !record.in_active_layer => MobilityStatus::Buried,
            Location::InReach(_) if record.stress_ratio <= 1.0 => MobilityStatus::BelowThreshold,
            Location::InReach(_) => MobilityStatus::Mobile,
        };
        let reach_flow = match record.location {
            Location::InReach(r) => self.flows.get(r).copied(),
            Location::OutOfNetwork => None,
        };

        Some(crate::profiling::ParcelDiagnostics {
            parcel,
            location: record.location,
            status,
            grain_size: attrs.grain_size,
            volume: record.volume,
            stress_ratio: record.stress_ratio,
            distance_total: record.distance_total,
            reach_flow,
        })
    }

    // -----------------------------------------------------------------------
    // Between-step mutation
    // -----------------------------------------------------------------------

    /// Inject new parcels at the current step (pulses, initial seeding).
    /// Validates reaches against the network and densities against the
    /// config before anything is added.
    pub fn add_parcels(
        &mut self,
        specs: &[ParcelSpec],
        at_step: u64,
    ) -> Result<Vec<ParcelId>, StepError> {
        for (index, spec) in specs.iter().enumerate() {
            if !self.network.contains_reach(spec.reach) {
                return Err(NetworkError::InvalidReach(spec.reach).into());
            }
            if spec.density <= self.config.water_density {
                return Err(StoreError::InvalidSpec {
                    index,
                    reason: "density must exceed water density",
                }
                .into());
            }
        }
        Ok(self.store.add_parcels(specs, at_step)?)
    }

    /// Move parcels to a reach between steps (recycling, pulse placement).
    pub fn relocate(
        &mut self,
        parcels: &[ParcelId],
        reach: ReachId,
        position: f64,
        arrival_step: u64,
    ) -> Result<(), StepError> {
        if !self.network.contains_reach(reach) {
            return Err(NetworkError::InvalidReach(reach).into());
        }
        self.store.relocate(parcels, reach, position, arrival_step)?;
        Ok(())
    }

    /// Drop all but the most recent `keep_last` history columns.
    pub fn truncate_history(&mut self, keep_last: usize) {
        self.store.truncate_history(keep_last);
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    /// Advance the whole system by one timestep of `dt` seconds.
    ///
    /// On error the staged history column is discarded and no reach or
    /// junction state has changed; the store's previous step remains the
    /// last valid state.
    pub fn run_one_step(&mut self, dt: f64) -> Result<StepSummary, StepError> {
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(StepError::InvalidTimestep(dt));
        }
        let step = self.store.append_timestep();
        match self.step_pipeline(dt, step) {
            Ok(summary) => Ok(summary),
            Err(e) => {
                self.store.discard_staged();
                Err(e)
            }
        }
    }

    fn step_pipeline(&mut self, dt: f64, step: u64) -> Result<StepSummary, StepError> {
        let mut summary = StepSummary {
            step,
            dt,
            ..StepSummary::default()
        };

        #[cfg(feature = "profiling")]
        let step_start = std::time::Instant::now();

        // Phase 1: Hydraulics.
        #[cfg(feature = "profiling")]
        let phase_start = std::time::Instant::now();
        let occupancy = self.collect_occupancy();
        let flows = self.compute_flows(&occupancy)?;
        self.flows = flows;
        #[cfg(feature = "profiling")]
        let hydraulics_dur = phase_start.elapsed();

        // Phase 2: Active layer.
        #[cfg(feature = "profiling")]
        let phase_start = std::time::Instant::now();
        let layers = self.compute_layers(&occupancy);
        self.apply_layers(layers);
        #[cfg(feature = "profiling")]
        let active_layer_dur = phase_start.elapsed();

        // Phase 3: Mobility.
        #[cfg(feature = "profiling")]
        let phase_start = std::time::Instant::now();
        let motions = self.compute_motions(dt, &mut summary);
        #[cfg(feature = "profiling")]
        let mobility_dur = phase_start.elapsed();

        // Phase 4: Advection (cascade), then commit positions and arrivals.
        #[cfg(feature = "profiling")]
        let phase_start = std::time::Instant::now();
        let (resolved, mut flux) = self.advect(&motions)?;
        self.commit_motions(&resolved, step, &mut summary);
        #[cfg(feature = "profiling")]
        let advection_dur = phase_start.elapsed();

        // Phase 5: Abrasion. Infallible from here on.
        #[cfg(feature = "profiling")]
        let phase_start = std::time::Instant::now();
        self.apply_abrasion(&resolved, &mut flux, &mut summary);
        #[cfg(feature = "profiling")]
        let abrasion_dur = phase_start.elapsed();

        // Phase 6: Elevation.
        #[cfg(feature = "profiling")]
        let phase_start = std::time::Instant::now();
        self.apply_elevation(&flux);
        #[cfg(feature = "profiling")]
        let elevation_dur = phase_start.elapsed();

        // Phase 7: Bookkeeping.
        #[cfg(feature = "profiling")]
        let phase_start = std::time::Instant::now();
        self.sim_state.step += 1;
        self.sim_state.model_time += dt;
        debug_assert_eq!(self.sim_state.step, self.store.latest_step());
        self.last_state_hash = self.compute_state_hash();
        summary.state_hash = self.last_state_hash;
        #[cfg(feature = "profiling")]
        let bookkeeping_dur = phase_start.elapsed();

        #[cfg(feature = "profiling")]
        {
            self.last_profile = Some(crate::profiling::StepProfile {
                hydraulics: hydraulics_dur,
                active_layer: active_layer_dur,
                mobility: mobility_dur,
                advection: advection_dur,
                abrasion: abrasion_dur,
                elevation: elevation_dur,
                bookkeeping: bookkeeping_dur,
                total: step_start.elapsed(),
                step,
            });
        }

        Ok(summary)
    }

    // -----------------------------------------------------------------------
    // Phase 1: Hydraulics
    // -----------------------------------------------------------------------

    /// Group in-network parcels by reach, in creation order. Parcels abraded
    /// to zero volume no longer take part in transport.
    fn collect_occupancy(&self) -> SecondaryMap<ReachId, Vec<ParcelId>> {
        let slice = self.store.latest_slice();
        let mut occupancy: SecondaryMap<ReachId, Vec<ParcelId>> = SecondaryMap::new();
        for rid in self.network.reach_ids() {
            occupancy.insert(rid, Vec::new());
        }
        for &pid in self.store.parcel_order() {
            let rec = &slice[pid];
            if let Location::InReach(r) = rec.location
                && rec.volume > 0.0
            {
                occupancy[r].push(pid);
            }
        }
        occupancy
    }

    fn flow_for_reach(
        &self,
        rid: ReachId,
        occupants: &[ParcelId],
    ) -> Result<ReachFlow, StepError> {
        let r = self.network.reach(rid)?;
        if !(r.flow_depth >= 0.0) {
            return Err(StepError::InvalidHydraulicState {
                reach: rid,
                quantity: "flow depth",
                value: r.flow_depth,
            });
        }
        if !(r.slope >= 0.0) {
            return Err(StepError::InvalidHydraulicState {
                reach: rid,
                quantity: "slope",
                value: r.slope,
            });
        }
        let shear = self.config.water_density * self.config.gravity * r.flow_depth * r.slope;
        if !(shear >= 0.0 && shear.is_finite()) {
            return Err(StepError::InvalidHydraulicState {
                reach: rid,
                quantity: "shear stress",
                value: shear,
            });
        }

        if occupants.is_empty() {
            return Ok(ReachFlow {
                shear_stress: shear,
                mean_grain_size: 0.0,
                mean_density: 0.0,
                shields_stress: 0.0,
                critical_shields: self.config.critical_shields,
                thickness: 0.0,
            });
        }

        let slice = self.store.latest_slice();
        let mut volume = 0.0;
        let mut grain_sum = 0.0;
        let mut density_sum = 0.0;
        for &pid in occupants {
            let v = slice[pid].volume;
            let attrs = self.store.attr(pid);
            volume += v;
            grain_sum += v * attrs.grain_size;
            density_sum += v * attrs.density;
        }
        let mean_grain_size = grain_sum / volume;
        let mean_density = density_sum / volume;
        let shields_stress = shear
            / ((mean_density - self.config.water_density) * self.config.gravity * mean_grain_size);
        let flow = LayerFlow {
            mean_grain_size,
            shields_stress,
            critical_shields: self.config.critical_shields,
        };
        Ok(ReachFlow {
            shear_stress: shear,
            mean_grain_size,
            mean_density,
            shields_stress,
            critical_shields: self.config.critical_shields,
            thickness: self.config.thickness_policy.thickness(&flow),
        })
    }

    /// Hydraulics over all reaches. Read-only on state frozen at step start,
    /// so with the `parallel` feature reaches are computed concurrently.
    fn compute_flows(
        &self,
        occupancy: &SecondaryMap<ReachId, Vec<ParcelId>>,
    ) -> Result<SecondaryMap<ReachId, ReachFlow>, StepError> {
        #[cfg(feature = "parallel")]
        let computed: Result<Vec<(ReachId, ReachFlow)>, StepError> = {
            use rayon::prelude::*;
            self.network
                .reach_order()
                .par_iter()
                .map(|&rid| Ok((rid, self.flow_for_reach(rid, &occupancy[rid])?)))
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let computed: Result<Vec<(ReachId, ReachFlow)>, StepError> = self
            .network
            .reach_order()
            .iter()
            .map(|&rid| Ok((rid, self.flow_for_reach(rid, &occupancy[rid])?)))
            .collect();

        let mut flows = SecondaryMap::new();
        for (rid, flow) in computed? {
            flows.insert(rid, flow);
        }
        Ok(flows)
    }

    // -----------------------------------------------------------------------
    // Phase 2: Active layer
    // -----------------------------------------------------------------------

    fn layer_for_reach(&self, rid: ReachId, occupants: &[ParcelId]) -> ActiveLayer {
        let slice = self.store.latest_slice();
        let flow = &self.flows[rid];
        // Invariant: ids in reach_order are always valid.
        let (width, length) = {
            let g = self.network.geometry(rid).unwrap();
            (g.width, g.length)
        };
        fill_layer(
            occupants.iter().map(|&pid| {
                let rec = &slice[pid];
                (pid, rec.arrival, rec.volume)
            }),
            flow.thickness,
            width,
            length,
        )
    }

    fn compute_layers(
        &self,
        occupancy: &SecondaryMap<ReachId, Vec<ParcelId>>,
    ) -> Vec<(ReachId, ActiveLayer)> {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            self.network
                .reach_order()
                .par_iter()
                .map(|&rid| (rid, self.layer_for_reach(rid, &occupancy[rid])))
                .collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            self.network
                .reach_order()
                .iter()
                .map(|&rid| (rid, self.layer_for_reach(rid, &occupancy[rid])))
                .collect()
        }
    }

    /// Write membership flags into the staged column and retain the layers
    /// for queries.
    fn apply_layers(&mut self, layers: Vec<(ReachId, ActiveLayer)>) {
        let slice = self.store.latest_slice_mut();
        for rec in slice.values_mut() {
            rec.in_active_layer = false;
            rec.stress_ratio = 0.0;
        }
        for (_, layer) in &layers {
            for &pid in &layer.members {
                slice[pid].in_active_layer = true;
            }
        }
        self.layers.clear();
        for (rid, layer) in layers {
            self.layers.insert(rid, layer);
        }
    }

    // -----------------------------------------------------------------------
    // Phase 3: Mobility
    // -----------------------------------------------------------------------

    /// Stress ratios for active parcels; travel distances for those above
    /// threshold. The ratio is recorded on the parcel either way.
    fn compute_motions(&mut self, dt: f64, summary: &mut StepSummary) -> Vec<Motion> {
        let mut motions = Vec::new();
        let porosity_factor = 1.0 - self.config.bed_porosity;
        for &rid in self.network.reach_order() {
            let flow = self.flows[rid];
            let layer = &self.layers[rid];
            summary.active_parcels += layer.members.len();
            for &pid in &layer.members {
                let (grain_size, density) = {
                    let attrs = self.store.attr(pid);
                    (attrs.grain_size, attrs.density)
                };
                let critical_stress = self.config.critical_shields
                    * (density - self.config.water_density)
                    * self.config.gravity
                    * grain_size;
                let ratio = flow.shear_stress / critical_stress;
                self.store.latest_slice_mut()[pid].stress_ratio = ratio;
                if ratio <= 1.0 {
                    continue;
                }
                summary.mobile_parcels += 1;
                let input = TransportInput {
                    grain_size,
                    shear_stress: flow.shear_stress,
                    critical_stress,
                    sediment_density: density,
                    water_density: self.config.water_density,
                    gravity: self.config.gravity,
                };
                let unit_rate = self.formula.unit_transport_rate(&input);
                // Virtual velocity: the unit rate moves through the
                // active-layer cross-section of solids.
                let velocity = unit_rate / (porosity_factor * flow.thickness);
                let distance = velocity * dt;
                if distance > 0.0 {
                    motions.push(Motion {
                        parcel: pid,
                        reach: rid,
                        distance,
                    });
                }
            }
        }
        motions
    }

    // -----------------------------------------------------------------------
    // Phase 4: Advection
    // -----------------------------------------------------------------------

    /// Resolve each motion through the downstream cascade. Read-only; the
    /// staged column is written by `commit_motions` once every motion has
    /// resolved.
    fn advect(
        &self,
        motions: &[Motion],
    ) -> Result<(Vec<ResolvedMotion>, SecondaryMap<ReachId, FluxTally>), StepError> {
        let slice = self.store.latest_slice();
        let mut resolved = Vec::with_capacity(motions.len());
        let mut flux: SecondaryMap<ReachId, FluxTally> = SecondaryMap::new();

        for m in motions {
            let rec = &slice[m.parcel];
            let volume = rec.volume;
            let mut reach = m.reach;
            let mut pos = rec.position;
            let mut remaining = m.distance;
            let mut hops = 0u32;

            let (final_loc, final_pos, moved) = loop {
                let length = self.network.reach(reach)?.length;
                let span = (1.0 - pos) * length;
                if remaining < span {
                    break (Location::InReach(reach), pos + remaining / length, m.distance);
                }
                remaining -= span;
                tally(&mut flux, reach).outgoing += volume;
                match self.network.reach(reach)?.downstream {
                    RoutingTarget::OutOfNetwork => {
                        break (Location::OutOfNetwork, 1.0, m.distance - remaining);
                    }
                    RoutingTarget::Downstream(next) => {
                        hops += 1;
                        if hops > self.config.max_cascade_hops {
                            return Err(StepError::DegenerateTopology {
                                parcel: m.parcel,
                                reach,
                                hops,
                            });
                        }
                        tally(&mut flux, next).incoming += volume;
                        reach = next;
                        pos = 0.0;
                    }
                }
            };

            resolved.push(ResolvedMotion {
                parcel: m.parcel,
                from_reach: m.reach,
                old_arrival: rec.arrival,
                last_reach: reach,
                final_loc,
                final_pos,
                moved,
            });
        }
        Ok((resolved, flux))
    }

    /// Write resolved positions, then reissue arrival keys for parcels that
    /// changed reach. Keys go out oldest-arrival-first, so a parcel that sat
    /// above another at its source still sits above it at the destination.
    fn commit_motions(
        &mut self,
        resolved: &[ResolvedMotion],
        step: u64,
        summary: &mut StepSummary,
    ) {
        {
            let slice = self.store.latest_slice_mut();
            for m in resolved {
                let rec = &mut slice[m.parcel];
                rec.location = m.final_loc;
                rec.position = m.final_pos;
            }
        }

        let mut arrivals: Vec<&ResolvedMotion> = resolved
            .iter()
            .filter(|m| matches!(m.final_loc, Location::InReach(r) if r != m.from_reach))
            .collect();
        arrivals.sort_unstable_by_key(|m| m.old_arrival);
        for m in arrivals {
            let key = self.store.issue_arrival(step);
            self.store.latest_slice_mut()[m.parcel].arrival = key;
        }

        for m in resolved {
            if m.final_loc.is_out_of_network() {
                summary.exited.push(m.parcel);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 5: Abrasion
    // -----------------------------------------------------------------------

    fn apply_abrasion(
        &mut self,
        resolved: &[ResolvedMotion],
        flux: &mut SecondaryMap<ReachId, FluxTally>,
        summary: &mut StepSummary,
    ) {
        for m in resolved {
            if m.moved <= 0.0 {
                continue;
            }
            summary.total_distance += m.moved;
            let abrasion_rate = self.store.attr(m.parcel).abrasion_rate;
            let rec = &mut self.store.latest_slice_mut()[m.parcel];
            rec.distance_total += m.moved;
            if abrasion_rate > 0.0 {
                let new_volume = (rec.volume * (-abrasion_rate * m.moved).exp()).max(0.0);
                let loss = rec.volume - new_volume;
                rec.volume = new_volume;
                if loss > 0.0 {
                    summary.abraded_volume += loss;
                    // Attributed to the reach where the parcel finished the
                    // step (or left the network).
                    tally(flux, m.last_reach).abraded += loss;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 6: Elevation
    // -----------------------------------------------------------------------

    /// Exner-style bed update: each reach's net volume change maps to an
    /// elevation shift at its upstream junction. The outlet junction is the
    /// fixed base level. Slopes are recomputed afterwards, so topographic
    /// feedback arrives at the next step.
    fn apply_elevation(&mut self, flux: &SecondaryMap<ReachId, FluxTally>) {
        let porosity_factor = 1.0 - self.config.bed_porosity;
        let shifts: Vec<(crate::id::NodeId, f64)> = self
            .network
            .reaches()
            .filter_map(|(rid, r)| {
                let t = flux.get(rid)?;
                let dv = t.incoming - t.outgoing - t.abraded;
                if dv == 0.0 {
                    return None;
                }
                let dz = dv / (porosity_factor * r.width * r.length);
                Some((r.from_node, dz))
            })
            .collect();
        for (node, dz) in shifts {
            self.network.shift_bed(node, dz);
        }
        self.network.recompute_slopes();
    }

    // -----------------------------------------------------------------------
    // State hash
    // -----------------------------------------------------------------------

    /// Deterministic hash over the step counter, reach hydraulics, junction
    /// elevations, and the latest parcel column.
    fn compute_state_hash(&self) -> u64 {
        let mut hasher = StateHash::new();
        hasher.write_u64(self.sim_state.step);
        hasher.write_f64(self.sim_state.model_time);

        for (_, r) in self.network.reaches() {
            hasher.write_f64(r.slope);
            hasher.write_f64(r.flow_depth);
        }
        for (_, j) in self.network.nodes() {
            hasher.write_f64(j.bed_elevation);
        }

        let slice = self.store.latest_slice();
        for &pid in self.store.parcel_order() {
            let rec = &slice[pid];
            match rec.location {
                Location::InReach(_) => hasher.write_u32(1),
                Location::OutOfNetwork => hasher.write_u32(0),
            }
            hasher.write_f64(rec.position);
            hasher.write_f64(rec.volume);
            hasher.write_u32(rec.in_active_layer as u32);
            hasher.write_u64(rec.arrival.step);
            hasher.write_u64(rec.arrival.seq);
            hasher.write_f64(rec.distance_total);
            hasher.write_f64(rec.stress_ratio);
        }
        hasher.finish()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Aggregate sediment statistics for one reach at the latest step.
    /// `None` if the reach is not part of the network.
    pub fn reach_stats(&self, reach: ReachId) -> Option<ReachSedimentStats> {
        if !self.network.contains_reach(reach) {
            return None;
        }
        let slice = self.store.latest_slice();
        let mut stats = ReachSedimentStats {
            reach,
            parcel_count: 0,
            total_volume: 0.0,
            active_count: 0,
            active_volume: 0.0,
            mean_active_grain_size: 0.0,
            sand_fraction: 0.0,
        };
        let mut grain_sum = 0.0;
        let mut sand_volume = 0.0;
        for &pid in self.store.parcel_order() {
            let rec = &slice[pid];
            if rec.location != Location::InReach(reach) {
                continue;
            }
            stats.parcel_count += 1;
            stats.total_volume += rec.volume;
            if rec.in_active_layer {
                let grain_size = self.store.attr(pid).grain_size;
                stats.active_count += 1;
                stats.active_volume += rec.volume;
                grain_sum += rec.volume * grain_size;
                if grain_size < SAND_THRESHOLD {
                    sand_volume += rec.volume;
                }
            }
        }
        if stats.active_volume > 0.0 {
            stats.mean_active_grain_size = grain_sum / stats.active_volume;
            stats.sand_fraction = sand_volume / stats.active_volume;
        }
        Some(stats)
    }

    /// Statistics for every reach, in network insertion order.
    pub fn all_reach_stats(&self) -> Vec<ReachSedimentStats> {
        self.network
            .reach_order()
            .iter()
            .filter_map(|&rid| self.reach_stats(rid))
            .collect()
    }

    /// The retained per-step history of one parcel, oldest step first.
    pub fn parcel_series(&self, parcel: ParcelId) -> Result<ParcelSeries, StoreError> {
        self.store.attributes(parcel)?;
        let mut first_step = None;
        let mut locations = Vec::new();
        let mut positions = Vec::new();
        let mut volumes = Vec::new();
        let mut distances = Vec::new();
        let mut stress_ratios = Vec::new();
        for step in self.store.base_step()..=self.store.latest_step() {
            // Pre-birth steps have no record.
            let Some(rec) = self.store.record(parcel, step)? else {
                continue;
            };
            if first_step.is_none() {
                first_step = Some(step);
            }
            locations.push(rec.location);
            positions.push(rec.position);
            volumes.push(rec.volume);
            distances.push(rec.distance_total);
            stress_ratios.push(rec.stress_ratio);
        }
        Ok(ParcelSeries {
            parcel,
            first_step: first_step.unwrap_or(self.store.base_step()),
            locations,
            positions,
            volumes,
            distances,
            stress_ratios,
        })
    }

    /// Decompose for snapshotting.
    pub(crate) fn parts(&self) -> (&RiverNetwork, &ParcelStore, &EngineConfig, &SimState) {
        (&self.network, &self.store, &self.config, &self.sim_state)
    }
}
