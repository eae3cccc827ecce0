//! Scenario loading from JSON.
//!
//! Feature-gated behind `data-loader`. Deserializes a network, initial
//! parcels, and config overrides from a data file, so scenarios can be
//! authored without touching builder code. Junctions and reaches are
//! cross-referenced by name; names exist only in the data file and are
//! resolved to ids during loading.

use std::collections::BTreeMap;

use crate::active_layer::ThicknessPolicy;
use crate::capacity::FormulaKind;
use crate::engine::{Engine, EngineConfig, StepError};
use crate::id::{NodeId, ParcelId, PropertyId, ReachId, SourceTag};
use crate::network::{NetworkBuilder, NetworkError, ReachSpec, RiverNetwork};
use crate::parcel::ParcelSpec;
use crate::store::ParcelStore;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur during scenario loading.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("network error: {0}")]
    Network(#[from] NetworkError),
    #[error("unknown junction reference: {0}")]
    UnknownNodeRef(String),
    #[error("unknown reach reference: {0}")]
    UnknownReachRef(String),
    #[error("duplicate junction name: {0}")]
    DuplicateNodeName(String),
    #[error("duplicate reach name: {0}")]
    DuplicateReachName(String),
    #[error("unknown capacity formula: {0}")]
    UnknownFormula(String),
    #[error("unknown active-layer policy: {0}")]
    UnknownLayerPolicy(String),
}

// ---------------------------------------------------------------------------
// JSON data structures
// ---------------------------------------------------------------------------

/// Top-level scenario structure for JSON deserialization.
#[derive(Debug, serde::Deserialize)]
pub struct ScenarioData {
    #[serde(default)]
    pub nodes: Vec<NodeData>,
    #[serde(default)]
    pub reaches: Vec<ReachData>,
    #[serde(default)]
    pub parcels: Vec<ParcelData>,
    #[serde(default)]
    pub config: Option<ConfigData>,
}

/// JSON representation of a junction.
#[derive(Debug, serde::Deserialize)]
pub struct NodeData {
    pub name: String,
    pub bed_elevation: f64,
    pub bedrock_elevation: f64,
}

/// JSON representation of a reach.
#[derive(Debug, serde::Deserialize)]
pub struct ReachData {
    pub name: String,
    pub from: String, // references junction by name
    pub to: String,   // references junction by name
    pub length: f64,
    pub width: f64,
    #[serde(default)]
    pub flow_depth: f64,
    /// Explicit slope; derived from junction bed elevations when absent.
    #[serde(default)]
    pub slope: Option<f64>,
}

/// JSON representation of a batch of identical parcels.
#[derive(Debug, serde::Deserialize)]
pub struct ParcelData {
    pub reach: String, // references reach by name
    #[serde(default)]
    pub position: f64,
    pub volume: f64,
    pub grain_size: f64,
    #[serde(default = "default_density")]
    pub density: f64,
    #[serde(default)]
    pub abrasion_rate: f64,
    #[serde(default)]
    pub source: u32,
    #[serde(default = "default_count")]
    pub count: u32,
    #[serde(default)]
    pub properties: BTreeMap<u16, f64>,
}

fn default_density() -> f64 {
    2650.0
}

fn default_count() -> u32 {
    1
}

/// JSON representation of config overrides. Absent fields keep the
/// [`EngineConfig`] defaults.
#[derive(Debug, serde::Deserialize)]
pub struct ConfigData {
    #[serde(default)]
    pub gravity: Option<f64>,
    #[serde(default)]
    pub water_density: Option<f64>,
    #[serde(default)]
    pub critical_shields: Option<f64>,
    #[serde(default)]
    pub bed_porosity: Option<f64>,
    #[serde(default)]
    pub formula: Option<String>, // "meyer_peter_muller", "wilcock_crowe"
    #[serde(default)]
    pub max_cascade_hops: Option<u32>,
    #[serde(default)]
    pub active_layer: Option<LayerData>,
}

/// JSON representation of the active-layer thickness policy.
#[derive(Debug, serde::Deserialize)]
pub struct LayerData {
    pub policy: String, // "fixed", "flow_dependent"
    #[serde(default)]
    pub thickness: Option<f64>,
    #[serde(default)]
    pub coefficient: Option<f64>,
    #[serde(default)]
    pub exponent: Option<f64>,
    #[serde(default)]
    pub minimum: Option<f64>,
}

// ---------------------------------------------------------------------------
// Loaded scenario
// ---------------------------------------------------------------------------

/// A loaded scenario: validated network, initial parcels, and config.
/// The name maps let callers keep referring to data-file names.
#[derive(Debug)]
pub struct Scenario {
    pub network: RiverNetwork,
    pub node_ids: BTreeMap<String, NodeId>,
    pub reach_ids: BTreeMap<String, ReachId>,
    pub parcels: Vec<ParcelSpec>,
    pub config: EngineConfig,
}

impl Scenario {
    /// Build an engine and seed it with the scenario's parcels at step 0.
    pub fn into_engine(self) -> Result<(Engine, Vec<ParcelId>), StepError> {
        let mut engine = Engine::new(self.network, ParcelStore::new(), self.config)?;
        let parcels = engine.add_parcels(&self.parcels, 0)?;
        Ok((engine, parcels))
    }
}

// ---------------------------------------------------------------------------
// Loading functions
// ---------------------------------------------------------------------------

/// Load a scenario from a JSON string.
pub fn load_scenario_json(json: &str) -> Result<Scenario, DataLoadError> {
    let data: ScenarioData = serde_json::from_str(json)?;
    build_scenario(data)
}

/// Load a scenario from JSON bytes.
pub fn load_scenario_json_bytes(bytes: &[u8]) -> Result<Scenario, DataLoadError> {
    let data: ScenarioData = serde_json::from_slice(bytes)?;
    build_scenario(data)
}

fn parse_layer(layer: &LayerData) -> Result<ThicknessPolicy, DataLoadError> {
    match layer.policy.as_str() {
        "fixed" => Ok(ThicknessPolicy::FixedThickness {
            thickness: layer.thickness.unwrap_or(0.1),
        }),
        "flow_dependent" => Ok(ThicknessPolicy::FlowDependent {
            coefficient: layer.coefficient.unwrap_or(0.515),
            exponent: layer.exponent.unwrap_or(0.56),
            minimum: layer.minimum.unwrap_or(0.01),
        }),
        other => Err(DataLoadError::UnknownLayerPolicy(other.to_string())),
    }
}

fn parse_config(data: &ConfigData) -> Result<EngineConfig, DataLoadError> {
    let mut config = EngineConfig::default();
    if let Some(g) = data.gravity {
        config.gravity = g;
    }
    if let Some(rho) = data.water_density {
        config.water_density = rho;
    }
    if let Some(theta) = data.critical_shields {
        config.critical_shields = theta;
    }
    if let Some(p) = data.bed_porosity {
        config.bed_porosity = p;
    }
    if let Some(hops) = data.max_cascade_hops {
        config.max_cascade_hops = hops;
    }
    if let Some(name) = &data.formula {
        config.formula = match name.as_str() {
            "meyer_peter_muller" => FormulaKind::MeyerPeterMuller,
            "wilcock_crowe" => FormulaKind::WilcockCrowe,
            other => return Err(DataLoadError::UnknownFormula(other.to_string())),
        };
    }
    if let Some(layer) = &data.active_layer {
        config.thickness_policy = parse_layer(layer)?;
    }
    Ok(config)
}

fn build_scenario(data: ScenarioData) -> Result<Scenario, DataLoadError> {
    let mut builder = NetworkBuilder::new();

    // Phase 1: junctions.
    let mut node_ids: BTreeMap<String, NodeId> = BTreeMap::new();
    let mut beds: BTreeMap<String, f64> = BTreeMap::new();
    for node in &data.nodes {
        let id = builder.add_junction(node.bed_elevation, node.bedrock_elevation);
        if node_ids.insert(node.name.clone(), id).is_some() {
            return Err(DataLoadError::DuplicateNodeName(node.name.clone()));
        }
        beds.insert(node.name.clone(), node.bed_elevation);
    }

    // Phase 2: reaches (resolve junction refs by name).
    let mut reach_ids: BTreeMap<String, ReachId> = BTreeMap::new();
    for reach in &data.reaches {
        let from = *node_ids
            .get(&reach.from)
            .ok_or_else(|| DataLoadError::UnknownNodeRef(reach.from.clone()))?;
        let to = *node_ids
            .get(&reach.to)
            .ok_or_else(|| DataLoadError::UnknownNodeRef(reach.to.clone()))?;
        let slope = match reach.slope {
            Some(s) => s,
            // Resolved names are present in both maps.
            None => ((beds[&reach.from] - beds[&reach.to]) / reach.length).max(0.0),
        };
        let id = builder.add_reach(ReachSpec {
            from_node: from,
            to_node: to,
            length: reach.length,
            width: reach.width,
            slope,
            flow_depth: reach.flow_depth,
        });
        if reach_ids.insert(reach.name.clone(), id).is_some() {
            return Err(DataLoadError::DuplicateReachName(reach.name.clone()));
        }
    }

    // Phase 3: validate the network.
    let network = builder.build()?;

    // Phase 4: parcel batches (resolve reach refs by name).
    let mut parcels = Vec::new();
    for batch in &data.parcels {
        let reach = *reach_ids
            .get(&batch.reach)
            .ok_or_else(|| DataLoadError::UnknownReachRef(batch.reach.clone()))?;
        let properties: BTreeMap<PropertyId, f64> = batch
            .properties
            .iter()
            .map(|(&k, &v)| (PropertyId(k), v))
            .collect();
        for _ in 0..batch.count {
            parcels.push(ParcelSpec {
                reach,
                position: batch.position,
                volume: batch.volume,
                grain_size: batch.grain_size,
                density: batch.density,
                abrasion_rate: batch.abrasion_rate,
                source: SourceTag(batch.source),
                properties: properties.clone(),
            });
        }
    }

    // Phase 5: config overrides.
    let config = match &data.config {
        Some(c) => parse_config(c)?,
        None => EngineConfig::default(),
    };

    Ok(Scenario {
        network,
        node_ids,
        reach_ids,
        parcels,
        config,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
