//! River network topology: reaches (channel segments) joined at junctions.
//!
//! The network is built once through [`NetworkBuilder`] and validated at
//! build time. During a transport step it is read-only; after a step the
//! engine writes updated junction elevations back and recomputes slopes.

use crate::id::{NodeId, ReachId};
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap};
use std::collections::VecDeque;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors from network construction and queries.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("reach not found: {0:?}")]
    InvalidReach(ReachId),
    #[error("junction not found: {0:?}")]
    InvalidNode(NodeId),
    #[error("reach {0:?} has non-positive length")]
    NonPositiveLength(ReachId),
    #[error("reach {0:?} has non-positive width")]
    NonPositiveWidth(ReachId),
    #[error("reach {0:?} has negative slope")]
    NegativeSlope(ReachId),
    #[error("reach {0:?} has negative flow depth")]
    NegativeFlowDepth(ReachId),
    #[error("junction {0:?} has more than one outflowing reach")]
    DivergentJunction(NodeId),
    #[error("junction {0:?} has bedrock above its bed surface")]
    BedrockAboveBed(NodeId),
    #[error("reach {0:?} has no route to an outlet")]
    NoRouteToOutlet(ReachId),
}

// ---------------------------------------------------------------------------
// Core data structures
// ---------------------------------------------------------------------------

/// Where sediment leaving a reach goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingTarget {
    /// The next reach downstream.
    Downstream(ReachId),
    /// Past the outlet; parcels routed here leave the modeled domain.
    OutOfNetwork,
}

/// A junction between reaches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Junction {
    /// Bed-surface elevation, m. Updated by the engine after each step.
    pub bed_elevation: f64,
    /// Bedrock elevation, m. Degradation never cuts below this.
    pub bedrock_elevation: f64,
}

/// A single channel segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reach {
    /// Upstream junction.
    pub from_node: NodeId,
    /// Downstream junction.
    pub to_node: NodeId,
    /// Segment length, m. Positive.
    pub length: f64,
    /// Channel width, m. Positive.
    pub width: f64,
    /// Water-surface slope, m/m. Non-negative; recomputed from junction
    /// elevations after each step.
    pub slope: f64,
    /// Flow depth, m. Non-negative; callers update it between steps.
    pub flow_depth: f64,
    /// Resolved routing target. Derived from junction topology at build.
    pub downstream: RoutingTarget,
}

/// Geometry snapshot returned by [`RiverNetwork::geometry`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReachGeometry {
    pub length: f64,
    pub width: f64,
    pub slope: f64,
    pub flow_depth: f64,
}

/// Per-reach input to [`NetworkBuilder::add_reach`]. The routing target is
/// not given here; it is inferred from shared junctions at build.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReachSpec {
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub length: f64,
    pub width: f64,
    pub slope: f64,
    pub flow_depth: f64,
}

// ---------------------------------------------------------------------------
// RiverNetwork
// ---------------------------------------------------------------------------

/// The validated river network.
///
/// Reaches and junctions live in `SlotMap`s; `reach_order` records insertion
/// order so iteration, hashing, and parallel splits are deterministic runs
/// of the same construction sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiverNetwork {
    nodes: SlotMap<NodeId, Junction>,
    reaches: SlotMap<ReachId, Reach>,
    reach_order: Vec<ReachId>,
}

impl RiverNetwork {
    /// Downstream routing target of a reach.
    pub fn downstream_reach(&self, reach: ReachId) -> Result<RoutingTarget, NetworkError> {
        self.reaches
            .get(reach)
            .map(|r| r.downstream)
            .ok_or(NetworkError::InvalidReach(reach))
    }

    /// Geometry of a reach at the current step.
    pub fn geometry(&self, reach: ReachId) -> Result<ReachGeometry, NetworkError> {
        self.reaches
            .get(reach)
            .map(|r| ReachGeometry {
                length: r.length,
                width: r.width,
                slope: r.slope,
                flow_depth: r.flow_depth,
            })
            .ok_or(NetworkError::InvalidReach(reach))
    }

    /// Borrow a reach.
    pub fn reach(&self, reach: ReachId) -> Result<&Reach, NetworkError> {
        self.reaches
            .get(reach)
            .ok_or(NetworkError::InvalidReach(reach))
    }

    /// Borrow a junction.
    pub fn node(&self, node: NodeId) -> Result<&Junction, NetworkError> {
        self.nodes.get(node).ok_or(NetworkError::InvalidNode(node))
    }

    pub fn reach_count(&self) -> usize {
        self.reaches.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains_reach(&self, reach: ReachId) -> bool {
        self.reaches.contains_key(reach)
    }

    /// Reaches in insertion order.
    pub fn reach_ids(&self) -> impl Iterator<Item = ReachId> + '_ {
        self.reach_order.iter().copied()
    }

    /// Insertion-order slice, for callers that need indexed access.
    pub fn reach_order(&self) -> &[ReachId] {
        &self.reach_order
    }

    /// Junctions in key order.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys()
    }

    /// Reaches with their ids, in insertion order.
    pub fn reaches(&self) -> impl Iterator<Item = (ReachId, &Reach)> + '_ {
        self.reach_order.iter().map(|&rid| (rid, &self.reaches[rid]))
    }

    /// Junctions with their ids, in key order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Junction)> + '_ {
        self.nodes.iter()
    }

    /// Update a reach's flow depth between steps. The value is taken as
    /// given; the engine rejects a negative or NaN depth fatally at the next
    /// step, leaving the prior state intact.
    pub fn set_flow_depth(&mut self, reach: ReachId, depth: f64) -> Result<(), NetworkError> {
        let r = self
            .reaches
            .get_mut(reach)
            .ok_or(NetworkError::InvalidReach(reach))?;
        r.flow_depth = depth;
        Ok(())
    }

    /// Shift a junction's bed elevation by `dz`, clamped at bedrock.
    pub fn adjust_bed_elevation(&mut self, node: NodeId, dz: f64) -> Result<(), NetworkError> {
        let j = self.nodes.get_mut(node).ok_or(NetworkError::InvalidNode(node))?;
        j.bed_elevation = (j.bed_elevation + dz).max(j.bedrock_elevation);
        Ok(())
    }

    /// Elevation shift for the engine's elevation phase, which runs after
    /// all fallible work. The node comes from a validated reach, so lookup
    /// cannot miss.
    pub(crate) fn shift_bed(&mut self, node: NodeId, dz: f64) {
        let j = &mut self.nodes[node];
        j.bed_elevation = (j.bed_elevation + dz).max(j.bedrock_elevation);
    }

    /// Recompute every reach's slope from current junction elevations.
    ///
    /// An aggraded downstream junction can produce an adverse (negative)
    /// raw slope; it is clamped to zero so the reach carries no stress
    /// instead of failing the run.
    pub fn recompute_slopes(&mut self) {
        for &rid in &self.reach_order {
            let (up, down, length) = {
                let r = &self.reaches[rid];
                (r.from_node, r.to_node, r.length)
            };
            let z_up = self.nodes[up].bed_elevation;
            let z_down = self.nodes[down].bed_elevation;
            self.reaches[rid].slope = ((z_up - z_down) / length).max(0.0);
        }
    }
}

// ---------------------------------------------------------------------------
// NetworkBuilder
// ---------------------------------------------------------------------------

/// Incremental construction of a [`RiverNetwork`], validated at `build()`.
#[derive(Debug, Default)]
pub struct NetworkBuilder {
    nodes: SlotMap<NodeId, Junction>,
    reaches: SlotMap<ReachId, Reach>,
    reach_order: Vec<ReachId>,
}

impl NetworkBuilder {
    pub fn new() -> Self {
        Self {
            nodes: SlotMap::with_key(),
            reaches: SlotMap::with_key(),
            reach_order: Vec::new(),
        }
    }

    /// Add a junction. Elevations are validated at `build()`.
    pub fn add_junction(&mut self, bed_elevation: f64, bedrock_elevation: f64) -> NodeId {
        self.nodes.insert(Junction {
            bed_elevation,
            bedrock_elevation,
        })
    }

    /// Add a reach between two junctions. The routing target is resolved at
    /// `build()` from shared junctions.
    pub fn add_reach(&mut self, spec: ReachSpec) -> ReachId {
        let id = self.reaches.insert(Reach {
            from_node: spec.from_node,
            to_node: spec.to_node,
            length: spec.length,
            width: spec.width,
            slope: spec.slope,
            flow_depth: spec.flow_depth,
            // Placeholder until build() resolves junction topology.
            downstream: RoutingTarget::OutOfNetwork,
        });
        self.reach_order.push(id);
        id
    }

    /// Validate and finish the network.
    ///
    /// Checks, in order:
    /// 1. every reach references existing junctions and has positive
    ///    length/width, non-negative slope/depth (NaN rejected);
    /// 2. every junction has at most one outflowing reach (converging
    ///    network);
    /// 3. junction bedrock lies at or below the bed surface;
    /// 4. every reach drains to an outlet (catches cycles).
    pub fn build(mut self) -> Result<RiverNetwork, NetworkError> {
        // 1. Per-reach geometry and junction references.
        for &rid in &self.reach_order {
            let r = &self.reaches[rid];
            if !self.nodes.contains_key(r.from_node) {
                return Err(NetworkError::InvalidNode(r.from_node));
            }
            if !self.nodes.contains_key(r.to_node) {
                return Err(NetworkError::InvalidNode(r.to_node));
            }
            if !(r.length > 0.0) {
                return Err(NetworkError::NonPositiveLength(rid));
            }
            if !(r.width > 0.0) {
                return Err(NetworkError::NonPositiveWidth(rid));
            }
            if !(r.slope >= 0.0) {
                return Err(NetworkError::NegativeSlope(rid));
            }
            if !(r.flow_depth >= 0.0) {
                return Err(NetworkError::NegativeFlowDepth(rid));
            }
        }

        // 2. Resolve routing: the reach leaving a junction, if any.
        let mut outflow: SecondaryMap<NodeId, ReachId> = SecondaryMap::new();
        for &rid in &self.reach_order {
            let from = self.reaches[rid].from_node;
            if outflow.insert(from, rid).is_some() {
                return Err(NetworkError::DivergentJunction(from));
            }
        }
        for &rid in &self.reach_order {
            let to = self.reaches[rid].to_node;
            self.reaches[rid].downstream = match outflow.get(to) {
                Some(&next) => RoutingTarget::Downstream(next),
                None => RoutingTarget::OutOfNetwork,
            };
        }

        // 3. Junction elevations.
        for (nid, j) in &self.nodes {
            if !(j.bed_elevation >= j.bedrock_elevation) {
                return Err(NetworkError::BedrockAboveBed(nid));
            }
        }

        // 4. Outlet reachability: walk upstream from outlet reaches.
        let mut upstream: SecondaryMap<ReachId, Vec<ReachId>> = SecondaryMap::new();
        for &rid in &self.reach_order {
            upstream.insert(rid, Vec::new());
        }
        let mut queue: VecDeque<ReachId> = VecDeque::new();
        for &rid in &self.reach_order {
            match self.reaches[rid].downstream {
                RoutingTarget::Downstream(next) => upstream[next].push(rid),
                RoutingTarget::OutOfNetwork => queue.push_back(rid),
            }
        }
        let mut drains: SecondaryMap<ReachId, ()> = SecondaryMap::new();
        while let Some(rid) = queue.pop_front() {
            if drains.insert(rid, ()).is_none()
                && let Some(ups) = upstream.get(rid)
            {
                for &up in ups {
                    queue.push_back(up);
                }
            }
        }
        for &rid in &self.reach_order {
            if !drains.contains_key(rid) {
                return Err(NetworkError::NoRouteToOutlet(rid));
            }
        }

        Ok(RiverNetwork {
            nodes: self.nodes,
            reaches: self.reaches,
            reach_order: self.reach_order,
        })
    }
}
