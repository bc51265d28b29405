//! Flow solvers for abstract and hybrid networks.
//!
//! # Abstract Flow Solver
//!
//! The channel network is treated as a resistor circuit and solved by
//! modified nodal analysis:
//!
//! 1. Every node whose pressure is not fixed (ground or a caller-supplied
//!    pressure) is an unknown
//! 2. Every pressure pump adds its own flow as an unknown, together with the
//!    constraint `p_b - p_a = pressure`
//! 3. Mass conservation at each free node gives one equation: the flow
//!    leaving through channels and pressure pumps equals the external
//!    inflow plus the flow delivered by flow-rate pumps
//!
//! The resulting dense system is solved by LU decomposition. Structurally
//! singular systems (a sub-network with no fixed pressure, or pressure
//! pumps closing a loop) are detected before factorisation and reported
//! with the offending nodes.
//!
//! # Submodules
//!
//! - [`boundary`]: translation between flow states and CFD boundary values
//! - [`cfd`]: the interface to CFD module simulators and a surrogate module
//! - [`coupling`]: the abstract/CFD fixed-point coupling scheduler
//! - [`integration`]: macro time stepping of a complete simulation
//!
//! # Usage Pattern
//!
//! ```
//! use microflow::{Network, ChannelGeometry};
//! use microflow::solvers::{BoundaryConditions, NodalSolver};
//!
//! let geometry = ChannelGeometry::rectangular(1e-4, 1e-4, 1e-3);
//! let mut network = Network::new();
//! let n0 = network.add_node([0.0, 0.0], true);
//! let n1 = network.add_node([1e-3, 0.0], false);
//! let n2 = network.add_node([2e-3, 0.0], false);
//! network.add_channel_with_resistance(n0, n1, geometry, 5.0).unwrap();
//! network.add_channel_with_resistance(n1, n2, geometry, 5.0).unwrap();
//! network.valid().unwrap();
//!
//! // Hold the far end at 10 Pa
//! let conditions = BoundaryConditions::new().with_pressure(n2, 10.0);
//! let state = NodalSolver::default().solve(&network, &conditions).unwrap();
//! assert!((state.pressure(n1) - 5.0).abs() < 1e-12);
//! assert!((state.boundary_flow(n0) - 2.0).abs() < 1e-12);
//! ```

// Submodules
pub mod boundary;
pub mod cfd;
pub mod coupling;
pub mod integration;

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{ChannelId, FlowDirection, ModuleId, Network, NodeId, PumpId, PumpKind, TopologyError};

pub use cfd::ModuleSolverError;

/// Result type for solver operations.
pub type SolverResult<T> = Result<T, SolverError>;

/// Errors that can occur during solving.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SolverError {
    /// The network changed since it was last validated
    #[error("Network must be sorted and validated before solving")]
    NotReady,
    /// The nodal system has no unique solution
    #[error("Singular nodal system involving nodes {nodes:?}")]
    SingularSystem { nodes: Vec<NodeId> },
    /// A channel resistance was never evaluated
    #[error("Channel {channel:?} has no resistance")]
    MissingResistance { channel: ChannelId },
    /// A channel resistance is not strictly positive
    #[error("Channel {channel:?} has invalid resistance {value}")]
    InvalidResistance { channel: ChannelId, value: f64 },
    /// A boundary condition conflicts with the network or another condition
    #[error("Conflicting boundary condition at node {node:?}")]
    ConflictingBoundary { node: NodeId },
    /// A boundary value is not finite, or a link resistance is not positive
    #[error("Invalid boundary value {value} at node {node:?}")]
    InvalidBoundary { node: NodeId, value: f64 },
    /// A boundary condition names a node that does not exist
    #[error("Unknown node {0:?} in boundary conditions")]
    UnknownNode(NodeId),
    /// A module has no simulator attached
    #[error("No simulator attached to module {0:?}")]
    MissingSimulator(ModuleId),
    /// More than one simulator claims the same module
    #[error("Several simulators attached to module {0:?}")]
    DuplicateSimulator(ModuleId),
    /// Coupling exhausted its iterations under the abort policy
    #[error("Coupling did not converge: residual {residual:e} after {iterations} iterations")]
    CouplingAborted { iterations: usize, residual: f64 },
    /// The network is malformed
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// A CFD simulator failed
    #[error(transparent)]
    ModuleSolver(#[from] ModuleSolverError),
}

/// A resistive connection that exists only for one solve, e.g. the interior
/// of a module before any CFD result is available.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VirtualLink {
    /// First endpoint
    pub a: NodeId,
    /// Second endpoint
    pub b: NodeId,
    /// Resistance [Pa*s/m^3]
    pub resistance: f64,
}

/// Caller-supplied boundary conditions for one abstract solve.
///
/// Pressures fix node pressures (in addition to ground nodes). Inflows are
/// external volumetric sources at a node; negative values are sinks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundaryConditions {
    pressures: BTreeMap<NodeId, f64>,
    inflows: BTreeMap<NodeId, f64>,
    links: Vec<VirtualLink>,
}

impl BoundaryConditions {
    /// Creates an empty set of boundary conditions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixes the pressure at `node`.
    pub fn with_pressure(mut self, node: NodeId, pressure: f64) -> Self {
        self.set_pressure(node, pressure);
        self
    }

    /// Adds an external inflow at `node`.
    pub fn with_inflow(mut self, node: NodeId, flow_rate: f64) -> Self {
        self.add_inflow(node, flow_rate);
        self
    }

    /// Fixes the pressure at `node`, replacing any previous value.
    pub fn set_pressure(&mut self, node: NodeId, pressure: f64) {
        self.pressures.insert(node, pressure);
    }

    /// Adds `flow_rate` to the external inflow at `node`.
    pub fn add_inflow(&mut self, node: NodeId, flow_rate: f64) {
        *self.inflows.entry(node).or_insert(0.0) += flow_rate;
    }

    /// Connects `a` and `b` with a resistance for this solve only.
    pub fn add_link(&mut self, a: NodeId, b: NodeId, resistance: f64) {
        self.links.push(VirtualLink { a, b, resistance });
    }

    /// Fixed pressure at `node`, if any.
    pub fn pressure(&self, node: NodeId) -> Option<f64> {
        self.pressures.get(&node).copied()
    }

    /// External inflow at `node`.
    pub fn inflow(&self, node: NodeId) -> f64 {
        self.inflows.get(&node).copied().unwrap_or(0.0)
    }

    /// Virtual links.
    pub fn links(&self) -> &[VirtualLink] {
        &self.links
    }

    /// True if `node` carries any condition or link.
    pub fn touches(&self, node: NodeId) -> bool {
        self.pressures.contains_key(&node)
            || self.inflows.contains_key(&node)
            || self.links.iter().any(|l| l.a == node || l.b == node)
    }
}

/// Pressures and flow rates over a whole network at one instant.
///
/// Flow rates are signed relative to the edge orientation: positive channel
/// flow runs from `node_a` to `node_b`, positive pump flow runs through the
/// pump from its suction to its discharge node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    /// Pressure per node [Pa]
    pub pressures: Vec<f64>,
    /// Flow rate per channel [m^3/s]
    pub channel_flows: Vec<f64>,
    /// Flow rate per pump [m^3/s]
    pub pump_flows: Vec<f64>,
    /// Net flow delivered into each node by its channels and pumps, i.e. the
    /// flow leaving the network there [m^3/s]. Zero at interior nodes.
    pub boundary_flows: Vec<f64>,
    /// Flow through each virtual link, in link order [m^3/s]
    pub link_flows: Vec<f64>,
    /// Nodes with a fixed pressure, an external inflow or a virtual link
    pub boundary_nodes: Vec<NodeId>,
}

impl FlowState {
    /// Pressure at `node` [Pa].
    ///
    /// # Panics
    ///
    /// Panics if `node` does not belong to the solved network.
    pub fn pressure(&self, node: NodeId) -> f64 {
        self.pressures[node.0]
    }

    /// Signed flow rate through `channel` [m^3/s].
    ///
    /// # Panics
    ///
    /// Panics if `channel` does not belong to the solved network.
    pub fn flow_rate(&self, channel: ChannelId) -> f64 {
        self.channel_flows[channel.0]
    }

    /// Flow direction in `channel`.
    pub fn direction(&self, channel: ChannelId) -> FlowDirection {
        FlowDirection::from_flow_rate(self.flow_rate(channel))
    }

    /// Signed flow rate through `pump` [m^3/s].
    pub fn pump_flow(&self, pump: PumpId) -> f64 {
        self.pump_flows[pump.0]
    }

    /// Flow leaving the network at `node` [m^3/s].
    pub fn boundary_flow(&self, node: NodeId) -> f64 {
        self.boundary_flows[node.0]
    }

    /// Largest mass imbalance over nodes that carry no boundary condition.
    pub fn interior_imbalance(&self) -> f64 {
        self.boundary_flows
            .iter()
            .enumerate()
            .filter(|(i, _)| self.boundary_nodes.binary_search(&NodeId(*i)).is_err())
            .map(|(_, f)| f.abs())
            .fold(0.0, f64::max)
    }
}

/// Configuration for the nodal solver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverConfig {
    /// Largest accepted scaled residual `|Ax - b| / (|A||x| + |b|)`; solutions
    /// above it are reported as singular
    pub residual_tolerance: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig { residual_tolerance: 1e-8 }
    }
}

impl SolverConfig {
    /// Creates a new solver configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the residual tolerance.
    pub fn with_residual_tolerance(mut self, tolerance: f64) -> Self {
        self.residual_tolerance = tolerance;
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum NodeVar {
    Free(usize),
    Fixed(f64),
}

impl NodeVar {
    fn value(self, x: &DVector<f64>) -> f64 {
        match self {
            NodeVar::Free(i) => x[i],
            NodeVar::Fixed(p) => p,
        }
    }
}

/// Disjoint sets over node indices.
struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        DisjointSet { parent: (0..n).collect() }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    /// Joins the sets of `a` and `b`; false if they were already joined.
    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        self.parent[ra.max(rb)] = ra.min(rb);
        true
    }
}

/// Abstract flow solver: modified nodal analysis of the channel network.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodalSolver {
    /// Solver settings
    pub config: SolverConfig,
}

impl NodalSolver {
    /// Creates a solver with the given configuration.
    pub fn new(config: SolverConfig) -> Self {
        NodalSolver { config }
    }

    /// Solves the network for pressures and flow rates.
    ///
    /// # Errors
    ///
    /// - [`SolverError::NotReady`] if the network was not validated
    /// - [`SolverError::MissingResistance`] / [`SolverError::InvalidResistance`]
    ///   for channels without a usable resistance
    /// - [`SolverError::SingularSystem`] if some pressures are undetermined
    pub fn solve(&self, network: &Network, conditions: &BoundaryConditions) -> SolverResult<FlowState> {
        if !network.is_ready() {
            return Err(SolverError::NotReady);
        }
        let node_count = network.node_count();

        let mut fixed: Vec<Option<f64>> =
            network.nodes().iter().map(|n| n.ground.then_some(0.0)).collect();
        for (&node, &pressure) in &conditions.pressures {
            let slot = fixed.get_mut(node.0).ok_or(SolverError::UnknownNode(node))?;
            if slot.is_some() {
                return Err(SolverError::ConflictingBoundary { node });
            }
            if !pressure.is_finite() {
                return Err(SolverError::InvalidBoundary { node, value: pressure });
            }
            *slot = Some(pressure);
        }
        for (&node, &inflow) in &conditions.inflows {
            if node.0 >= node_count {
                return Err(SolverError::UnknownNode(node));
            }
            if !inflow.is_finite() {
                return Err(SolverError::InvalidBoundary { node, value: inflow });
            }
        }
        for link in &conditions.links {
            for node in [link.a, link.b] {
                if node.0 >= node_count {
                    return Err(SolverError::UnknownNode(node));
                }
            }
            if !(link.resistance.is_finite() && link.resistance > 0.0) {
                return Err(SolverError::InvalidBoundary { node: link.a, value: link.resistance });
            }
        }

        let conductances = network
            .channels()
            .iter()
            .map(|c| match c.resistance() {
                None => Err(SolverError::MissingResistance { channel: c.id }),
                Some(r) if !(r.is_finite() && r > 0.0) => {
                    Err(SolverError::InvalidResistance { channel: c.id, value: r })
                }
                Some(r) => Ok(1.0 / r),
            })
            .collect::<SolverResult<Vec<f64>>>()?;

        check_determinacy(network, conditions, &fixed)?;

        let mut free_count = 0;
        let vars: Vec<NodeVar> = fixed
            .iter()
            .map(|f| match f {
                Some(p) => NodeVar::Fixed(*p),
                None => {
                    free_count += 1;
                    NodeVar::Free(free_count - 1)
                }
            })
            .collect();
        let pressure_pumps: Vec<PumpId> =
            network.pumps().iter().filter(|p| p.pressure().is_some()).map(|p| p.id).collect();
        let n = free_count + pressure_pumps.len();

        debug!(
            unknowns = n,
            free_nodes = free_count,
            pressure_pumps = pressure_pumps.len(),
            "solving nodal system"
        );

        let mut a = DMatrix::<f64>::zeros(n, n);
        let mut b = DVector::<f64>::zeros(n);

        for (channel, g) in network.channels().iter().zip(&conductances) {
            stamp_conductance(&mut a, &mut b, vars[channel.node_a.0], vars[channel.node_b.0], *g);
        }
        for link in &conditions.links {
            stamp_conductance(&mut a, &mut b, vars[link.a.0], vars[link.b.0], 1.0 / link.resistance);
        }
        for (&node, &inflow) in &conditions.inflows {
            if let NodeVar::Free(r) = vars[node.0] {
                b[r] += inflow;
            }
        }
        let mut pressure_pump_row = free_count;
        for pump in network.pumps() {
            let (va, vb) = (vars[pump.node_a.0], vars[pump.node_b.0]);
            match pump.kind {
                PumpKind::FlowRate(q) => {
                    if let NodeVar::Free(r) = va {
                        b[r] -= q;
                    }
                    if let NodeVar::Free(r) = vb {
                        b[r] += q;
                    }
                }
                PumpKind::Pressure(dp) => {
                    let m = pressure_pump_row;
                    pressure_pump_row += 1;
                    b[m] = dp;
                    match va {
                        NodeVar::Free(r) => {
                            a[(r, m)] += 1.0;
                            a[(m, r)] -= 1.0;
                        }
                        NodeVar::Fixed(p) => b[m] += p,
                    }
                    match vb {
                        NodeVar::Free(r) => {
                            a[(r, m)] -= 1.0;
                            a[(m, r)] += 1.0;
                        }
                        NodeVar::Fixed(p) => b[m] -= p,
                    }
                }
            }
        }

        let x = if n == 0 {
            DVector::zeros(0)
        } else {
            let free_nodes = || -> Vec<NodeId> {
                vars.iter()
                    .enumerate()
                    .filter(|(_, v)| matches!(v, NodeVar::Free(_)))
                    .map(|(i, _)| NodeId(i))
                    .collect()
            };
            let x = match a.clone().lu().solve(&b) {
                Some(sol) => sol,
                None => return Err(SolverError::SingularSystem { nodes: free_nodes() }),
            };
            let residual = (&a * &x - &b).amax();
            let scale = a.amax() * x.amax() + b.amax();
            if !x.iter().all(|v| v.is_finite())
                || residual > self.config.residual_tolerance * scale
            {
                return Err(SolverError::SingularSystem { nodes: free_nodes() });
            }
            x
        };

        let pressures: Vec<f64> = vars.iter().map(|v| v.value(&x)).collect();
        let mut boundary_flows = vec![0.0; node_count];

        let channel_flows: Vec<f64> = network
            .channels()
            .iter()
            .zip(&conductances)
            .map(|(c, g)| {
                let q = (pressures[c.node_a.0] - pressures[c.node_b.0]) * g;
                boundary_flows[c.node_a.0] -= q;
                boundary_flows[c.node_b.0] += q;
                q
            })
            .collect();

        let mut pressure_pump_row = free_count;
        let pump_flows: Vec<f64> = network
            .pumps()
            .iter()
            .map(|p| {
                let q = match p.kind {
                    PumpKind::FlowRate(q) => q,
                    PumpKind::Pressure(_) => {
                        pressure_pump_row += 1;
                        x[pressure_pump_row - 1]
                    }
                };
                boundary_flows[p.node_a.0] -= q;
                boundary_flows[p.node_b.0] += q;
                q
            })
            .collect();

        let link_flows = conditions
            .links
            .iter()
            .map(|l| (pressures[l.a.0] - pressures[l.b.0]) / l.resistance)
            .collect();

        let boundary_nodes = (0..node_count)
            .map(NodeId)
            .filter(|&node| fixed[node.0].is_some() || conditions.touches(node))
            .collect();

        Ok(FlowState { pressures, channel_flows, pump_flows, boundary_flows, link_flows, boundary_nodes })
    }
}

fn stamp_conductance(a: &mut DMatrix<f64>, b: &mut DVector<f64>, va: NodeVar, vb: NodeVar, g: f64) {
    match (va, vb) {
        (NodeVar::Free(i), NodeVar::Free(j)) => {
            a[(i, i)] += g;
            a[(j, j)] += g;
            a[(i, j)] -= g;
            a[(j, i)] -= g;
        }
        (NodeVar::Free(i), NodeVar::Fixed(p)) | (NodeVar::Fixed(p), NodeVar::Free(i)) => {
            a[(i, i)] += g;
            b[i] += g * p;
        }
        (NodeVar::Fixed(_), NodeVar::Fixed(_)) => {}
    }
}

/// Rejects systems whose pressures are structurally undetermined.
///
/// Pressure is transmitted by channels, virtual links and pressure pumps.
/// Every set of nodes joined by these must contain a fixed pressure, and
/// pressure pumps must not close a loop (directly or through fixed nodes).
fn check_determinacy(
    network: &Network,
    conditions: &BoundaryConditions,
    fixed: &[Option<f64>],
) -> SolverResult<()> {
    let node_count = network.node_count();
    let component_of = |sets: &mut DisjointSet, root: usize| -> Vec<NodeId> {
        (0..node_count).filter(|&i| sets.find(i) == root).map(NodeId).collect()
    };

    // Fixed nodes all hang off a virtual reference at index `node_count`
    let reference = node_count;
    let mut pumps = DisjointSet::new(node_count + 1);
    for (i, f) in fixed.iter().enumerate() {
        if f.is_some() {
            pumps.union(i, reference);
        }
    }
    for pump in network.pumps().iter().filter(|p| p.pressure().is_some()) {
        if !pumps.union(pump.node_a.0, pump.node_b.0) {
            let root = pumps.find(pump.node_a.0);
            return Err(SolverError::SingularSystem { nodes: component_of(&mut pumps, root) });
        }
    }

    let mut sets = DisjointSet::new(node_count);
    for c in network.channels() {
        sets.union(c.node_a.0, c.node_b.0);
    }
    for l in &conditions.links {
        sets.union(l.a.0, l.b.0);
    }
    for p in network.pumps().iter().filter(|p| p.pressure().is_some()) {
        sets.union(p.node_a.0, p.node_b.0);
    }
    let mut anchored = vec![false; node_count];
    for (i, f) in fixed.iter().enumerate() {
        if f.is_some() {
            let root = sets.find(i);
            anchored[root] = true;
        }
    }
    for i in 0..node_count {
        let root = sets.find(i);
        if !anchored[root] {
            return Err(SolverError::SingularSystem { nodes: component_of(&mut sets, root) });
        }
    }
    Ok(())
}
