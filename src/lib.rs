//! # Microflow: Abstract and Hybrid Simulation of Microfluidic Networks
//!
//! Microflow models a microfluidic device as an electrical-analog network:
//! channels are resistors, pumps are sources and pressures play the role of
//! voltages. Selected regions ("modules") can be handed to a CFD simulator,
//! in which case the abstract solve and the CFD solves are coupled by a
//! relaxed fixed-point iteration until the values exchanged at the module
//! openings agree.
//!
//! On top of each finalized flow field the crate transports discrete
//! droplets (with splitting at bifurcations and merging) and dissolved
//! species (advected concentration fronts mixed at junctions).
//!
//! ## Example
//!
//! ```
//! use microflow::{Network, ChannelGeometry};
//! use microflow::solvers::{BoundaryConditions, NodalSolver};
//!
//! let mut network = Network::new();
//! let ground = network.add_node([0.0, 0.0], true);
//! let inlet = network.add_node([0.0, 1e-3], false);
//! let outlet = network.add_node([1e-3, 1e-3], true);
//!
//! network.add_pressure_pump(ground, inlet, 1e3).unwrap();
//! network
//!     .add_channel_with_resistance(inlet, outlet, ChannelGeometry::rectangular(1e-4, 1e-4, 1e-3), 1e12)
//!     .unwrap();
//! network.valid().unwrap();
//!
//! let state = NodalSolver::default().solve(&network, &BoundaryConditions::new()).unwrap();
//! assert!((state.pressure(inlet) - 1e3).abs() < 1e-9);
//! assert!((state.channel_flows[0] - 1e-9).abs() < 1e-21);
//! ```
//!
//! Solving before the network was validated is rejected:
//!
//! ```
//! use microflow::Network;
//! use microflow::solvers::{BoundaryConditions, NodalSolver, SolverError};
//!
//! let mut network = Network::new();
//! network.add_node([0.0, 0.0], true);
//! let result = NodalSolver::default().solve(&network, &BoundaryConditions::new());
//! assert!(matches!(result, Err(SolverError::NotReady)));
//! ```
//!
//! ## Optional Features
//!
//! - **`parallel`**: advance independent CFD modules concurrently using `rayon`
//! - **`thermodynamics`**: derive fluid density and viscosity from CoolProp using `rfluids`
//!
//! ```toml
//! [dependencies]
//! microflow = { version = "0.1", features = ["parallel"] }
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

// Core modules
pub mod fluid;
pub mod models;
pub mod results;
pub mod solvers;
pub mod transport;

// Optional feature modules
#[cfg(feature = "thermodynamics")]
pub mod thermodynamics;

pub use fluid::{Fluid, FluidId, FluidRegistry};
pub use models::{
    Channel, ChannelGeometry, CrossSection, Module, Opening, OpeningDrive, Pump, PumpKind,
};

// Graph Layer: Network and Topology
///
/// Unique identifier for a node of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// Unique identifier for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub usize);

/// Unique identifier for a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PumpId(pub usize);

/// Unique identifier for a CFD module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModuleId(pub usize);

macro_rules! impl_index {
    ($($id:ty),*) => {
        $(impl $id {
            /// Gets the index value.
            pub fn index(&self) -> usize {
                self.0
            }
        })*
    };
}

impl_index!(NodeId, ChannelId, PumpId, ModuleId);

/// Direction of flow in a channel relative to its endpoint order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowDirection {
    /// Flow from `node_a` to `node_b`
    Forward,
    /// Flow from `node_b` to `node_a`
    Reverse,
    /// No flow
    Stagnant,
}

impl FlowDirection {
    /// Direction of a signed flow rate.
    pub fn from_flow_rate(flow_rate: f64) -> Self {
        if flow_rate > 0.0 {
            FlowDirection::Forward
        } else if flow_rate < 0.0 {
            FlowDirection::Reverse
        } else {
            FlowDirection::Stagnant
        }
    }
}

/// A node of the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier
    pub id: NodeId,
    /// Position in the device plane [m]
    pub position: [f64; 2],
    /// Pressure reference: held at 0 Pa
    pub ground: bool,
    /// Droplets reaching this node leave the device
    pub sink: bool,
}

/// An edge of the network: a channel or a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Edge {
    /// Resistive channel
    Channel(ChannelId),
    /// Pump
    Pump(PumpId),
}

/// One entry of a node's adjacency list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    /// Edge leaving the node
    pub edge: Edge,
    /// Node at the other end of the edge
    pub neighbour: NodeId,
}

/// Result type for graph construction and validation.
pub type TopologyResult<T> = Result<T, TopologyError>;

/// Errors raised while building or validating a network.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TopologyError {
    #[error("Unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("Unknown channel {0:?}")]
    UnknownChannel(ChannelId),
    #[error("Unknown pump {0:?}")]
    UnknownPump(PumpId),
    #[error("Unknown module {0:?}")]
    UnknownModule(ModuleId),
    #[error("Edge would connect node {0:?} to itself")]
    SelfLoop(NodeId),
    #[error("Invalid geometry for channel between {a:?} and {b:?}")]
    InvalidGeometry { a: NodeId, b: NodeId },
    #[error("Invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: f64 },
    #[error("Conflicting pumps {first:?} and {second:?} between {a:?} and {b:?}")]
    ConflictingPumps { first: PumpId, second: PumpId, a: NodeId, b: NodeId },
    #[error("Module {0:?} has no openings")]
    EmptyModule(ModuleId),
    #[error("Invalid opening at node {0:?}")]
    InvalidOpening(NodeId),
    #[error("Node {node:?} is already an opening of module {module:?}")]
    OpeningInUse { node: NodeId, module: ModuleId },
    #[error("Network has no nodes")]
    Empty,
    #[error("Network has no ground node")]
    NoGround,
    #[error("Network is disconnected: nodes {nodes:?} are unreachable from ground")]
    Disconnected { nodes: Vec<NodeId> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopologyStatus {
    Modified,
    Sorted,
    Valid,
}

/// The abstract network: nodes, channels, pumps and CFD modules.
///
/// Entities live in arenas indexed by their ids; edges store node ids rather
/// than references. Any structural change resets the network to an unsorted
/// state, and [`Network::valid`] must succeed again before solving.
///
/// # Examples
///
/// ```
/// use microflow::{Network, ChannelGeometry, TopologyError};
///
/// let mut network = Network::new();
/// let a = network.add_node([0.0, 0.0], false);
/// let b = network.add_node([1e-3, 0.0], false);
/// network.add_channel(a, b, ChannelGeometry::rectangular(1e-4, 1e-4, 1e-3)).unwrap();
///
/// // A network needs a pressure reference
/// assert_eq!(network.valid(), Err(TopologyError::NoGround));
/// ```
#[derive(Debug, Clone)]
pub struct Network {
    nodes: Vec<Node>,
    channels: Vec<Channel>,
    pumps: Vec<Pump>,
    modules: Vec<Module>,
    /// Adjacency lists, built by `sort`
    links: Vec<Vec<Link>>,
    /// Components connected by channels and pumps, built by `sort`
    groups: Vec<Vec<NodeId>>,
    status: TopologyStatus,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    /// Creates an empty network.
    pub fn new() -> Self {
        Network {
            nodes: Vec::new(),
            channels: Vec::new(),
            pumps: Vec::new(),
            modules: Vec::new(),
            links: Vec::new(),
            groups: Vec::new(),
            status: TopologyStatus::Modified,
        }
    }

    fn touch(&mut self) {
        self.status = TopologyStatus::Modified;
    }

    fn check_node(&self, node: NodeId) -> TopologyResult<()> {
        if node.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(TopologyError::UnknownNode(node))
        }
    }

    /// Adds a node at `position`; ground nodes are held at 0 Pa.
    pub fn add_node(&mut self, position: [f64; 2], ground: bool) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node { id, position, ground, sink: false });
        self.touch();
        id
    }

    /// Marks or unmarks `node` as a pressure reference.
    pub fn set_ground(&mut self, node: NodeId, ground: bool) -> TopologyResult<()> {
        self.check_node(node)?;
        self.nodes[node.0].ground = ground;
        self.touch();
        Ok(())
    }

    /// Marks or unmarks `node` as a droplet sink.
    pub fn set_sink(&mut self, node: NodeId, sink: bool) -> TopologyResult<()> {
        self.check_node(node)?;
        self.nodes[node.0].sink = sink;
        Ok(())
    }

    fn check_edge(&self, a: NodeId, b: NodeId) -> TopologyResult<()> {
        self.check_node(a)?;
        self.check_node(b)?;
        if a == b {
            return Err(TopologyError::SelfLoop(a));
        }
        Ok(())
    }

    /// Adds a channel whose resistance will come from the resistance model.
    pub fn add_channel(
        &mut self,
        a: NodeId,
        b: NodeId,
        geometry: ChannelGeometry,
    ) -> TopologyResult<ChannelId> {
        self.push_channel(a, b, geometry, None)
    }

    /// Adds a channel with a fixed resistance [Pa*s/m^3].
    ///
    /// The geometry is still used for transport (volume, velocity).
    pub fn add_channel_with_resistance(
        &mut self,
        a: NodeId,
        b: NodeId,
        geometry: ChannelGeometry,
        resistance: f64,
    ) -> TopologyResult<ChannelId> {
        if !(resistance.is_finite() && resistance > 0.0) {
            return Err(TopologyError::InvalidValue { what: "resistance", value: resistance });
        }
        self.push_channel(a, b, geometry, Some(resistance))
    }

    fn push_channel(
        &mut self,
        a: NodeId,
        b: NodeId,
        geometry: ChannelGeometry,
        fixed_resistance: Option<f64>,
    ) -> TopologyResult<ChannelId> {
        self.check_edge(a, b)?;
        if !geometry.is_valid() {
            return Err(TopologyError::InvalidGeometry { a, b });
        }
        let id = ChannelId(self.channels.len());
        let channel = Channel::new(id, a, b, geometry);
        self.channels.push(match fixed_resistance {
            Some(r) => channel.with_fixed_resistance(r),
            None => channel,
        });
        self.touch();
        Ok(id)
    }

    /// Adds a pressure pump raising the pressure from `a` to `b` by `pressure` [Pa].
    pub fn add_pressure_pump(&mut self, a: NodeId, b: NodeId, pressure: f64) -> TopologyResult<PumpId> {
        self.add_pump(a, b, PumpKind::Pressure(pressure))
    }

    /// Adds a flow-rate pump moving `flow_rate` [m^3/s] from `a` to `b`.
    pub fn add_flow_rate_pump(&mut self, a: NodeId, b: NodeId, flow_rate: f64) -> TopologyResult<PumpId> {
        self.add_pump(a, b, PumpKind::FlowRate(flow_rate))
    }

    /// Adds a pump. At most one pump may join any pair of nodes.
    pub fn add_pump(&mut self, a: NodeId, b: NodeId, kind: PumpKind) -> TopologyResult<PumpId> {
        self.check_edge(a, b)?;
        check_pump_value(kind)?;
        let id = PumpId(self.pumps.len());
        if let Some(existing) = self.pumps.iter().find(|p| p.joins(a, b)) {
            return Err(TopologyError::ConflictingPumps { first: existing.id, second: id, a, b });
        }
        self.pumps.push(Pump::new(id, a, b, kind));
        self.touch();
        Ok(id)
    }

    /// Adds a CFD module bound to the network through `openings`.
    ///
    /// Every opening must sit on an existing node that is not already an
    /// opening of another module.
    pub fn add_module(
        &mut self,
        position: [f64; 2],
        size: [f64; 2],
        geometry: impl Into<String>,
        openings: Vec<Opening>,
    ) -> TopologyResult<ModuleId> {
        let id = ModuleId(self.modules.len());
        if openings.is_empty() {
            return Err(TopologyError::EmptyModule(id));
        }
        if !(size[0] > 0.0 && size[1] > 0.0) {
            return Err(TopologyError::InvalidValue { what: "module size", value: size[0].min(size[1]) });
        }
        for (i, opening) in openings.iter().enumerate() {
            self.check_node(opening.node)?;
            if !opening.is_valid() || openings[..i].iter().any(|o| o.node == opening.node) {
                return Err(TopologyError::InvalidOpening(opening.node));
            }
            if let Some((module, _)) = self.module_at(opening.node) {
                return Err(TopologyError::OpeningInUse { node: opening.node, module });
            }
        }
        self.modules.push(Module {
            id,
            position,
            size,
            geometry: geometry.into(),
            openings: openings.into_iter().map(Opening::normalized).collect(),
            internal_resistance: None,
        });
        self.touch();
        Ok(id)
    }

    /// Sets the resistance used to connect the openings of `module` pairwise
    /// for the first abstract solve.
    pub fn set_internal_resistance(&mut self, module: ModuleId, resistance: f64) -> TopologyResult<()> {
        if !(resistance.is_finite() && resistance > 0.0) {
            return Err(TopologyError::InvalidValue { what: "internal resistance", value: resistance });
        }
        let module = self.modules.get_mut(module.0).ok_or(TopologyError::UnknownModule(module))?;
        module.internal_resistance = Some(resistance);
        Ok(())
    }

    /// Replaces a channel's geometry; its cached resistance is dropped.
    pub fn set_channel_geometry(&mut self, channel: ChannelId, geometry: ChannelGeometry) -> TopologyResult<()> {
        let c = self.channels.get_mut(channel.0).ok_or(TopologyError::UnknownChannel(channel))?;
        if !geometry.is_valid() {
            return Err(TopologyError::InvalidGeometry { a: c.node_a, b: c.node_b });
        }
        c.set_geometry(geometry);
        Ok(())
    }

    /// Changes what a pump holds fixed.
    pub fn set_pump(&mut self, pump: PumpId, kind: PumpKind) -> TopologyResult<()> {
        check_pump_value(kind)?;
        let p = self.pumps.get_mut(pump.0).ok_or(TopologyError::UnknownPump(pump))?;
        let regrouped = std::mem::discriminant(&p.kind) != std::mem::discriminant(&kind);
        p.kind = kind;
        // Pressure groups depend on which pumps fix a pressure difference
        if regrouped && self.status == TopologyStatus::Valid {
            self.status = TopologyStatus::Sorted;
        }
        Ok(())
    }

    /// Gets a node by id.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Gets a channel by id.
    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id.0)
    }

    /// Gets a pump by id.
    pub fn pump(&self, id: PumpId) -> Option<&Pump> {
        self.pumps.get(id.0)
    }

    /// Gets a module by id.
    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(id.0)
    }

    /// All nodes, indexed by id.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All channels, indexed by id.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// All pumps, indexed by id.
    pub fn pumps(&self) -> &[Pump] {
        &self.pumps
    }

    /// All modules, indexed by id.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// Gets the number of nodes.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Gets the number of channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Gets the number of pumps.
    pub fn pump_count(&self) -> usize {
        self.pumps.len()
    }

    /// Gets the number of modules.
    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Module and opening index bound to `node`, if any.
    pub fn module_at(&self, node: NodeId) -> Option<(ModuleId, usize)> {
        self.modules.iter().find_map(|m| m.opening_index(node).map(|i| (m.id, i)))
    }

    /// Adjacency list of `node`. Empty until the network is sorted.
    pub fn links(&self, node: NodeId) -> &[Link] {
        self.links.get(node.0).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Groups of nodes connected through channels and pumps alone, i.e. with
    /// modules cut out. Empty until the network is sorted.
    pub fn groups(&self) -> &[Vec<NodeId>] {
        &self.groups
    }

    /// Evaluates every stale channel resistance with `model`.
    ///
    /// Returns the number of channels whose resistance was recomputed.
    pub fn update_resistances(&mut self, model: &dyn models::ResistanceModel, viscosity: f64) -> usize {
        self.channels
            .iter_mut()
            .map(|c| c.update_resistance(model, viscosity))
            .filter(|updated| *updated)
            .count()
    }

    /// Drops all cached resistances.
    pub fn invalidate_resistances(&mut self) {
        self.channels.iter_mut().for_each(Channel::invalidate_resistance);
    }

    /// True once `sort` has run since the last structural change.
    pub fn is_sorted(&self) -> bool {
        self.status != TopologyStatus::Modified
    }

    /// True once `valid` has succeeded since the last structural change.
    pub fn is_ready(&self) -> bool {
        self.status == TopologyStatus::Valid
    }

    /// Builds the adjacency lists and channel/pump groups.
    ///
    /// Edges are listed in id order (channels first, then pumps), so the
    /// resulting ordering, and every linear system built from it, is
    /// deterministic.
    pub fn sort(&mut self) -> TopologyResult<()> {
        let node_count = self.nodes.len();
        let mut links: Vec<Vec<Link>> = vec![Vec::new(); node_count];

        let edges = self
            .channels
            .iter()
            .map(|c| (Edge::Channel(c.id), c.node_a, c.node_b))
            .chain(self.pumps.iter().map(|p| (Edge::Pump(p.id), p.node_a, p.node_b)));
        for (edge, a, b) in edges {
            self.check_node(a)?;
            self.check_node(b)?;
            links[a.0].push(Link { edge, neighbour: b });
            links[b.0].push(Link { edge, neighbour: a });
        }
        for module in &self.modules {
            for opening in &module.openings {
                self.check_node(opening.node)?;
            }
        }

        let mut groups = Vec::new();
        let mut seen = vec![false; node_count];
        for start in 0..node_count {
            if seen[start] {
                continue;
            }
            seen[start] = true;
            let mut group = Vec::new();
            let mut queue = VecDeque::from([start]);
            while let Some(n) = queue.pop_front() {
                group.push(NodeId(n));
                for link in &links[n] {
                    if !seen[link.neighbour.0] {
                        seen[link.neighbour.0] = true;
                        queue.push_back(link.neighbour.0);
                    }
                }
            }
            group.sort();
            groups.push(group);
        }

        self.links = links;
        self.groups = groups;
        self.status = TopologyStatus::Sorted;
        Ok(())
    }

    /// Validates the network, sorting it first if needed.
    ///
    /// Checks that:
    /// - the network has at least one node and one ground node
    /// - no two pumps join the same pair of nodes
    /// - every node is reachable from a ground node through channels, pumps
    ///   or modules
    pub fn valid(&mut self) -> TopologyResult<()> {
        if !self.is_sorted() {
            self.sort()?;
        }
        if self.nodes.is_empty() {
            return Err(TopologyError::Empty);
        }
        if !self.nodes.iter().any(|n| n.ground) {
            return Err(TopologyError::NoGround);
        }
        for (i, first) in self.pumps.iter().enumerate() {
            if let Some(second) = self.pumps[i + 1..].iter().find(|p| p.joins(first.node_a, first.node_b)) {
                return Err(TopologyError::ConflictingPumps {
                    first: first.id,
                    second: second.id,
                    a: first.node_a,
                    b: first.node_b,
                });
            }
        }

        let mut reached = vec![false; self.nodes.len()];
        let mut queue: VecDeque<usize> =
            self.nodes.iter().filter(|n| n.ground).map(|n| n.id.0).collect();
        for &n in &queue {
            reached[n] = true;
        }
        while let Some(n) = queue.pop_front() {
            let via_edges = self.links[n].iter().map(|l| l.neighbour);
            let via_module = self
                .module_at(NodeId(n))
                .map(|(m, _)| self.modules[m.0].openings.iter().map(|o| o.node).collect::<Vec<_>>())
                .unwrap_or_default();
            for next in via_edges.chain(via_module) {
                if !reached[next.0] {
                    reached[next.0] = true;
                    queue.push_back(next.0);
                }
            }
        }
        let unreached: Vec<NodeId> =
            reached.iter().enumerate().filter(|(_, r)| !**r).map(|(i, _)| NodeId(i)).collect();
        if !unreached.is_empty() {
            return Err(TopologyError::Disconnected { nodes: unreached });
        }
        self.anchor_floating_groups();

        self.status = TopologyStatus::Valid;
        debug!(
            nodes = self.nodes.len(),
            channels = self.channels.len(),
            pumps = self.pumps.len(),
            modules = self.modules.len(),
            groups = self.groups.len(),
            "network validated"
        );
        Ok(())
    }

    /// Gives every pressure group a pressure reference.
    ///
    /// Pressure propagates along channels and pressure pumps only. A group
    /// of such edges that holds no ground node and no flow-driven opening
    /// reaches the rest of the network through modules alone, so its level
    /// is undetermined. Its first opening is switched to
    /// [`OpeningDrive::FlowRate`] and takes its pressure from the module.
    fn anchor_floating_groups(&mut self) {
        let mut seen = vec![false; self.nodes.len()];
        for start in 0..self.nodes.len() {
            if seen[start] {
                continue;
            }
            seen[start] = true;
            let mut group = vec![NodeId(start)];
            let mut queue = VecDeque::from([start]);
            while let Some(n) = queue.pop_front() {
                for link in &self.links[n] {
                    let fixes_pressure = match link.edge {
                        Edge::Channel(_) => true,
                        Edge::Pump(p) => self.pumps[p.0].pressure().is_some(),
                    };
                    if fixes_pressure && !seen[link.neighbour.0] {
                        seen[link.neighbour.0] = true;
                        group.push(link.neighbour);
                        queue.push_back(link.neighbour.0);
                    }
                }
            }

            let anchored = group.iter().any(|n| {
                self.nodes[n.0].ground
                    || self.module_at(*n).is_some_and(|(m, i)| {
                        self.modules[m.0].openings[i].drive == OpeningDrive::FlowRate
                    })
            });
            if anchored {
                continue;
            }
            let opening = self.modules.iter().find_map(|module| {
                module
                    .openings
                    .iter()
                    .position(|o| group.contains(&o.node))
                    .map(|i| (module.id, i))
            });
            if let Some((module, i)) = opening {
                let opening = &mut self.modules[module.0].openings[i];
                opening.drive = OpeningDrive::FlowRate;
                debug!(module = module.0, node = opening.node.0, "opening anchors a floating pressure group");
            }
        }
    }
}

fn check_pump_value(kind: PumpKind) -> TopologyResult<()> {
    match kind {
        PumpKind::Pressure(p) if !p.is_finite() => {
            Err(TopologyError::InvalidValue { what: "pump pressure", value: p })
        }
        PumpKind::FlowRate(q) if !q.is_finite() => {
            Err(TopologyError::InvalidValue { what: "pump flow rate", value: q })
        }
        _ => Ok(()),
    }
}
