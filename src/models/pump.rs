//! Pumps: the sources of the abstract network.

use serde::{Deserialize, Serialize};

use crate::{NodeId, PumpId};

/// What a pump holds fixed between its two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PumpKind {
    /// Pressure rise from `node_a` to `node_b` [Pa]: `p_b - p_a = value`
    Pressure(f64),
    /// Volumetric flow from `node_a` to `node_b` [m^3/s]
    FlowRate(f64),
}

/// A pressure or flow-rate pump between two nodes.
///
/// # Examples
///
/// ```
/// use microflow::{Network, PumpKind};
///
/// let mut network = Network::new();
/// let inlet = network.add_node([0.0, 0.0], true);
/// let node = network.add_node([1e-3, 0.0], false);
/// let pump = network.add_pressure_pump(inlet, node, 1e3).unwrap();
/// assert_eq!(network.pump(pump).unwrap().kind, PumpKind::Pressure(1e3));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pump {
    /// Unique identifier
    pub id: PumpId,
    /// Suction side
    pub node_a: NodeId,
    /// Discharge side
    pub node_b: NodeId,
    /// Fixed quantity
    pub kind: PumpKind,
}

impl Pump {
    pub(crate) fn new(id: PumpId, node_a: NodeId, node_b: NodeId, kind: PumpKind) -> Self {
        Pump { id, node_a, node_b, kind }
    }

    /// True if the pump joins the unordered node pair `(a, b)`.
    pub fn joins(&self, a: NodeId, b: NodeId) -> bool {
        (self.node_a == a && self.node_b == b) || (self.node_a == b && self.node_b == a)
    }

    /// Fixed pressure rise, for pressure pumps.
    pub fn pressure(&self) -> Option<f64> {
        match self.kind {
            PumpKind::Pressure(p) => Some(p),
            PumpKind::FlowRate(_) => None,
        }
    }

    /// Fixed flow rate, for flow-rate pumps.
    pub fn flow_rate(&self) -> Option<f64> {
        match self.kind {
            PumpKind::FlowRate(q) => Some(q),
            PumpKind::Pressure(_) => None,
        }
    }
}
