//! CFD modules and their openings.
//!
//! A module is a region of the device that is resolved by a CFD simulator
//! rather than by the resistive analog. The abstract network only sees the
//! module's openings: boundary nodes where fluid crosses between the two
//! models.

use serde::{Deserialize, Serialize};

use crate::{ModuleId, NodeId};

/// Which quantity the abstract network imposes on the CFD side of an opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OpeningDrive {
    /// The module receives the opening pressure and answers with a flow rate
    #[default]
    Pressure,
    /// The module receives the flow rate and answers with a pressure
    FlowRate,
}

/// A boundary point where a module meets the abstract network.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Opening {
    /// Network node the opening is bound to
    pub node: NodeId,
    /// Outward unit normal in the device plane
    pub normal: [f64; 2],
    /// Opening width [m]
    pub width: f64,
    /// Opening height [m]
    pub height: f64,
    /// Boundary condition imposed on the CFD side
    pub drive: OpeningDrive,
}

impl Opening {
    /// Pressure-driven opening with the given normal and cross-section.
    pub fn new(node: NodeId, normal: [f64; 2], width: f64, height: f64) -> Self {
        Opening { node, normal, width, height, drive: OpeningDrive::Pressure }
    }

    /// Sets the drive.
    pub fn with_drive(mut self, drive: OpeningDrive) -> Self {
        self.drive = drive;
        self
    }

    /// Cross-sectional area [m^2].
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    pub(crate) fn is_valid(&self) -> bool {
        let norm = (self.normal[0] * self.normal[0] + self.normal[1] * self.normal[1]).sqrt();
        norm.is_finite() && norm > 0.0 && self.area().is_finite() && self.area() > 0.0
    }

    pub(crate) fn normalized(mut self) -> Self {
        let norm = (self.normal[0] * self.normal[0] + self.normal[1] * self.normal[1]).sqrt();
        self.normal = [self.normal[0] / norm, self.normal[1] / norm];
        self
    }
}

/// A CFD-resolved region of the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Unique identifier
    pub id: ModuleId,
    /// Lower-left corner of the bounding box [m]
    pub position: [f64; 2],
    /// Bounding box extent [m]
    pub size: [f64; 2],
    /// Opaque reference to the interior geometry (e.g. an STL file)
    pub geometry: String,
    /// Ordered openings
    pub openings: Vec<Opening>,
    /// Resistance between each pair of openings used to seed the very first
    /// abstract solve
    pub internal_resistance: Option<f64>,
}

impl Module {
    /// Index of the opening bound to `node`.
    pub fn opening_index(&self, node: NodeId) -> Option<usize> {
        self.openings.iter().position(|o| o.node == node)
    }

    /// True if the bounding box contains `point`.
    pub fn contains(&self, point: [f64; 2]) -> bool {
        point[0] >= self.position[0]
            && point[0] <= self.position[0] + self.size[0]
            && point[1] >= self.position[1]
            && point[1] <= self.position[1] + self.size[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opening_area_and_normal() {
        let opening = Opening::new(NodeId(0), [3.0, 4.0], 1e-4, 5e-5);
        assert!(opening.is_valid());
        assert!((opening.area() - 5e-9).abs() < 1e-20);

        let n = opening.normalized().normal;
        assert!((n[0] - 0.6).abs() < 1e-12);
        assert!((n[1] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_opening_is_invalid() {
        assert!(!Opening::new(NodeId(0), [0.0, 0.0], 1e-4, 1e-4).is_valid());
        assert!(!Opening::new(NodeId(0), [1.0, 0.0], 0.0, 1e-4).is_valid());
    }

    #[test]
    fn test_module_bounding_box() {
        let module = Module {
            id: ModuleId(0),
            position: [1e-3, 0.0],
            size: [1e-3, 1e-3],
            geometry: "cross.stl".to_string(),
            openings: vec![Opening::new(NodeId(1), [-1.0, 0.0], 1e-4, 1e-4)],
            internal_resistance: None,
        };
        assert!(module.contains([1.5e-3, 0.5e-3]));
        assert!(!module.contains([0.5e-3, 0.5e-3]));
        assert_eq!(module.opening_index(NodeId(1)), Some(0));
        assert_eq!(module.opening_index(NodeId(2)), None);
    }
}
