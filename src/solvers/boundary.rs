//! Module boundary adapter.
//!
//! Translates between the abstract flow state at a module's openings and the
//! boundary values exchanged with its CFD simulator. Sign convention: flow
//! rates at openings are positive *into the module*.
//!
//! An opening's [`OpeningDrive`] decides what crosses in each direction:
//!
//! | Drive | abstract → CFD | CFD → abstract override |
//! |---|---|---|
//! | `Pressure` | opening pressure | flow rate, applied as a sink at the node |
//! | `FlowRate` | flow rate into the module | pressure, applied as a fixed node pressure |

use serde::{Deserialize, Serialize};

use super::{BoundaryConditions, FlowState};
use crate::{Module, ModuleId, NodeId, OpeningDrive};

/// Boundary values for the CFD side of one opening.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpeningBoundary {
    /// Network node of the opening
    pub node: NodeId,
    /// Which value the CFD side should impose
    pub drive: OpeningDrive,
    /// Abstract pressure at the opening [Pa]
    pub pressure: f64,
    /// Abstract flow rate into the module [m^3/s]
    pub flow_rate: f64,
    /// Opening cross-section [m^2]
    pub area: f64,
    /// Outward unit normal
    pub normal: [f64; 2],
}

impl OpeningBoundary {
    /// Mean velocity into the module [m/s].
    pub fn mean_velocity(&self) -> f64 {
        self.flow_rate / self.area
    }

    /// Mean velocity vector; points inward for flow into the module.
    pub fn velocity(&self) -> [f64; 2] {
        let v = self.mean_velocity();
        [-self.normal[0] * v, -self.normal[1] * v]
    }
}

/// Boundary values for every opening of one module, in opening order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleBoundary {
    /// Target module
    pub module: ModuleId,
    /// Number of CFD sub-steps to advance before answering
    pub substeps: usize,
    /// Per-opening values
    pub openings: Vec<OpeningBoundary>,
}

/// CFD answer at one opening.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpeningResponse {
    /// Pressure at the opening [Pa]
    pub pressure: f64,
    /// Flow rate into the module [m^3/s]
    pub flow_rate: f64,
}

/// Value imposed on the abstract network at one opening.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OpeningOverride {
    /// Network node of the opening
    pub node: NodeId,
    /// Drive of the opening; selects the meaning of `value`
    pub drive: OpeningDrive,
    /// Flow rate into the module for `Pressure` drive, pressure for `FlowRate` drive
    pub value: f64,
}

/// Overrides for all openings of one module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleOverrides {
    /// Source module
    pub module: ModuleId,
    /// Per-opening overrides, in opening order
    pub openings: Vec<OpeningOverride>,
}

impl ModuleOverrides {
    /// Zero overrides: no flow through pressure-driven openings and 0 Pa at
    /// flow-driven ones.
    pub fn zero(module: &Module) -> Self {
        ModuleOverrides {
            module: module.id,
            openings: module
                .openings
                .iter()
                .map(|o| OpeningOverride { node: o.node, drive: o.drive, value: 0.0 })
                .collect(),
        }
    }

    /// Picks, for each opening, the quantity the abstract side receives.
    pub fn from_responses(module: &Module, responses: &[OpeningResponse]) -> Self {
        ModuleOverrides {
            module: module.id,
            openings: module
                .openings
                .iter()
                .zip(responses)
                .map(|(o, r)| OpeningOverride {
                    node: o.node,
                    drive: o.drive,
                    value: match o.drive {
                        OpeningDrive::Pressure => r.flow_rate,
                        OpeningDrive::FlowRate => r.pressure,
                    },
                })
                .collect(),
        }
    }

    /// Current values seen by the abstract side: the flow into the module at
    /// pressure-driven openings and the pressure at flow-driven ones.
    pub fn from_boundary(boundary: &ModuleBoundary) -> Self {
        ModuleOverrides {
            module: boundary.module,
            openings: boundary
                .openings
                .iter()
                .map(|o| OpeningOverride {
                    node: o.node,
                    drive: o.drive,
                    value: match o.drive {
                        OpeningDrive::Pressure => o.flow_rate,
                        OpeningDrive::FlowRate => o.pressure,
                    },
                })
                .collect(),
        }
    }

    /// Under-relaxes towards `target`: `alpha * target + (1 - alpha) * self`.
    ///
    /// Pressure overrides use `alpha_pressure`, flow-rate overrides use
    /// `alpha_flow`.
    pub fn relax(&self, target: &ModuleOverrides, alpha_pressure: f64, alpha_flow: f64) -> Self {
        ModuleOverrides {
            module: self.module,
            openings: self
                .openings
                .iter()
                .zip(&target.openings)
                .map(|(prev, new)| {
                    let alpha = match new.drive {
                        OpeningDrive::Pressure => alpha_flow,
                        OpeningDrive::FlowRate => alpha_pressure,
                    };
                    OpeningOverride { value: alpha * new.value + (1.0 - alpha) * prev.value, ..*new }
                })
                .collect(),
        }
    }

    /// Largest relative change of any opening value with respect to `previous`.
    pub fn max_relative_change(&self, previous: &ModuleOverrides) -> f64 {
        self.openings
            .iter()
            .zip(&previous.openings)
            .map(|(new, old)| relative_change(new.value, old.value))
            .fold(0.0, f64::max)
    }
}

/// `|new - old| / max(|new|, |old|)`, zero when both vanish.
pub fn relative_change(new: f64, old: f64) -> f64 {
    let scale = new.abs().max(old.abs());
    if scale == 0.0 {
        0.0
    } else {
        (new - old).abs() / scale
    }
}

/// Reads the abstract flow state at the openings of `module`.
pub fn to_cfd(module: &Module, state: &FlowState, substeps: usize) -> ModuleBoundary {
    ModuleBoundary {
        module: module.id,
        substeps,
        openings: module
            .openings
            .iter()
            .map(|o| OpeningBoundary {
                node: o.node,
                drive: o.drive,
                pressure: state.pressure(o.node),
                flow_rate: state.boundary_flow(o.node),
                area: o.area(),
                normal: o.normal,
            })
            .collect(),
    }
}

/// Imposes module overrides on the next abstract solve.
pub fn apply(overrides: &ModuleOverrides, conditions: &mut BoundaryConditions) {
    for o in &overrides.openings {
        match o.drive {
            OpeningDrive::Pressure => conditions.add_inflow(o.node, -o.value),
            OpeningDrive::FlowRate => conditions.set_pressure(o.node, o.value),
        }
    }
}

/// Connects every pair of openings of `module` through its internal
/// resistance. Returns false if the module declares none.
pub fn seed(module: &Module, conditions: &mut BoundaryConditions) -> bool {
    let Some(resistance) = module.internal_resistance else {
        return false;
    };
    for (i, a) in module.openings.iter().enumerate() {
        for b in &module.openings[i + 1..] {
            conditions.add_link(a.node, b.node, resistance);
        }
    }
    true
}
