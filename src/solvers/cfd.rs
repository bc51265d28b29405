//! Interface to CFD module simulators.
//!
//! The coupling scheduler treats every module simulator as a black box that
//! receives a [`ModuleBoundary`], advances by the requested number of
//! sub-steps and answers with the pressure and flow rate at each opening.
//!
//! [`SurrogateModule`] is a deterministic reference simulator: a star of
//! resistors joining each opening to an internal node whose pressure relaxes
//! towards its steady value on every sub-step. It stands in for a real CFD
//! code in tests and in networks where a module's interior is known to be
//! linear.

use serde::{Deserialize, Serialize};

use super::boundary::{relative_change, ModuleBoundary, OpeningResponse};
use crate::{ModuleId, OpeningDrive};

/// Errors reported by a module simulator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ModuleSolverError {
    #[error("Module {module:?} diverged")]
    Diverged { module: ModuleId },
    #[error("Module {module:?} expected {expected} openings, got {got}")]
    BoundaryMismatch { module: ModuleId, expected: usize, got: usize },
    #[error("Module {module:?} has no pressure reference at any opening")]
    Underdetermined { module: ModuleId },
    #[error("Module {module:?} failed: {message}")]
    Failed { module: ModuleId, message: String },
}

/// Convergence state of a module simulator after one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModuleState {
    /// Sub-steps advanced so far
    pub steps: usize,
    /// Simulator-internal residual of the last sub-step
    pub residual: f64,
    /// True if the simulator considers itself converged
    pub converged: bool,
}

/// Answer of a module simulator to one boundary exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleResponse {
    /// Per-opening values, in opening order
    pub openings: Vec<OpeningResponse>,
    /// Internal state after the exchange
    pub state: ModuleState,
}

/// A CFD simulator attached to one module.
pub trait CfdSimulator: Send {
    /// Module this simulator resolves.
    fn module(&self) -> ModuleId;

    /// Imposes `boundary`, advances `boundary.substeps` sub-steps and reports
    /// the resulting opening values.
    fn advance(&mut self, boundary: &ModuleBoundary) -> Result<ModuleResponse, ModuleSolverError>;
}

const SURROGATE_TOLERANCE: f64 = 1e-12;

/// Star resistor model of a module interior.
///
/// Opening `k` is joined to a single internal node through resistance `r_k`.
/// Pressure-driven openings fix the pressure at their end of the star,
/// flow-driven openings inject their flow rate into the internal node.
///
/// # Examples
///
/// ```
/// use microflow::{ModuleId, NodeId, OpeningDrive};
/// use microflow::solvers::boundary::{ModuleBoundary, OpeningBoundary};
/// use microflow::solvers::cfd::{CfdSimulator, SurrogateModule};
///
/// let opening = |node, pressure| OpeningBoundary {
///     node: NodeId(node),
///     drive: OpeningDrive::Pressure,
///     pressure,
///     flow_rate: 0.0,
///     area: 1e-8,
///     normal: [1.0, 0.0],
/// };
/// let boundary = ModuleBoundary {
///     module: ModuleId(0),
///     substeps: 1,
///     openings: vec![opening(1, 100.0), opening(2, 0.0)],
/// };
///
/// let mut module = SurrogateModule::new(ModuleId(0), vec![1.0, 1.0]);
/// let response = module.advance(&boundary).unwrap();
/// assert!((response.openings[0].flow_rate - 50.0).abs() < 1e-12);
/// assert!((response.openings[1].flow_rate + 50.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SurrogateModule {
    module: ModuleId,
    resistances: Vec<f64>,
    relaxation_rate: f64,
    center: f64,
    steps: usize,
}

impl SurrogateModule {
    /// Creates a surrogate with one resistance per opening that reaches its
    /// steady state within a single sub-step.
    pub fn new(module: ModuleId, resistances: Vec<f64>) -> Self {
        SurrogateModule { module, resistances, relaxation_rate: 1.0, center: 0.0, steps: 0 }
    }

    /// Sets the fraction of the distance to steady state covered per
    /// sub-step, clamped to `(0, 1]`.
    pub fn with_relaxation_rate(mut self, rate: f64) -> Self {
        self.relaxation_rate = rate.clamp(f64::EPSILON, 1.0);
        self
    }

    /// Current internal pressure [Pa].
    pub fn center_pressure(&self) -> f64 {
        self.center
    }

    /// Total opening-to-opening resistance between openings `a` and `b`.
    pub fn resistance_between(&self, a: usize, b: usize) -> Option<f64> {
        Some(self.resistances.get(a)? + self.resistances.get(b)?)
    }

    fn steady_center(&self, boundary: &ModuleBoundary) -> Result<f64, ModuleSolverError> {
        let mut conductance = 0.0;
        let mut source = 0.0;
        for (opening, r) in boundary.openings.iter().zip(&self.resistances) {
            match opening.drive {
                OpeningDrive::Pressure => {
                    conductance += 1.0 / r;
                    source += opening.pressure / r;
                }
                OpeningDrive::FlowRate => source += opening.flow_rate,
            }
        }
        if conductance == 0.0 {
            return Err(ModuleSolverError::Underdetermined { module: self.module });
        }
        Ok(source / conductance)
    }
}

impl CfdSimulator for SurrogateModule {
    fn module(&self) -> ModuleId {
        self.module
    }

    fn advance(&mut self, boundary: &ModuleBoundary) -> Result<ModuleResponse, ModuleSolverError> {
        if boundary.module != self.module {
            return Err(ModuleSolverError::Failed {
                module: self.module,
                message: format!("boundary addressed to module {:?}", boundary.module),
            });
        }
        if boundary.openings.len() != self.resistances.len() {
            return Err(ModuleSolverError::BoundaryMismatch {
                module: self.module,
                expected: self.resistances.len(),
                got: boundary.openings.len(),
            });
        }
        if let Some(r) = self.resistances.iter().find(|r| !(r.is_finite() && **r > 0.0)) {
            return Err(ModuleSolverError::Failed {
                module: self.module,
                message: format!("invalid opening resistance {r}"),
            });
        }

        let steady = self.steady_center(boundary)?;
        let substeps = boundary.substeps.max(1);
        let keep = (1.0 - self.relaxation_rate).powi(substeps as i32);
        let previous = self.center;
        self.center = steady + keep * (previous - steady);
        self.steps += substeps;
        if !self.center.is_finite() {
            return Err(ModuleSolverError::Diverged { module: self.module });
        }

        let openings = boundary
            .openings
            .iter()
            .zip(&self.resistances)
            .map(|(opening, r)| match opening.drive {
                OpeningDrive::Pressure => OpeningResponse {
                    pressure: opening.pressure,
                    flow_rate: (opening.pressure - self.center) / r,
                },
                OpeningDrive::FlowRate => OpeningResponse {
                    pressure: self.center + r * opening.flow_rate,
                    flow_rate: opening.flow_rate,
                },
            })
            .collect();

        let residual = relative_change(steady, self.center);
        Ok(ModuleResponse {
            openings,
            state: ModuleState {
                steps: self.steps,
                residual,
                converged: residual <= SURROGATE_TOLERANCE,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solvers::boundary::OpeningBoundary;
    use crate::NodeId;

    fn opening(node: usize, drive: OpeningDrive, pressure: f64, flow_rate: f64) -> OpeningBoundary {
        OpeningBoundary { node: NodeId(node), drive, pressure, flow_rate, area: 1e-8, normal: [1.0, 0.0] }
    }

    fn boundary(openings: Vec<OpeningBoundary>, substeps: usize) -> ModuleBoundary {
        ModuleBoundary { module: ModuleId(0), substeps, openings }
    }

    #[test]
    fn test_pressure_openings_conserve_mass() {
        let mut module = SurrogateModule::new(ModuleId(0), vec![1.0, 2.0, 2.0]);
        let b = boundary(
            vec![
                opening(1, OpeningDrive::Pressure, 100.0, 0.0),
                opening(2, OpeningDrive::Pressure, 0.0, 0.0),
                opening(3, OpeningDrive::Pressure, 20.0, 0.0),
            ],
            1,
        );
        let response = module.advance(&b).unwrap();

        // p_c = (100 + 0 + 10) / (1 + 0.5 + 0.5)
        assert!((module.center_pressure() - 55.0).abs() < 1e-12);
        let total: f64 = response.openings.iter().map(|o| o.flow_rate).sum();
        assert!(total.abs() < 1e-12);
        assert!((response.openings[0].flow_rate - 45.0).abs() < 1e-12);
        assert!(response.state.converged);
    }

    #[test]
    fn test_flow_driven_opening_returns_pressure() {
        let mut module = SurrogateModule::new(ModuleId(0), vec![1.0, 3.0]);
        let b = boundary(
            vec![
                opening(1, OpeningDrive::FlowRate, 0.0, 2.0),
                opening(2, OpeningDrive::Pressure, 10.0, 0.0),
            ],
            1,
        );
        let response = module.advance(&b).unwrap();

        // p_c = (10 / 3 + 2) / (1 / 3) = 16
        assert!((response.openings[0].pressure - 18.0).abs() < 1e-12);
        assert!((response.openings[1].flow_rate + 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_relaxation_over_substeps() {
        let b = boundary(
            vec![
                opening(1, OpeningDrive::Pressure, 100.0, 0.0),
                opening(2, OpeningDrive::Pressure, 0.0, 0.0),
            ],
            2,
        );
        let mut module = SurrogateModule::new(ModuleId(0), vec![1.0, 1.0]).with_relaxation_rate(0.5);
        let first = module.advance(&b).unwrap();
        assert!((module.center_pressure() - 37.5).abs() < 1e-12);
        assert!(!first.state.converged);
        assert_eq!(first.state.steps, 2);

        let second = module.advance(&b).unwrap();
        assert!((module.center_pressure() - 46.875).abs() < 1e-12);
        assert!(second.state.residual < first.state.residual);
    }

    #[test]
    fn test_rejects_bad_boundaries() {
        let mut module = SurrogateModule::new(ModuleId(0), vec![1.0, 1.0]);
        let one = boundary(vec![opening(1, OpeningDrive::Pressure, 0.0, 0.0)], 1);
        assert_eq!(
            module.advance(&one),
            Err(ModuleSolverError::BoundaryMismatch { module: ModuleId(0), expected: 2, got: 1 })
        );

        let flows = boundary(
            vec![
                opening(1, OpeningDrive::FlowRate, 0.0, 1.0),
                opening(2, OpeningDrive::FlowRate, 0.0, -1.0),
            ],
            1,
        );
        assert_eq!(
            module.advance(&flows),
            Err(ModuleSolverError::Underdetermined { module: ModuleId(0) })
        );

        let mut wrong = boundary(vec![], 1);
        wrong.module = ModuleId(3);
        assert!(matches!(module.advance(&wrong), Err(ModuleSolverError::Failed { .. })));
    }
}
