//! Hybrid abstract/CFD coupling.
//!
//! Each macro step is resolved by a relaxed fixed-point iteration between the
//! nodal solver and the module simulators:
//!
//! 1. **AbstractSolve**: solve the network with the current module overrides
//! 2. **CfdExchange**: hand each module the abstract values at its openings,
//!    advance it by the coupling interval and read back its response
//! 3. **ConvergenceCheck**: under-relax the responses into new overrides,
//!    `new = alpha * cfd + (1 - alpha) * previous`, and compare with the
//!    previous overrides
//!
//! The loop ends in **Converged** once the largest relative change at any
//! opening falls below the tolerance, or in **MaxIterReached**. Every
//! iteration is recorded as an immutable [`CouplingState`].
//!
//! # Example
//!
//! ```
//! use microflow::{ChannelGeometry, Network, Opening};
//! use microflow::solvers::{BoundaryConditions, NodalSolver};
//! use microflow::solvers::cfd::{CfdSimulator, SurrogateModule};
//! use microflow::solvers::coupling::{CouplingConfig, CouplingScheduler};
//!
//! let geometry = ChannelGeometry::rectangular(1e-4, 1e-4, 1e-3);
//! let mut network = Network::new();
//! let ground = network.add_node([0.0, 0.0], true);
//! let inlet = network.add_node([0.0, 1.0], false);
//! let a = network.add_node([1.0, 1.0], false);
//! let b = network.add_node([2.0, 1.0], false);
//! network.add_pressure_pump(ground, inlet, 1000.0).unwrap();
//! network.add_channel_with_resistance(inlet, a, geometry, 1.0).unwrap();
//! network.add_channel_with_resistance(b, ground, geometry, 1.0).unwrap();
//! let module = network
//!     .add_module(
//!         [1.0, 0.5],
//!         [1.0, 1.0],
//!         "straight.stl",
//!         vec![Opening::new(a, [-1.0, 0.0], 1e-4, 1e-4), Opening::new(b, [1.0, 0.0], 1e-4, 1e-4)],
//!     )
//!     .unwrap();
//! network.valid().unwrap();
//!
//! let mut simulators: Vec<Box<dyn CfdSimulator>> =
//!     vec![Box::new(SurrogateModule::new(module, vec![0.5, 0.5]))];
//! let scheduler = CouplingScheduler::new(CouplingConfig::default(), NodalSolver::default());
//! let outcome = scheduler.run(&network, &BoundaryConditions::new(), &mut simulators, None).unwrap();
//!
//! assert!(outcome.converged);
//! assert!((outcome.flow.channel_flows[0] - 1000.0 / 3.0).abs() < 1e-2);
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::boundary::{self, ModuleBoundary, ModuleOverrides};
use super::cfd::{CfdSimulator, ModuleResponse, ModuleSolverError};
use super::{BoundaryConditions, FlowState, NodalSolver, SolverError, SolverResult};
use crate::{Module, ModuleId, Network, TopologyError};

/// What to do when the coupling iteration runs out of iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NonConvergencePolicy {
    /// Finalize the step with the last iterate and flag it as non-converged
    #[default]
    Finalize,
    /// Fail the step with [`SolverError::CouplingAborted`]
    Abort,
}

/// Configuration for the coupling iteration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CouplingConfig {
    /// Relaxation factor applied to pressure overrides, in `(0, 1]`
    pub relaxation_pressure: f64,
    /// Relaxation factor applied to flow-rate overrides, in `(0, 1]`
    pub relaxation_flow: f64,
    /// Largest accepted relative change of any opening value
    pub tolerance: f64,
    /// Maximum number of iterations per macro step; zero runs one iteration
    pub max_iterations: usize,
    /// CFD sub-steps per exchange
    pub coupling_interval: usize,
    /// Behaviour on exhausted iterations
    pub non_convergence: NonConvergencePolicy,
}

impl Default for CouplingConfig {
    fn default() -> Self {
        CouplingConfig {
            relaxation_pressure: 0.5,
            relaxation_flow: 0.5,
            tolerance: 1e-6,
            max_iterations: 100,
            coupling_interval: 1,
            non_convergence: NonConvergencePolicy::Finalize,
        }
    }
}

fn clamp_relaxation(alpha: f64) -> f64 {
    if alpha.is_nan() {
        1.0
    } else {
        alpha.clamp(f64::EPSILON, 1.0)
    }
}

impl CouplingConfig {
    /// Creates a coupling configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets both relaxation factors, clamped to `(0, 1]`.
    pub fn with_relaxation(mut self, alpha: f64) -> Self {
        self.relaxation_pressure = clamp_relaxation(alpha);
        self.relaxation_flow = clamp_relaxation(alpha);
        self
    }

    /// Sets the pressure relaxation factor, clamped to `(0, 1]`.
    pub fn with_pressure_relaxation(mut self, alpha: f64) -> Self {
        self.relaxation_pressure = clamp_relaxation(alpha);
        self
    }

    /// Sets the flow-rate relaxation factor, clamped to `(0, 1]`.
    pub fn with_flow_relaxation(mut self, beta: f64) -> Self {
        self.relaxation_flow = clamp_relaxation(beta);
        self
    }

    /// Sets the convergence tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Sets the maximum number of iterations (at least one).
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Sets the CFD sub-steps per exchange (at least one).
    pub fn with_coupling_interval(mut self, substeps: usize) -> Self {
        self.coupling_interval = substeps.max(1);
        self
    }

    /// Sets the non-convergence policy.
    pub fn with_policy(mut self, policy: NonConvergencePolicy) -> Self {
        self.non_convergence = policy;
        self
    }
}

/// Phases of the coupling state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CouplingPhase {
    AbstractSolve,
    CfdExchange,
    ConvergenceCheck,
    Converged,
    MaxIterReached,
}

/// Values exchanged with one module during one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleExchange {
    /// Abstract-side values at the openings
    pub boundary: ModuleBoundary,
    /// CFD-side values at the openings
    pub response: ModuleResponse,
    /// Relaxed overrides for the next abstract solve
    pub overrides: ModuleOverrides,
    /// Largest relative change at this module's openings
    pub residual: f64,
}

/// Snapshot of one coupling iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingState {
    /// Iteration number, starting at 1
    pub iteration: usize,
    /// Phase reached at the end of the iteration
    pub phase: CouplingPhase,
    /// Largest relative change over all modules
    pub residual: f64,
    /// Per-module exchange, in module order
    pub modules: Vec<ModuleExchange>,
}

/// Result of coupling one macro step.
#[derive(Debug, Clone, PartialEq)]
pub struct CouplingOutcome {
    /// Abstract flow state solved with the final overrides
    pub flow: FlowState,
    /// Final overrides, in module order; carried into the next macro step
    pub overrides: Vec<ModuleOverrides>,
    /// Terminal phase: `Converged` or `MaxIterReached`
    pub phase: CouplingPhase,
    /// True if the residual fell below the tolerance
    pub converged: bool,
    /// Number of iterations performed
    pub iterations: usize,
    /// Residual of the last iteration
    pub residual: f64,
    /// One snapshot per iteration
    pub history: Vec<CouplingState>,
}

/// Drives the abstract/CFD fixed-point iteration.
#[derive(Debug, Clone, Copy, Default)]
pub struct CouplingScheduler {
    /// Coupling settings
    pub config: CouplingConfig,
    solver: NodalSolver,
}

impl CouplingScheduler {
    /// Creates a scheduler.
    pub fn new(config: CouplingConfig, solver: NodalSolver) -> Self {
        CouplingScheduler { config, solver }
    }

    /// Couples one macro step.
    ///
    /// `previous` holds the overrides the last macro step converged to. On
    /// the first step (`None`), modules with an internal resistance are
    /// replaced by links between their openings for the first abstract
    /// solve; all other modules start from zero overrides.
    ///
    /// # Errors
    ///
    /// Fails on any abstract solve error, a module simulator error, a module
    /// without exactly one simulator, or exhausted iterations under
    /// [`NonConvergencePolicy::Abort`].
    pub fn run(
        &self,
        network: &Network,
        base: &BoundaryConditions,
        simulators: &mut [Box<dyn CfdSimulator>],
        previous: Option<&[ModuleOverrides]>,
    ) -> SolverResult<CouplingOutcome> {
        let modules = network.modules();
        if modules.is_empty() {
            let flow = self.solver.solve(network, base)?;
            return Ok(CouplingOutcome {
                flow,
                overrides: Vec::new(),
                phase: CouplingPhase::Converged,
                converged: true,
                iterations: 0,
                residual: 0.0,
                history: Vec::new(),
            });
        }
        check_simulators(network, simulators)?;

        let mut overrides: Vec<ModuleOverrides> = match previous {
            Some(prev) if matches_drives(prev, modules) => prev.to_vec(),
            _ => modules.iter().map(ModuleOverrides::zero).collect(),
        };
        let mut seeding = previous.is_none();
        let max_iterations = self.config.max_iterations.max(1);
        let mut history: Vec<CouplingState> = Vec::with_capacity(max_iterations);
        let mut residual = f64::INFINITY;

        for iteration in 1..=max_iterations {
            let conditions = self.conditions(network, base, &overrides, seeding);
            seeding = false;
            debug!(iteration, phase = ?CouplingPhase::AbstractSolve, "solving abstract network");
            let flow = self.solver.solve(network, &conditions)?;

            debug!(
                iteration,
                phase = ?CouplingPhase::CfdExchange,
                modules = modules.len(),
                "exchanging module boundaries"
            );
            let boundaries: Vec<ModuleBoundary> = modules
                .iter()
                .map(|m| boundary::to_cfd(m, &flow, self.config.coupling_interval))
                .collect();
            let responses = exchange(simulators, &boundaries)?;

            let mut exchanges = Vec::with_capacity(modules.len());
            for ((module, boundary), response) in modules.iter().zip(boundaries).zip(responses) {
                if response.openings.len() != module.openings.len() {
                    return Err(ModuleSolverError::BoundaryMismatch {
                        module: module.id,
                        expected: module.openings.len(),
                        got: response.openings.len(),
                    }
                    .into());
                }
                let current = ModuleOverrides::from_boundary(&boundary);
                let target = ModuleOverrides::from_responses(module, &response.openings);
                let relaxed = current.relax(
                    &target,
                    self.config.relaxation_pressure,
                    self.config.relaxation_flow,
                );
                let module_residual = relaxed.max_relative_change(&current);
                exchanges.push(ModuleExchange {
                    boundary,
                    response,
                    overrides: relaxed,
                    residual: module_residual,
                });
            }
            residual = exchanges.iter().map(|e| e.residual).fold(0.0, f64::max);
            overrides = exchanges.iter().map(|e| e.overrides.clone()).collect();

            let converged = residual <= self.config.tolerance;
            let phase = if converged {
                CouplingPhase::Converged
            } else if iteration == max_iterations {
                CouplingPhase::MaxIterReached
            } else {
                CouplingPhase::ConvergenceCheck
            };
            debug!(iteration, residual, phase = ?phase, "coupling iteration");
            history.push(CouplingState { iteration, phase, residual, modules: exchanges });
            if converged {
                break;
            }
        }

        let iterations = history.len();
        let phase = history.last().map_or(CouplingPhase::MaxIterReached, |state| state.phase);
        let converged = phase == CouplingPhase::Converged;
        if !converged {
            match self.config.non_convergence {
                NonConvergencePolicy::Abort => {
                    return Err(SolverError::CouplingAborted { iterations, residual });
                }
                NonConvergencePolicy::Finalize => {
                    warn!(iterations, residual, "coupling did not converge; finalizing step");
                }
            }
        }

        let conditions = self.conditions(network, base, &overrides, false);
        let flow = self.solver.solve(network, &conditions)?;
        Ok(CouplingOutcome { flow, overrides, phase, converged, iterations, residual, history })
    }

    fn conditions(
        &self,
        network: &Network,
        base: &BoundaryConditions,
        overrides: &[ModuleOverrides],
        seeding: bool,
    ) -> BoundaryConditions {
        let mut conditions = base.clone();
        for (module, o) in network.modules().iter().zip(overrides) {
            if !(seeding && boundary::seed(module, &mut conditions)) {
                boundary::apply(o, &mut conditions);
            }
        }
        conditions
    }
}

/// True if `overrides` were recorded for the current openings and drives.
fn matches_drives(overrides: &[ModuleOverrides], modules: &[Module]) -> bool {
    overrides.len() == modules.len()
        && overrides.iter().zip(modules).all(|(o, m)| {
            o.openings.len() == m.openings.len()
                && o.openings.iter().zip(&m.openings).all(|(a, b)| a.node == b.node && a.drive == b.drive)
        })
}

/// Every module needs exactly one simulator, and every simulator a module.
fn check_simulators(network: &Network, simulators: &[Box<dyn CfdSimulator>]) -> SolverResult<()> {
    let mut attached = vec![0usize; network.module_count()];
    for simulator in simulators {
        let id = simulator.module();
        let count = attached.get_mut(id.0).ok_or(TopologyError::UnknownModule(id))?;
        *count += 1;
        if *count > 1 {
            return Err(SolverError::DuplicateSimulator(id));
        }
    }
    match attached.iter().position(|&c| c == 0) {
        Some(i) => Err(SolverError::MissingSimulator(ModuleId(i))),
        None => Ok(()),
    }
}

/// Advances every simulator with its module's boundary and returns the
/// responses in module order.
fn exchange(
    simulators: &mut [Box<dyn CfdSimulator>],
    boundaries: &[ModuleBoundary],
) -> SolverResult<Vec<ModuleResponse>> {
    let advance = |simulator: &mut Box<dyn CfdSimulator>| {
        let id = simulator.module();
        (id, simulator.advance(&boundaries[id.0]))
    };

    #[cfg(feature = "parallel")]
    let results: Vec<(ModuleId, Result<ModuleResponse, ModuleSolverError>)> =
        simulators.par_iter_mut().map(advance).collect();

    #[cfg(not(feature = "parallel"))]
    let results: Vec<(ModuleId, Result<ModuleResponse, ModuleSolverError>)> =
        simulators.iter_mut().map(advance).collect();

    let mut responses: Vec<Option<ModuleResponse>> = vec![None; boundaries.len()];
    for (id, result) in results {
        responses[id.0] = Some(result?);
    }
    responses
        .into_iter()
        .enumerate()
        .map(|(i, r)| r.ok_or(SolverError::MissingSimulator(ModuleId(i))))
        .collect()
}
