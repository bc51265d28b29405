//! Time integration of a whole device.
//!
//! A [`Simulation`] owns the network, its fluids, the CFD simulators and both
//! transport engines, and advances them in fixed macro steps:
//!
//! 1. refresh stale channel resistances for the continuous phase
//! 2. couple the abstract solve with the module simulators
//! 3. move droplets and mixtures through the finalized flow field
//! 4. record the finalized state in the [`ResultStore`]
//!
//! Runs can be cancelled between macro steps through a
//! [`CancellationToken`]; everything recorded up to that point stays
//! available.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::boundary::ModuleOverrides;
use super::cfd::CfdSimulator;
use super::coupling::{CouplingConfig, CouplingScheduler};
use super::{BoundaryConditions, NodalSolver, SolverConfig, SolverError};
use crate::models::{RectangularModel, ResistanceModel};
use crate::results::{ResultError, ResultStore, SimulationState};
use crate::transport::{
    DropletEngine, DropletId, InjectionTarget, MixingModel, MixtureEngine, MixtureId, TransportError,
};
use crate::{ChannelId, FluidId, FluidRegistry, Network, TopologyError};

/// Result type for simulation runs.
pub type SimulationResult<T> = Result<T, SimulationError>;

/// Errors raised while running a simulation.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Results(#[from] ResultError),
    #[error("Invalid time step {0}")]
    InvalidTimeStep(f64),
    #[error("Simulation cancelled after step {step} at t = {time}")]
    Cancelled { step: usize, time: f64 },
}

/// Settings of a simulation run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationConfig {
    /// Macro step [s]
    pub time_step: f64,
    /// Time at which [`Simulation::run`] stops [s]
    pub end_time: f64,
    /// Upper bound on macro steps per call to [`Simulation::run`]
    pub max_steps: usize,
    /// Hybrid coupling settings
    pub coupling: CouplingConfig,
    /// Nodal solver settings
    pub solver: SolverConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig {
            time_step: 1e-2,
            end_time: 1.0,
            max_steps: 1_000_000,
            coupling: CouplingConfig::default(),
            solver: SolverConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the macro step.
    pub fn with_time_step(mut self, time_step: f64) -> Self {
        self.time_step = time_step;
        self
    }

    /// Sets the end time.
    pub fn with_end_time(mut self, end_time: f64) -> Self {
        self.end_time = end_time;
        self
    }

    /// Sets the step limit.
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Sets the coupling settings.
    pub fn with_coupling(mut self, coupling: CouplingConfig) -> Self {
        self.coupling = coupling;
        self
    }

    /// Sets the nodal solver settings.
    pub fn with_solver(mut self, solver: SolverConfig) -> Self {
        self.solver = solver;
        self
    }
}

/// Shared flag asking a running simulation to stop after its current step.
///
/// # Examples
///
/// ```
/// use microflow::solvers::integration::CancellationToken;
///
/// let token = CancellationToken::new();
/// let handle = token.clone();
/// handle.cancel();
/// assert!(token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of [`Simulation::run`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    /// Macro steps taken by this run
    pub steps: usize,
    /// Simulated time reached [s]
    pub time: f64,
    /// Steps of this run whose coupling did not converge
    pub non_converged: usize,
}

/// A microfluidic device advanced in time.
///
/// # Examples
///
/// ```
/// use microflow::{ChannelGeometry, Fluid, FluidRegistry, Network};
/// use microflow::solvers::integration::{Simulation, SimulationConfig};
///
/// let mut network = Network::new();
/// let ground = network.add_node([0.0, 0.0], true);
/// let inlet = network.add_node([0.0, 1e-3], false);
/// let outlet = network.add_node([1e-3, 1e-3], true);
/// network.add_flow_rate_pump(ground, inlet, 1e-11).unwrap();
/// network.add_channel(inlet, outlet, ChannelGeometry::rectangular(1e-4, 1e-4, 1e-3)).unwrap();
///
/// let mut fluids = FluidRegistry::new();
/// let water = fluids.add(Fluid::water());
///
/// let mut simulation = Simulation::new(network, fluids, water)
///     .unwrap()
///     .with_config(SimulationConfig::new().with_time_step(0.1).with_end_time(0.5));
/// let summary = simulation.run().unwrap();
///
/// assert_eq!(summary.steps, 5);
/// assert!((simulation.results().last().unwrap().flow.channel_flows[0] - 1e-11).abs() < 1e-20);
/// ```
pub struct Simulation {
    network: Network,
    fluids: FluidRegistry,
    continuous_phase: FluidId,
    resistance_model: Box<dyn ResistanceModel>,
    boundary: BoundaryConditions,
    simulators: Vec<Box<dyn CfdSimulator>>,
    droplets: DropletEngine,
    mixtures: MixtureEngine,
    results: ResultStore,
    config: SimulationConfig,
    overrides: Option<Vec<ModuleOverrides>>,
    time: f64,
    step: usize,
    cancel: CancellationToken,
}

impl Simulation {
    /// Creates a simulation at `t = 0` with `continuous_phase` filling the
    /// channels.
    ///
    /// # Errors
    ///
    /// Fails if `continuous_phase` is not registered in `fluids`.
    pub fn new(network: Network, fluids: FluidRegistry, continuous_phase: FluidId) -> SimulationResult<Self> {
        fluids.get(continuous_phase).ok_or(TransportError::UnknownFluid(continuous_phase))?;
        Ok(Simulation {
            network,
            fluids,
            continuous_phase,
            resistance_model: Box::new(RectangularModel),
            boundary: BoundaryConditions::new(),
            simulators: Vec::new(),
            droplets: DropletEngine::new(),
            mixtures: MixtureEngine::default(),
            results: ResultStore::new(),
            config: SimulationConfig::default(),
            overrides: None,
            time: 0.0,
            step: 0,
            cancel: CancellationToken::new(),
        })
    }

    /// Sets the run configuration.
    pub fn with_config(mut self, config: SimulationConfig) -> Self {
        self.config = config;
        self
    }

    /// Selects the resistance model.
    pub fn with_resistance_model(mut self, model: Box<dyn ResistanceModel>) -> Self {
        self.resistance_model = model;
        self
    }

    /// Selects the junction mixing model.
    pub fn with_mixing_model(mut self, model: Box<dyn MixingModel>) -> Self {
        self.mixtures.set_model(model);
        self
    }

    /// Sets caller-supplied boundary conditions, applied on every step.
    pub fn with_boundary(mut self, boundary: BoundaryConditions) -> Self {
        self.boundary = boundary;
        self
    }

    /// Attaches a CFD simulator to the module it reports.
    pub fn attach(&mut self, simulator: Box<dyn CfdSimulator>) {
        debug!(module = simulator.module().0, "simulator attached");
        self.simulators.push(simulator);
    }

    /// Changes the continuous phase; every model-derived resistance is
    /// re-evaluated on the next step.
    pub fn set_continuous_phase(&mut self, fluid: FluidId) -> SimulationResult<()> {
        self.fluids.get(fluid).ok_or(TransportError::UnknownFluid(fluid))?;
        self.continuous_phase = fluid;
        self.network.invalidate_resistances();
        Ok(())
    }

    /// Schedules a droplet injection.
    pub fn inject_droplet(
        &mut self,
        fluid: FluidId,
        volume: f64,
        channel: ChannelId,
        center: f64,
        time: f64,
    ) -> SimulationResult<DropletId> {
        Ok(self.droplets.inject(&self.network, &self.fluids, fluid, volume, channel, center, time)?)
    }

    /// Schedules a one-shot mixture injection filling the target up to
    /// `depth`.
    pub fn inject_mixture(
        &mut self,
        mixture: MixtureId,
        target: InjectionTarget,
        depth: f64,
        time: f64,
    ) -> SimulationResult<usize> {
        Ok(self.mixtures.inject(&self.network, mixture, target, depth, time)?)
    }

    /// Schedules a permanent mixture injection.
    pub fn inject_mixture_permanent(
        &mut self,
        mixture: MixtureId,
        target: InjectionTarget,
        time: f64,
    ) -> SimulationResult<usize> {
        Ok(self.mixtures.inject_permanent(&self.network, mixture, target, time)?)
    }

    /// Gets the network.
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Gets the network for editing; structural edits are revalidated on the
    /// next step.
    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    /// Gets the fluids, including mixtures created by droplet merging.
    pub fn fluids(&self) -> &FluidRegistry {
        &self.fluids
    }

    /// Gets the droplet engine.
    pub fn droplets(&self) -> &DropletEngine {
        &self.droplets
    }

    /// Gets the mixture engine.
    pub fn mixtures(&self) -> &MixtureEngine {
        &self.mixtures
    }

    /// Gets the mixture engine, to register species and mixtures.
    pub fn mixtures_mut(&mut self) -> &mut MixtureEngine {
        &mut self.mixtures
    }

    /// Gets the recorded history.
    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    /// Gets the run configuration.
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Current simulated time [s].
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Macro steps taken so far.
    pub fn steps(&self) -> usize {
        self.step
    }

    /// Token that cancels [`Simulation::run`] from another thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Advances one macro step of `config.time_step`.
    pub fn step(&mut self) -> SimulationResult<&SimulationState> {
        self.advance(self.config.time_step)
    }

    fn advance(&mut self, dt: f64) -> SimulationResult<&SimulationState> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(SimulationError::InvalidTimeStep(dt));
        }
        if !self.network.is_ready() {
            self.network.valid()?;
        }
        let viscosity = self
            .fluids
            .get(self.continuous_phase)
            .map(|f| f.viscosity)
            .ok_or(TransportError::UnknownFluid(self.continuous_phase))?;
        let updated = self.network.update_resistances(self.resistance_model.as_ref(), viscosity);
        if updated > 0 {
            debug!(channels = updated, model = self.resistance_model.name(), "resistances updated");
        }

        let scheduler = CouplingScheduler::new(self.config.coupling, NodalSolver::new(self.config.solver));
        let outcome =
            scheduler.run(&self.network, &self.boundary, &mut self.simulators, self.overrides.as_deref())?;

        let (from, to) = (self.time, self.time + dt);
        self.droplets.advance(&self.network, &outcome.flow, &mut self.fluids, from, to)?;
        self.mixtures.advance(&self.network, &outcome.flow, from, to)?;

        let state = SimulationState {
            step: self.step + 1,
            time: to,
            flow: outcome.flow,
            converged: outcome.converged,
            coupling_iterations: outcome.iterations,
            coupling_residual: outcome.residual,
            coupling: outcome.history,
            droplets: self.droplets.snapshot(),
            mixtures: self.mixtures.snapshot(),
        };
        let recorded = self.results.push(state)?;
        self.overrides = Some(outcome.overrides);
        self.step += 1;
        self.time = to;
        info!(
            step = self.step,
            time = to,
            converged = outcome.converged,
            iterations = outcome.iterations,
            "macro step finalized"
        );
        Ok(recorded)
    }

    /// Steps until `config.end_time` or `config.max_steps`.
    ///
    /// The last step is shortened to land on the end time.
    ///
    /// # Errors
    ///
    /// Stops at the first failing step, or with [`SimulationError::Cancelled`]
    /// once the cancellation token is set. States recorded before the error
    /// stay in [`Simulation::results`].
    pub fn run(&mut self) -> SimulationResult<RunSummary> {
        let end = self.config.end_time;
        let tolerance = 1e-9 * self.config.time_step.abs();
        let mut steps = 0;
        let mut non_converged = 0;
        while self.time < end - tolerance && steps < self.config.max_steps {
            if self.cancel.is_cancelled() {
                warn!(step = self.step, time = self.time, "simulation cancelled");
                return Err(SimulationError::Cancelled { step: self.step, time: self.time });
            }
            let dt = self.config.time_step.min(end - self.time);
            if !self.advance(dt)?.converged {
                non_converged += 1;
            }
            steps += 1;
        }
        info!(steps, time = self.time, non_converged, "simulation finished");
        Ok(RunSummary { steps, time: self.time, non_converged })
    }
}
