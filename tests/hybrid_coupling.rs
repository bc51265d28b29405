//! Hybrid abstract/CFD steps driven through [`Simulation`].

use microflow::solvers::cfd::SurrogateModule;
use microflow::solvers::coupling::{CouplingConfig, NonConvergencePolicy};
use microflow::solvers::integration::{Simulation, SimulationConfig, SimulationError};
use microflow::solvers::SolverError;
use microflow::{
    ChannelGeometry, ChannelId, Fluid, FluidRegistry, ModuleId, Network, NodeId, Opening, OpeningDrive,
};

const PUMP_PRESSURE: f64 = 1000.0;
const CHANNEL_RESISTANCE: f64 = 1e12;

/// Pressure pump, channel, module, channel back to ground. Channels and
/// module each account for a third of the total resistance.
fn device(config: SimulationConfig) -> Simulation {
    let geometry = ChannelGeometry::rectangular(1e-4, 1e-4, 1e-3);
    let mut network = Network::new();
    let n0 = network.add_node([0.0, 0.0], true);
    let n1 = network.add_node([0.0, 1e-3], false);
    let n2 = network.add_node([1e-3, 1e-3], false);
    let n3 = network.add_node([2e-3, 1e-3], false);
    network.add_pressure_pump(n0, n1, PUMP_PRESSURE).unwrap();
    network.add_channel_with_resistance(n1, n2, geometry, CHANNEL_RESISTANCE).unwrap();
    network.add_channel_with_resistance(n3, n0, geometry, CHANNEL_RESISTANCE).unwrap();
    let module = network
        .add_module(
            [1e-3, 0.5e-3],
            [1e-3, 1e-3],
            "straight.stl",
            vec![
                Opening::new(n2, [-1.0, 0.0], 1e-4, 1e-4),
                Opening::new(n3, [1.0, 0.0], 1e-4, 1e-4),
            ],
        )
        .unwrap();

    let mut fluids = FluidRegistry::new();
    let water = fluids.add(Fluid::water());
    let mut simulation = Simulation::new(network, fluids, water).unwrap().with_config(config);
    let half = 0.5 * CHANNEL_RESISTANCE;
    simulation.attach(Box::new(SurrogateModule::new(module, vec![half, half])));
    simulation
}

fn expected_flow() -> f64 {
    PUMP_PRESSURE / (3.0 * CHANNEL_RESISTANCE)
}

#[test]
fn test_converged_run_matches_lumped_network() {
    let mut simulation = device(SimulationConfig::new().with_time_step(0.1).with_end_time(0.3));
    let summary = simulation.run().unwrap();

    assert_eq!(summary.steps, 3);
    assert_eq!(summary.non_converged, 0);
    let state = simulation.results().last().unwrap();
    assert!(state.converged);
    assert!(state.coupling_residual <= simulation.config().coupling.tolerance);

    let q = expected_flow();
    assert!((state.flow.flow_rate(ChannelId(0)) / q - 1.0).abs() < 1e-4);
    assert!((state.flow.flow_rate(ChannelId(1)) / q - 1.0).abs() < 1e-4);
    let p2 = state.flow.pressure(NodeId(2));
    let p3 = state.flow.pressure(NodeId(3));
    assert!(((p2 - p3) / (PUMP_PRESSURE / 3.0) - 1.0).abs() < 1e-4);
}

#[test]
fn test_non_converged_steps_are_finalized_and_flagged() {
    let coupling = CouplingConfig::new().with_max_iterations(2);
    let mut simulation = device(
        SimulationConfig::new().with_time_step(0.1).with_end_time(0.3).with_coupling(coupling),
    );
    let summary = simulation.run().unwrap();

    assert_eq!(summary.steps, 3);
    assert_eq!(summary.non_converged, 3);
    assert_eq!(simulation.results().non_converged_steps(), vec![1, 2, 3]);

    let states = simulation.results().states();
    for state in states {
        assert_eq!(state.coupling_iterations, 2);
        assert_eq!(state.coupling.len(), 2);
        assert!(state.flow.interior_imbalance() < 1e-18);
    }
    // Later steps pick up where the previous one stopped
    assert!(states[2].coupling_residual < states[0].coupling_residual);
}

#[test]
fn test_abort_policy_stops_the_run() {
    let coupling = CouplingConfig::new()
        .with_max_iterations(2)
        .with_policy(NonConvergencePolicy::Abort);
    let mut simulation = device(SimulationConfig::new().with_time_step(0.1).with_coupling(coupling));

    let result = simulation.run();
    assert!(matches!(
        result,
        Err(SimulationError::Solver(SolverError::CouplingAborted { iterations: 2, .. }))
    ));
    assert!(simulation.results().is_empty());
    assert_eq!(simulation.time(), 0.0);
}

#[test]
fn test_second_simulator_for_a_module_is_rejected() {
    let mut simulation = device(SimulationConfig::new());
    simulation.attach(Box::new(SurrogateModule::new(ModuleId(0), vec![1.0, 1.0])));

    assert!(matches!(
        simulation.step(),
        Err(SimulationError::Solver(SolverError::DuplicateSimulator(ModuleId(0))))
    ));
}

#[test]
fn test_coupling_history_is_serialized_with_results() {
    let mut simulation = device(SimulationConfig::new().with_time_step(0.1).with_end_time(0.1));
    simulation.run().unwrap();

    let json = simulation.results().to_json().unwrap();
    let restored = microflow::results::ResultStore::from_json(&json).unwrap();
    let state = restored.last().unwrap();
    assert_eq!(state.coupling.len(), state.coupling_iterations);
    assert_eq!(state.coupling[0].modules.len(), 1);
}

#[test]
fn test_inlet_reaching_ground_only_through_module() {
    let geometry = ChannelGeometry::rectangular(1e-4, 1e-4, 1e-3);
    let q = 1e-11;
    let mut network = Network::new();
    let n0 = network.add_node([0.0, 0.0], true);
    let n1 = network.add_node([0.0, 1e-3], false);
    let n2 = network.add_node([1e-3, 1e-3], false);
    let n3 = network.add_node([2e-3, 1e-3], false);
    network.add_flow_rate_pump(n0, n1, q).unwrap();
    network.add_channel_with_resistance(n1, n2, geometry, CHANNEL_RESISTANCE).unwrap();
    network.add_channel_with_resistance(n3, n0, geometry, CHANNEL_RESISTANCE).unwrap();
    let module = network
        .add_module(
            [1e-3, 0.5e-3],
            [1e-3, 1e-3],
            "straight.stl",
            vec![
                Opening::new(n2, [-1.0, 0.0], 1e-4, 1e-4),
                Opening::new(n3, [1.0, 0.0], 1e-4, 1e-4),
            ],
        )
        .unwrap();

    let mut fluids = FluidRegistry::new();
    let water = fluids.add(Fluid::water());
    let mut simulation = Simulation::new(network, fluids, water)
        .unwrap()
        .with_config(SimulationConfig::new().with_time_step(0.1).with_end_time(0.2));
    let half = 0.5 * CHANNEL_RESISTANCE;
    simulation.attach(Box::new(SurrogateModule::new(module, vec![half, half])));
    let summary = simulation.run().unwrap();

    assert_eq!(summary.steps, 2);
    assert_eq!(summary.non_converged, 0);
    let openings = &simulation.network().module(module).unwrap().openings;
    assert_eq!(openings[0].drive, OpeningDrive::FlowRate);
    assert_eq!(openings[1].drive, OpeningDrive::Pressure);

    // 10 Pa across the outlet channel, another 10 Pa across the module
    let state = simulation.results().last().unwrap();
    assert!((state.flow.flow_rate(ChannelId(1)) / q - 1.0).abs() < 1e-4);
    assert!((state.flow.pressure(n3) / (q * CHANNEL_RESISTANCE) - 1.0).abs() < 1e-4);
    assert!((state.flow.pressure(n2) / (2.0 * q * CHANNEL_RESISTANCE) - 1.0).abs() < 1e-4);
    assert!((state.flow.pressure(n1) / (3.0 * q * CHANNEL_RESISTANCE) - 1.0).abs() < 1e-4);
}
