//! Nodal analysis against hand-solved resistor networks, plus the
//! three-inlet rectangular network used as a regression scenario.

use microflow::models::{RectangularModel, ResistanceModel};
use microflow::solvers::{BoundaryConditions, FlowState, NodalSolver};
use microflow::{ChannelGeometry, ChannelId, Network, NodeId, PumpId};

const TOL: f64 = 1e-9;

fn dummy() -> ChannelGeometry {
    ChannelGeometry::rectangular(1e-4, 1e-4, 1e-3)
}

/// Network with a ground node followed by `n` free nodes.
fn nodes(n: usize) -> (Network, NodeId, Vec<NodeId>) {
    let mut network = Network::new();
    let ground = network.add_node([0.0, 0.0], true);
    let free = (0..n).map(|i| network.add_node([i as f64 + 1.0, 0.0], false)).collect();
    (network, ground, free)
}

fn solve(network: &mut Network) -> FlowState {
    network.valid().unwrap();
    let state = NodalSolver::default().solve(network, &BoundaryConditions::new()).unwrap();
    assert!(state.interior_imbalance() < 1e-9);
    state
}

#[test]
fn test_pressure_and_flow_sources() {
    let (mut network, g, n) = nodes(4);
    let v0 = network.add_pressure_pump(g, n[0], 1.0).unwrap();
    network.add_flow_rate_pump(g, n[2], 1.0).unwrap();
    network.add_channel_with_resistance(n[0], n[1], dummy(), 5.0).unwrap();
    network.add_channel_with_resistance(n[1], g, dummy(), 10.0).unwrap();
    network.add_channel_with_resistance(n[2], n[3], dummy(), 5.0).unwrap();
    network.add_channel_with_resistance(n[3], g, dummy(), 10.0).unwrap();
    let state = solve(&mut network);

    assert!((state.pressure(n[0]) - 1.0).abs() < TOL);
    assert!((state.pressure(n[1]) - 2.0 / 3.0).abs() < TOL);
    assert!((state.pressure(n[2]) - 15.0).abs() < TOL);
    assert!((state.pressure(n[3]) - 10.0).abs() < TOL);
    assert!((state.pump_flow(v0) - 0.2 / 3.0).abs() < TOL);
    assert!((state.flow_rate(ChannelId(2)) - 1.0).abs() < TOL);
}

#[test]
fn test_dangling_branch_carries_no_flow() {
    let (mut network, g, n) = nodes(5);
    let v0 = network.add_pressure_pump(g, n[0], 1.0).unwrap();
    let v1 = network.add_pressure_pump(n[4], g, 2.0).unwrap();
    network.add_flow_rate_pump(g, n[1], 1.0).unwrap();
    network.add_channel_with_resistance(n[0], n[1], dummy(), 5.0).unwrap();
    network.add_channel_with_resistance(g, n[1], dummy(), 10.0).unwrap();
    network.add_channel_with_resistance(n[1], n[2], dummy(), 20.0).unwrap();
    network.add_channel_with_resistance(n[2], n[3], dummy(), 30.0).unwrap();
    let state = solve(&mut network);

    assert!((state.pressure(n[0]) - 1.0).abs() < TOL);
    for node in &n[1..4] {
        assert!((state.pressure(*node) - 4.0).abs() < TOL);
    }
    assert!((state.pressure(n[4]) + 2.0).abs() < TOL);
    assert!((state.pump_flow(v0) + 0.6).abs() < TOL);
    assert!(state.pump_flow(v1).abs() < TOL);
    assert!(state.flow_rate(ChannelId(3)).abs() < TOL);
}

#[test]
fn test_pressure_pump_between_free_nodes() {
    let (mut network, g, n) = nodes(3);
    let v0 = network.add_pressure_pump(n[1], n[0], 32.0).unwrap();
    let v1 = network.add_pressure_pump(n[2], g, 20.0).unwrap();
    network.add_channel_with_resistance(g, n[0], dummy(), 2.0).unwrap();
    network.add_channel_with_resistance(n[1], n[2], dummy(), 4.0).unwrap();
    network.add_channel_with_resistance(n[1], g, dummy(), 8.0).unwrap();
    let state = solve(&mut network);

    assert!((state.pressure(n[0]) - 8.0).abs() < TOL);
    assert!((state.pressure(n[1]) + 24.0).abs() < TOL);
    assert!((state.pressure(n[2]) + 20.0).abs() < TOL);
    assert!((state.pump_flow(v0) - 4.0).abs() < TOL);
    assert!((state.pump_flow(v1) + 1.0).abs() < TOL);
}

#[test]
fn test_mixed_pumps_on_one_node() {
    let (mut network, g, n) = nodes(2);
    let v0 = network.add_pressure_pump(n[0], n[1], 32.0).unwrap();
    network.add_flow_rate_pump(n[0], g, 20.0).unwrap();
    network.add_channel_with_resistance(g, n[0], dummy(), 2.0).unwrap();
    network.add_channel_with_resistance(n[0], n[1], dummy(), 4.0).unwrap();
    network.add_channel_with_resistance(n[1], g, dummy(), 8.0).unwrap();
    let state = solve(&mut network);

    assert!((state.pressure(n[0]) + 38.4).abs() < TOL);
    assert!((state.pressure(n[1]) + 6.4).abs() < TOL);
    assert!((state.pump_flow(v0) - 7.2).abs() < TOL);
}

#[test]
fn test_flow_rate_pumps_only() {
    let (mut network, g, n) = nodes(3);
    network.add_flow_rate_pump(n[0], g, 1.0).unwrap();
    network.add_flow_rate_pump(n[2], g, 1.5).unwrap();
    network.add_channel_with_resistance(n[0], n[1], dummy(), 5.0).unwrap();
    network.add_channel_with_resistance(n[1], n[2], dummy(), 7.0).unwrap();
    let c3 = network.add_channel_with_resistance(n[1], g, dummy(), 10.0).unwrap();
    let state = solve(&mut network);

    assert!((state.pressure(n[0]) + 30.0).abs() < TOL);
    assert!((state.pressure(n[1]) + 25.0).abs() < TOL);
    assert!((state.pressure(n[2]) + 35.5).abs() < TOL);
    assert!((state.flow_rate(c3) + 2.5).abs() < TOL);
    assert!(state.boundary_flow(g).abs() < TOL);
}

#[test]
fn test_network_without_pumps_is_at_rest() {
    let (mut network, g, n) = nodes(3);
    network.add_channel_with_resistance(g, n[0], dummy(), 1.0).unwrap();
    network.add_channel_with_resistance(n[0], n[1], dummy(), 2.0).unwrap();
    network.add_channel_with_resistance(n[1], n[2], dummy(), 3.0).unwrap();
    network.add_channel_with_resistance(n[2], n[0], dummy(), 4.0).unwrap();
    let state = solve(&mut network);

    assert!(state.pressures.iter().all(|p| p.abs() < TOL));
    assert!(state.channel_flows.iter().all(|q| q.abs() < TOL));
}

#[test]
fn test_longer_channel_carries_less_flow() {
    let flow_for = |length: f64| {
        let (mut network, g, n) = nodes(1);
        let outlet = network.add_node([2.0, 0.0], true);
        network.add_pressure_pump(g, n[0], 100.0).unwrap();
        let c = network
            .add_channel(n[0], outlet, ChannelGeometry::rectangular(1e-4, 5e-5, length))
            .unwrap();
        network.update_resistances(&RectangularModel, 1e-3);
        let r = network.channel(c).unwrap().resistance().unwrap();
        (r, solve(&mut network).flow_rate(c))
    };

    let (r_short, q_short) = flow_for(1e-3);
    let (r_long, q_long) = flow_for(2e-3);
    assert!(r_long > r_short);
    assert!(q_long < q_short);
    assert!((q_short / q_long - 2.0).abs() < 1e-9);
}

/// Three pressure pumps of 1 kPa feeding a common outlet through 100 um
/// square channels filled with a 1 mPa*s fluid.
fn three_inlets() -> (Network, [PumpId; 3], ChannelId) {
    let geometry = ChannelGeometry::rectangular(1e-4, 1e-4, 1e-3);
    let mut network = Network::new();
    let n0 = network.add_node([0.0, 0.0], true);
    let n1 = network.add_node([0.0, 2e-3], false);
    let n2 = network.add_node([0.0, 1e-3], false);
    let n3 = network.add_node([0.0, 0.0], false);
    let n4 = network.add_node([1e-3, 2e-3], false);
    let n5 = network.add_node([1e-3, 1e-3], false);
    let n6 = network.add_node([1e-3, 0.0], false);
    let n7 = network.add_node([2e-3, 1e-3], true);
    let pumps = [
        network.add_pressure_pump(n0, n1, 1e3).unwrap(),
        network.add_pressure_pump(n0, n2, 1e3).unwrap(),
        network.add_pressure_pump(n0, n3, 1e3).unwrap(),
    ];
    network.add_channel(n1, n4, geometry).unwrap();
    network.add_channel(n2, n5, geometry).unwrap();
    network.add_channel(n3, n6, geometry).unwrap();
    network.add_channel(n4, n5, geometry).unwrap();
    network.add_channel(n6, n5, geometry).unwrap();
    let outlet = network.add_channel(n5, n7, geometry).unwrap();
    network.update_resistances(&RectangularModel, 1e-3);
    (network, pumps, outlet)
}

#[test]
fn test_three_inlets_conserve_mass() {
    let (mut network, pumps, outlet) = three_inlets();
    let state = solve(&mut network);

    let inflow: f64 = pumps.iter().map(|p| state.pump_flow(*p)).sum();
    let outflow = state.flow_rate(outlet);
    assert!(inflow > 0.0);
    assert!((inflow - outflow).abs() < 1e-12 * inflow);
    assert!((state.boundary_flow(NodeId(7)) - outflow).abs() < 1e-12 * inflow);

    // The two outer inlets are symmetric
    assert!((state.pump_flow(pumps[0]) - state.pump_flow(pumps[2])).abs() < 1e-12 * inflow);
    assert!(state.pump_flow(pumps[1]) > state.pump_flow(pumps[0]));
}

#[test]
fn test_three_inlets_converge_under_shrinking_perturbation() {
    let (mut network, _, outlet) = three_inlets();
    let reference = solve(&mut network);
    let base = *network.channel(outlet).unwrap().geometry();
    let r = RectangularModel.resistance(&base, 1e-3);

    let mut deviations = Vec::new();
    for epsilon in [1e-1, 1e-2, 1e-3] {
        let geometry = ChannelGeometry { length: base.length * (1.0 + epsilon), ..base };
        network.set_channel_geometry(outlet, geometry).unwrap();
        network.update_resistances(&RectangularModel, 1e-3);
        let r_perturbed = network.channel(outlet).unwrap().resistance().unwrap();
        assert!((r_perturbed / r - 1.0 - epsilon).abs() < 1e-9);

        let state = solve(&mut network);
        let deviation = state
            .channel_flows
            .iter()
            .zip(&reference.channel_flows)
            .map(|(q, q0)| ((q - q0) / q0).abs())
            .fold(0.0, f64::max);
        deviations.push(deviation);
    }

    assert!(deviations[0] > deviations[1] && deviations[1] > deviations[2]);
    assert!(deviations[2] < 1e-3);
}
