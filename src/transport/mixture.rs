//! Species transport.
//!
//! Each channel holds an ordered list of [`MixtureSegment`]s covering the
//! whole channel, measured as fractions from `node_a`. A segment without a
//! mixture holds pure carrier fluid. Every (sub-)step:
//!
//! 1. the part of each channel that leaves through its outlet is collected
//!    at the outlet node, together with pump deliveries and external inflow
//!    (carrier)
//! 2. the [`MixingModel`] turns each node's inflows into one outflow mixture
//! 3. every channel shifts its segments downstream and takes in the outflow
//!    mixture of its inlet node
//!
//! A step is cut into sub-steps that end whenever a segment boundary reaches
//! the outlet of its channel, so each channel hands a single mixture to its
//! outlet node per sub-step and fronts pass through plain junctions intact.
//!
//! CFD modules act as junctions: the mixture entering through some openings
//! leaves, flow-weighted by the mixing model, through the others.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{InjectionQueue, TransportError, TransportResult};
use crate::solvers::FlowState;
use crate::{ChannelId, Network, NodeId, PumpId};

const CONCENTRATION_TOLERANCE: f64 = 1e-12;
const MIN_WIDTH: f64 = 1e-14;
/// External inflows below this fraction of the largest flow are solver noise.
const EXTERNAL_FLOW_TOLERANCE: f64 = 1e-9;

/// Identifier of a species in a [`MixtureRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SpeciesId(pub usize);

/// Identifier of a mixture in a [`MixtureRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MixtureId(pub usize);

/// A dissolved species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Species {
    /// Name of the species
    pub name: String,
    /// Diffusivity in the carrier [m^2/s]
    pub diffusivity: f64,
}

/// Concentrations of one or more species in the carrier fluid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mixture {
    /// Unique identifier
    pub id: MixtureId,
    /// Fractional concentration per species, in `[0, 1]`
    pub concentrations: BTreeMap<SpeciesId, f64>,
}

impl Mixture {
    /// Concentration of `species`; zero if absent.
    pub fn concentration(&self, species: SpeciesId) -> f64 {
        self.concentrations.get(&species).copied().unwrap_or(0.0)
    }
}

/// Species and mixtures known to a simulation.
///
/// Mixtures are interned: registering a composition that already exists
/// returns the existing id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MixtureRegistry {
    species: Vec<Species>,
    mixtures: Vec<Mixture>,
}

impl MixtureRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a species.
    pub fn add_species(&mut self, name: &str, diffusivity: f64) -> SpeciesId {
        let id = SpeciesId(self.species.len());
        self.species.push(Species { name: name.to_string(), diffusivity });
        id
    }

    /// Registers a mixture, or returns the id of an identical one.
    ///
    /// # Errors
    ///
    /// Fails for unknown species and concentrations outside `[0, 1]`.
    pub fn add_mixture(
        &mut self,
        concentrations: impl IntoIterator<Item = (SpeciesId, f64)>,
    ) -> TransportResult<MixtureId> {
        let mut map = BTreeMap::new();
        for (species, value) in concentrations {
            if species.0 >= self.species.len() {
                return Err(TransportError::UnknownSpecies(species));
            }
            if !(0.0..=1.0).contains(&value) {
                return Err(TransportError::InvalidConcentration { species, value });
            }
            *map.entry(species).or_insert(0.0) += value;
        }
        if let Some((&species, &value)) = map.iter().find(|(_, v)| **v > 1.0) {
            return Err(TransportError::InvalidConcentration { species, value });
        }
        Ok(self.intern_nonempty(map))
    }

    /// Interns a composition; `None` if it holds no species.
    fn intern(&mut self, mut concentrations: BTreeMap<SpeciesId, f64>) -> Option<MixtureId> {
        concentrations.retain(|_, v| *v > CONCENTRATION_TOLERANCE);
        if concentrations.is_empty() {
            return None;
        }
        Some(self.intern_nonempty(concentrations))
    }

    fn intern_nonempty(&mut self, concentrations: BTreeMap<SpeciesId, f64>) -> MixtureId {
        let existing = self.mixtures.iter().find(|m| {
            m.concentrations.len() == concentrations.len()
                && m.concentrations.iter().zip(&concentrations).all(|((sa, ca), (sb, cb))| {
                    sa == sb && (ca - cb).abs() <= CONCENTRATION_TOLERANCE
                })
        });
        if let Some(m) = existing {
            return m.id;
        }
        let id = MixtureId(self.mixtures.len());
        self.mixtures.push(Mixture { id, concentrations });
        id
    }

    /// Gets a mixture by id.
    pub fn get(&self, id: MixtureId) -> Option<&Mixture> {
        self.mixtures.get(id.0)
    }

    /// Gets a species by id.
    pub fn species(&self, id: SpeciesId) -> Option<&Species> {
        self.species.get(id.0)
    }

    /// All mixtures, indexed by id.
    pub fn mixtures(&self) -> &[Mixture] {
        &self.mixtures
    }

    /// Concentration of `species` in `mixture`; carrier fluid holds none.
    pub fn concentration(&self, mixture: Option<MixtureId>, species: SpeciesId) -> f64 {
        mixture.and_then(|m| self.get(m)).map_or(0.0, |m| m.concentration(species))
    }
}

/// Combines the flows entering a node into the mixture leaving it.
pub trait MixingModel: Debug + Send + Sync {
    /// Name of the model.
    fn name(&self) -> &'static str;

    /// Outflow mixture for `inflows` given as `(mixture, volume)` pairs.
    fn mix(
        &self,
        inflows: &[(Option<MixtureId>, f64)],
        registry: &mut MixtureRegistry,
    ) -> Option<MixtureId>;
}

/// Complete mixing at junctions: concentrations are averaged weighted by
/// inflow volume.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstantaneousMixing;

impl MixingModel for InstantaneousMixing {
    fn name(&self) -> &'static str {
        "instantaneous"
    }

    fn mix(
        &self,
        inflows: &[(Option<MixtureId>, f64)],
        registry: &mut MixtureRegistry,
    ) -> Option<MixtureId> {
        let first = inflows.first()?.0;
        if inflows.iter().all(|(m, _)| *m == first) {
            return first;
        }
        let total: f64 = inflows.iter().map(|(_, v)| v).sum();
        if total <= 0.0 {
            return first;
        }
        let mut concentrations = BTreeMap::new();
        for (mixture, volume) in inflows {
            let Some(m) = mixture.and_then(|m| registry.get(m)) else {
                continue;
            };
            for (&species, &c) in &m.concentrations {
                *concentrations.entry(species).or_insert(0.0) += c * volume / total;
            }
        }
        registry.intern(concentrations)
    }
}

/// No mixing: the largest inflow dictates the outflow mixture.
#[derive(Debug, Clone, Copy, Default)]
pub struct DominantInflowMixing;

impl MixingModel for DominantInflowMixing {
    fn name(&self) -> &'static str {
        "dominant-inflow"
    }

    fn mix(
        &self,
        inflows: &[(Option<MixtureId>, f64)],
        _registry: &mut MixtureRegistry,
    ) -> Option<MixtureId> {
        inflows
            .iter()
            .rev()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .and_then(|(m, _)| *m)
    }
}

/// A run of constant mixture inside a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixtureSegment {
    /// Start, as a fraction from `node_a`
    pub start: f64,
    /// End, as a fraction from `node_a`
    pub end: f64,
    /// Mixture, or `None` for carrier fluid
    pub mixture: Option<MixtureId>,
}

/// Mixture segments of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFronts {
    pub channel: ChannelId,
    pub segments: Vec<MixtureSegment>,
}

/// Where a mixture enters the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InjectionTarget {
    /// At the inlet of a channel
    Channel(ChannelId),
    /// Through a pump, into the channels leaving its outlet node
    Pump(PumpId),
}

/// How long a mixture injection lasts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InjectionKind {
    /// Fills the target from its inlet up to `depth` (fraction of the channel)
    OneShot { depth: f64 },
    /// Replaces the inflow at the target from its start time onward
    Permanent,
}

/// A scheduled mixture injection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixtureInjection {
    pub mixture: MixtureId,
    pub target: InjectionTarget,
    pub kind: InjectionKind,
    pub time: f64,
}

/// Advects mixtures through the network.
#[derive(Debug)]
pub struct MixtureEngine {
    registry: MixtureRegistry,
    model: Box<dyn MixingModel>,
    channels: Vec<Vec<MixtureSegment>>,
    nodes: Vec<Option<MixtureId>>,
    permanent: Vec<(InjectionTarget, MixtureId)>,
    injections: Vec<MixtureInjection>,
    queue: InjectionQueue<usize>,
}

impl Default for MixtureEngine {
    fn default() -> Self {
        Self::new(Box::new(InstantaneousMixing))
    }
}

fn carrier() -> Vec<MixtureSegment> {
    vec![MixtureSegment { start: 0.0, end: 1.0, mixture: None }]
}

/// Merges neighbours holding the same mixture and drops slivers.
fn coalesce(segments: &mut Vec<MixtureSegment>) {
    segments.retain(|s| s.end - s.start > MIN_WIDTH);
    let mut merged: Vec<MixtureSegment> = Vec::with_capacity(segments.len());
    for s in segments.drain(..) {
        match merged.last_mut() {
            Some(last) if last.mixture == s.mixture => last.end = s.end,
            Some(last) => {
                let start = last.end;
                merged.push(MixtureSegment { start, ..s });
            }
            None => merged.push(MixtureSegment { start: 0.0, ..s }),
        }
    }
    if let Some(last) = merged.last_mut() {
        last.end = 1.0;
    }
    if merged.is_empty() {
        merged = carrier();
    }
    *segments = merged;
}

/// Covers `[start, end]` with `mixture`.
fn paint(segments: &mut Vec<MixtureSegment>, start: f64, end: f64, mixture: Option<MixtureId>) {
    let mut painted = Vec::with_capacity(segments.len() + 2);
    for s in segments.iter() {
        if s.start < start {
            painted.push(MixtureSegment { end: s.end.min(start), ..*s });
        }
    }
    painted.push(MixtureSegment { start, end, mixture });
    for s in segments.iter() {
        if s.end > end {
            painted.push(MixtureSegment { start: s.start.max(end), ..*s });
        }
    }
    *segments = painted;
    coalesce(segments);
}

/// Fractions of the channel leaving through the outlet while the contents
/// advance by `m`.
fn outflow(segments: &[MixtureSegment], m: f64, forward: bool) -> Vec<(Option<MixtureId>, f64)> {
    let (lo, hi) = if forward { (1.0 - m, 1.0) } else { (0.0, m) };
    let mut exits: Vec<(Option<MixtureId>, f64)> = segments
        .iter()
        .filter_map(|s| {
            let overlap = s.end.min(hi) - s.start.max(lo);
            (overlap > 0.0).then_some((s.mixture, overlap))
        })
        .collect();
    // Rounding at a front may add a sliver of the next segment
    if exits.len() > 1 {
        exits.retain(|(_, overlap)| *overlap > MIN_WIDTH);
    }
    exits
}

/// Fraction of the channel between its outlet and the nearest front.
fn outlet_width(segments: &[MixtureSegment], forward: bool) -> f64 {
    let width = if forward {
        segments.last().map(|s| 1.0 - s.start)
    } else {
        segments.first().map(|s| s.end)
    };
    width.unwrap_or(1.0)
}

/// Advances the contents by `m` and fills the inlet with `inlet`.
fn shift(segments: &mut Vec<MixtureSegment>, m: f64, forward: bool, inlet: Option<MixtureId>) {
    if forward {
        for s in segments.iter_mut() {
            s.start += m;
            s.end = (s.end + m).min(1.0);
        }
        segments.retain(|s| s.start < 1.0);
        segments.insert(0, MixtureSegment { start: 0.0, end: m.min(1.0), mixture: inlet });
    } else {
        for s in segments.iter_mut() {
            s.start = (s.start - m).max(0.0);
            s.end -= m;
        }
        segments.retain(|s| s.end > 0.0);
        segments.push(MixtureSegment { start: (1.0 - m).max(0.0), end: 1.0, mixture: inlet });
    }
    coalesce(segments);
}

impl MixtureEngine {
    /// Creates an engine with the given mixing model.
    pub fn new(model: Box<dyn MixingModel>) -> Self {
        MixtureEngine {
            registry: MixtureRegistry::new(),
            model,
            channels: Vec::new(),
            nodes: Vec::new(),
            permanent: Vec::new(),
            injections: Vec::new(),
            queue: InjectionQueue::new(),
        }
    }

    /// Replaces the mixing model.
    pub fn set_model(&mut self, model: Box<dyn MixingModel>) {
        self.model = model;
    }

    /// Name of the mixing model in use.
    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Species and mixtures.
    pub fn registry(&self) -> &MixtureRegistry {
        &self.registry
    }

    /// Species and mixtures, for registration.
    pub fn registry_mut(&mut self) -> &mut MixtureRegistry {
        &mut self.registry
    }

    /// Schedules a one-shot injection filling the target from its inlet up to
    /// `depth` (fraction of the channel, in `(0, 1]`).
    pub fn inject(
        &mut self,
        network: &Network,
        mixture: MixtureId,
        target: InjectionTarget,
        depth: f64,
        time: f64,
    ) -> TransportResult<usize> {
        if !(depth > 0.0 && depth <= 1.0) {
            return Err(TransportError::InvalidDepth(depth));
        }
        self.schedule(network, MixtureInjection { mixture, target, kind: InjectionKind::OneShot { depth }, time })
    }

    /// Schedules a permanent injection at the target from `time` onward.
    pub fn inject_permanent(
        &mut self,
        network: &Network,
        mixture: MixtureId,
        target: InjectionTarget,
        time: f64,
    ) -> TransportResult<usize> {
        self.schedule(network, MixtureInjection { mixture, target, kind: InjectionKind::Permanent, time })
    }

    fn schedule(&mut self, network: &Network, injection: MixtureInjection) -> TransportResult<usize> {
        if !injection.time.is_finite() {
            return Err(TransportError::InvalidTime(injection.time));
        }
        self.registry.get(injection.mixture).ok_or(TransportError::UnknownMixture(injection.mixture))?;
        match injection.target {
            InjectionTarget::Channel(c) => {
                network.channel(c).ok_or(TransportError::UnknownChannel(c))?;
            }
            InjectionTarget::Pump(p) => {
                network.pump(p).ok_or(TransportError::UnknownPump(p))?;
            }
        }
        let id = self.injections.len();
        self.injections.push(injection);
        self.queue.push(injection.time, id);
        debug!(injection = id, mixture = injection.mixture.0, time = injection.time, "mixture injection scheduled");
        Ok(id)
    }

    /// Scheduled and applied injections, indexed by the id returned when
    /// scheduling.
    pub fn injections(&self) -> &[MixtureInjection] {
        &self.injections
    }

    fn ensure(&mut self, network: &Network) {
        self.channels.resize_with(network.channel_count(), carrier);
        self.nodes.resize(network.node_count(), None);
    }

    /// Channels fed by an injection target, with their inlet direction.
    fn target_channels(network: &Network, flow: &FlowState, target: InjectionTarget) -> Vec<(ChannelId, bool)> {
        match target {
            InjectionTarget::Channel(c) => vec![(c, flow.flow_rate(c) >= 0.0)],
            InjectionTarget::Pump(p) => {
                let Some(pump) = network.pump(p) else {
                    return Vec::new();
                };
                let outlet = if flow.pump_flow(p) >= 0.0 { pump.node_b } else { pump.node_a };
                network
                    .channels()
                    .iter()
                    .filter(|c| c.connects(outlet))
                    .filter(|c| {
                        let q = flow.flow_rate(c.id);
                        (c.node_a == outlet && q >= 0.0) || (c.node_b == outlet && q <= 0.0)
                    })
                    .map(|c| (c.id, c.node_a == outlet))
                    .collect()
            }
        }
    }

    fn apply(&mut self, network: &Network, flow: &FlowState, id: usize) {
        let injection = self.injections[id];
        match injection.kind {
            InjectionKind::OneShot { depth } => {
                for (channel, forward) in Self::target_channels(network, flow, injection.target) {
                    let (start, end) = if forward { (0.0, depth) } else { (1.0 - depth, 1.0) };
                    paint(&mut self.channels[channel.0], start, end, Some(injection.mixture));
                }
            }
            InjectionKind::Permanent => {
                self.permanent.retain(|(t, _)| *t != injection.target);
                self.permanent.push((injection.target, injection.mixture));
            }
        }
        debug!(injection = id, "mixture injection applied");
    }

    fn permanent_at(&self, target: InjectionTarget) -> Option<MixtureId> {
        self.permanent.iter().find(|(t, _)| *t == target).map(|(_, m)| *m)
    }

    /// Advects all mixtures from `from` to `to` through the finalized `flow`.
    pub fn advance(&mut self, network: &Network, flow: &FlowState, from: f64, to: f64) -> TransportResult<()> {
        if flow.channel_flows.len() != network.channel_count()
            || flow.pressures.len() != network.node_count()
            || flow.pump_flows.len() != network.pump_count()
        {
            return Err(TransportError::StaleFlowState);
        }
        self.ensure(network);
        let mut now = from;
        loop {
            for (_, id) in self.queue.pop_due(now) {
                self.apply(network, flow, id);
            }
            if now >= to {
                break;
            }
            let end = self.queue.next_time().filter(|t| *t > now && *t < to).unwrap_or(to);
            self.advect(network, flow, end - now);
            now = end;
        }
        Ok(())
    }

    fn advect(&mut self, network: &Network, flow: &FlowState, dt: f64) {
        let mut remaining = dt;
        let mut substeps = 0usize;
        while remaining > dt * 1e-12 {
            let step = network
                .channels()
                .iter()
                .filter(|c| flow.flow_rate(c.id) != 0.0)
                .map(|c| {
                    let q = flow.flow_rate(c.id);
                    outlet_width(&self.channels[c.id.0], q > 0.0) * c.volume() / q.abs()
                })
                .fold(remaining, f64::min);
            self.substep(network, flow, step);
            remaining -= step;
            substeps += 1;
        }
        debug!(substeps, dt, "mixtures advected");
    }

    fn substep(&mut self, network: &Network, flow: &FlowState, dt: f64) {
        let mut inflows: Vec<Vec<(Option<MixtureId>, f64)>> = vec![Vec::new(); network.node_count()];

        for c in network.channels() {
            let q = flow.flow_rate(c.id);
            if q == 0.0 {
                continue;
            }
            let forward = q > 0.0;
            let outlet = if forward { c.node_b } else { c.node_a };
            let m = q.abs() * dt / c.volume();
            for (mixture, fraction) in outflow(&self.channels[c.id.0], m, forward) {
                inflows[outlet.0].push((mixture, fraction * c.volume()));
            }
        }
        for p in network.pumps() {
            let q = flow.pump_flow(p.id);
            if q == 0.0 {
                continue;
            }
            let (inlet, outlet) = if q > 0.0 { (p.node_a, p.node_b) } else { (p.node_b, p.node_a) };
            let mixture = self.permanent_at(InjectionTarget::Pump(p.id)).or(self.nodes[inlet.0]);
            inflows[outlet.0].push((mixture, q.abs() * dt));
        }

        let scale = flow.channel_flows.iter().chain(&flow.pump_flows).map(|q| q.abs()).fold(0.0, f64::max);
        let threshold = EXTERNAL_FLOW_TOLERANCE * scale;
        for module in network.modules() {
            let mut entering = Vec::new();
            for o in &module.openings {
                let q = flow.boundary_flow(o.node);
                if q > threshold && !inflows[o.node.0].is_empty() {
                    entering.push((self.model.mix(&inflows[o.node.0], &mut self.registry), q * dt));
                }
            }
            let mixture = self.model.mix(&entering, &mut self.registry);
            for o in &module.openings {
                let q = -flow.boundary_flow(o.node);
                if q > threshold {
                    inflows[o.node.0].push((mixture, q * dt));
                }
            }
        }
        for (i, node_inflows) in inflows.iter_mut().enumerate() {
            let external = -flow.boundary_flow(NodeId(i));
            if external > threshold && network.module_at(NodeId(i)).is_none() {
                node_inflows.push((None, external * dt));
            }
        }
        for (i, node_inflows) in inflows.iter().enumerate() {
            if !node_inflows.is_empty() {
                self.nodes[i] = self.model.mix(node_inflows, &mut self.registry);
            }
        }

        for c in network.channels() {
            let q = flow.flow_rate(c.id);
            if q == 0.0 {
                continue;
            }
            let forward = q > 0.0;
            let inlet = if forward { c.node_a } else { c.node_b };
            let mixture = self.permanent_at(InjectionTarget::Channel(c.id)).or(self.nodes[inlet.0]);
            let m = q.abs() * dt / c.volume();
            shift(&mut self.channels[c.id.0], m, forward, mixture);
        }
    }

    /// Segments of `channel`, once the engine has seen the network.
    pub fn fronts(&self, channel: ChannelId) -> Option<&[MixtureSegment]> {
        self.channels.get(channel.0).map(Vec::as_slice)
    }

    /// Mixture leaving `node` in the last sub-step.
    pub fn node_mixture(&self, node: NodeId) -> Option<MixtureId> {
        self.nodes.get(node.0).copied().flatten()
    }

    /// Concentration of `species` at `position` (fraction from `node_a`).
    pub fn concentration_at(&self, channel: ChannelId, position: f64, species: SpeciesId) -> f64 {
        let mixture = self
            .fronts(channel)
            .and_then(|segments| segments.iter().find(|s| position >= s.start && position <= s.end))
            .and_then(|s| s.mixture);
        self.registry.concentration(mixture, species)
    }

    /// Snapshot of every channel's segments.
    pub fn snapshot(&self) -> Vec<ChannelFronts> {
        self.channels
            .iter()
            .enumerate()
            .map(|(i, segments)| ChannelFronts { channel: ChannelId(i), segments: segments.clone() })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solvers::{BoundaryConditions, NodalSolver};
    use crate::ChannelGeometry;

    fn geometry() -> ChannelGeometry {
        ChannelGeometry::rectangular(1e-4, 1e-4, 1e-3)
    }

    fn solve(network: &Network) -> FlowState {
        NodalSolver::default().solve(network, &BoundaryConditions::new()).unwrap()
    }

    /// One channel flushed once per second.
    fn straight() -> (Network, ChannelId, PumpId) {
        let mut network = Network::new();
        let n0 = network.add_node([0.0, 0.0], true);
        let n1 = network.add_node([0.0, 1e-3], false);
        let n2 = network.add_node([1e-3, 1e-3], true);
        let p = network.add_flow_rate_pump(n0, n1, 1e-11).unwrap();
        let c = network.add_channel_with_resistance(n1, n2, geometry(), 1e12).unwrap();
        network.valid().unwrap();
        (network, c, p)
    }

    fn engine_with_dye() -> (MixtureEngine, SpeciesId, MixtureId) {
        let mut engine = MixtureEngine::default();
        let dye = engine.registry_mut().add_species("dye", 1e-9);
        let full = engine.registry_mut().add_mixture([(dye, 1.0)]).unwrap();
        (engine, dye, full)
    }

    fn assert_layout(engine: &MixtureEngine, c: ChannelId, expected: &[(f64, f64, Option<MixtureId>)]) {
        let segments = engine.fronts(c).unwrap();
        assert_eq!(segments.len(), expected.len(), "{segments:?}");
        for (s, (start, end, mixture)) in segments.iter().zip(expected) {
            assert!((s.start - start).abs() < 1e-9, "{segments:?}");
            assert!((s.end - end).abs() < 1e-9, "{segments:?}");
            assert_eq!(s.mixture, *mixture);
        }
    }

    #[test]
    fn test_registry_validation_and_dedupe() {
        let mut registry = MixtureRegistry::new();
        let a = registry.add_species("a", 1e-9);
        let b = registry.add_species("b", 2e-9);

        assert_eq!(
            registry.add_mixture([(a, 1.5)]),
            Err(TransportError::InvalidConcentration { species: a, value: 1.5 })
        );
        assert_eq!(
            registry.add_mixture([(SpeciesId(7), 0.5)]),
            Err(TransportError::UnknownSpecies(SpeciesId(7)))
        );
        let m = registry.add_mixture([(a, 0.2), (b, 0.3)]).unwrap();
        assert_eq!(registry.add_mixture([(b, 0.3), (a, 0.2)]).unwrap(), m);
        assert_eq!(registry.mixtures().len(), 1);
        assert!((registry.concentration(Some(m), b) - 0.3).abs() < 1e-15);
        assert_eq!(registry.concentration(None, b), 0.0);
    }

    #[test]
    fn test_instantaneous_mixing_is_volume_weighted() {
        let mut registry = MixtureRegistry::new();
        let a = registry.add_species("a", 1e-9);
        let full = registry.add_mixture([(a, 1.0)]).unwrap();

        let mixed = InstantaneousMixing.mix(&[(Some(full), 1.0), (None, 3.0)], &mut registry);
        assert!((registry.concentration(mixed, a) - 0.25).abs() < 1e-15);
        let again = InstantaneousMixing.mix(&[(None, 6.0), (Some(full), 2.0)], &mut registry);
        assert_eq!(mixed, again);

        assert_eq!(InstantaneousMixing.mix(&[(Some(full), 1.0), (Some(full), 2.0)], &mut registry), Some(full));
        assert_eq!(InstantaneousMixing.mix(&[], &mut registry), None);
    }

    #[test]
    fn test_dominant_inflow_mixing() {
        let mut registry = MixtureRegistry::new();
        let a = registry.add_species("a", 1e-9);
        let full = registry.add_mixture([(a, 1.0)]).unwrap();

        assert_eq!(DominantInflowMixing.mix(&[(Some(full), 1.0), (None, 3.0)], &mut registry), None);
        assert_eq!(DominantInflowMixing.mix(&[(Some(full), 2.0), (None, 2.0)], &mut registry), Some(full));
        assert_eq!(registry.mixtures().len(), 1);
    }

    #[test]
    fn test_front_advects_with_flow() {
        let (network, c, _) = straight();
        let flow = solve(&network);
        let (mut engine, dye, full) = engine_with_dye();
        engine.inject(&network, full, InjectionTarget::Channel(c), 0.5, 0.0).unwrap();

        engine.advance(&network, &flow, 0.0, 0.25).unwrap();
        assert_layout(&engine, c, &[(0.0, 0.25, None), (0.25, 0.75, Some(full)), (0.75, 1.0, None)]);
        assert_eq!(engine.concentration_at(c, 0.5, dye), 1.0);
        assert_eq!(engine.concentration_at(c, 0.1, dye), 0.0);

        engine.advance(&network, &flow, 0.25, 1.0).unwrap();
        assert_layout(&engine, c, &[(0.0, 1.0, None)]);
    }

    #[test]
    fn test_scheduled_permanent_injection() {
        let (network, c, _) = straight();
        let flow = solve(&network);
        let (mut engine, _, full) = engine_with_dye();
        engine.inject_permanent(&network, full, InjectionTarget::Channel(c), 0.5).unwrap();

        engine.advance(&network, &flow, 0.0, 1.0).unwrap();
        assert_layout(&engine, c, &[(0.0, 0.5, Some(full)), (0.5, 1.0, None)]);
    }

    #[test]
    fn test_long_step_is_subdivided() {
        let (network, c, p) = straight();
        let flow = solve(&network);
        let (mut engine, _, full) = engine_with_dye();
        engine.inject_permanent(&network, full, InjectionTarget::Pump(p), 0.0).unwrap();

        // Pump delivery reaches the channel inlet through node n1
        engine.advance(&network, &flow, 0.0, 2.5).unwrap();
        assert_layout(&engine, c, &[(0.0, 1.0, Some(full))]);
        assert_eq!(engine.node_mixture(NodeId(1)), Some(full));
    }

    #[test]
    fn test_one_shot_at_pump_fills_outlet_channels() {
        let (network, c, p) = straight();
        let flow = solve(&network);
        let (mut engine, _, full) = engine_with_dye();
        engine.inject(&network, full, InjectionTarget::Pump(p), 0.4, 0.0).unwrap();
        engine.advance(&network, &flow, 0.0, 0.0).unwrap();
        assert_layout(&engine, c, &[(0.0, 0.4, Some(full)), (0.4, 1.0, None)]);
    }

    #[test]
    fn test_junction_mixes_by_flow_rate() {
        let mut network = Network::new();
        let n0 = network.add_node([0.0, 0.0], true);
        let n1 = network.add_node([0.0, 1e-3], false);
        let n2 = network.add_node([0.0, -1e-3], false);
        let n3 = network.add_node([1e-3, 0.0], false);
        let n4 = network.add_node([2e-3, 0.0], true);
        let dyed = network.add_flow_rate_pump(n0, n1, 1e-11).unwrap();
        network.add_flow_rate_pump(n0, n2, 3e-11).unwrap();
        network.add_channel_with_resistance(n1, n3, geometry(), 1e12).unwrap();
        network.add_channel_with_resistance(n2, n3, geometry(), 1e12).unwrap();
        let out = network.add_channel_with_resistance(n3, n4, geometry(), 1e12).unwrap();
        network.valid().unwrap();
        let flow = solve(&network);

        let (mut engine, dye, full) = engine_with_dye();
        engine.inject_permanent(&network, full, InjectionTarget::Pump(dyed), 0.0).unwrap();
        let mut t = 0.0;
        for _ in 0..20 {
            engine.advance(&network, &flow, t, t + 0.1).unwrap();
            t += 0.1;
        }

        assert!((engine.concentration_at(out, 0.5, dye) - 0.25).abs() < 1e-9);
        assert!((engine.concentration_at(out, 0.99, dye) - 0.25).abs() < 1e-9);
        let mixed = engine.node_mixture(n3);
        assert!((engine.registry().concentration(mixed, dye) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_front_passes_serial_junction_intact() {
        let mut network = Network::new();
        let n0 = network.add_node([0.0, 0.0], true);
        let n1 = network.add_node([0.0, 1e-3], false);
        let n2 = network.add_node([1e-3, 1e-3], false);
        let n3 = network.add_node([2e-3, 1e-3], true);
        network.add_flow_rate_pump(n0, n1, 1e-11).unwrap();
        let first = network.add_channel_with_resistance(n1, n2, geometry(), 1e12).unwrap();
        let second = network.add_channel_with_resistance(n2, n3, geometry(), 1e12).unwrap();
        network.valid().unwrap();
        let flow = solve(&network);

        let (mut engine, dye, full) = engine_with_dye();
        engine.inject(&network, full, InjectionTarget::Channel(first), 0.2, 0.0).unwrap();
        engine.advance(&network, &flow, 0.0, 1.0).unwrap();

        assert_layout(&engine, first, &[(0.0, 1.0, None)]);
        assert_layout(&engine, second, &[(0.0, 0.2, Some(full)), (0.2, 1.0, None)]);
        assert_eq!(engine.concentration_at(second, 0.1, dye), 1.0);
        assert_eq!(engine.concentration_at(second, 0.9, dye), 0.0);
    }

    /// Pump -> channel -> module -> channel -> ground, with the flow state
    /// imposed directly.
    fn through_module() -> (Network, FlowState, PumpId, ChannelId) {
        let mut network = Network::new();
        let n0 = network.add_node([0.0, 0.0], true);
        let n1 = network.add_node([0.0, 1e-3], false);
        let n2 = network.add_node([1e-3, 1e-3], false);
        let n3 = network.add_node([2e-3, 1e-3], false);
        let n4 = network.add_node([3e-3, 1e-3], true);
        let p = network.add_flow_rate_pump(n0, n1, 1e-11).unwrap();
        network.add_channel_with_resistance(n1, n2, geometry(), 1e12).unwrap();
        let out = network.add_channel_with_resistance(n3, n4, geometry(), 1e12).unwrap();
        network
            .add_module(
                [1e-3, 0.5e-3],
                [1e-3, 1e-3],
                "straight.stl",
                vec![
                    crate::Opening::new(n2, [-1.0, 0.0], 1e-4, 1e-4),
                    crate::Opening::new(n3, [1.0, 0.0], 1e-4, 1e-4),
                ],
            )
            .unwrap();
        network.valid().unwrap();

        let flow = FlowState {
            pressures: vec![0.0; 5],
            channel_flows: vec![1e-11, 1e-11],
            pump_flows: vec![1e-11],
            boundary_flows: vec![-1e-11, 0.0, 1e-11, -1e-11, 1e-11],
            link_flows: Vec::new(),
            boundary_nodes: Vec::new(),
        };
        (network, flow, p, out)
    }

    #[test]
    fn test_species_cross_modules() {
        let (network, flow, p, out) = through_module();
        let (mut engine, dye, full) = engine_with_dye();
        engine.inject_permanent(&network, full, InjectionTarget::Pump(p), 0.0).unwrap();

        engine.advance(&network, &flow, 0.0, 1.5).unwrap();
        assert_layout(&engine, out, &[(0.0, 0.5, Some(full)), (0.5, 1.0, None)]);

        engine.advance(&network, &flow, 1.5, 3.0).unwrap();
        assert_layout(&engine, out, &[(0.0, 1.0, Some(full))]);
        assert_eq!(engine.concentration_at(out, 0.5, dye), 1.0);
        assert_eq!(engine.node_mixture(NodeId(3)), Some(full));
    }

    #[test]
    fn test_stale_flow_state_is_rejected() {
        let (network, mut flow, _, _) = through_module();
        let mut engine = MixtureEngine::default();
        flow.pump_flows.clear();
        assert_eq!(engine.advance(&network, &flow, 0.0, 0.1), Err(TransportError::StaleFlowState));
    }

    #[test]
    fn test_injection_validation() {
        let (network, c, _) = straight();
        let (mut engine, _, full) = engine_with_dye();
        assert_eq!(
            engine.inject(&network, MixtureId(5), InjectionTarget::Channel(c), 0.5, 0.0),
            Err(TransportError::UnknownMixture(MixtureId(5)))
        );
        assert_eq!(
            engine.inject_permanent(&network, full, InjectionTarget::Pump(PumpId(3)), 0.0),
            Err(TransportError::UnknownPump(PumpId(3)))
        );
        assert!(matches!(
            engine.inject(&network, full, InjectionTarget::Channel(c), 1.5, 0.0),
            Err(TransportError::InvalidDepth(_))
        ));
        assert!(engine.injections().is_empty());
    }

    #[test]
    fn test_paint_and_coalesce() {
        let mut segments = carrier();
        paint(&mut segments, 0.2, 0.6, Some(MixtureId(0)));
        paint(&mut segments, 0.4, 0.8, Some(MixtureId(0)));
        let spans: Vec<(f64, f64)> = segments.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(spans, vec![(0.0, 0.2), (0.2, 0.8), (0.8, 1.0)]);

        let exits = outflow(&segments, 0.3, true);
        assert_eq!(exits.len(), 2);
        assert!((exits[0].1 - 0.1).abs() < 1e-15);
        shift(&mut segments, 0.3, false, None);
        assert!((segments[0].end - 0.5).abs() < 1e-15);
        assert_eq!(segments.last().unwrap().end, 1.0);
    }
}
