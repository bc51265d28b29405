//! Droplet transport.
//!
//! Droplets live in an arena and are never deleted: splitting, merging and
//! leaving the network end a droplet's life by changing its position to a
//! terminal state and linking it to its children. This keeps the branching
//! history of every fragment auditable.
//!
//! Within one macro step the engine runs an event loop over a fixed flow
//! state. Events (injections becoming due and droplet heads reaching a node)
//! are handled in increasing time order, injections first on ties, then by
//! droplet id. At a node a droplet:
//!
//! - leaves the network if the node is a sink
//! - merges with a droplet already waiting there
//! - enters the single outflow channel, or splits across several outflow
//!   channels in proportion to their flow rates
//! - waits if no channel carries flow away from the node
//!
//! Pumps are not passable for droplets.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{same_time, InjectionQueue, TransportError, TransportResult};
use crate::solvers::FlowState;
use crate::{Channel, ChannelId, Edge, FlowDirection, FluidId, FluidRegistry, Network, NodeId};

/// Identifier of a droplet in a [`DropletEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DropletId(pub usize);

/// Where a droplet is, or how it left the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DropletPosition {
    /// Scheduled for injection, centred at `center` (fraction from `node_a`)
    Pending { channel: ChannelId, center: f64 },
    /// Moving through a channel; `head` is the leading edge as a fraction
    /// from `node_a`
    InChannel { channel: ChannelId, head: f64, heading: FlowDirection },
    /// Held at a node without outflow, having arrived through `channel`
    Waiting { node: NodeId, channel: ChannelId },
    /// Split at `node`; each branch carries its volume fraction
    Bifurcation { node: NodeId, branches: Vec<(ChannelId, f64)> },
    /// Merged into another droplet
    Merged { into: DropletId },
    /// Left the network at a sink node
    Sunk { node: NodeId },
}

impl DropletPosition {
    /// True while the droplet is inside the network.
    pub fn is_active(&self) -> bool {
        matches!(self, DropletPosition::InChannel { .. } | DropletPosition::Waiting { .. })
    }
}

/// A droplet of dispersed phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Droplet {
    /// Unique identifier
    pub id: DropletId,
    /// Fluid the droplet consists of
    pub fluid: FluidId,
    /// Volume [m^3]
    pub volume: f64,
    /// Current position or terminal state
    pub position: DropletPosition,
    /// Droplets this one was split or merged from
    pub parents: Vec<DropletId>,
    /// Droplets this one was split or merged into
    pub children: Vec<DropletId>,
    /// Time the droplet was created [s]
    pub created_at: f64,
    /// Time the droplet left the network, split or merged [s]
    pub removed_at: Option<f64>,
}

impl Droplet {
    /// True while the droplet is inside the network.
    pub fn is_active(&self) -> bool {
        self.position.is_active()
    }

    /// Channel the droplet is in or arrived through.
    pub fn channel(&self) -> Option<ChannelId> {
        match self.position {
            DropletPosition::Pending { channel, .. }
            | DropletPosition::InChannel { channel, .. }
            | DropletPosition::Waiting { channel, .. } => Some(channel),
            _ => None,
        }
    }
}

/// Compact view of an active droplet for the result store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropletSnapshot {
    pub id: DropletId,
    pub fluid: FluidId,
    pub volume: f64,
    pub position: DropletPosition,
}

/// What happened to a droplet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DropletEventKind {
    Injected { channel: ChannelId },
    Entered { node: NodeId, channel: ChannelId },
    Split { node: NodeId, children: Vec<DropletId> },
    Merged { with: DropletId, into: DropletId },
    Waiting { node: NodeId },
    Reversed { channel: ChannelId },
    Sunk { node: NodeId },
}

/// A timestamped droplet event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropletEvent {
    /// Time of the event [s]
    pub time: f64,
    /// Droplet the event refers to
    pub droplet: DropletId,
    /// Event details
    pub kind: DropletEventKind,
}

/// Moves droplets through the network.
#[derive(Debug, Clone, Default)]
pub struct DropletEngine {
    droplets: Vec<Droplet>,
    queue: InjectionQueue<DropletId>,
    events: Vec<DropletEvent>,
}

fn heading_from(channel: &Channel, node: NodeId) -> FlowDirection {
    if channel.node_a == node {
        FlowDirection::Forward
    } else {
        FlowDirection::Reverse
    }
}

fn entry_head(heading: FlowDirection) -> f64 {
    match heading {
        FlowDirection::Reverse => 1.0,
        _ => 0.0,
    }
}

impl DropletEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules a droplet of `volume` centred at `center` (fraction of the
    /// channel from `node_a`), to appear at `time`.
    ///
    /// # Errors
    ///
    /// Fails if the channel or fluid is unknown, the volume is not positive,
    /// the droplet is as long as the channel or longer, or it would not fit
    /// entirely inside the channel at `center`.
    #[allow(clippy::too_many_arguments)]
    pub fn inject(
        &mut self,
        network: &Network,
        fluids: &FluidRegistry,
        fluid: FluidId,
        volume: f64,
        channel: ChannelId,
        center: f64,
        time: f64,
    ) -> TransportResult<DropletId> {
        if !time.is_finite() {
            return Err(TransportError::InvalidTime(time));
        }
        fluids.get(fluid).ok_or(TransportError::UnknownFluid(fluid))?;
        let c = network.channel(channel).ok_or(TransportError::UnknownChannel(channel))?;
        if !(volume.is_finite() && volume > 0.0) {
            return Err(TransportError::InvalidVolume(volume));
        }
        if !(center > 0.0 && center < 1.0) {
            return Err(TransportError::InvalidPosition { channel, position: center });
        }
        let capacity = c.volume();
        let length = volume / capacity;
        if length >= 1.0 {
            return Err(TransportError::DropletTooLarge { channel, volume, capacity });
        }
        if center - length / 2.0 < 0.0 || center + length / 2.0 > 1.0 {
            return Err(TransportError::InvalidPosition { channel, position: center });
        }

        let id = DropletId(self.droplets.len());
        self.droplets.push(Droplet {
            id,
            fluid,
            volume,
            position: DropletPosition::Pending { channel, center },
            parents: Vec::new(),
            children: Vec::new(),
            created_at: time,
            removed_at: None,
        });
        self.queue.push(time, id);
        debug!(droplet = id.0, channel = channel.0, volume, time, "droplet scheduled");
        Ok(id)
    }

    /// Merges two active droplets into a new one at the position of `a`.
    ///
    /// The new droplet's fluid is the volume-weighted mixture of both fluids.
    pub fn merge(
        &mut self,
        fluids: &mut FluidRegistry,
        a: DropletId,
        b: DropletId,
        time: f64,
    ) -> TransportResult<DropletId> {
        for id in [a, b] {
            let droplet = self.droplets.get(id.0).ok_or(TransportError::UnknownDroplet(id))?;
            if !droplet.is_active() {
                return Err(TransportError::Inactive(id));
            }
        }
        if a == b {
            return Err(TransportError::Inactive(b));
        }
        Ok(self.merge_unchecked(fluids, a, b, time))
    }

    fn merge_unchecked(&mut self, fluids: &mut FluidRegistry, a: DropletId, b: DropletId, time: f64) -> DropletId {
        let (da, db) = (&self.droplets[a.0], &self.droplets[b.0]);
        let fluid = fluids.mix(da.fluid, da.volume, db.fluid, db.volume);
        let volume = da.volume + db.volume;
        let position = da.position.clone();

        let id = DropletId(self.droplets.len());
        self.droplets.push(Droplet {
            id,
            fluid,
            volume,
            position,
            parents: vec![a, b],
            children: Vec::new(),
            created_at: time,
            removed_at: None,
        });
        for (old, other) in [(a, b), (b, a)] {
            let droplet = &mut self.droplets[old.0];
            droplet.position = DropletPosition::Merged { into: id };
            droplet.children = vec![id];
            droplet.removed_at = Some(time);
            self.events.push(DropletEvent {
                time,
                droplet: old,
                kind: DropletEventKind::Merged { with: other, into: id },
            });
        }
        debug!(a = a.0, b = b.0, into = id.0, volume, "droplets merged");
        id
    }

    /// Moves all droplets from `from` to `to` through the finalized `flow`.
    pub fn advance(
        &mut self,
        network: &Network,
        flow: &FlowState,
        fluids: &mut FluidRegistry,
        from: f64,
        to: f64,
    ) -> TransportResult<()> {
        if flow.channel_flows.len() != network.channel_count()
            || flow.pressures.len() != network.node_count()
            || flow.pump_flows.len() != network.pump_count()
        {
            return Err(TransportError::StaleFlowState);
        }
        let mut now = from;
        self.align_headings(network, flow, now);

        let waiting: Vec<(DropletId, NodeId, ChannelId)> = self
            .droplets
            .iter()
            .filter_map(|d| match d.position {
                DropletPosition::Waiting { node, channel } => Some((d.id, node, channel)),
                _ => None,
            })
            .collect();
        for (id, node, channel) in waiting {
            if self.droplets[id.0].is_active() {
                self.route(network, flow, id, node, channel, now);
            }
        }

        loop {
            let arrivals = self.arrivals(network, flow, now);
            let next_arrival = arrivals.iter().map(|(t, _)| *t).min_by(f64::total_cmp);
            let next_injection = self.queue.next_time().filter(|t| *t <= to).map(|t| t.max(now));
            let next = match (next_arrival, next_injection) {
                (Some(a), Some(i)) => a.min(i),
                (Some(a), None) => a,
                (None, Some(i)) => i,
                (None, None) => break,
            };
            if next > to {
                break;
            }

            self.move_all(network, flow, next - now);
            now = next;

            for (_, id) in self.queue.pop_due(now) {
                self.activate(network, flow, id, now);
            }

            let mut due: Vec<(f64, DropletId)> =
                arrivals.into_iter().filter(|(t, _)| same_time(*t, now)).collect();
            due.sort_by(|x, y| x.0.total_cmp(&y.0).then(x.1.cmp(&y.1)));
            for (_, id) in due {
                self.arrive(network, flow, fluids, id, now);
            }
        }
        self.move_all(network, flow, to - now);
        Ok(())
    }

    fn activate(&mut self, network: &Network, flow: &FlowState, id: DropletId, time: f64) {
        let DropletPosition::Pending { channel, center } = self.droplets[id.0].position else {
            return;
        };
        let Some(c) = network.channel(channel) else {
            return;
        };
        let length = self.droplets[id.0].volume / c.volume();
        let heading = match flow.direction(channel) {
            FlowDirection::Reverse => FlowDirection::Reverse,
            _ => FlowDirection::Forward,
        };
        let head = match heading {
            FlowDirection::Reverse => center - length / 2.0,
            _ => center + length / 2.0,
        };
        let droplet = &mut self.droplets[id.0];
        droplet.position = DropletPosition::InChannel { channel, head, heading };
        droplet.created_at = time;
        self.events.push(DropletEvent { time, droplet: id, kind: DropletEventKind::Injected { channel } });
    }

    /// Turns droplets around in channels whose flow reversed; the former
    /// trailing edge becomes the leading edge.
    fn align_headings(&mut self, network: &Network, flow: &FlowState, time: f64) {
        for droplet in &mut self.droplets {
            let DropletPosition::InChannel { channel, head, heading } = droplet.position else {
                continue;
            };
            let direction = flow.direction(channel);
            if direction == FlowDirection::Stagnant || direction == heading {
                continue;
            }
            let Some(c) = network.channel(channel) else {
                continue;
            };
            let length = droplet.volume / c.volume();
            let head = match direction {
                FlowDirection::Forward => head + length,
                _ => head - length,
            };
            droplet.position =
                DropletPosition::InChannel { channel, head: head.clamp(0.0, 1.0), heading: direction };
            self.events.push(DropletEvent {
                time,
                droplet: droplet.id,
                kind: DropletEventKind::Reversed { channel },
            });
        }
    }

    /// Fraction of `channel` travelled per second.
    fn rate(network: &Network, flow: &FlowState, channel: ChannelId, heading: FlowDirection) -> f64 {
        match network.channel(channel) {
            Some(c) if flow.direction(channel) == heading => flow.flow_rate(channel).abs() / c.volume(),
            _ => 0.0,
        }
    }

    /// Times at which moving droplets reach the end of their channel.
    fn arrivals(&self, network: &Network, flow: &FlowState, now: f64) -> Vec<(f64, DropletId)> {
        self.droplets
            .iter()
            .filter_map(|d| {
                let DropletPosition::InChannel { channel, head, heading } = d.position else {
                    return None;
                };
                let rate = Self::rate(network, flow, channel, heading);
                if rate <= 0.0 {
                    return None;
                }
                let remaining = match heading {
                    FlowDirection::Reverse => head,
                    _ => 1.0 - head,
                };
                Some((now + remaining.max(0.0) / rate, d.id))
            })
            .collect()
    }

    fn move_all(&mut self, network: &Network, flow: &FlowState, dt: f64) {
        if dt <= 0.0 {
            return;
        }
        for droplet in &mut self.droplets {
            if let DropletPosition::InChannel { channel, head, heading } = &mut droplet.position {
                let distance = Self::rate(network, flow, *channel, *heading) * dt;
                *head = match heading {
                    FlowDirection::Reverse => *head - distance,
                    _ => *head + distance,
                }
                .clamp(0.0, 1.0);
            }
        }
    }

    fn arrive(
        &mut self,
        network: &Network,
        flow: &FlowState,
        fluids: &mut FluidRegistry,
        id: DropletId,
        time: f64,
    ) {
        let DropletPosition::InChannel { channel, heading, .. } = self.droplets[id.0].position else {
            return;
        };
        let Some(c) = network.channel(channel) else {
            return;
        };
        let node = match heading {
            FlowDirection::Reverse => c.node_a,
            _ => c.node_b,
        };

        if network.node(node).is_some_and(|n| n.sink) {
            let droplet = &mut self.droplets[id.0];
            droplet.position = DropletPosition::Sunk { node };
            droplet.removed_at = Some(time);
            self.events.push(DropletEvent { time, droplet: id, kind: DropletEventKind::Sunk { node } });
            debug!(droplet = id.0, node = node.0, time, "droplet left the network");
            return;
        }

        let waiting = self.droplets.iter().find(|d| {
            d.id != id && matches!(d.position, DropletPosition::Waiting { node: n, .. } if n == node)
        });
        if let Some(waiting) = waiting.map(|d| d.id) {
            self.merge_unchecked(fluids, waiting, id, time);
            return;
        }

        self.route(network, flow, id, node, channel, time);
    }

    /// Sends a droplet standing at `node` into the channels carrying flow
    /// away from it.
    fn route(
        &mut self,
        network: &Network,
        flow: &FlowState,
        id: DropletId,
        node: NodeId,
        from: ChannelId,
        time: f64,
    ) {
        let outflows: Vec<(&Channel, f64)> = network
            .links(node)
            .iter()
            .filter_map(|link| match link.edge {
                Edge::Channel(c) if c != from => network.channel(c),
                _ => None,
            })
            .filter_map(|c| {
                let q = flow.flow_rate(c.id);
                let leaving = (c.node_a == node && q > 0.0) || (c.node_b == node && q < 0.0);
                leaving.then_some((c, q.abs()))
            })
            .collect();

        match outflows.as_slice() {
            [] => {
                let was_waiting = matches!(self.droplets[id.0].position, DropletPosition::Waiting { .. });
                self.droplets[id.0].position = DropletPosition::Waiting { node, channel: from };
                if !was_waiting {
                    warn!(droplet = id.0, node = node.0, time, "droplet stalled at node without outflow");
                    self.events.push(DropletEvent { time, droplet: id, kind: DropletEventKind::Waiting { node } });
                }
            }
            [(c, _)] => {
                let heading = heading_from(c, node);
                self.droplets[id.0].position =
                    DropletPosition::InChannel { channel: c.id, head: entry_head(heading), heading };
                self.events.push(DropletEvent {
                    time,
                    droplet: id,
                    kind: DropletEventKind::Entered { node, channel: c.id },
                });
            }
            branches => {
                let total: f64 = branches.iter().map(|(_, q)| q).sum();
                let parent = &self.droplets[id.0];
                let (volume, fluid) = (parent.volume, parent.fluid);
                let mut assigned = 0.0;
                let mut children = Vec::with_capacity(branches.len());
                for (i, (c, q)) in branches.iter().enumerate() {
                    let share = if i + 1 == branches.len() { volume - assigned } else { volume * q / total };
                    assigned += share;
                    let heading = heading_from(c, node);
                    let child = DropletId(self.droplets.len());
                    self.droplets.push(Droplet {
                        id: child,
                        fluid,
                        volume: share,
                        position: DropletPosition::InChannel {
                            channel: c.id,
                            head: entry_head(heading),
                            heading,
                        },
                        parents: vec![id],
                        children: Vec::new(),
                        created_at: time,
                        removed_at: None,
                    });
                    children.push(child);
                }
                let parent = &mut self.droplets[id.0];
                parent.position = DropletPosition::Bifurcation {
                    node,
                    branches: branches.iter().map(|(c, q)| (c.id, q / total)).collect(),
                };
                parent.children = children.clone();
                parent.removed_at = Some(time);
                debug!(droplet = id.0, node = node.0, branches = children.len(), "droplet split");
                self.events.push(DropletEvent { time, droplet: id, kind: DropletEventKind::Split { node, children } });
            }
        }
    }

    /// Gets a droplet by id.
    pub fn droplet(&self, id: DropletId) -> Option<&Droplet> {
        self.droplets.get(id.0)
    }

    /// Every droplet ever created, indexed by id.
    pub fn droplets(&self) -> &[Droplet] {
        &self.droplets
    }

    /// Droplets currently inside the network.
    pub fn active(&self) -> impl Iterator<Item = &Droplet> {
        self.droplets.iter().filter(|d| d.is_active())
    }

    /// Number of injections not yet due.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Event log in processing order.
    pub fn events(&self) -> &[DropletEvent] {
        &self.events
    }

    /// Total volume inside the network and scheduled for injection [m^3].
    pub fn total_volume(&self) -> f64 {
        self.droplets
            .iter()
            .filter(|d| d.is_active() || matches!(d.position, DropletPosition::Pending { .. }))
            .map(|d| d.volume)
            .sum()
    }

    /// Snapshot of all active droplets.
    pub fn snapshot(&self) -> Vec<DropletSnapshot> {
        self.active()
            .map(|d| DropletSnapshot { id: d.id, fluid: d.fluid, volume: d.volume, position: d.position.clone() })
            .collect()
    }
}
