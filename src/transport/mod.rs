//! Transport of droplets and dissolved species over finalized flow states.
//!
//! Both engines consume one [`FlowState`](crate::solvers::FlowState) per
//! macro step and never feed back into the flow solve:
//!
//! - [`droplet`]: discrete droplets moved along channels, split at
//!   bifurcations, merged at nodes and removed at sinks
//! - [`mixture`]: piecewise-constant mixture segments advected through
//!   channels and mixed at junctions
//!
//! Injections for both engines are scheduled through an [`InjectionQueue`]
//! and become active once simulated time reaches them.

use serde::{Deserialize, Serialize};

use crate::{ChannelId, FluidId, PumpId};

pub mod droplet;
pub mod mixture;

pub use droplet::{
    Droplet, DropletEngine, DropletEvent, DropletEventKind, DropletId, DropletPosition, DropletSnapshot,
};
pub use mixture::{
    ChannelFronts, DominantInflowMixing, InjectionKind, InjectionTarget, InstantaneousMixing, Mixture,
    MixtureEngine, MixtureId, MixtureInjection, MixtureRegistry, MixtureSegment, MixingModel, Species,
    SpeciesId,
};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised by the transport engines.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Unknown channel {0:?}")]
    UnknownChannel(ChannelId),
    #[error("Unknown pump {0:?}")]
    UnknownPump(PumpId),
    #[error("Unknown droplet {0:?}")]
    UnknownDroplet(DropletId),
    #[error("Unknown fluid {0:?}")]
    UnknownFluid(FluidId),
    #[error("Unknown mixture {0:?}")]
    UnknownMixture(MixtureId),
    #[error("Unknown species {0:?}")]
    UnknownSpecies(SpeciesId),
    #[error("Invalid position {position} in channel {channel:?}")]
    InvalidPosition { channel: ChannelId, position: f64 },
    #[error("Invalid injection depth {0}, expected a fraction in (0, 1]")]
    InvalidDepth(f64),
    #[error("Invalid volume {0}")]
    InvalidVolume(f64),
    #[error("Droplet of {volume:e} m^3 does not fit into channel {channel:?} of {capacity:e} m^3")]
    DropletTooLarge { channel: ChannelId, volume: f64, capacity: f64 },
    #[error("Invalid concentration {value} of species {species:?}")]
    InvalidConcentration { species: SpeciesId, value: f64 },
    #[error("Invalid injection time {0}")]
    InvalidTime(f64),
    #[error("Droplet {0:?} is not in the network")]
    Inactive(DropletId),
    #[error("Flow state does not match the network")]
    StaleFlowState,
}

/// Time-ordered queue of scheduled injections.
///
/// Items due at the same time are released in insertion order.
///
/// # Examples
///
/// ```
/// use microflow::transport::InjectionQueue;
///
/// let mut queue = InjectionQueue::new();
/// queue.push(2.0, "late");
/// queue.push(1.0, "early");
/// queue.push(1.0, "early too");
///
/// assert_eq!(queue.next_time(), Some(1.0));
/// assert_eq!(queue.pop_due(1.5), vec![(1.0, "early"), (1.0, "early too")]);
/// assert_eq!(queue.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionQueue<T> {
    entries: Vec<(f64, T)>,
}

impl<T> Default for InjectionQueue<T> {
    fn default() -> Self {
        InjectionQueue { entries: Vec::new() }
    }
}

impl<T> InjectionQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `item` at `time`.
    pub fn push(&mut self, time: f64, item: T) {
        let at = self.entries.partition_point(|(t, _)| t.total_cmp(&time).is_le());
        self.entries.insert(at, (time, item));
    }

    /// Time of the earliest scheduled item.
    pub fn next_time(&self) -> Option<f64> {
        self.entries.first().map(|(t, _)| *t)
    }

    /// Removes and returns every item scheduled at or before `time`.
    pub fn pop_due(&mut self, time: f64) -> Vec<(f64, T)> {
        let due = self.entries.partition_point(|(t, _)| *t <= time);
        self.entries.drain(..due).collect()
    }

    /// Scheduled items in release order.
    pub fn iter(&self) -> impl Iterator<Item = &(f64, T)> {
        self.entries.iter()
    }

    /// Number of scheduled items.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is scheduled.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Two event times closer than this (relative to their magnitude) coincide.
pub(crate) fn same_time(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
}
