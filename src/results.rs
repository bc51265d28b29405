//! Finalized simulation states indexed by time.
//!
//! The store is append-only: every macro step adds one [`SimulationState`]
//! with a strictly later time than the previous one. Readers query by step
//! or by time and may serialize the whole history to JSON.

use serde::{Deserialize, Serialize};

use crate::solvers::coupling::CouplingState;
use crate::solvers::FlowState;
use crate::transport::{ChannelFronts, DropletSnapshot};

/// Result type for result store operations.
pub type StoreResult<T> = Result<T, ResultError>;

/// Errors raised by the [`ResultStore`].
#[derive(Debug, thiserror::Error)]
pub enum ResultError {
    #[error("State at time {time} does not follow the last recorded time {last}")]
    NonMonotonicTime { time: f64, last: f64 },
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Everything known about the network at the end of one macro step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationState {
    /// Macro step number, starting at 1
    pub step: usize,
    /// Simulated time at the end of the step [s]
    pub time: f64,
    /// Finalized flow field
    pub flow: FlowState,
    /// False if the coupling ran out of iterations
    pub converged: bool,
    /// Coupling iterations performed
    pub coupling_iterations: usize,
    /// Residual of the last coupling iteration
    pub coupling_residual: f64,
    /// Per-iteration coupling snapshots; empty without modules
    pub coupling: Vec<CouplingState>,
    /// Droplets inside the network
    pub droplets: Vec<DropletSnapshot>,
    /// Mixture segments per channel
    pub mixtures: Vec<ChannelFronts>,
}

/// Append-only history of finalized states.
///
/// # Examples
///
/// ```
/// use microflow::results::ResultStore;
///
/// let store = ResultStore::new();
/// assert!(store.is_empty());
/// assert!(store.at_time(1.0).is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultStore {
    states: Vec<SimulationState>,
}

impl ResultStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a finalized state and returns the stored copy.
    ///
    /// # Errors
    ///
    /// Rejects states whose time does not lie strictly after the last one.
    pub fn push(&mut self, state: SimulationState) -> StoreResult<&SimulationState> {
        let last = self.states.last().map_or(f64::NEG_INFINITY, |s| s.time);
        if !(state.time > last) {
            return Err(ResultError::NonMonotonicTime { time: state.time, last });
        }
        self.states.push(state);
        Ok(&self.states[self.states.len() - 1])
    }

    /// All states in time order.
    pub fn states(&self) -> &[SimulationState] {
        &self.states
    }

    /// Number of recorded states.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Most recent state.
    pub fn last(&self) -> Option<&SimulationState> {
        self.states.last()
    }

    /// State recorded for macro step `step`.
    pub fn step(&self, step: usize) -> Option<&SimulationState> {
        self.states.iter().find(|s| s.step == step)
    }

    /// Latest state finalized at or before `time`.
    pub fn at_time(&self, time: f64) -> Option<&SimulationState> {
        let after = self.states.partition_point(|s| s.time <= time);
        after.checked_sub(1).map(|i| &self.states[i])
    }

    /// Step numbers whose coupling did not converge.
    pub fn non_converged_steps(&self) -> Vec<usize> {
        self.states.iter().filter(|s| !s.converged).map(|s| s.step).collect()
    }

    /// Serializes the whole history.
    pub fn to_json(&self) -> StoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restores a history written by [`ResultStore::to_json`].
    ///
    /// # Errors
    ///
    /// Fails on malformed input or on states out of time order.
    pub fn from_json(json: &str) -> StoreResult<Self> {
        let parsed: ResultStore = serde_json::from_str(json)?;
        let mut store = ResultStore::new();
        for state in parsed.states {
            store.push(state)?;
        }
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DropletId, DropletPosition, MixtureSegment};
    use crate::{ChannelId, FluidId, NodeId};

    fn state(step: usize, time: f64, converged: bool) -> SimulationState {
        SimulationState {
            step,
            time,
            flow: FlowState {
                pressures: vec![0.0, 10.0 * time],
                channel_flows: vec![1e-11],
                pump_flows: vec![1e-11],
                boundary_flows: vec![-1e-11, 0.0],
                link_flows: Vec::new(),
                boundary_nodes: vec![NodeId(0)],
            },
            converged,
            coupling_iterations: if converged { 3 } else { 100 },
            coupling_residual: if converged { 1e-7 } else { 1e-3 },
            coupling: Vec::new(),
            droplets: vec![DropletSnapshot {
                id: DropletId(0),
                fluid: FluidId(1),
                volume: 1e-13,
                position: DropletPosition::InChannel {
                    channel: ChannelId(0),
                    head: 0.5,
                    heading: crate::FlowDirection::Forward,
                },
            }],
            mixtures: vec![ChannelFronts {
                channel: ChannelId(0),
                segments: vec![MixtureSegment { start: 0.0, end: 1.0, mixture: None }],
            }],
        }
    }

    #[test]
    fn test_rejects_non_monotonic_time() {
        let mut store = ResultStore::new();
        store.push(state(1, 0.1, true)).unwrap();
        assert!(matches!(
            store.push(state(2, 0.1, true)),
            Err(ResultError::NonMonotonicTime { .. })
        ));
        assert!(store.push(state(2, f64::NAN, true)).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_query_by_time_and_step() {
        let mut store = ResultStore::new();
        for (i, t) in [0.1, 0.2, 0.3].iter().enumerate() {
            store.push(state(i + 1, *t, i != 1)).unwrap();
        }

        assert!(store.at_time(0.05).is_none());
        assert_eq!(store.at_time(0.1).unwrap().step, 1);
        assert_eq!(store.at_time(0.25).unwrap().step, 2);
        assert_eq!(store.at_time(10.0).unwrap().step, 3);
        assert_eq!(store.step(2).unwrap().time, 0.2);
        assert_eq!(store.non_converged_steps(), vec![2]);
        assert_eq!(store.last().unwrap().step, 3);
    }

    #[test]
    fn test_json_keeps_history() {
        let mut store = ResultStore::new();
        store.push(state(1, 0.5, true)).unwrap();
        store.push(state(2, 1.0, false)).unwrap();

        let json = store.to_json().unwrap();
        let restored = ResultStore::from_json(&json).unwrap();
        assert_eq!(restored, store);
        assert!(matches!(ResultStore::from_json("{"), Err(ResultError::Serialization(_))));
    }
}
