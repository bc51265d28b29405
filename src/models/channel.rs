//! Channels: the resistive edges of the abstract network.
//!
//! A channel joins two nodes and carries a cross-section geometry. Its
//! hydraulic resistance is either fixed at construction or derived from a
//! [`ResistanceModel`] and cached until the geometry or the fluid changes.

use serde::{Deserialize, Serialize};

use super::resistance::ResistanceModel;
use crate::{ChannelId, NodeId};

/// Cross-section shape of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CrossSection {
    /// Rectangular duct with width and height [m]
    Rectangular { width: f64, height: f64 },
    /// Circular pipe with radius [m]
    Circular { radius: f64 },
}

impl CrossSection {
    /// Cross-sectional area [m^2].
    pub fn area(&self) -> f64 {
        match *self {
            CrossSection::Rectangular { width, height } => width * height,
            CrossSection::Circular { radius } => std::f64::consts::PI * radius * radius,
        }
    }

    fn is_valid(&self) -> bool {
        match *self {
            CrossSection::Rectangular { width, height } => {
                width.is_finite() && height.is_finite() && width > 0.0 && height > 0.0
            }
            CrossSection::Circular { radius } => radius.is_finite() && radius > 0.0,
        }
    }
}

/// Geometry of a straight channel segment.
///
/// # Examples
///
/// ```
/// use microflow::models::ChannelGeometry;
///
/// let geometry = ChannelGeometry::rectangular(100e-6, 30e-6, 1e-3);
/// assert!((geometry.volume() - 3e-12).abs() < 1e-24);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelGeometry {
    /// Channel length [m]
    pub length: f64,
    /// Cross-section shape
    pub cross_section: CrossSection,
}

impl ChannelGeometry {
    /// Rectangular channel of the given width, height and length [m].
    pub fn rectangular(width: f64, height: f64, length: f64) -> Self {
        ChannelGeometry { length, cross_section: CrossSection::Rectangular { width, height } }
    }

    /// Circular channel of the given radius and length [m].
    pub fn circular(radius: f64, length: f64) -> Self {
        ChannelGeometry { length, cross_section: CrossSection::Circular { radius } }
    }

    /// Cross-sectional area [m^2].
    pub fn area(&self) -> f64 {
        self.cross_section.area()
    }

    /// Internal volume [m^3].
    pub fn volume(&self) -> f64 {
        self.area() * self.length
    }

    /// True when every dimension is finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        self.length.is_finite() && self.length > 0.0 && self.cross_section.is_valid()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct CachedResistance {
    model: &'static str,
    viscosity: f64,
    value: f64,
}

/// A channel between two nodes of the network.
#[derive(Debug, Clone)]
pub struct Channel {
    /// Unique identifier
    pub id: ChannelId,
    /// First endpoint; positive flow runs from `node_a` to `node_b`
    pub node_a: NodeId,
    /// Second endpoint
    pub node_b: NodeId,
    geometry: ChannelGeometry,
    fixed_resistance: Option<f64>,
    cached: Option<CachedResistance>,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, node_a: NodeId, node_b: NodeId, geometry: ChannelGeometry) -> Self {
        Channel { id, node_a, node_b, geometry, fixed_resistance: None, cached: None }
    }

    pub(crate) fn with_fixed_resistance(mut self, resistance: f64) -> Self {
        self.fixed_resistance = Some(resistance);
        self
    }

    /// Channel geometry.
    pub fn geometry(&self) -> &ChannelGeometry {
        &self.geometry
    }

    /// Replaces the geometry and drops any cached resistance.
    pub fn set_geometry(&mut self, geometry: ChannelGeometry) {
        self.geometry = geometry;
        self.cached = None;
    }

    /// Internal volume [m^3].
    pub fn volume(&self) -> f64 {
        self.geometry.volume()
    }

    /// Cross-sectional area [m^2].
    pub fn area(&self) -> f64 {
        self.geometry.area()
    }

    /// True if the resistance was fixed at construction.
    pub fn has_fixed_resistance(&self) -> bool {
        self.fixed_resistance.is_some()
    }

    /// Current hydraulic resistance [Pa*s/m^3], if known.
    ///
    /// Returns the fixed resistance, or the cached model value. `None` means
    /// the resistance has not been evaluated since the last invalidation.
    pub fn resistance(&self) -> Option<f64> {
        self.fixed_resistance.or(self.cached.map(|c| c.value))
    }

    /// Evaluates the resistance with `model`, reusing the cache when the model
    /// and viscosity are unchanged. Returns true if a new value was computed.
    pub fn update_resistance(&mut self, model: &dyn ResistanceModel, viscosity: f64) -> bool {
        if self.fixed_resistance.is_some() {
            return false;
        }
        if let Some(cached) = self.cached {
            if cached.model == model.name() && cached.viscosity == viscosity {
                return false;
            }
        }
        let value = model.resistance(&self.geometry, viscosity);
        self.cached = Some(CachedResistance { model: model.name(), viscosity, value });
        true
    }

    /// Drops the cached resistance.
    pub fn invalidate_resistance(&mut self) {
        self.cached = None;
    }

    /// Endpoint opposite to `node`, or `None` if `node` is not an endpoint.
    pub fn other_node(&self, node: NodeId) -> Option<NodeId> {
        if node == self.node_a {
            Some(self.node_b)
        } else if node == self.node_b {
            Some(self.node_a)
        } else {
            None
        }
    }

    /// True if `node` is one of the endpoints.
    pub fn connects(&self, node: NodeId) -> bool {
        self.node_a == node || self.node_b == node
    }
}
