//! Hydraulic resistance models.
//!
//! A resistance model maps channel geometry and fluid viscosity to the
//! hydraulic resistance used by the nodal solver. Models are selected per
//! simulation; the solver only ever reads the resulting values.
//!
//! - [`RectangularModel`]: closed-form series solution for a rectangular duct
//! - [`PoiseuilleModel`]: simplified parallel-plate / Hagen-Poiseuille law

use std::f64::consts::PI;
use std::fmt;

use super::channel::{ChannelGeometry, CrossSection};

/// Maps channel geometry and viscosity to a hydraulic resistance.
///
/// Implementations must be pure: the same inputs always give the same value.
/// The returned resistance is in [Pa*s/m^3].
///
/// # Examples
///
/// ```
/// use microflow::models::{ChannelGeometry, ResistanceModel, RectangularModel};
///
/// let geometry = ChannelGeometry::rectangular(100e-6, 100e-6, 1e-3);
/// let r = RectangularModel.resistance(&geometry, 1e-3);
/// assert!(r > 0.0);
/// ```
pub trait ResistanceModel: fmt::Debug + Send + Sync {
    /// Stable identifier, used as part of the resistance cache key.
    fn name(&self) -> &'static str;

    /// Resistance of a channel with `geometry` filled with a fluid of
    /// dynamic viscosity `viscosity` [Pa*s].
    fn resistance(&self, geometry: &ChannelGeometry, viscosity: f64) -> f64;
}

/// Hagen-Poiseuille resistance of a circular pipe.
fn circular_resistance(radius: f64, length: f64, viscosity: f64) -> f64 {
    8.0 * viscosity * length / (PI * radius.powi(4))
}

/// Rectangular duct resistance from the first term of the Fourier series
/// solution.
///
/// For a duct of width `w` and height `h` (with `h <= w`):
///
/// `R = a * mu * L / (w * h^3)` with
/// `a = 12 / (1 - 192 * h * tanh(pi * w / (2h)) / (pi^5 * w))`.
///
/// Circular cross-sections fall back to Hagen-Poiseuille.
#[derive(Debug, Clone, Copy, Default)]
pub struct RectangularModel;

impl RectangularModel {
    /// Geometry factor `a` for a duct with `height <= width`.
    pub fn factor(width: f64, height: f64) -> f64 {
        12.0 / (1.0 - 192.0 * height * (PI * width / (2.0 * height)).tanh() / (PI.powi(5) * width))
    }
}

impl ResistanceModel for RectangularModel {
    fn name(&self) -> &'static str {
        "rectangular"
    }

    fn resistance(&self, geometry: &ChannelGeometry, viscosity: f64) -> f64 {
        match geometry.cross_section {
            CrossSection::Rectangular { width, height } => {
                let (w, h) = if height <= width { (width, height) } else { (height, width) };
                Self::factor(w, h) * viscosity * geometry.length / (w * h.powi(3))
            }
            CrossSection::Circular { radius } => {
                circular_resistance(radius, geometry.length, viscosity)
            }
        }
    }
}

/// Simplified Poiseuille resistance.
///
/// Rectangular ducts use the parallel-plate limit `R = 12 * mu * L / (w * h^3)`
/// with `h` the smaller dimension. Circular pipes use Hagen-Poiseuille.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoiseuilleModel;

impl ResistanceModel for PoiseuilleModel {
    fn name(&self) -> &'static str {
        "poiseuille"
    }

    fn resistance(&self, geometry: &ChannelGeometry, viscosity: f64) -> f64 {
        match geometry.cross_section {
            CrossSection::Rectangular { width, height } => {
                let (w, h) = if height <= width { (width, height) } else { (height, width) };
                12.0 * viscosity * geometry.length / (w * h.powi(3))
            }
            CrossSection::Circular { radius } => {
                circular_resistance(radius, geometry.length, viscosity)
            }
        }
    }
}

/// Built-in resistance models, selectable by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResistanceModelKind {
    /// [`RectangularModel`]
    #[default]
    Rectangular,
    /// [`PoiseuilleModel`]
    Poiseuille,
}

impl ResistanceModelKind {
    /// Instantiates the selected model.
    pub fn build(self) -> Box<dyn ResistanceModel> {
        match self {
            ResistanceModelKind::Rectangular => Box::new(RectangularModel),
            ResistanceModelKind::Poiseuille => Box::new(PoiseuilleModel),
        }
    }
}
