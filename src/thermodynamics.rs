//! Fluid properties from CoolProp via rfluids.
//!
//! The network only needs two properties per fluid: density and dynamic
//! viscosity. This module evaluates both for a CoolProp substance at a given
//! pressure and temperature and turns them into a [`Fluid`](crate::Fluid)
//! ready for the [`FluidRegistry`](crate::FluidRegistry).
//!
//! # Example
//!
//! ```ignore
//! use microflow::FluidRegistry;
//! use microflow::thermodynamics::{Substance, fluids::Pure};
//!
//! let mut fluids = FluidRegistry::new();
//! let water = Substance::Pure(Pure::Water).register(&mut fluids, 101325.0, 293.15)?;
//! assert!(fluids.get(water).unwrap().viscosity > 9e-4);
//! ```
//!
//! # Implementation Notes
//!
//! rfluids uses a typestate pattern: a `Fluid<Undefined>` built from a
//! substance becomes a `Fluid<Defined>` once its state is fixed with
//! `.in_state()`. Incompressible binary mixtures (glycol-water and the like)
//! go through CoolProp's INCOMP backend, which only covers a limited
//! temperature range per mixture.

use rfluids::prelude::*;

use crate::{FluidId, FluidRegistry};

/// Result type for property evaluation.
pub type ThermoResult<T> = Result<T, ThermoError>;

/// Errors that can occur while evaluating fluid properties.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThermoError {
    /// Invalid input conditions (e.g. negative temperature)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// CoolProp could not fix the requested state
    #[error("State at {pressure} Pa and {temperature} K could not be evaluated")]
    StateFailed { pressure: f64, temperature: f64 },
    /// Property not available for this substance/state
    #[error("Property not available: {0}")]
    PropertyNotAvailable(&'static str),
}

/// A CoolProp substance usable as a continuous or dispersed phase.
#[derive(Debug, Clone)]
pub enum Substance {
    /// Pure component fluid
    Pure(Pure),
    /// Incompressible binary mixture (e.g. propylene glycol in water)
    BinaryMix(BinaryMix),
}

impl Substance {
    /// Binary mixture of `kind` at the given fraction.
    pub fn binary(kind: BinaryMixKind, fraction: f64) -> ThermoResult<Self> {
        let binary = kind.with_fraction(fraction).map_err(|_| {
            ThermoError::InvalidInput(format!("Invalid fraction {} for {:?}", fraction, kind))
        })?;
        Ok(Substance::BinaryMix(binary))
    }

    /// Name used for the registered fluid.
    pub fn name(&self) -> String {
        match self {
            Substance::Pure(pure) => format!("{:?}", pure),
            Substance::BinaryMix(binary) => format!("{:?}", binary),
        }
    }

    fn to_rfluids_fluid(&self) -> rfluids::fluid::Fluid<Undefined> {
        match self {
            Substance::Pure(pure) => rfluids::fluid::Fluid::from(*pure),
            Substance::BinaryMix(binary) => rfluids::fluid::Fluid::from(*binary),
        }
    }

    /// Density and dynamic viscosity at `pressure` [Pa] and `temperature` [K].
    pub fn properties(&self, pressure: f64, temperature: f64) -> ThermoResult<Properties> {
        if !(pressure > 0.0 && temperature > 0.0) {
            return Err(ThermoError::InvalidInput(
                "Pressure and temperature must be positive".to_string(),
            ));
        }
        let mut state = self
            .to_rfluids_fluid()
            .in_state(FluidInput::pressure(pressure), FluidInput::temperature(temperature))
            .map_err(|_| ThermoError::StateFailed { pressure, temperature })?;

        Ok(Properties {
            pressure,
            temperature,
            density: state.density().map_err(|_| ThermoError::PropertyNotAvailable("density"))?,
            viscosity: state
                .dynamic_viscosity()
                .map_err(|_| ThermoError::PropertyNotAvailable("dynamic viscosity"))?,
        })
    }

    /// Evaluates the substance and registers it as a fluid.
    pub fn register(&self, fluids: &mut FluidRegistry, pressure: f64, temperature: f64) -> ThermoResult<FluidId> {
        let props = self.properties(pressure, temperature)?;
        Ok(fluids.add(props.to_fluid(&self.name())))
    }
}

/// Transport-relevant properties at one state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Properties {
    /// Pressure [Pa]
    pub pressure: f64,
    /// Temperature [K]
    pub temperature: f64,
    /// Density [kg/m^3]
    pub density: f64,
    /// Dynamic viscosity [Pa*s]
    pub viscosity: f64,
}

impl Properties {
    /// Kinematic viscosity [m^2/s].
    pub fn kinematic_viscosity(&self) -> f64 {
        self.viscosity / self.density
    }

    /// Converts to a network fluid named `name`.
    pub fn to_fluid(&self, name: &str) -> crate::Fluid {
        crate::Fluid::new(name, self.density, self.viscosity)
    }
}

/// Substances available in the CoolProp database.
pub mod fluids {
    /// Pure fluids: `Pure::Water`, `Pure::Ethanol`, ...
    pub use rfluids::prelude::Pure;

    /// Incompressible binary mixtures: `BinaryMixKind::MPG`, `BinaryMixKind::MEG`, ...
    pub use rfluids::prelude::BinaryMixKind;
}
