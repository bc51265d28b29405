//! Fluids carried by the network.
//!
//! The continuous phase fixes the viscosity used by the resistance model;
//! droplets each reference the fluid they are made of. Merging droplets of
//! different fluids registers a new, volume-weighted fluid.

use serde::{Deserialize, Serialize};

/// Identifier of a fluid in a [`FluidRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FluidId(pub usize);

/// A Newtonian fluid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fluid {
    /// Name of the fluid
    pub name: String,
    /// Density [kg/m^3]
    pub density: f64,
    /// Dynamic viscosity [Pa*s]
    pub viscosity: f64,
}

impl Fluid {
    /// Creates a fluid with the given density and viscosity.
    pub fn new(name: &str, density: f64, viscosity: f64) -> Self {
        Fluid { name: name.to_string(), density, viscosity }
    }

    /// Water at 20 degC.
    pub fn water() -> Self {
        Fluid::new("water", 998.2, 1.0016e-3)
    }
}

/// Arena of fluids referenced by id.
///
/// # Examples
///
/// ```
/// use microflow::{Fluid, FluidRegistry};
///
/// let mut fluids = FluidRegistry::new();
/// let water = fluids.add(Fluid::new("water", 1000.0, 1e-3));
/// let oil = fluids.add(Fluid::new("oil", 900.0, 5e-3));
///
/// let mixed = fluids.mix(water, 1.0, oil, 1.0);
/// assert!((fluids.get(mixed).unwrap().viscosity - 3e-3).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FluidRegistry {
    fluids: Vec<Fluid>,
}

impl FluidRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fluid.
    pub fn add(&mut self, fluid: Fluid) -> FluidId {
        let id = FluidId(self.fluids.len());
        self.fluids.push(fluid);
        id
    }

    /// Gets a fluid by id.
    pub fn get(&self, id: FluidId) -> Option<&Fluid> {
        self.fluids.get(id.0)
    }

    /// Gets the number of registered fluids.
    pub fn len(&self) -> usize {
        self.fluids.len()
    }

    /// True if no fluid is registered.
    pub fn is_empty(&self) -> bool {
        self.fluids.is_empty()
    }

    /// Registers the volume-weighted mixture of two fluids.
    ///
    /// Returns `a` unchanged when both ids are equal. Unknown ids contribute
    /// nothing, so mixing with an unknown fluid returns the known one.
    pub fn mix(&mut self, a: FluidId, volume_a: f64, b: FluidId, volume_b: f64) -> FluidId {
        if a == b {
            return a;
        }
        let (fa, fb) = match (self.get(a), self.get(b)) {
            (Some(fa), Some(fb)) => (fa, fb),
            (Some(_), None) => return a,
            (None, _) => return b,
        };
        let total = volume_a + volume_b;
        let wa = volume_a / total;
        let wb = volume_b / total;
        let mixed = Fluid {
            name: format!("{}+{}", fa.name, fb.name),
            density: wa * fa.density + wb * fb.density,
            viscosity: wa * fa.viscosity + wb * fb.viscosity,
        };
        self.add(mixed)
    }
}
