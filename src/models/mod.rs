//! Entities of the abstract network and their physical models.
//!
//! One file per entity:
//!
//! - **Channel**: resistive edge with a cross-section geometry and a cached
//!   hydraulic resistance
//! - **Pump**: pressure or flow-rate source between two nodes
//! - **Module**: CFD-resolved region bound to the network through openings
//! - **Resistance**: pluggable geometry-to-resistance models
//!
//! Nodes and the network container itself live at the crate root.
//!
//! ## Example
//!
//! ```
//! use microflow::models::{ChannelGeometry, ResistanceModelKind};
//!
//! let geometry = ChannelGeometry::rectangular(100e-6, 100e-6, 1e-3);
//! let model = ResistanceModelKind::Poiseuille.build();
//! let r = model.resistance(&geometry, 1e-3);
//! assert!((r - 12.0 * 1e-3 * 1e-3 / 1e-16).abs() / r < 1e-12);
//! ```

pub mod channel;
pub mod module;
pub mod pump;
pub mod resistance;

pub use channel::{Channel, ChannelGeometry, CrossSection};
pub use module::{Module, Opening, OpeningDrive};
pub use pump::{Pump, PumpKind};
pub use resistance::{PoiseuilleModel, RectangularModel, ResistanceModel, ResistanceModelKind};
