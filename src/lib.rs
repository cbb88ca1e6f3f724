//! Battery management core for a maritime lithium-ion energy storage array:
//! 22 series modules x 14 series elements (308 cells) per pack, 128 Ah
//! nominal, multiple packs sharing one DC bus.
//!
//! The crate is organized around one [`controller::PackController`] per pack
//! (measurement, protection, current limits, SoC, contactor and mode state
//! machines, CAN, NVM) and an [`array::Array`] that distributes the requested
//! bus current among connected packs with a clamped Kirchhoff solver.
//!
//! All hardware access goes through the [`hardware::Hal`] trait; the shipped
//! implementation is the desktop [`hardware::MockHal`] used by the simulator
//! (`sim` feature) and the test suite.

pub mod array;
pub mod comms;
pub mod config;
pub mod contactor;
pub mod controller;
pub mod domain;
pub mod hardware;
pub mod limits;
pub mod monitor;
pub mod protection;
pub mod soc;
pub mod state;
pub mod telemetry;

#[cfg(feature = "sim")]
pub mod sim;

pub use array::{Array, ArrayRequest};
pub use controller::PackController;
pub use domain::{BmsError, ContactorState, CurrentLimit, FaultKind, Pack, PackData, PackMode};
pub use protection::{Protection, ProtectionConfig};
