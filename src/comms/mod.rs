//! External communication: the CAN message set and NVM persistence.

pub mod can;
pub mod nvm;

pub use can::{CanBus, CodecError};
pub use nvm::{FaultEvent, NvmStore, PersistentRecord};
