//! Domain model: pack topology, shared types, reference curves, and the
//! equivalent-circuit battery model.

pub mod curves;
pub mod pack;
pub mod types;

pub use pack::Pack;
pub use types::{
    AsicSafetyStatus, BmsError, ContactorState, CurrentLimit, EmsCommand, EmsRequest, FaultFlags,
    FaultKind, FaultRecord, ModuleData, PackData, PackMode, CELLS_PER_MODULE, CELLS_PER_PACK,
    MAX_PACKS, NOMINAL_CAPACITY_AH, NUM_MODULES, TEMPS_PER_MODULE, TEMP_SENSORS_PER_PACK,
};
