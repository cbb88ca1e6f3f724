//! Desktop simulation harness: plant coupling over the mock HAL, scripted
//! scenarios, and CSV recording. Demo scaffolding, not part of the BMS core.

pub mod driver;
pub mod recorder;

pub use driver::{ScenarioRunner, SimDriver};
pub use recorder::CsvRecorder;
