//! Core data types shared across the BMS: pack topology constants, operating
//! modes, fault bookkeeping, EMS commands, current envelopes, and the measured
//! pack telemetry that the monitor fills in and every other task consumes.

use serde::{Deserialize, Serialize};
use strum_macros::Display;
use thiserror::Error;

use crate::hardware::HalError;

// ---------------------------------------------------------------------------
// Pack topology
// ---------------------------------------------------------------------------

/// Series modules per pack.
pub const NUM_MODULES: usize = 22;
/// Series elements (cell groups) per module.
pub const CELLS_PER_MODULE: usize = 14;
/// Series elements per pack: 22 x 14 = 308.
pub const CELLS_PER_PACK: usize = NUM_MODULES * CELLS_PER_MODULE;
/// Thermistor channels per module (TS1..TS3 on the monitor ASIC).
pub const TEMPS_PER_MODULE: usize = 3;
/// Temperature sensors per pack: 66.
pub const TEMP_SENSORS_PER_PACK: usize = NUM_MODULES * TEMPS_PER_MODULE;
/// Nominal pack capacity in amp-hours.
pub const NOMINAL_CAPACITY_AH: f64 = 128.0;
/// Maximum packs on one DC bus.
pub const MAX_PACKS: usize = 8;

// ---------------------------------------------------------------------------
// Modes and states
// ---------------------------------------------------------------------------

/// Pack operation modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PackMode {
    Off,
    PowerSave,
    Fault,
    Ready,
    Connecting,
    Connected,
    NotReady,
}

impl PackMode {
    /// Stable code used on the CAN status frame.
    pub fn code(self) -> u8 {
        match self {
            PackMode::Off => 0,
            PackMode::PowerSave => 1,
            PackMode::Fault => 2,
            PackMode::Ready => 3,
            PackMode::Connecting => 4,
            PackMode::Connected => 5,
            PackMode::NotReady => 6,
        }
    }
}

/// Contactor state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactorState {
    Open,
    PreCharge,
    Closing,
    Closed,
    Opening,
    Welded,
}

// ---------------------------------------------------------------------------
// Faults
// ---------------------------------------------------------------------------

/// Every distinct protection condition the pack can latch or flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
pub enum FaultKind {
    CellOverVoltage,
    CellUnderVoltage,
    CellOverTemp,
    HwOverVoltage,
    HwUnderVoltage,
    HwOverTemp,
    OverCurrentCharge,
    OverCurrentDischarge,
    ColdChargeOverCurrent,
    ShortCircuitDischarge,
    ContactorWeld,
    EmsTimeout,
    CommLoss,
}

impl FaultKind {
    /// Stable numeric code used in the NVM fault log.
    pub fn code(self) -> u8 {
        match self {
            FaultKind::CellOverVoltage => 1,
            FaultKind::CellUnderVoltage => 2,
            FaultKind::CellOverTemp => 3,
            FaultKind::HwOverVoltage => 4,
            FaultKind::HwUnderVoltage => 5,
            FaultKind::HwOverTemp => 6,
            FaultKind::OverCurrentCharge => 7,
            FaultKind::OverCurrentDischarge => 8,
            FaultKind::ColdChargeOverCurrent => 9,
            FaultKind::ShortCircuitDischarge => 10,
            FaultKind::ContactorWeld => 11,
            FaultKind::EmsTimeout => 12,
            FaultKind::CommLoss => 13,
        }
    }
}

/// Per-condition fault flags. The monitor ORs ASIC safety-status bits straight
/// into these; the protection timers set them when a delay expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultFlags {
    pub cell_ov: bool,
    pub cell_uv: bool,
    pub cell_ot: bool,
    pub hw_ov: bool,
    pub hw_uv: bool,
    pub hw_ot: bool,
    pub hw_ut: bool,
    pub oc_charge: bool,
    pub oc_discharge: bool,
    pub sc_discharge: bool,
    pub contactor_weld: bool,
    pub ems_timeout: bool,
    pub comm_loss: bool,
    pub imbalance: bool,
}

impl FaultFlags {
    pub fn any(&self) -> bool {
        self.cell_ov
            || self.cell_uv
            || self.cell_ot
            || self.hw_ov
            || self.hw_uv
            || self.hw_ot
            || self.hw_ut
            || self.oc_charge
            || self.oc_discharge
            || self.sc_discharge
            || self.contactor_weld
            || self.ems_timeout
            || self.comm_loss
    }

    pub fn set(&mut self, kind: FaultKind) {
        match kind {
            FaultKind::CellOverVoltage => self.cell_ov = true,
            FaultKind::CellUnderVoltage => self.cell_uv = true,
            FaultKind::CellOverTemp => self.cell_ot = true,
            FaultKind::HwOverVoltage => self.hw_ov = true,
            FaultKind::HwUnderVoltage => self.hw_uv = true,
            FaultKind::HwOverTemp => self.hw_ot = true,
            FaultKind::OverCurrentCharge => self.oc_charge = true,
            FaultKind::OverCurrentDischarge => self.oc_discharge = true,
            FaultKind::ColdChargeOverCurrent => self.oc_charge = true,
            FaultKind::ShortCircuitDischarge => self.sc_discharge = true,
            FaultKind::ContactorWeld => self.contactor_weld = true,
            FaultKind::EmsTimeout => self.ems_timeout = true,
            FaultKind::CommLoss => self.comm_loss = true,
        }
    }

    /// Low byte for the CAN status frame: the eight cell/HW/overcurrent bits.
    pub fn low_byte(&self) -> u8 {
        (self.cell_ov as u8)
            | (self.cell_uv as u8) << 1
            | (self.cell_ot as u8) << 2
            | (self.hw_ov as u8) << 3
            | (self.hw_uv as u8) << 4
            | (self.hw_ot as u8) << 5
            | (self.oc_charge as u8) << 6
            | (self.oc_discharge as u8) << 7
    }
}

/// One fired protection event: the kind plus the offending reading.
/// Rendered to text only at the CAN/CLI/log boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    pub kind: FaultKind,
    /// Cell or sensor index, when the condition is per-cell/per-sensor.
    pub index: Option<u16>,
    /// Offending reading in the condition's native unit (mV, 0.1 C, mA).
    pub value: i32,
}

impl std::fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.kind, self.index) {
            (
                FaultKind::CellOverVoltage
                | FaultKind::CellUnderVoltage
                | FaultKind::HwOverVoltage
                | FaultKind::HwUnderVoltage,
                Some(i),
            ) => write!(f, "{}: cell {} at {} mV", self.kind, i, self.value),
            (FaultKind::CellOverTemp | FaultKind::HwOverTemp, Some(i)) => {
                write!(f, "{}: sensor {} at {:.1} C", self.kind, i, self.value as f64 / 10.0)
            }
            (
                FaultKind::OverCurrentCharge
                | FaultKind::OverCurrentDischarge
                | FaultKind::ColdChargeOverCurrent
                | FaultKind::ContactorWeld,
                _,
            ) => write!(f, "{}: I = {:.1} A", self.kind, self.value as f64 / 1000.0),
            _ => write!(f, "{}", self.kind),
        }
    }
}

// ---------------------------------------------------------------------------
// EMS commands
// ---------------------------------------------------------------------------

/// Decoded request from the energy management system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EmsRequest {
    ConnectCharge,
    ConnectDischarge,
    Disconnect,
    ResetFaults,
    PowerSave,
    SetLimits { charge_a: f64, discharge_a: f64 },
    /// Watchdog feed only; carries no action.
    Heartbeat,
}

/// An EMS request stamped with the receive tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmsCommand {
    pub request: EmsRequest,
    pub timestamp_ms: u32,
}

// ---------------------------------------------------------------------------
// Current envelope
// ---------------------------------------------------------------------------

/// A (charge, discharge) current envelope in amps, both sides non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentLimit {
    pub charge_a: f64,
    pub discharge_a: f64,
}

impl CurrentLimit {
    pub const ZERO: CurrentLimit = CurrentLimit { charge_a: 0.0, discharge_a: 0.0 };

    /// Element-wise minimum, floored at zero.
    pub fn min(self, other: CurrentLimit) -> CurrentLimit {
        CurrentLimit {
            charge_a: self.charge_a.min(other.charge_a).max(0.0),
            discharge_a: self.discharge_a.min(other.discharge_a).max(0.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Measured telemetry
// ---------------------------------------------------------------------------

/// Raw safety-status registers read back from one module's monitor ASIC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsicSafetyStatus {
    pub status_a: u8,
    pub status_b: u8,
    pub status_c: u8,
}

/// Everything the monitor knows about one module.
#[derive(Debug, Clone, Copy)]
pub struct ModuleData {
    pub cell_mv: [u16; CELLS_PER_MODULE],
    pub temp_deci_c: [i16; TEMPS_PER_MODULE],
    pub stack_mv: u16,
    pub safety: AsicSafetyStatus,
    pub comm_ok: bool,
}

impl Default for ModuleData {
    fn default() -> Self {
        Self {
            cell_mv: [0; CELLS_PER_MODULE],
            temp_deci_c: [0; TEMPS_PER_MODULE],
            stack_mv: 0,
            safety: AsicSafetyStatus::default(),
            comm_ok: false,
        }
    }
}

/// Measured pack state: filled in by the monitor, consumed by protection,
/// current limiting, the contactor FSM, the mode FSM, and the CAN encoder.
/// Single writer per field group within one control tick.
#[derive(Debug, Clone)]
pub struct PackData {
    pub cell_mv: [u16; CELLS_PER_PACK],
    pub modules: [ModuleData; NUM_MODULES],

    pub pack_voltage_mv: u32,
    pub pack_current_ma: i32,
    pub bus_voltage_mv: u32,
    pub max_cell_mv: u16,
    pub min_cell_mv: u16,
    pub avg_cell_mv: u16,

    pub max_temp_deci_c: i16,
    pub min_temp_deci_c: i16,

    /// Estimated state of charge, hundredths of a percent (0..=10000).
    pub soc_hundredths: u16,

    pub faults: FaultFlags,
    pub fault_latched: bool,
    pub has_warning: bool,

    /// Effective current envelope in amps (after protection and EMS clamps).
    pub charge_limit_a: f64,
    pub discharge_limit_a: f64,

    pub contactor_state: ContactorState,
    pub mode: PackMode,

    pub uptime_ms: u32,
    pub last_ems_msg_ms: u32,
}

impl Default for PackData {
    fn default() -> Self {
        Self {
            cell_mv: [0; CELLS_PER_PACK],
            modules: [ModuleData::default(); NUM_MODULES],
            pack_voltage_mv: 0,
            pack_current_ma: 0,
            bus_voltage_mv: 0,
            max_cell_mv: 0,
            min_cell_mv: u16::MAX,
            avg_cell_mv: 0,
            max_temp_deci_c: -400,
            min_temp_deci_c: 7000,
            soc_hundredths: 5000,
            faults: FaultFlags::default(),
            fault_latched: false,
            has_warning: false,
            charge_limit_a: 0.0,
            discharge_limit_a: 0.0,
            contactor_state: ContactorState::Open,
            mode: PackMode::NotReady,
            uptime_ms: 0,
            last_ems_msg_ms: 0,
        }
    }
}

impl PackData {
    /// max - min cell spread in millivolts.
    pub fn imbalance_mv(&self) -> u16 {
        self.max_cell_mv.saturating_sub(self.min_cell_mv)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// BMS domain errors.
#[derive(Debug, Error)]
pub enum BmsError {
    #[error("invalid time step {0} s: must be positive")]
    InvalidTimeStep(f64),

    #[error("duplicate pack id {0} in array configuration")]
    DuplicatePackId(u8),

    #[error("array configuration holds {0} packs, maximum is {MAX_PACKS}")]
    TooManyPacks(usize),

    #[error(
        "pack voltage {pack_v:.1} V too far from bus {bus_v:.1} V (max delta {max_delta:.1} V)"
    )]
    VoltageMismatch { pack_v: f64, bus_v: f64, max_delta: f64 },

    #[error("connect rejected: pack is {0}, not READY")]
    NotReady(PackMode),

    #[error("fault reset denied: safe-state hold incomplete")]
    ResetDenied,

    #[error(transparent)]
    Hal(#[from] HalError),
}
