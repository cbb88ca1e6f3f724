//! Multi-layer fault protection with leaky-integrator delay timers.
//!
//! Every monitored condition owns a timer: +dt while the condition holds,
//! -dt/2 (floored at zero) while it does not. A timer crossing its threshold
//! fires the fault or warning. Transient noise drains away; a sustained but
//! intermittent condition still accumulates (net +dt/2 per on/off cycle).
//!
//! The hardware-safety pass is independent of software fault state and runs
//! even when the pack is already latched. Once latched, the software checks
//! stop escalating and the run only accumulates safe-state time toward the
//! 60 s manual-reset hold.

use tracing::{error, warn};

use crate::domain::types::{
    FaultKind, FaultRecord, PackData, CELLS_PER_PACK, NOMINAL_CAPACITY_AH, NUM_MODULES,
    TEMPS_PER_MODULE, TEMP_SENSORS_PER_PACK,
};
use crate::limits;

/// Alarm thresholds and delays. These exact values are the contract; the test
/// suite asserts them verbatim.
pub mod thresholds {
    /// Cell over-voltage fault, millivolts (5 s delay).
    pub const SE_OV_FAULT_MV: u16 = 4225;
    /// Cell under-voltage fault, millivolts (5 s delay); cells reading zero
    /// are treated as unconnected and skipped.
    pub const SE_UV_FAULT_MV: u16 = 3000;
    /// Sensor over-temperature fault, 0.1 degC (5 s delay).
    pub const SE_OT_FAULT_DECI_C: i16 = 650;

    /// Warning assert thresholds (5 s delay).
    pub const SE_OV_WARN_MV: u16 = 4210;
    pub const SE_UV_WARN_MV: u16 = 3200;
    pub const SE_OT_WARN_DECI_C: i16 = 600;

    /// Warning clear thresholds (hysteresis deadband defaults).
    pub const SE_OV_WARN_CLEAR_MV: u16 = 4190;
    pub const SE_UV_WARN_CLEAR_MV: u16 = 3220;
    pub const SE_OT_WARN_CLEAR_DECI_C: i16 = 570;

    /// Hardware safety thresholds.
    pub const HW_OV_MV: u16 = 4300;
    pub const HW_UV_MV: u16 = 2700;
    pub const HW_OT_DECI_C: i16 = 700;

    /// Delays, milliseconds.
    pub const SE_FAULT_DELAY_MS: u32 = 5000;
    pub const HW_OV_DELAY_MS: u32 = 1000;
    pub const HW_UV_DELAY_MS: u32 = 1000;
    pub const HW_OT_DELAY_MS: u32 = 5000;
    pub const WARN_DELAY_MS: u32 = 5000;
    pub const OC_WARN_DELAY_MS: u32 = 10_000;
    pub const OC_FAULT_DELAY_MS: u32 = 5000;

    /// A warning stays visible at least this long after its cause clears.
    pub const WARNING_HOLD_MS: u32 = 10_000;
    /// Safe-state hold required before a manual fault reset is accepted.
    pub const FAULT_RESET_HOLD_MS: u32 = 60_000;

    /// Absolute overcurrent caps: 3 C charge, 5 C discharge (amps).
    pub const MAX_CHARGE_A: f64 = 384.0;
    pub const MAX_DISCHARGE_A: f64 = 640.0;

    /// Overcurrent warning margin: |I| > 1.05 x limit + 5 A, both directions.
    pub const OC_WARN_FACTOR: f64 = 1.05;
    pub const OC_WARN_OFFSET_A: f64 = 5.0;
}

use thresholds::*;

/// Warning hysteresis deadbands; the defaults are the engineering choices of
/// the reference, overridable from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ProtectionConfig {
    pub ov_warn_clear_mv: u16,
    pub uv_warn_clear_mv: u16,
    pub ot_warn_clear_deci_c: i16,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            ov_warn_clear_mv: SE_OV_WARN_CLEAR_MV,
            uv_warn_clear_mv: SE_UV_WARN_CLEAR_MV,
            ot_warn_clear_deci_c: SE_OT_WARN_CLEAR_DECI_C,
        }
    }
}

fn leak_up(timer: &mut u32, dt_ms: u32) {
    *timer = timer.saturating_add(dt_ms);
}

fn leak_down(timer: &mut u32, dt_ms: u32) {
    *timer = timer.saturating_sub(dt_ms / 2);
}

/// Bounded, de-duplicated fault record buffer.
const MAX_FAULT_RECORDS: usize = 8;

/// Per-pack protection state: one leaky timer per monitored condition.
pub struct Protection {
    config: ProtectionConfig,

    ov_timer_ms: [u32; CELLS_PER_PACK],
    uv_timer_ms: [u32; CELLS_PER_PACK],
    ot_timer_ms: [u32; TEMP_SENSORS_PER_PACK],

    hw_ov_timer_ms: u32,
    hw_uv_timer_ms: u32,
    hw_ot_timer_ms: u32,

    oc_charge_timer_ms: u32,
    oc_discharge_timer_ms: u32,
    cold_charge_timer_ms: u32,
    oc_warn_timer_ms: u32,

    warn_ov_timer_ms: u32,
    warn_uv_timer_ms: u32,
    warn_ot_timer_ms: u32,
    warn_ov_active: bool,
    warn_uv_active: bool,
    warn_ot_active: bool,
    oc_warn_active: bool,
    warning_hold_ms: u32,

    safe_state_ms: u32,
    hw_latched: bool,

    records: Vec<FaultRecord>,
}

impl Protection {
    pub fn new(config: ProtectionConfig) -> Self {
        Self {
            config,
            ov_timer_ms: [0; CELLS_PER_PACK],
            uv_timer_ms: [0; CELLS_PER_PACK],
            ot_timer_ms: [0; TEMP_SENSORS_PER_PACK],
            hw_ov_timer_ms: 0,
            hw_uv_timer_ms: 0,
            hw_ot_timer_ms: 0,
            oc_charge_timer_ms: 0,
            oc_discharge_timer_ms: 0,
            cold_charge_timer_ms: 0,
            oc_warn_timer_ms: 0,
            warn_ov_timer_ms: 0,
            warn_uv_timer_ms: 0,
            warn_ot_timer_ms: 0,
            warn_ov_active: false,
            warn_uv_active: false,
            warn_ot_active: false,
            oc_warn_active: false,
            warning_hold_ms: 0,
            safe_state_ms: 0,
            hw_latched: false,
            records: Vec::new(),
        }
    }

    pub fn hw_latched(&self) -> bool {
        self.hw_latched
    }

    pub fn safe_state_ms(&self) -> u32 {
        self.safe_state_ms
    }

    /// Fired fault records, newest last, bounded and de-duplicated.
    pub fn records(&self) -> &[FaultRecord] {
        &self.records
    }

    pub fn ov_timer_ms(&self, cell: usize) -> u32 {
        self.ov_timer_ms[cell]
    }

    /// Advance all timers by `dt_ms` against the current measurements.
    /// Returns the fault records that fired during this run (normally empty).
    pub fn run(&mut self, pack: &mut PackData, dt_ms: u32) -> Vec<FaultRecord> {
        let mut fired = Vec::new();

        // The hardware path never defers to software state.
        self.hw_safety(pack, dt_ms, &mut fired);

        if pack.fault_latched {
            self.accumulate_safe_state(pack, dt_ms);
            return fired;
        }

        self.check_cell_faults(pack, dt_ms, &mut fired);
        if pack.fault_latched {
            return fired;
        }

        self.check_overcurrent_faults(pack, dt_ms, &mut fired);
        if pack.fault_latched {
            return fired;
        }

        self.check_warnings(pack, dt_ms);
        fired
    }

    /// Hardware safety sub-pass: runs even when a software fault is latched.
    pub fn hw_safety(&mut self, pack: &mut PackData, dt_ms: u32, fired: &mut Vec<FaultRecord>) {
        let hw_ov_cell = pack
            .cell_mv
            .iter()
            .position(|&mv| mv >= HW_OV_MV);
        if let Some(cell) = hw_ov_cell {
            leak_up(&mut self.hw_ov_timer_ms, dt_ms);
            if self.hw_ov_timer_ms >= HW_OV_DELAY_MS {
                let mv = pack.cell_mv[cell] as i32;
                self.fire_hw(pack, FaultKind::HwOverVoltage, cell as u16, mv, fired);
            }
        } else {
            leak_down(&mut self.hw_ov_timer_ms, dt_ms);
        }

        let hw_uv_cell = pack
            .cell_mv
            .iter()
            .position(|&mv| mv > 0 && mv <= HW_UV_MV);
        if let Some(cell) = hw_uv_cell {
            leak_up(&mut self.hw_uv_timer_ms, dt_ms);
            if self.hw_uv_timer_ms >= HW_UV_DELAY_MS {
                let mv = pack.cell_mv[cell] as i32;
                self.fire_hw(pack, FaultKind::HwUnderVoltage, cell as u16, mv, fired);
            }
        } else {
            leak_down(&mut self.hw_uv_timer_ms, dt_ms);
        }

        let hw_ot = hottest_sensor(pack).filter(|&(_, t)| t >= HW_OT_DECI_C);
        if let Some((sensor, t)) = hw_ot {
            leak_up(&mut self.hw_ot_timer_ms, dt_ms);
            if self.hw_ot_timer_ms >= HW_OT_DELAY_MS {
                self.fire_hw(pack, FaultKind::HwOverTemp, sensor as u16, t as i32, fired);
            }
        } else {
            leak_down(&mut self.hw_ot_timer_ms, dt_ms);
        }
    }

    fn check_cell_faults(&mut self, pack: &mut PackData, dt_ms: u32, fired: &mut Vec<FaultRecord>) {
        for i in 0..CELLS_PER_PACK {
            let mv = pack.cell_mv[i];
            if mv >= SE_OV_FAULT_MV {
                leak_up(&mut self.ov_timer_ms[i], dt_ms);
                if self.ov_timer_ms[i] >= SE_FAULT_DELAY_MS {
                    self.fire_sw(pack, FaultKind::CellOverVoltage, Some(i as u16), mv as i32, fired);
                    return;
                }
            } else {
                leak_down(&mut self.ov_timer_ms[i], dt_ms);
            }
        }

        for i in 0..CELLS_PER_PACK {
            let mv = pack.cell_mv[i];
            if mv == 0 {
                continue; // unconnected tap
            }
            if mv <= SE_UV_FAULT_MV {
                leak_up(&mut self.uv_timer_ms[i], dt_ms);
                if self.uv_timer_ms[i] >= SE_FAULT_DELAY_MS {
                    self.fire_sw(pack, FaultKind::CellUnderVoltage, Some(i as u16), mv as i32, fired);
                    return;
                }
            } else {
                leak_down(&mut self.uv_timer_ms[i], dt_ms);
            }
        }

        for module in 0..NUM_MODULES {
            for sensor in 0..TEMPS_PER_MODULE {
                let idx = module * TEMPS_PER_MODULE + sensor;
                let t = pack.modules[module].temp_deci_c[sensor];
                if t >= SE_OT_FAULT_DECI_C {
                    leak_up(&mut self.ot_timer_ms[idx], dt_ms);
                    if self.ot_timer_ms[idx] >= SE_FAULT_DELAY_MS {
                        self.fire_sw(pack, FaultKind::CellOverTemp, Some(idx as u16), t as i32, fired);
                        return;
                    }
                } else {
                    leak_down(&mut self.ot_timer_ms[idx], dt_ms);
                }
            }
        }
    }

    fn check_overcurrent_faults(
        &mut self,
        pack: &mut PackData,
        dt_ms: u32,
        fired: &mut Vec<FaultRecord>,
    ) {
        let current_ma = pack.pack_current_ma;
        let i_a = current_ma as f64 / 1000.0;

        // Charging below freezing: the derated charge limit collapses to
        // zero, so any sustained charge current is an escalation.
        let coldest_c = pack.min_temp_deci_c as f64 / 10.0;
        let cold_limit = limits::by_temperature(coldest_c, NOMINAL_CAPACITY_AH);
        let cold_charge =
            coldest_c < 0.0 && i_a > OC_WARN_FACTOR * cold_limit.charge_a + OC_WARN_OFFSET_A;
        if cold_charge {
            leak_up(&mut self.cold_charge_timer_ms, dt_ms);
            if self.cold_charge_timer_ms >= OC_FAULT_DELAY_MS {
                self.fire_sw(pack, FaultKind::ColdChargeOverCurrent, None, current_ma, fired);
                return;
            }
        } else {
            leak_down(&mut self.cold_charge_timer_ms, dt_ms);
        }

        if i_a > MAX_CHARGE_A {
            leak_up(&mut self.oc_charge_timer_ms, dt_ms);
            if self.oc_charge_timer_ms >= SE_FAULT_DELAY_MS {
                self.fire_sw(pack, FaultKind::OverCurrentCharge, None, current_ma, fired);
                return;
            }
        } else {
            leak_down(&mut self.oc_charge_timer_ms, dt_ms);
        }

        if i_a < -MAX_DISCHARGE_A {
            leak_up(&mut self.oc_discharge_timer_ms, dt_ms);
            if self.oc_discharge_timer_ms >= SE_FAULT_DELAY_MS {
                self.fire_sw(pack, FaultKind::OverCurrentDischarge, None, current_ma, fired);
            }
        } else {
            leak_down(&mut self.oc_discharge_timer_ms, dt_ms);
        }
    }

    fn check_warnings(&mut self, pack: &mut PackData, dt_ms: u32) {
        let cfg = self.config;

        if pack.max_cell_mv >= SE_OV_WARN_MV {
            leak_up(&mut self.warn_ov_timer_ms, dt_ms);
            if self.warn_ov_timer_ms >= WARN_DELAY_MS {
                self.warn_ov_active = true;
            }
        } else if pack.max_cell_mv < cfg.ov_warn_clear_mv {
            self.warn_ov_timer_ms = 0;
            self.warn_ov_active = false;
        }
        // Inside the deadband: timer and assertion both hold.

        let min_valid = pack.min_cell_mv != u16::MAX;
        if min_valid && pack.min_cell_mv <= SE_UV_WARN_MV {
            leak_up(&mut self.warn_uv_timer_ms, dt_ms);
            if self.warn_uv_timer_ms >= WARN_DELAY_MS {
                self.warn_uv_active = true;
            }
        } else if min_valid && pack.min_cell_mv > cfg.uv_warn_clear_mv {
            self.warn_uv_timer_ms = 0;
            self.warn_uv_active = false;
        }

        if pack.max_temp_deci_c >= SE_OT_WARN_DECI_C {
            leak_up(&mut self.warn_ot_timer_ms, dt_ms);
            if self.warn_ot_timer_ms >= WARN_DELAY_MS {
                self.warn_ot_active = true;
            }
        } else if pack.max_temp_deci_c < cfg.ot_warn_clear_deci_c {
            self.warn_ot_timer_ms = 0;
            self.warn_ot_active = false;
        }

        let i_a = pack.pack_current_ma as f64 / 1000.0;
        let temp_c = pack.max_temp_deci_c as f64 / 10.0;
        let limit = limits::by_temperature(temp_c, NOMINAL_CAPACITY_AH);
        let oc = i_a > OC_WARN_FACTOR * limit.charge_a + OC_WARN_OFFSET_A
            || i_a < -(OC_WARN_FACTOR * limit.discharge_a + OC_WARN_OFFSET_A);
        if oc {
            leak_up(&mut self.oc_warn_timer_ms, dt_ms);
            if self.oc_warn_timer_ms >= OC_WARN_DELAY_MS {
                self.oc_warn_active = true;
            }
        } else {
            leak_down(&mut self.oc_warn_timer_ms, dt_ms);
            self.oc_warn_active = false;
        }

        let any_warn =
            self.warn_ov_active || self.warn_uv_active || self.warn_ot_active || self.oc_warn_active;
        if any_warn {
            if !pack.has_warning {
                warn!(
                    pack_current_ma = pack.pack_current_ma,
                    max_cell_mv = pack.max_cell_mv,
                    min_cell_mv = pack.min_cell_mv,
                    max_temp_deci_c = pack.max_temp_deci_c,
                    "pack warning asserted"
                );
            }
            pack.has_warning = true;
            self.warning_hold_ms = 0;
        } else if pack.has_warning {
            self.warning_hold_ms += dt_ms;
            if self.warning_hold_ms >= WARNING_HOLD_MS {
                pack.has_warning = false;
                self.warning_hold_ms = 0;
            }
        }
    }

    fn accumulate_safe_state(&mut self, pack: &PackData, dt_ms: u32) {
        let cells_safe = pack
            .cell_mv
            .iter()
            .all(|&mv| mv < SE_OV_FAULT_MV && (mv == 0 || mv > SE_UV_FAULT_MV));
        let temps_safe = pack
            .modules
            .iter()
            .flat_map(|m| m.temp_deci_c.iter())
            .all(|&t| t < SE_OT_FAULT_DECI_C);

        if cells_safe && temps_safe {
            leak_up(&mut self.safe_state_ms, dt_ms);
        } else {
            self.safe_state_ms = 0;
        }
    }

    fn fire_sw(
        &mut self,
        pack: &mut PackData,
        kind: FaultKind,
        index: Option<u16>,
        value: i32,
        fired: &mut Vec<FaultRecord>,
    ) {
        let record = FaultRecord { kind, index, value };
        error!(fault = %record, "software fault latched");
        pack.faults.set(kind);
        pack.fault_latched = true;
        pack.charge_limit_a = 0.0;
        pack.discharge_limit_a = 0.0;
        self.push_record(record);
        fired.push(record);
    }

    fn fire_hw(
        &mut self,
        pack: &mut PackData,
        kind: FaultKind,
        index: u16,
        value: i32,
        fired: &mut Vec<FaultRecord>,
    ) {
        let record = FaultRecord { kind, index: Some(index), value };
        if !self.hw_latched {
            error!(fault = %record, "hardware safety latched");
        }
        pack.faults.set(kind);
        pack.fault_latched = true;
        pack.charge_limit_a = 0.0;
        pack.discharge_limit_a = 0.0;
        self.hw_latched = true;
        if self.push_record(record) {
            fired.push(record);
        }
    }

    fn push_record(&mut self, record: FaultRecord) -> bool {
        let duplicate = self
            .records
            .iter()
            .any(|r| r.kind == record.kind && r.index == record.index);
        if duplicate || self.records.len() >= MAX_FAULT_RECORDS {
            return false;
        }
        self.records.push(record);
        true
    }

    /// True when a manual reset would be accepted: either nothing is latched
    /// (reset is a no-op) or the pack has held safe state for the full 60 s.
    pub fn can_reset(&self, pack: &PackData) -> bool {
        !pack.fault_latched || self.safe_state_ms >= FAULT_RESET_HOLD_MS
    }

    /// Clear every latch, timer and flag. Caller is responsible for checking
    /// [`Protection::can_reset`] first and for restoring the pack mode.
    pub fn reset(&mut self, pack: &mut PackData) {
        let config = self.config;
        *self = Protection::new(config);
        pack.faults = Default::default();
        pack.fault_latched = false;
        pack.has_warning = false;
    }
}

fn hottest_sensor(pack: &PackData) -> Option<(usize, i16)> {
    pack.modules
        .iter()
        .enumerate()
        .flat_map(|(m, module)| {
            module
                .temp_deci_c
                .iter()
                .enumerate()
                .map(move |(s, &t)| (m * TEMPS_PER_MODULE + s, t))
        })
        .max_by_key(|&(_, t)| t)
}
