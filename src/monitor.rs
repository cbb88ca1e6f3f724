//! Staggered cell/temperature monitoring and pack aggregation.
//!
//! Each 10 ms run reads ONE module (14 cell voltages, 3 thermistors, stack
//! voltage, safety registers) so no single cycle holds the I2C bus long. A
//! full 22-module scan takes 220 ms, after which the pack aggregates
//! (min/max/avg cell, temperature extremes, imbalance) are recomputed.
//!
//! ASIC safety-status bits are OR'd into the pack fault flags as soon as they
//! are read. An I2C failure marks the module down and raises `comm_loss`;
//! operation continues on last-known data.
//!
//! The monitor also runs the passive balancing rule: while resting or lightly
//! loaded in READY/CONNECTED with more than 50 mV of spread, bleed every cell
//! above the low cell plus half the threshold.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::domain::types::{
    FaultKind, PackData, PackMode, CELLS_PER_MODULE, NUM_MODULES, TEMPS_PER_MODULE,
};
use crate::hardware::bq76952::{
    Bq76952, SSA_CELL_OV, SSA_CELL_UV, SSA_OC_CHARGE, SSA_OC_DISCHARGE_1, SSA_OC_DISCHARGE_2,
    SSA_SC_DISCHARGE, SSB_OT_CHARGE, SSB_OT_DISCHARGE, SSB_OT_FET, SSB_OT_INTERNAL, SSB_UT_CHARGE,
    SSB_UT_DISCHARGE, SSB_UT_INTERNAL,
};
use crate::hardware::Hal;

/// Cell spread that raises the imbalance warning, millivolts.
pub const IMBALANCE_WARN_MV: u16 = 50;
/// Balancing engages above this spread and bleeds cells down to
/// `min + IMBALANCE_WARN_MV / 2`.
pub const BALANCE_THRESHOLD_MV: u16 = 50;
/// No balancing while |I| exceeds 0.2 C.
pub const BALANCE_MAX_CURRENT_MA: i32 = 25_600;

/// Scan and aggregation state for one pack.
pub struct Monitor {
    asic: Bq76952,
    next_module: usize,
    scan_complete: bool,
    scan_count: u32,
    balance_active: bool,
    balance_masks: [u16; NUM_MODULES],
}

impl Monitor {
    pub fn new(hal: Arc<dyn Hal>) -> Self {
        Self {
            asic: Bq76952::new(hal),
            next_module: 0,
            scan_complete: false,
            scan_count: 0,
            balance_active: false,
            balance_masks: [0; NUM_MODULES],
        }
    }

    pub fn scan_index(&self) -> usize {
        self.next_module
    }

    /// True when the run that just finished completed a full pack scan.
    pub fn scan_complete(&self) -> bool {
        self.scan_complete
    }

    pub fn scan_count(&self) -> u32 {
        self.scan_count
    }

    pub fn balance_active(&self) -> bool {
        self.balance_active
    }

    /// One monitor cycle: read the next module, roll the scan, refresh the
    /// pack current, and on scan completion aggregate and run balancing.
    pub fn run(&mut self, pack: &mut PackData) {
        self.scan_complete = false;

        let module = self.next_module;
        self.read_module(pack, module);
        self.next_module += 1;

        if self.next_module >= NUM_MODULES {
            self.next_module = 0;
            self.scan_complete = true;
            self.scan_count += 1;
            self.aggregate(pack);
            self.run_balancing(pack);
        }

        // Pack current comes from the first module's coulomb counter.
        match self.asic.read_current(0) {
            Ok(ma) => pack.pack_current_ma = ma,
            Err(err) => {
                warn!(error = %err, "pack current read failed");
                pack.faults.set(FaultKind::CommLoss);
            }
        }
    }

    /// Read one module's cells, temperatures and safety registers.
    pub fn read_module(&mut self, pack: &mut PackData, module: usize) {
        let mut cells = [0u16; CELLS_PER_MODULE];
        match self.asic.read_all_cells(module as u8, &mut cells) {
            Ok(()) => {
                pack.modules[module].cell_mv = cells;
                pack.modules[module].comm_ok = true;
                let base = module * CELLS_PER_MODULE;
                pack.cell_mv[base..base + CELLS_PER_MODULE].copy_from_slice(&cells);
            }
            Err(err) => {
                warn!(module, error = %err, "module read failed");
                pack.modules[module].comm_ok = false;
                pack.faults.set(FaultKind::CommLoss);
                return;
            }
        }

        if let Ok(stack_mv) = self.asic.read_stack_voltage(module as u8) {
            pack.modules[module].stack_mv = stack_mv;
        }

        for sensor in 0..TEMPS_PER_MODULE {
            if let Ok(deci_c) = self.asic.read_temperature(module as u8, sensor as u8) {
                pack.modules[module].temp_deci_c[sensor] = deci_c;
            }
        }

        match self.asic.read_safety(module as u8) {
            Ok(safety) => {
                pack.modules[module].safety = safety;
                self.fold_safety_bits(pack, module);
            }
            Err(err) => {
                warn!(module, error = %err, "safety register read failed");
                pack.faults.set(FaultKind::CommLoss);
            }
        }
    }

    /// The ASIC's own protection path is independent of ours: any status bit
    /// maps straight onto the pack fault flags.
    fn fold_safety_bits(&self, pack: &mut PackData, module: usize) {
        let safety = pack.modules[module].safety;

        if safety.status_a & SSA_CELL_OV != 0 {
            pack.faults.hw_ov = true;
        }
        if safety.status_a & SSA_CELL_UV != 0 {
            pack.faults.hw_uv = true;
        }
        if safety.status_a & SSA_SC_DISCHARGE != 0 {
            pack.faults.sc_discharge = true;
        }
        if safety.status_a & (SSA_OC_DISCHARGE_1 | SSA_OC_DISCHARGE_2) != 0 {
            pack.faults.oc_discharge = true;
        }
        if safety.status_a & SSA_OC_CHARGE != 0 {
            pack.faults.oc_charge = true;
        }
        if safety.status_b & (SSB_OT_CHARGE | SSB_OT_DISCHARGE | SSB_OT_INTERNAL | SSB_OT_FET) != 0
        {
            pack.faults.hw_ot = true;
        }
        if safety.status_b & (SSB_UT_CHARGE | SSB_UT_DISCHARGE | SSB_UT_INTERNAL) != 0 {
            pack.faults.hw_ut = true;
        }
    }

    /// Recompute pack-wide aggregates after a full scan. Cells reading zero
    /// (unconnected taps) are excluded from min/avg.
    pub fn aggregate(&self, pack: &mut PackData) {
        let mut sum_mv: u64 = 0;
        let mut count: u32 = 0;
        let mut max_mv: u16 = 0;
        let mut min_mv: u16 = u16::MAX;

        for &mv in pack.cell_mv.iter() {
            if mv == 0 {
                continue;
            }
            sum_mv += mv as u64;
            count += 1;
            max_mv = max_mv.max(mv);
            min_mv = min_mv.min(mv);
        }

        pack.max_cell_mv = max_mv;
        pack.min_cell_mv = min_mv;
        pack.avg_cell_mv = if count > 0 { (sum_mv / count as u64) as u16 } else { 0 };
        pack.pack_voltage_mv = pack.cell_mv.iter().map(|&v| v as u32).sum();

        let mut max_temp = i16::MIN;
        let mut min_temp = i16::MAX;
        for module in pack.modules.iter() {
            for &t in module.temp_deci_c.iter() {
                max_temp = max_temp.max(t);
                min_temp = min_temp.min(t);
            }
        }
        pack.max_temp_deci_c = max_temp;
        pack.min_temp_deci_c = min_temp;

        if min_mv != u16::MAX && max_mv - min_mv > IMBALANCE_WARN_MV {
            if !pack.faults.imbalance {
                warn!(spread_mv = max_mv - min_mv, "cell imbalance warning");
            }
            pack.faults.imbalance = true;
            pack.has_warning = true;
        } else {
            pack.faults.imbalance = false;
        }
    }

    fn run_balancing(&mut self, pack: &PackData) {
        let allowed = matches!(pack.mode, PackMode::Ready | PackMode::Connected)
            && pack.pack_current_ma.abs() <= BALANCE_MAX_CURRENT_MA
            && pack.min_cell_mv != u16::MAX
            && pack.imbalance_mv() > BALANCE_THRESHOLD_MV;

        if !allowed {
            if self.balance_active {
                debug!("balancing disabled");
                for module in 0..NUM_MODULES {
                    self.balance_masks[module] = 0;
                    let _ = self.asic.set_balance(module as u8, 0);
                }
                self.balance_active = false;
            }
            return;
        }

        let bleed_above = pack.min_cell_mv + BALANCE_THRESHOLD_MV / 2;
        self.balance_active = true;
        for module in 0..NUM_MODULES {
            let mut mask: u16 = 0;
            for (cell, &mv) in pack.modules[module].cell_mv.iter().enumerate() {
                if mv > bleed_above {
                    mask |= 1 << cell;
                }
            }
            if mask != self.balance_masks[module] {
                self.balance_masks[module] = mask;
                if let Err(err) = self.asic.set_balance(module as u8, mask) {
                    warn!(module, error = %err, "balance mask write failed");
                }
            }
        }
    }
}
