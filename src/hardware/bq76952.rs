//! Driver for the TI BQ76952 battery monitor ASIC, one per module.
//!
//! Direct commands are 1- or 2-byte register reads; configuration and cell
//! balancing go through the subcommand window at 0x3E/0x3F with a
//! one's-complement checksum at 0x60. All modules share the same I2C address;
//! the HAL mux (`i2c_select_module`) routes to the right bus segment.
//!
//! Cell voltages read back in millivolts (little-endian). Temperatures read
//! back in 0.1 K and are converted to signed 0.1 degC. Stack voltage is in
//! 10 mV units. CC2 current is signed milliamps.

use std::sync::Arc;

use crate::domain::types::{AsicSafetyStatus, CELLS_PER_MODULE, TEMPS_PER_MODULE};

use super::{Hal, HalError};

/// 7-bit I2C address, identical for every module behind the mux.
pub const I2C_ADDR: u8 = 0x08;

/// Direct-command registers.
pub const REG_SAFETY_ALERT_A: u8 = 0x02;
pub const REG_SAFETY_STATUS_A: u8 = 0x03;
pub const REG_SAFETY_ALERT_B: u8 = 0x04;
pub const REG_SAFETY_STATUS_B: u8 = 0x05;
pub const REG_SAFETY_ALERT_C: u8 = 0x06;
pub const REG_SAFETY_STATUS_C: u8 = 0x07;
pub const REG_CELL1_VOLTAGE: u8 = 0x14;
pub const REG_STACK_VOLTAGE: u8 = 0x34;
pub const REG_CC2_CURRENT: u8 = 0x3A;
pub const REG_SUBCMD_LOW: u8 = 0x3E;
pub const REG_SUBCMD_DATA: u8 = 0x40;
pub const REG_SUBCMD_CKSUM: u8 = 0x60;
pub const REG_TS1_TEMP: u8 = 0x70;
pub const REG_TS2_TEMP: u8 = 0x72;
pub const REG_TS3_TEMP: u8 = 0x74;

/// Subcommands.
pub const SUBCMD_DEVICE_NUMBER: u16 = 0x0001;
pub const SUBCMD_SET_CFGUPDATE: u16 = 0x0090;
pub const SUBCMD_EXIT_CFGUPDATE: u16 = 0x0092;
/// Cell-balancing active-cells mask.
pub const SUBCMD_CB_ACTIVE_CELLS: u16 = 0x0083;

/// Expected DEVICE_NUMBER response.
pub const DEVICE_NUMBER: u16 = 0x7695;

/// Safety Status A bits.
pub const SSA_CELL_UV: u8 = 1 << 2;
pub const SSA_CELL_OV: u8 = 1 << 3;
pub const SSA_OC_CHARGE: u8 = 1 << 4;
pub const SSA_OC_DISCHARGE_1: u8 = 1 << 5;
pub const SSA_OC_DISCHARGE_2: u8 = 1 << 6;
pub const SSA_SC_DISCHARGE: u8 = 1 << 7;

/// Safety Status B bits.
pub const SSB_UT_CHARGE: u8 = 1 << 0;
pub const SSB_UT_DISCHARGE: u8 = 1 << 1;
pub const SSB_UT_INTERNAL: u8 = 1 << 2;
pub const SSB_OT_CHARGE: u8 = 1 << 4;
pub const SSB_OT_DISCHARGE: u8 = 1 << 5;
pub const SSB_OT_INTERNAL: u8 = 1 << 6;
pub const SSB_OT_FET: u8 = 1 << 7;

/// Register-level access to the per-module monitor ASICs.
pub struct Bq76952 {
    hal: Arc<dyn Hal>,
}

impl Bq76952 {
    pub fn new(hal: Arc<dyn Hal>) -> Self {
        Self { hal }
    }

    fn read_reg16(&self, module_id: u8, reg: u8) -> Result<u16, HalError> {
        self.hal.i2c_select_module(module_id);
        let mut buf = [0u8; 2];
        self.hal.i2c_read(I2C_ADDR, reg, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_reg8(&self, module_id: u8, reg: u8) -> Result<u8, HalError> {
        self.hal.i2c_select_module(module_id);
        let mut buf = [0u8; 1];
        self.hal.i2c_read(I2C_ADDR, reg, &mut buf)?;
        Ok(buf[0])
    }

    /// One's-complement-of-sum checksum over the subcommand address and data.
    pub fn checksum(data: &[u8]) -> u8 {
        !data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
    }

    /// Write a bare subcommand to the 0x3E/0x3F window.
    pub fn subcommand(&self, module_id: u8, subcmd: u16) -> Result<(), HalError> {
        self.hal.i2c_select_module(module_id);
        let bytes = subcmd.to_le_bytes();
        self.hal.i2c_write(I2C_ADDR, &[REG_SUBCMD_LOW, bytes[0], bytes[1]])
    }

    /// Write a subcommand with a data payload, followed by the checksum and
    /// transfer length at 0x60/0x61.
    pub fn subcommand_write(&self, module_id: u8, subcmd: u16, data: &[u8]) -> Result<(), HalError> {
        self.hal.i2c_select_module(module_id);
        let addr = subcmd.to_le_bytes();

        let mut buf = Vec::with_capacity(3 + data.len());
        buf.push(REG_SUBCMD_LOW);
        buf.extend_from_slice(&addr);
        buf.extend_from_slice(data);
        self.hal.i2c_write(I2C_ADDR, &buf)?;

        let mut cksum_src = Vec::with_capacity(2 + data.len());
        cksum_src.extend_from_slice(&addr);
        cksum_src.extend_from_slice(data);
        let cksum = Self::checksum(&cksum_src);
        let len = 4 + data.len() as u8;
        self.hal.i2c_write(I2C_ADDR, &[REG_SUBCMD_CKSUM, cksum, len])
    }

    /// Probe the device-number subcommand; returns the reported id.
    pub fn device_number(&self, module_id: u8) -> Result<u16, HalError> {
        self.subcommand(module_id, SUBCMD_DEVICE_NUMBER)?;
        self.hal.delay_ms(2);
        self.read_reg16(module_id, REG_SUBCMD_DATA)
    }

    /// Read all cell voltages for one module into `out`, millivolts.
    pub fn read_all_cells(
        &self,
        module_id: u8,
        out: &mut [u16; CELLS_PER_MODULE],
    ) -> Result<(), HalError> {
        for (cell, slot) in out.iter_mut().enumerate() {
            let reg = REG_CELL1_VOLTAGE + (cell as u8) * 2;
            *slot = self.read_reg16(module_id, reg)?;
        }
        Ok(())
    }

    /// Module stack voltage in millivolts (register LSB is 10 mV).
    pub fn read_stack_voltage(&self, module_id: u8) -> Result<u16, HalError> {
        let raw = self.read_reg16(module_id, REG_STACK_VOLTAGE)?;
        Ok(raw.saturating_mul(10))
    }

    /// Thermistor reading in signed 0.1 degC. Raw register is 0.1 K.
    pub fn read_temperature(&self, module_id: u8, sensor_idx: u8) -> Result<i16, HalError> {
        let reg = match sensor_idx as usize {
            0 => REG_TS1_TEMP,
            1 => REG_TS2_TEMP,
            _ if (sensor_idx as usize) < TEMPS_PER_MODULE => REG_TS3_TEMP,
            _ => return Ok(0),
        };
        let raw = self.read_reg16(module_id, reg)?;
        Ok((raw as i32 - 2731) as i16)
    }

    /// CC2 pack current through this module, signed milliamps. The register
    /// is configured for 100 mA units so the full +-640 A range fits.
    pub fn read_current(&self, module_id: u8) -> Result<i32, HalError> {
        let raw = self.read_reg16(module_id, REG_CC2_CURRENT)?;
        Ok(raw as i16 as i32 * 100)
    }

    /// Safety status registers A/B/C.
    pub fn read_safety(&self, module_id: u8) -> Result<AsicSafetyStatus, HalError> {
        Ok(AsicSafetyStatus {
            status_a: self.read_reg8(module_id, REG_SAFETY_STATUS_A)?,
            status_b: self.read_reg8(module_id, REG_SAFETY_STATUS_B)?,
            status_c: self.read_reg8(module_id, REG_SAFETY_STATUS_C)?,
        })
    }

    /// Program the passive-balancing cell mask (bit per cell, LSB = cell 0).
    pub fn set_balance(&self, module_id: u8, mask: u16) -> Result<(), HalError> {
        self.subcommand_write(module_id, SUBCMD_CB_ACTIVE_CELLS, &mask.to_le_bytes())
    }
}
