//! Desktop mock HAL for the simulator and the test suite.
//!
//! All state is injectable: cell voltages, temperatures and safety registers
//! the ASIC driver will read back, GPIO inputs, ADC samples, queued CAN RX
//! frames, and the tick counter. GPIO outputs, CAN TX frames, balancing masks
//! and NVM contents are captured for inspection.

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::domain::types::{NUM_MODULES, TEMPS_PER_MODULE};

use super::bq76952::{
    DEVICE_NUMBER, REG_CC2_CURRENT, REG_CELL1_VOLTAGE, REG_SAFETY_ALERT_A, REG_SAFETY_STATUS_C,
    REG_STACK_VOLTAGE, REG_SUBCMD_DATA, REG_SUBCMD_LOW, REG_TS1_TEMP, REG_TS2_TEMP, REG_TS3_TEMP,
    SUBCMD_CB_ACTIVE_CELLS, SUBCMD_DEVICE_NUMBER,
};
use super::{AdcChannel, CanFrame, GpioPin, Hal, HalError, BUS_SENSE_MV_PER_LSB};

const GPIO_COUNT: usize = 9;
const ADC_COUNT: usize = 3;
const CELLS_PER_ASIC: usize = 16;
const NVM_SIZE: usize = 4096;

fn gpio_idx(pin: GpioPin) -> usize {
    match pin {
        GpioPin::ContactorPos => 0,
        GpioPin::ContactorNeg => 1,
        GpioPin::PrechargeRelay => 2,
        GpioPin::ContactorFbPos => 3,
        GpioPin::ContactorFbNeg => 4,
        GpioPin::FaultLed => 5,
        GpioPin::WarningLed => 6,
        GpioPin::FaultRelay => 7,
        GpioPin::WarningRelay => 8,
    }
}

fn adc_idx(channel: AdcChannel) -> usize {
    match channel {
        AdcChannel::BusVoltage => 0,
        AdcChannel::PackCurrent => 1,
        AdcChannel::ContactorVoltage => 2,
    }
}

struct MockState {
    cell_mv: [[u16; CELLS_PER_ASIC]; NUM_MODULES],
    /// Raw thermistor readings in 0.1 K, as the ASIC reports them.
    temp_raw: [[u16; TEMPS_PER_MODULE]; NUM_MODULES],
    safety_a: [u8; NUM_MODULES],
    safety_b: [u8; NUM_MODULES],
    safety_c: [u8; NUM_MODULES],
    current_ma: [i32; NUM_MODULES],
    balance_mask: [u16; NUM_MODULES],

    gpio_out: [bool; GPIO_COUNT],
    gpio_in: [bool; GPIO_COUNT],
    adc: [u16; ADC_COUNT],

    can_tx: Vec<CanFrame>,
    can_rx: VecDeque<CanFrame>,

    tick_ms: u32,
    active_module: u8,
    last_subcmd: u16,
    i2c_fail: bool,

    nvm: [u8; NVM_SIZE],
    nvm_fail: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            // Mid-SoC defaults: 3675 mV cells at 25.0 C (298.2 K).
            cell_mv: [[3675; CELLS_PER_ASIC]; NUM_MODULES],
            temp_raw: [[2982; TEMPS_PER_MODULE]; NUM_MODULES],
            safety_a: [0; NUM_MODULES],
            safety_b: [0; NUM_MODULES],
            safety_c: [0; NUM_MODULES],
            current_ma: [0; NUM_MODULES],
            balance_mask: [0; NUM_MODULES],
            gpio_out: [false; GPIO_COUNT],
            gpio_in: [false; GPIO_COUNT],
            adc: [0; ADC_COUNT],
            can_tx: Vec::new(),
            can_rx: VecDeque::new(),
            tick_ms: 0,
            active_module: 0,
            last_subcmd: 0,
            i2c_fail: false,
            nvm: [0; NVM_SIZE],
            nvm_fail: false,
        }
    }
}

/// Injectable desktop HAL.
pub struct MockHal {
    state: Mutex<MockState>,
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHal {
    pub fn new() -> Self {
        Self { state: Mutex::new(MockState::default()) }
    }

    // -- injection API ------------------------------------------------------

    pub fn set_cell_voltage(&self, module_id: u8, cell_idx: u8, mv: u16) {
        let mut st = self.state.lock();
        if (module_id as usize) < NUM_MODULES && (cell_idx as usize) < CELLS_PER_ASIC {
            st.cell_mv[module_id as usize][cell_idx as usize] = mv;
        }
    }

    pub fn set_all_cell_voltages(&self, mv: u16) {
        let mut st = self.state.lock();
        for module in st.cell_mv.iter_mut() {
            module.fill(mv);
        }
    }

    pub fn set_temperature(&self, module_id: u8, sensor_idx: u8, deci_c: i16) {
        let mut st = self.state.lock();
        if (module_id as usize) < NUM_MODULES && (sensor_idx as usize) < TEMPS_PER_MODULE {
            st.temp_raw[module_id as usize][sensor_idx as usize] = (deci_c as i32 + 2731) as u16;
        }
    }

    pub fn set_all_temperatures(&self, deci_c: i16) {
        let mut st = self.state.lock();
        for module in st.temp_raw.iter_mut() {
            module.fill((deci_c as i32 + 2731) as u16);
        }
    }

    pub fn set_safety_a(&self, module_id: u8, flags: u8) {
        self.state.lock().safety_a[module_id as usize % NUM_MODULES] = flags;
    }

    pub fn set_safety_b(&self, module_id: u8, flags: u8) {
        self.state.lock().safety_b[module_id as usize % NUM_MODULES] = flags;
    }

    pub fn set_current_ma(&self, module_id: u8, ma: i32) {
        self.state.lock().current_ma[module_id as usize % NUM_MODULES] = ma;
    }

    pub fn set_i2c_fail(&self, fail: bool) {
        self.state.lock().i2c_fail = fail;
    }

    pub fn set_nvm_fail(&self, fail: bool) {
        self.state.lock().nvm_fail = fail;
    }

    pub fn set_gpio_input(&self, pin: GpioPin, state: bool) {
        self.state.lock().gpio_in[gpio_idx(pin)] = state;
    }

    pub fn set_adc(&self, channel: AdcChannel, raw: u16) {
        self.state.lock().adc[adc_idx(channel)] = raw.min(4095);
    }

    /// Convenience: program the bus-voltage ADC channel from millivolts.
    pub fn set_bus_voltage_mv(&self, mv: u32) {
        self.set_adc(AdcChannel::BusVoltage, (mv / BUS_SENSE_MV_PER_LSB) as u16);
    }

    pub fn set_tick(&self, ms: u32) {
        self.state.lock().tick_ms = ms;
    }

    pub fn advance_tick(&self, ms: u32) {
        self.state.lock().tick_ms += ms;
    }

    pub fn inject_can_rx(&self, frame: CanFrame) {
        self.state.lock().can_rx.push_back(frame);
    }

    // -- capture API --------------------------------------------------------

    pub fn gpio_output(&self, pin: GpioPin) -> bool {
        self.state.lock().gpio_out[gpio_idx(pin)]
    }

    pub fn balance_mask(&self, module_id: u8) -> u16 {
        self.state.lock().balance_mask[module_id as usize % NUM_MODULES]
    }

    pub fn can_tx_count(&self) -> usize {
        self.state.lock().can_tx.len()
    }

    /// Drain and return every captured TX frame.
    pub fn take_can_tx(&self) -> Vec<CanFrame> {
        std::mem::take(&mut self.state.lock().can_tx)
    }
}

impl Hal for MockHal {
    fn i2c_select_module(&self, module_id: u8) {
        let mut st = self.state.lock();
        if (module_id as usize) < NUM_MODULES {
            st.active_module = module_id;
        }
    }

    fn i2c_write(&self, addr: u8, data: &[u8]) -> Result<(), HalError> {
        let mut st = self.state.lock();
        if st.i2c_fail {
            return Err(HalError::I2c { addr, reg: data.first().copied().unwrap_or(0) });
        }

        // Track subcommand-window writes so reads from 0x40 and balancing
        // mask captures behave like the real part.
        if data.len() >= 3 && data[0] == REG_SUBCMD_LOW {
            st.last_subcmd = u16::from_le_bytes([data[1], data[2]]);
            if st.last_subcmd == SUBCMD_CB_ACTIVE_CELLS && data.len() >= 5 {
                let module = st.active_module as usize;
                st.balance_mask[module] = u16::from_le_bytes([data[3], data[4]]);
            }
        }
        Ok(())
    }

    fn i2c_read(&self, addr: u8, reg: u8, buf: &mut [u8]) -> Result<(), HalError> {
        let st = self.state.lock();
        if st.i2c_fail {
            return Err(HalError::I2c { addr, reg });
        }
        let m = st.active_module as usize;

        // Cell voltage window: 0x14 + 2 * cell.
        if (REG_CELL1_VOLTAGE..REG_CELL1_VOLTAGE + (CELLS_PER_ASIC as u8) * 2).contains(&reg)
            && buf.len() == 2
        {
            let cell = ((reg - REG_CELL1_VOLTAGE) / 2) as usize;
            buf.copy_from_slice(&st.cell_mv[m][cell].to_le_bytes());
            return Ok(());
        }

        if (REG_SAFETY_ALERT_A..=REG_SAFETY_STATUS_C).contains(&reg) && buf.len() == 1 {
            buf[0] = match reg {
                r if r <= 0x03 => st.safety_a[m],
                r if r <= 0x05 => st.safety_b[m],
                _ => st.safety_c[m],
            };
            return Ok(());
        }

        if buf.len() == 2 {
            let raw: Option<u16> = match reg {
                REG_TS1_TEMP => Some(st.temp_raw[m][0]),
                REG_TS2_TEMP => Some(st.temp_raw[m][1]),
                REG_TS3_TEMP => Some(st.temp_raw[m][2]),
                // CC2 is configured for 100 mA units.
                REG_CC2_CURRENT => Some((st.current_ma[m] / 100) as i16 as u16),
                REG_STACK_VOLTAGE => {
                    let sum: u32 = st.cell_mv[m][..crate::domain::CELLS_PER_MODULE]
                        .iter()
                        .map(|&v| v as u32)
                        .sum();
                    Some((sum / 10) as u16)
                }
                REG_SUBCMD_DATA if st.last_subcmd == SUBCMD_DEVICE_NUMBER => Some(DEVICE_NUMBER),
                _ => None,
            };
            if let Some(v) = raw {
                buf.copy_from_slice(&v.to_le_bytes());
                return Ok(());
            }
        }

        buf.fill(0);
        Ok(())
    }

    fn gpio_write(&self, pin: GpioPin, state: bool) {
        self.state.lock().gpio_out[gpio_idx(pin)] = state;
    }

    fn gpio_read(&self, pin: GpioPin) -> bool {
        self.state.lock().gpio_in[gpio_idx(pin)]
    }

    fn adc_read(&self, channel: AdcChannel) -> u16 {
        self.state.lock().adc[adc_idx(channel)]
    }

    fn can_transmit(&self, frame: &CanFrame) -> Result<(), HalError> {
        self.state.lock().can_tx.push(*frame);
        Ok(())
    }

    fn can_receive(&self) -> Result<Option<CanFrame>, HalError> {
        Ok(self.state.lock().can_rx.pop_front())
    }

    fn tick_ms(&self) -> u32 {
        self.state.lock().tick_ms
    }

    fn delay_ms(&self, ms: u32) {
        self.state.lock().tick_ms += ms;
    }

    fn critical_enter(&self) {}

    fn critical_exit(&self) {}

    fn nvm_write(&self, addr: u32, data: &[u8]) -> Result<(), HalError> {
        let mut st = self.state.lock();
        if st.nvm_fail {
            return Err(HalError::Nvm { addr });
        }
        let start = addr as usize;
        let end = start + data.len();
        if end > NVM_SIZE {
            return Err(HalError::Nvm { addr });
        }
        st.nvm[start..end].copy_from_slice(data);
        Ok(())
    }

    fn nvm_read(&self, addr: u32, buf: &mut [u8]) -> Result<(), HalError> {
        let st = self.state.lock();
        if st.nvm_fail {
            return Err(HalError::Nvm { addr });
        }
        let start = addr as usize;
        let end = start + buf.len();
        if end > NVM_SIZE {
            return Err(HalError::Nvm { addr });
        }
        buf.copy_from_slice(&st.nvm[start..end]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpio_roundtrip() {
        let hal = MockHal::new();
        hal.gpio_write(GpioPin::ContactorPos, true);
        assert!(hal.gpio_output(GpioPin::ContactorPos));
        hal.set_gpio_input(GpioPin::ContactorFbPos, true);
        assert!(hal.gpio_read(GpioPin::ContactorFbPos));
    }

    #[test]
    fn can_queues_are_fifo() {
        let hal = MockHal::new();
        hal.inject_can_rx(CanFrame { id: 1, dlc: 0, data: [0; 8] });
        hal.inject_can_rx(CanFrame { id: 2, dlc: 0, data: [0; 8] });
        assert_eq!(hal.can_receive().unwrap().unwrap().id, 1);
        assert_eq!(hal.can_receive().unwrap().unwrap().id, 2);
        assert_eq!(hal.can_receive().unwrap(), None);
    }

    #[test]
    fn nvm_roundtrip_and_bounds() {
        let hal = MockHal::new();
        hal.nvm_write(16, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        hal.nvm_read(16, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert!(hal.nvm_write(4095, &[1, 2]).is_err());
    }

    #[test]
    fn bus_voltage_helper_scales_to_adc() {
        let hal = MockHal::new();
        hal.set_bus_voltage_mv(1_131_000);
        assert_eq!(hal.adc_read(AdcChannel::BusVoltage) as u32, 1_131_000 / BUS_SENSE_MV_PER_LSB);
    }

    #[test]
    fn tick_is_controllable() {
        let hal = MockHal::new();
        hal.set_tick(100);
        hal.advance_tick(50);
        assert_eq!(hal.tick_ms(), 150);
        hal.delay_ms(2);
        assert_eq!(hal.tick_ms(), 152);
    }
}
