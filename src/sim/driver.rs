//! Desktop simulation driver.
//!
//! The driver owns the plant side of the loop: every tick it copies each
//! pack's physics state into that pack's mock HAL (cell voltages,
//! temperatures, pack current, bus-voltage ADC), applies scripted anomalies
//! and optional measurement noise, then runs the array control step. EMS
//! traffic is injected as real CAN frames so the whole RX path is exercised.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::array::{Array, ArrayRequest};
use crate::comms::can;
use crate::config::{Config, Scenario};
use crate::controller::PackController;
use crate::domain::types::{BmsError, PackMode, CELLS_PER_MODULE, NUM_MODULES};
use crate::hardware::{Hal, MockHal};
use crate::protection::ProtectionConfig;

/// Array simulation harness over mock HALs.
pub struct SimDriver {
    array: Array,
    hals: Vec<Arc<MockHal>>,
    tick_ms: u32,
    time_ms: u32,
    noise_cell_mv: u16,
    rng: StdRng,
    /// (pack, module, cell) -> forced reading, mV.
    cell_overrides: HashMap<(usize, u8, u8), u16>,
    /// (pack, module, sensor) -> forced reading, 0.1 C.
    temp_overrides: HashMap<(usize, u8, u8), i16>,
}

impl SimDriver {
    pub fn from_config(config: &Config) -> Result<Self, BmsError> {
        let protection = ProtectionConfig::from(&config.protection);
        let seeds: Vec<(u8, f64, f64)> =
            config.array.packs.iter().map(|p| (p.id, p.soc, p.temperature_c)).collect();
        Self::new(
            &seeds,
            protection,
            config.demo.tick_ms,
            config.sim.noise_cell_mv,
            config.sim.seed,
        )
    }

    /// `seeds` are (id, initial SoC, initial temperature) triples.
    pub fn new(
        seeds: &[(u8, f64, f64)],
        protection: ProtectionConfig,
        tick_ms: u32,
        noise_cell_mv: u16,
        noise_seed: u64,
    ) -> Result<Self, BmsError> {
        let mut hals = Vec::with_capacity(seeds.len());
        let mut controllers = Vec::with_capacity(seeds.len());
        for &(id, soc, temp_c) in seeds {
            let hal = Arc::new(MockHal::new());
            controllers.push(PackController::new(
                id,
                soc,
                temp_c,
                protection,
                Arc::clone(&hal) as Arc<dyn Hal>,
            ));
            hals.push(hal);
        }

        let mut driver = Self {
            array: Array::new(controllers)?,
            hals,
            tick_ms,
            time_ms: 0,
            noise_cell_mv,
            rng: StdRng::seed_from_u64(noise_seed),
            cell_overrides: HashMap::new(),
            temp_overrides: HashMap::new(),
        };
        driver.couple_plant();
        Ok(driver)
    }

    pub fn array(&self) -> &Array {
        &self.array
    }

    pub fn array_mut(&mut self) -> &mut Array {
        &mut self.array
    }

    pub fn hal(&self, pack_idx: usize) -> &Arc<MockHal> {
        &self.hals[pack_idx]
    }

    pub fn time_ms(&self) -> u32 {
        self.time_ms
    }

    pub fn time_s(&self) -> f64 {
        self.time_ms as f64 / 1000.0
    }

    // -- scripted events ----------------------------------------------------

    /// Force one cell's reading until cleared.
    pub fn set_cell_override(&mut self, pack_idx: usize, module: u8, cell: u8, mv: u16) {
        self.cell_overrides.insert((pack_idx, module, cell), mv);
    }

    /// Force one thermistor's reading until cleared.
    pub fn set_temp_override(&mut self, pack_idx: usize, module: u8, sensor: u8, deci_c: i16) {
        self.temp_overrides.insert((pack_idx, module, sensor), deci_c);
    }

    pub fn clear_overrides(&mut self) {
        self.cell_overrides.clear();
        self.temp_overrides.clear();
    }

    /// Inject an EMS command frame on one pack's bus.
    pub fn send_command(&self, pack_idx: usize, code: u8, charge_a: i16, discharge_a: i16) {
        self.hals[pack_idx].inject_can_rx(can::encode_ems_command(code, charge_a, discharge_a));
    }

    pub fn send_command_all(&self, code: u8, charge_a: i16, discharge_a: i16) {
        for idx in 0..self.hals.len() {
            self.send_command(idx, code, charge_a, discharge_a);
        }
    }

    pub fn send_heartbeat_all(&self) {
        for hal in &self.hals {
            hal.inject_can_rx(can::encode_ems_heartbeat());
        }
    }

    // -- stepping -----------------------------------------------------------

    /// One control tick: plant coupling, array step, clock advance.
    pub fn step(&mut self, request: ArrayRequest) -> Result<(), BmsError> {
        self.couple_plant();
        self.array.step(self.tick_ms, request, None)?;
        for hal in &self.hals {
            hal.advance_tick(self.tick_ms);
        }
        self.time_ms += self.tick_ms;
        Ok(())
    }

    pub fn run_for(&mut self, duration_ms: u32, request: ArrayRequest) -> Result<(), BmsError> {
        let mut elapsed = 0;
        while elapsed < duration_ms {
            self.step(request)?;
            elapsed += self.tick_ms;
        }
        Ok(())
    }

    /// Mirror the physics state into the measurement side of every mock HAL.
    fn couple_plant(&mut self) {
        let bus_mv = (self.array.bus_voltage_v() * 1000.0).max(0.0) as u32;

        for (idx, hal) in self.hals.iter().enumerate() {
            let model = self.array.controller(idx).pack();
            let base_mv = (model.cell_voltage_v() * 1000.0).round().clamp(0.0, 65535.0) as u16;
            let temp_deci = (model.temperature_c() * 10.0).round() as i16;
            let current_ma = (model.current_a() * 1000.0) as i32;

            if self.noise_cell_mv == 0 {
                hal.set_all_cell_voltages(base_mv);
            } else {
                let spread = self.noise_cell_mv as i32;
                for module in 0..NUM_MODULES as u8 {
                    for cell in 0..CELLS_PER_MODULE as u8 {
                        let noise = self.rng.gen_range(-spread..=spread);
                        let mv = (base_mv as i32 + noise).clamp(0, 65535) as u16;
                        hal.set_cell_voltage(module, cell, mv);
                    }
                }
            }
            hal.set_all_temperatures(temp_deci);
            hal.set_current_ma(0, current_ma);
            hal.set_bus_voltage_mv(bus_mv);

            for (&(pack, module, cell), &mv) in &self.cell_overrides {
                if pack == idx {
                    hal.set_cell_voltage(module, cell, mv);
                }
            }
            for (&(pack, module, sensor), &deci) in &self.temp_overrides {
                if pack == idx {
                    hal.set_temperature(module, sensor, deci);
                }
            }
        }
    }
}

/// Scripted scenario on top of [`SimDriver`]: settle, connect the fleet,
/// feed the EMS watchdog, drive the requested current, optionally break
/// things halfway through.
pub struct ScenarioRunner {
    driver: SimDriver,
    scenario: Scenario,
    request_a: f64,
    duration_ms: u32,
    heartbeat_acc_ms: u32,
    connect_issued: bool,
    fault_injected: bool,
}

/// Fleet connect starts after this settling time.
const CONNECT_AT_MS: u32 = 500;
/// EMS heartbeat cadence.
const HEARTBEAT_PERIOD_MS: u32 = 1000;

impl ScenarioRunner {
    pub fn new(driver: SimDriver, scenario: Scenario, request_a: f64, duration_s: u32) -> Self {
        Self {
            driver,
            scenario,
            request_a,
            duration_ms: duration_s.saturating_mul(1000),
            heartbeat_acc_ms: 0,
            connect_issued: false,
            fault_injected: false,
        }
    }

    pub fn driver(&self) -> &SimDriver {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut SimDriver {
        &mut self.driver
    }

    pub fn finished(&self) -> bool {
        self.driver.time_ms() >= self.duration_ms
    }

    fn for_charge(&self) -> bool {
        !matches!(self.scenario, Scenario::Discharge)
    }

    fn request(&self) -> ArrayRequest {
        match self.scenario {
            Scenario::Charge | Scenario::CellFault => ArrayRequest::Current(self.request_a),
            Scenario::Discharge => ArrayRequest::Current(-self.request_a),
            Scenario::Equalization => ArrayRequest::Equalize,
        }
    }

    /// One scripted control tick.
    pub fn tick(&mut self) -> Result<(), BmsError> {
        let now = self.driver.time_ms();

        if !self.connect_issued && now >= CONNECT_AT_MS {
            let for_charge = self.for_charge();
            self.driver.array_mut().connect_first(for_charge);
            self.connect_issued = true;
            // Contactor feedback is wired through in the simulated plant.
            for idx in 0..self.driver.hals.len() {
                let hal = self.driver.hal(idx);
                hal.set_gpio_input(crate::hardware::GpioPin::ContactorFbPos, true);
                hal.set_gpio_input(crate::hardware::GpioPin::ContactorFbNeg, true);
            }
        }
        if self.connect_issued {
            let any_connected =
                self.driver.array().controllers().iter().any(|c| c.mode() == PackMode::Connected);
            let any_ready =
                self.driver.array().controllers().iter().any(|c| c.mode() == PackMode::Ready);
            if any_connected && any_ready {
                let for_charge = self.for_charge();
                self.driver.array_mut().connect_remaining(for_charge);
            }
        }

        self.heartbeat_acc_ms += self.driver.tick_ms;
        if self.heartbeat_acc_ms >= HEARTBEAT_PERIOD_MS {
            self.heartbeat_acc_ms = 0;
            self.driver.send_heartbeat_all();
        }

        if self.scenario == Scenario::CellFault
            && !self.fault_injected
            && now >= self.duration_ms / 2
        {
            info!("scripted anomaly: cell 0 of pack 0 stuck at 4310 mV");
            self.driver.set_cell_override(0, 0, 0, 4310);
            self.fault_injected = true;
        }

        let request = self.request();
        self.driver.step(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_driver() -> SimDriver {
        SimDriver::new(
            &[(1, 0.45, 25.0), (2, 0.55, 25.0), (3, 0.65, 25.0)],
            ProtectionConfig::default(),
            10,
            0,
            42,
        )
        .unwrap()
    }

    #[test]
    fn plant_coupling_mirrors_model_into_hal() {
        let mut driver = make_driver();
        driver.run_for(400, ArrayRequest::Current(0.0)).unwrap();

        let model_mv = (driver.array().controller(0).pack().cell_voltage_v() * 1000.0).round();
        let measured = driver.array().controller(0).data().avg_cell_mv;
        assert!((measured as f64 - model_mv).abs() <= 1.0);
    }

    #[test]
    fn fleet_reaches_ready_then_connects() {
        let driver = make_driver();
        let mut runner = ScenarioRunner::new(driver, Scenario::Charge, 200.0, 30);

        for _ in 0..300 {
            runner.tick().unwrap();
        }
        let connected = runner
            .driver()
            .array()
            .controllers()
            .iter()
            .filter(|c| c.mode() == PackMode::Connected)
            .count();
        assert_eq!(connected, 3, "all packs on the bus after 3 s");
    }

    #[test]
    fn charge_scenario_raises_soc() {
        let driver = make_driver();
        let mut runner = ScenarioRunner::new(driver, Scenario::Charge, 300.0, 60);
        let initial: f64 =
            runner.driver().array().controllers().iter().map(|c| c.pack().soc()).sum();

        while !runner.finished() {
            runner.tick().unwrap();
        }
        let total: f64 = runner.driver().array().controllers().iter().map(|c| c.pack().soc()).sum();
        assert!(total > initial, "net charge after {initial} -> {total}");
    }

    #[test]
    fn cell_fault_scenario_latches_and_sheds_the_pack() {
        let driver = make_driver();
        let mut runner = ScenarioRunner::new(driver, Scenario::CellFault, 200.0, 60);
        while !runner.finished() {
            runner.tick().unwrap();
        }

        let faulted = runner.driver().array().controller(0);
        assert!(faulted.data().fault_latched);
        assert_eq!(faulted.mode(), PackMode::Fault);
        assert_eq!(faulted.envelope().charge_a, 0.0);
        // The commanded current for a shed pack is zero.
        assert_eq!(faulted.commanded_current_a(), 0.0);
    }

    #[test]
    fn ems_set_limits_clamps_envelope() {
        let mut driver = make_driver();
        driver.run_for(400, ArrayRequest::Current(0.0)).unwrap();
        assert_eq!(driver.array().controller(0).mode(), PackMode::Ready);

        driver.send_command(0, can::CMD_SET_LIMITS, 100, 150);
        driver.run_for(200, ArrayRequest::Current(0.0)).unwrap();

        let env = driver.array().controller(0).envelope();
        assert!(env.charge_a <= 100.0);
        assert!(env.discharge_a <= 150.0);
        // The other packs keep the full derated envelope.
        assert!(driver.array().controller(1).envelope().charge_a > 300.0);
    }

    #[test]
    fn noise_stays_within_configured_band() {
        let mut driver = SimDriver::new(
            &[(1, 0.50, 25.0)],
            ProtectionConfig::default(),
            10,
            5,
            7,
        )
        .unwrap();
        driver.run_for(400, ArrayRequest::Current(0.0)).unwrap();

        let data = driver.array().controller(0).data();
        let model_mv = (driver.array().controller(0).pack().cell_voltage_v() * 1000.0) as i32;
        assert!((data.max_cell_mv as i32 - model_mv).abs() <= 6);
        assert!((data.min_cell_mv as i32 - model_mv).abs() <= 6);
    }
}
