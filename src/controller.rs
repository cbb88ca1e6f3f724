//! Per-pack controller: owns the physics model, the measured telemetry, and
//! every per-pack task, and runs them in the fixed tick order
//!
//!   CAN RX -> monitor -> protection -> current limits -> SoC -> contactor ->
//!   pack state -> CAN TX
//!
//! so a fault latched by protection is visible to the state machine (and the
//! array solver) within the same 10 ms control tick. The contactor, state and
//! CAN tasks run at their own longer periods via accumulators, matching the
//! firmware task table (10/10/50/100/100 ms).

use std::sync::Arc;
use tracing::info;

use crate::comms::{CanBus, NvmStore};
use crate::contactor::ContactorFsm;
use crate::domain::types::{
    BmsError, ContactorState, CurrentLimit, EmsCommand, EmsRequest, PackData, PackMode,
};
use crate::domain::Pack;
use crate::hardware::{AdcChannel, GpioPin, Hal, BUS_SENSE_MV_PER_LSB};
use crate::limits;
use crate::monitor::Monitor;
use crate::protection::{Protection, ProtectionConfig};
use crate::soc::SocEstimator;
use crate::state;

/// Reference task periods, milliseconds.
pub const MONITOR_PERIOD_MS: u32 = 10;
pub const PROTECTION_PERIOD_MS: u32 = 10;
pub const CONTACTOR_PERIOD_MS: u32 = 50;
pub const STATE_PERIOD_MS: u32 = 100;
pub const CAN_TX_PERIOD_MS: u32 = 100;
/// Operating-record save interval.
pub const PERSIST_PERIOD_MS: u32 = 60_000;

/// One pack's complete control stack.
pub struct PackController {
    id: u8,
    hal: Arc<dyn Hal>,

    pack: Pack,
    data: PackData,
    protection: Protection,
    contactor: ContactorFsm,
    monitor: Monitor,
    soc: SocEstimator,
    can: CanBus,
    nvm: NvmStore,

    /// Current assigned by the array solver for the next physics step.
    commanded_current_a: f64,
    /// Standing EMS SET_LIMITS clamp.
    ems_limit: Option<CurrentLimit>,
    pending_cmd: Option<EmsCommand>,

    contactor_acc_ms: u32,
    state_acc_ms: u32,
    can_tx_acc_ms: u32,
    persist_acc_ms: u32,
    charge_mah_acc: f64,
    discharge_mah_acc: f64,
}

impl PackController {
    pub fn new(
        id: u8,
        initial_soc: f64,
        initial_temp_c: f64,
        protection_config: ProtectionConfig,
        hal: Arc<dyn Hal>,
    ) -> Self {
        let pack = Pack::new(id, initial_soc, initial_temp_c);
        let mut data = PackData::default();
        data.soc_hundredths = (initial_soc.clamp(0.0, 1.0) * 10_000.0).round() as u16;

        Self {
            id,
            hal: Arc::clone(&hal),
            pack,
            data,
            protection: Protection::new(protection_config),
            contactor: ContactorFsm::new(Arc::clone(&hal)),
            monitor: Monitor::new(Arc::clone(&hal)),
            soc: SocEstimator::new(initial_soc),
            can: CanBus::new(Arc::clone(&hal)),
            nvm: NvmStore::new(hal),
            commanded_current_a: 0.0,
            ems_limit: None,
            pending_cmd: None,
            contactor_acc_ms: 0,
            state_acc_ms: 0,
            can_tx_acc_ms: 0,
            persist_acc_ms: 0,
            charge_mah_acc: 0.0,
            discharge_mah_acc: 0.0,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn mode(&self) -> PackMode {
        self.data.mode
    }

    pub fn pack(&self) -> &Pack {
        &self.pack
    }

    pub fn data(&self) -> &PackData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut PackData {
        &mut self.data
    }

    pub fn protection(&self) -> &Protection {
        &self.protection
    }

    pub fn contactor_state(&self) -> ContactorState {
        self.contactor.state()
    }

    pub fn nvm(&self) -> &NvmStore {
        &self.nvm
    }

    pub fn commanded_current_a(&self) -> f64 {
        self.commanded_current_a
    }

    pub fn envelope(&self) -> CurrentLimit {
        CurrentLimit {
            charge_a: self.data.charge_limit_a,
            discharge_a: self.data.discharge_limit_a,
        }
    }

    /// One control tick; `dt_ms` is the base (monitor) period. All writes to
    /// the shared pack data happen inside the HAL critical section.
    pub fn tick(&mut self, dt_ms: u32) {
        self.hal.critical_enter();

        // Inbound EMS traffic. Every message feeds the watchdog; the latest
        // actionable command is consumed once by the state task.
        for cmd in self.can.rx_poll() {
            self.data.last_ems_msg_ms = self.data.uptime_ms;
            if cmd.request != EmsRequest::Heartbeat {
                self.pending_cmd = Some(cmd);
            }
        }

        self.data.bus_voltage_mv =
            self.hal.adc_read(AdcChannel::BusVoltage) as u32 * BUS_SENSE_MV_PER_LSB;

        self.monitor.run(&mut self.data);

        let fired = self.protection.run(&mut self.data, dt_ms);
        for record in fired {
            self.nvm.log_fault(self.data.uptime_ms, &record);
        }
        if self.data.fault_latched && self.data.mode != PackMode::Fault {
            state::enter_fault(&mut self.data, &mut self.contactor);
        }

        // Effective envelope: derating curves, EMS clamp, fault gate.
        let mut envelope = limits::pack_envelope(&self.data, self.soc.soc());
        if let Some(ems) = self.ems_limit {
            envelope = envelope.min(ems);
        }
        if self.data.mode == PackMode::Fault {
            envelope = CurrentLimit::ZERO;
        }
        self.data.charge_limit_a = envelope.charge_a;
        self.data.discharge_limit_a = envelope.discharge_a;

        self.soc.update(&mut self.data, dt_ms);
        self.accumulate_throughput(dt_ms);

        self.contactor_acc_ms += dt_ms;
        while self.contactor_acc_ms >= CONTACTOR_PERIOD_MS {
            self.contactor_acc_ms -= CONTACTOR_PERIOD_MS;
            self.contactor.run(&mut self.data, CONTACTOR_PERIOD_MS);
        }

        self.state_acc_ms += dt_ms;
        while self.state_acc_ms >= STATE_PERIOD_MS {
            self.state_acc_ms -= STATE_PERIOD_MS;
            let cmd = self.pending_cmd.take();
            state::run(
                &mut self.data,
                &mut self.contactor,
                &mut self.protection,
                cmd.as_ref(),
                &mut self.ems_limit,
            );
        }

        self.can_tx_acc_ms += dt_ms;
        while self.can_tx_acc_ms >= CAN_TX_PERIOD_MS {
            self.can_tx_acc_ms -= CAN_TX_PERIOD_MS;
            self.can.tx_periodic(&self.data);
        }

        self.hal.gpio_write(GpioPin::FaultLed, self.data.fault_latched);
        self.hal.gpio_write(GpioPin::FaultRelay, self.data.fault_latched);
        self.hal.gpio_write(GpioPin::WarningLed, self.data.has_warning);
        self.hal.gpio_write(GpioPin::WarningRelay, self.data.has_warning);

        self.data.uptime_ms += dt_ms;
        self.hal.critical_exit();
    }

    fn accumulate_throughput(&mut self, dt_ms: u32) {
        let ma = self.data.pack_current_ma;
        let mah = ma.unsigned_abs() as f64 * dt_ms as f64 / 3_600_000.0;
        if ma > 0 {
            self.charge_mah_acc += mah;
        } else if ma < 0 {
            self.discharge_mah_acc += mah;
        }

        self.persist_acc_ms += dt_ms;
        if self.persist_acc_ms >= PERSIST_PERIOD_MS {
            self.persist_acc_ms = 0;
            let whole_charge = self.charge_mah_acc as u32;
            let whole_discharge = self.discharge_mah_acc as u32;
            self.charge_mah_acc -= whole_charge as f64;
            self.discharge_mah_acc -= whole_discharge as f64;
            self.nvm.persistent.charge_mah += whole_charge;
            self.nvm.persistent.discharge_mah += whole_discharge;
            self.nvm.persistent.runtime_ms = self.data.uptime_ms;
            self.nvm.persistent.soc_hundredths = self.data.soc_hundredths;
            self.nvm.save_persistent();
        }
    }

    /// Direct connect entry point (used by the array sequencing): voltage
    /// match gate, then the contactor close request.
    pub fn request_connect(&mut self, bus_voltage_mv: u32) -> Result<(), BmsError> {
        if self.data.mode != PackMode::Ready {
            return Err(BmsError::NotReady(self.data.mode));
        }
        if !state::connect_allowed(&self.data, bus_voltage_mv) {
            return Err(BmsError::VoltageMismatch {
                pack_v: self.data.pack_voltage_mv as f64 / 1000.0,
                bus_v: bus_voltage_mv as f64 / 1000.0,
                max_delta: state::VOLTAGE_MATCH_MV as f64 / 1000.0,
            });
        }
        info!(pack_id = self.id, bus_voltage_mv, "connect requested");
        self.contactor.request_close(bus_voltage_mv);
        self.data.mode = PackMode::Connecting;
        Ok(())
    }

    pub fn request_disconnect(&mut self) {
        if matches!(self.data.mode, PackMode::Connected | PackMode::Connecting) {
            self.contactor.request_open();
            self.data.mode = PackMode::Ready;
        }
    }

    /// Manual fault reset. A reset with nothing latched is a no-op success.
    pub fn manual_fault_reset(&mut self) -> Result<(), BmsError> {
        if !self.data.fault_latched {
            return Ok(());
        }
        if !self.protection.can_reset(&self.data) {
            return Err(BmsError::ResetDenied);
        }
        self.protection.reset(&mut self.data);
        self.data.mode = PackMode::Ready;
        info!(pack_id = self.id, "manual fault reset accepted");
        Ok(())
    }

    /// Advance the physics model with the solver-assigned current.
    pub fn step_physics(
        &mut self,
        dt_s: f64,
        current_a: f64,
        external_heat_w: f64,
    ) -> Result<(), BmsError> {
        self.commanded_current_a = current_a;
        let closed = self.contactor.state() == ContactorState::Closed;
        self.pack.step(dt_s, current_a, closed, external_heat_w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::MockHal;

    fn make_controller() -> (Arc<MockHal>, PackController) {
        let hal = Arc::new(MockHal::new());
        let ctrl = PackController::new(
            1,
            0.5,
            25.0,
            ProtectionConfig::default(),
            Arc::clone(&hal) as Arc<dyn Hal>,
        );
        (hal, ctrl)
    }

    fn run_ticks(ctrl: &mut PackController, hal: &MockHal, n: usize) {
        for _ in 0..n {
            ctrl.tick(10);
            hal.advance_tick(10);
        }
    }

    #[test]
    fn reaches_ready_after_first_full_scan() {
        let (hal, mut ctrl) = make_controller();
        assert_eq!(ctrl.mode(), PackMode::NotReady);
        // One full scan (220 ms) plus a state tick.
        run_ticks(&mut ctrl, &hal, 31);
        assert_eq!(ctrl.mode(), PackMode::Ready);
    }

    #[test]
    fn envelope_reflects_derating_curves() {
        let (hal, mut ctrl) = make_controller();
        run_ticks(&mut ctrl, &hal, 31);
        let env = ctrl.envelope();
        // 25 C, mid SoC, 3675 mV cells: 3 C charge, 5 C discharge.
        assert!((env.charge_a - 384.0).abs() < 1.0);
        assert!((env.discharge_a - 640.0).abs() < 1.0);
    }

    #[test]
    fn sustained_cell_fault_latches_and_logs() {
        let (hal, mut ctrl) = make_controller();
        run_ticks(&mut ctrl, &hal, 31);

        hal.set_cell_voltage(0, 0, 4230);
        run_ticks(&mut ctrl, &hal, 600); // 6 s
        assert!(ctrl.data().fault_latched);
        assert_eq!(ctrl.mode(), PackMode::Fault);
        assert_eq!(ctrl.envelope(), CurrentLimit::ZERO);
        assert!(ctrl.nvm().count() >= 1);
        assert!(hal.gpio_output(GpioPin::FaultRelay));
    }

    #[test]
    fn manual_reset_is_noop_when_healthy() {
        let (_hal, mut ctrl) = make_controller();
        assert!(ctrl.manual_fault_reset().is_ok());
    }

    #[test]
    fn manual_reset_denied_before_hold() {
        let (hal, mut ctrl) = make_controller();
        run_ticks(&mut ctrl, &hal, 31);
        hal.set_cell_voltage(0, 0, 4230);
        run_ticks(&mut ctrl, &hal, 600);
        assert!(ctrl.data().fault_latched);

        hal.set_cell_voltage(0, 0, 3675);
        run_ticks(&mut ctrl, &hal, 3000); // 30 s safe
        assert!(matches!(ctrl.manual_fault_reset(), Err(BmsError::ResetDenied)));
        assert!(ctrl.data().fault_latched);

        run_ticks(&mut ctrl, &hal, 3500); // 65 s total
        assert!(ctrl.manual_fault_reset().is_ok());
        assert_eq!(ctrl.mode(), PackMode::Ready);

        // Idempotent afterwards.
        assert!(ctrl.manual_fault_reset().is_ok());
    }

    #[test]
    fn connect_gate_rejects_wrong_mode_and_mismatch() {
        let (hal, mut ctrl) = make_controller();
        assert!(matches!(
            ctrl.request_connect(1_000_000),
            Err(BmsError::NotReady(PackMode::NotReady))
        ));

        run_ticks(&mut ctrl, &hal, 31);
        let pack_mv = ctrl.data().pack_voltage_mv;
        assert!(matches!(
            ctrl.request_connect(pack_mv + 50_000),
            Err(BmsError::VoltageMismatch { .. })
        ));
        assert!(ctrl.request_connect(pack_mv).is_ok());
        assert_eq!(ctrl.mode(), PackMode::Connecting);
    }

    #[test]
    fn ems_connect_over_can_reaches_connected() {
        let (hal, mut ctrl) = make_controller();
        run_ticks(&mut ctrl, &hal, 31);

        // Feedback wired, bus matches the pack.
        hal.set_gpio_input(GpioPin::ContactorFbPos, true);
        hal.set_gpio_input(GpioPin::ContactorFbNeg, true);
        hal.set_bus_voltage_mv(ctrl.data().pack_voltage_mv);

        let mut frame = crate::hardware::CanFrame {
            id: crate::comms::can::ID_EMS_COMMAND,
            dlc: 5,
            data: [0; 8],
        };
        frame.data[0] = crate::comms::can::CMD_CONNECT_CHARGE;
        hal.inject_can_rx(frame);

        run_ticks(&mut ctrl, &hal, 50); // command, pre-charge, close, confirm
        assert_eq!(ctrl.mode(), PackMode::Connected);
        assert_eq!(ctrl.contactor_state(), ContactorState::Closed);

        // Watchdog: silence for > 5 s faults the pack.
        run_ticks(&mut ctrl, &hal, 510);
        assert_eq!(ctrl.mode(), PackMode::Fault);
        assert!(ctrl.data().faults.ems_timeout);
    }

    #[test]
    fn heartbeat_feeds_watchdog() {
        let (hal, mut ctrl) = make_controller();
        run_ticks(&mut ctrl, &hal, 31);
        hal.set_gpio_input(GpioPin::ContactorFbPos, true);
        hal.set_gpio_input(GpioPin::ContactorFbNeg, true);
        hal.set_bus_voltage_mv(ctrl.data().pack_voltage_mv);

        let mut frame = crate::hardware::CanFrame {
            id: crate::comms::can::ID_EMS_COMMAND,
            dlc: 5,
            data: [0; 8],
        };
        frame.data[0] = crate::comms::can::CMD_CONNECT_CHARGE;
        hal.inject_can_rx(frame);
        run_ticks(&mut ctrl, &hal, 50);
        assert_eq!(ctrl.mode(), PackMode::Connected);

        // Heartbeat every second keeps the pack on the bus.
        for _ in 0..8 {
            hal.inject_can_rx(crate::hardware::CanFrame {
                id: crate::comms::can::ID_EMS_HEARTBEAT,
                dlc: 0,
                data: [0; 8],
            });
            run_ticks(&mut ctrl, &hal, 100);
        }
        assert_eq!(ctrl.mode(), PackMode::Connected);
    }

    #[test]
    fn periodic_can_tx_runs() {
        let (hal, mut ctrl) = make_controller();
        run_ticks(&mut ctrl, &hal, 100); // 1 s -> 10 TX cycles x 6 frames
        assert_eq!(hal.can_tx_count(), 60);
    }
}
