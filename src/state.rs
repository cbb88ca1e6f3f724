//! 7-mode pack state machine.
//!
//! Power-on -> NOT_READY (self-test) -> READY, then EMS commands drive
//! CONNECTING/CONNECTED/POWER_SAVE. Two rules override everything: a latched
//! fault forces FAULT from any state, and a silent EMS while CONNECTING or
//! CONNECTED trips the watchdog so the pack opens rather than drifting
//! uncontrolled.

use tracing::{info, warn};

use crate::contactor::ContactorFsm;
use crate::domain::types::{
    ContactorState, CurrentLimit, EmsCommand, EmsRequest, FaultKind, PackData, PackMode,
    NUM_MODULES,
};
use crate::protection::Protection;

/// EMS watchdog window while CONNECTING or CONNECTED.
pub const EMS_WATCHDOG_MS: u32 = 5000;
/// Maximum pack-to-bus delta accepted for a connect request:
/// 1.2 V per module x 22 modules.
pub const VOLTAGE_MATCH_MV: u32 = 1200 * NUM_MODULES as u32;

/// Force the pack into FAULT: zero envelopes and command the contactor open.
pub fn enter_fault(pack: &mut PackData, contactor: &mut ContactorFsm) {
    if pack.mode != PackMode::Fault {
        warn!(from = %pack.mode, "entering FAULT");
    }
    pack.mode = PackMode::Fault;
    pack.charge_limit_a = 0.0;
    pack.discharge_limit_a = 0.0;
    contactor.request_open();
}

/// Voltage-match gate for a connect request.
pub fn connect_allowed(pack: &PackData, bus_voltage_mv: u32) -> bool {
    let delta = (pack.pack_voltage_mv as i64 - bus_voltage_mv as i64).unsigned_abs() as u32;
    delta <= VOLTAGE_MATCH_MV
}

/// Advance the mode machine. `cmd` is the EMS command consumed this cycle (at
/// most one); `ems_limit` is the standing SET_LIMITS clamp, updated in place.
pub fn run(
    pack: &mut PackData,
    contactor: &mut ContactorFsm,
    protection: &mut Protection,
    cmd: Option<&EmsCommand>,
    ems_limit: &mut Option<CurrentLimit>,
) {
    // Global rule: a latched fault wins from any state.
    if pack.fault_latched && pack.mode != PackMode::Fault {
        enter_fault(pack, contactor);
        return;
    }

    // Global rule: EMS watchdog while on (or joining) the bus.
    if matches!(pack.mode, PackMode::Connected | PackMode::Connecting) {
        let elapsed = pack.uptime_ms.wrapping_sub(pack.last_ems_msg_ms);
        if elapsed > EMS_WATCHDOG_MS {
            warn!(elapsed_ms = elapsed, "EMS watchdog expired");
            pack.faults.set(FaultKind::EmsTimeout);
            enter_fault(pack, contactor);
            return;
        }
    }

    match pack.mode {
        PackMode::NotReady => {
            let all_ok = pack.modules.iter().all(|m| m.comm_ok);
            if all_ok {
                info!("self-test passed: NOT_READY -> READY");
                pack.mode = PackMode::Ready;
            }
        }

        PackMode::Ready => {
            if let Some(cmd) = cmd {
                match cmd.request {
                    EmsRequest::ConnectCharge | EmsRequest::ConnectDischarge => {
                        if connect_allowed(pack, pack.bus_voltage_mv) {
                            contactor.request_close(pack.bus_voltage_mv);
                            pack.mode = PackMode::Connecting;
                            info!(bus_mv = pack.bus_voltage_mv, "READY -> CONNECTING");
                        } else {
                            warn!(
                                pack_mv = pack.pack_voltage_mv,
                                bus_mv = pack.bus_voltage_mv,
                                max_delta_mv = VOLTAGE_MATCH_MV,
                                "connect rejected: bus voltage mismatch"
                            );
                        }
                    }
                    EmsRequest::PowerSave => {
                        pack.mode = PackMode::PowerSave;
                        info!("READY -> POWER_SAVE");
                    }
                    EmsRequest::SetLimits { charge_a, discharge_a } => {
                        *ems_limit = Some(CurrentLimit { charge_a, discharge_a });
                    }
                    _ => {}
                }
            }
        }

        PackMode::Connecting => {
            if contactor.is_welded() {
                enter_fault(pack, contactor);
            } else if contactor.state() == ContactorState::Closed {
                pack.mode = PackMode::Connected;
                info!("CONNECTING -> CONNECTED");
            } else if contactor.state() == ContactorState::Open {
                // Pre-charge failed or timed out.
                pack.mode = PackMode::Ready;
                info!("CONNECTING -> READY (contactor reopened)");
            }

            if let Some(cmd) = cmd {
                if cmd.request == EmsRequest::Disconnect {
                    contactor.request_open();
                    pack.mode = PackMode::Ready;
                    info!("CONNECTING -> READY (disconnect)");
                }
            }
        }

        PackMode::Connected => {
            if contactor.is_welded() {
                enter_fault(pack, contactor);
                return;
            }

            if let Some(cmd) = cmd {
                match cmd.request {
                    EmsRequest::Disconnect => {
                        contactor.request_open();
                        pack.mode = PackMode::Ready;
                        info!("CONNECTED -> READY (disconnect)");
                    }
                    EmsRequest::SetLimits { charge_a, discharge_a } => {
                        *ems_limit = Some(CurrentLimit { charge_a, discharge_a });
                    }
                    _ => {}
                }
            }
        }

        PackMode::PowerSave => {
            if let Some(cmd) = cmd {
                if !matches!(cmd.request, EmsRequest::PowerSave | EmsRequest::Heartbeat) {
                    pack.mode = PackMode::Ready;
                    info!("POWER_SAVE -> READY (wake)");
                }
            }
        }

        PackMode::Fault => {
            if let Some(cmd) = cmd {
                if cmd.request == EmsRequest::ResetFaults {
                    if protection.can_reset(pack) {
                        protection.reset(pack);
                        pack.mode = PackMode::Ready;
                        info!("FAULT -> READY (manual reset)");
                    } else {
                        warn!(
                            safe_state_ms = protection.safe_state_ms(),
                            "fault reset denied: safe-state hold incomplete"
                        );
                    }
                }
            }
        }

        PackMode::Off => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Hal, MockHal};
    use crate::protection::ProtectionConfig;
    use std::sync::Arc;

    struct Fixture {
        hal: Arc<MockHal>,
        pack: PackData,
        contactor: ContactorFsm,
        protection: Protection,
        ems_limit: Option<CurrentLimit>,
    }

    fn make_fixture() -> Fixture {
        let hal = Arc::new(MockHal::new());
        let contactor = ContactorFsm::new(Arc::clone(&hal) as Arc<dyn Hal>);
        let mut pack = PackData::default();
        for module in pack.modules.iter_mut() {
            module.comm_ok = true;
        }
        pack.pack_voltage_mv = 1_131_900;
        pack.bus_voltage_mv = 1_131_900;
        Fixture {
            hal,
            pack,
            contactor,
            protection: Protection::new(ProtectionConfig::default()),
            ems_limit: None,
        }
    }

    fn cmd(request: EmsRequest) -> EmsCommand {
        EmsCommand { request, timestamp_ms: 0 }
    }

    fn step(fx: &mut Fixture, command: Option<EmsRequest>) {
        let command = command.map(cmd);
        run(
            &mut fx.pack,
            &mut fx.contactor,
            &mut fx.protection,
            command.as_ref(),
            &mut fx.ems_limit,
        );
    }

    #[test]
    fn not_ready_until_all_modules_respond() {
        let mut fx = make_fixture();
        fx.pack.modules[5].comm_ok = false;
        step(&mut fx, None);
        assert_eq!(fx.pack.mode, PackMode::NotReady);

        fx.pack.modules[5].comm_ok = true;
        step(&mut fx, None);
        assert_eq!(fx.pack.mode, PackMode::Ready);
    }

    #[test]
    fn connect_command_starts_contactor_sequence() {
        let mut fx = make_fixture();
        fx.pack.mode = PackMode::Ready;
        step(&mut fx, Some(EmsRequest::ConnectCharge));
        assert_eq!(fx.pack.mode, PackMode::Connecting);

        fx.contactor.run(&mut fx.pack, 50);
        assert_eq!(fx.contactor.state(), ContactorState::PreCharge);
    }

    #[test]
    fn connect_rejected_on_voltage_mismatch() {
        let mut fx = make_fixture();
        fx.pack.mode = PackMode::Ready;
        fx.pack.bus_voltage_mv = fx.pack.pack_voltage_mv + VOLTAGE_MATCH_MV + 1000;
        step(&mut fx, Some(EmsRequest::ConnectCharge));
        assert_eq!(fx.pack.mode, PackMode::Ready);
        assert_eq!(fx.contactor.state(), ContactorState::Open);
    }

    #[test]
    fn connecting_promotes_when_contactor_closes() {
        let mut fx = make_fixture();
        fx.pack.mode = PackMode::Ready;
        fx.hal.set_gpio_input(crate::hardware::GpioPin::ContactorFbPos, true);
        fx.hal.set_gpio_input(crate::hardware::GpioPin::ContactorFbNeg, true);

        step(&mut fx, Some(EmsRequest::ConnectCharge));
        for _ in 0..3 {
            fx.contactor.run(&mut fx.pack, 50);
        }
        assert_eq!(fx.contactor.state(), ContactorState::Closed);
        step(&mut fx, None);
        assert_eq!(fx.pack.mode, PackMode::Connected);
    }

    #[test]
    fn connecting_falls_back_when_precharge_fails() {
        let mut fx = make_fixture();
        fx.pack.mode = PackMode::Connecting;
        // Contactor never left OPEN (request was lost / pre-charge aborted).
        step(&mut fx, None);
        assert_eq!(fx.pack.mode, PackMode::Ready);
    }

    #[test]
    fn latched_fault_forces_fault_mode_from_anywhere() {
        let mut fx = make_fixture();
        fx.pack.mode = PackMode::Connected;
        fx.pack.fault_latched = true;
        fx.pack.charge_limit_a = 100.0;
        step(&mut fx, None);
        assert_eq!(fx.pack.mode, PackMode::Fault);
        assert_eq!(fx.pack.charge_limit_a, 0.0);
        assert_eq!(fx.pack.discharge_limit_a, 0.0);
    }

    #[test]
    fn ems_watchdog_trips_after_five_seconds() {
        let mut fx = make_fixture();
        fx.pack.mode = PackMode::Connected;
        fx.pack.last_ems_msg_ms = 0;
        fx.pack.uptime_ms = EMS_WATCHDOG_MS + 1;
        step(&mut fx, None);
        assert_eq!(fx.pack.mode, PackMode::Fault);
        assert!(fx.pack.faults.ems_timeout);
    }

    #[test]
    fn watchdog_quiet_while_ready() {
        let mut fx = make_fixture();
        fx.pack.mode = PackMode::Ready;
        fx.pack.uptime_ms = 60_000;
        fx.pack.last_ems_msg_ms = 0;
        step(&mut fx, None);
        assert_eq!(fx.pack.mode, PackMode::Ready);
    }

    #[test]
    fn set_limits_stores_standing_clamp() {
        let mut fx = make_fixture();
        fx.pack.mode = PackMode::Connected;
        fx.pack.uptime_ms = 10;
        fx.pack.last_ems_msg_ms = 10;
        step(&mut fx, Some(EmsRequest::SetLimits { charge_a: 50.0, discharge_a: 75.0 }));
        assert_eq!(fx.ems_limit, Some(CurrentLimit { charge_a: 50.0, discharge_a: 75.0 }));
    }

    #[test]
    fn power_save_wakes_on_other_commands_only() {
        let mut fx = make_fixture();
        fx.pack.mode = PackMode::PowerSave;
        step(&mut fx, Some(EmsRequest::PowerSave));
        assert_eq!(fx.pack.mode, PackMode::PowerSave);
        step(&mut fx, Some(EmsRequest::Heartbeat));
        assert_eq!(fx.pack.mode, PackMode::PowerSave);
        step(&mut fx, Some(EmsRequest::Disconnect));
        assert_eq!(fx.pack.mode, PackMode::Ready);
    }

    #[test]
    fn fault_reset_denied_until_hold_elapses() {
        let mut fx = make_fixture();
        fx.pack.fault_latched = true;
        fx.pack.mode = PackMode::Fault;

        step(&mut fx, Some(EmsRequest::ResetFaults));
        assert_eq!(fx.pack.mode, PackMode::Fault);
        assert!(fx.pack.fault_latched);

        // Accumulate the 60 s safe-state hold with healthy readings.
        for module in fx.pack.modules.iter_mut() {
            module.cell_mv = [3675; crate::domain::CELLS_PER_MODULE];
        }
        fx.pack.cell_mv = [3675; crate::domain::CELLS_PER_PACK];
        let mut elapsed = 0;
        while elapsed < 61_000 {
            fx.protection.run(&mut fx.pack, 10);
            elapsed += 10;
        }

        step(&mut fx, Some(EmsRequest::ResetFaults));
        assert_eq!(fx.pack.mode, PackMode::Ready);
        assert!(!fx.pack.fault_latched);
    }

    #[test]
    fn welded_contactor_faults_connected_pack() {
        let mut fx = make_fixture();
        fx.hal.set_gpio_input(crate::hardware::GpioPin::ContactorFbPos, true);
        fx.hal.set_gpio_input(crate::hardware::GpioPin::ContactorFbNeg, true);
        fx.pack.mode = PackMode::Ready;
        step(&mut fx, Some(EmsRequest::ConnectCharge));
        for _ in 0..3 {
            fx.contactor.run(&mut fx.pack, 50);
        }
        fx.pack.uptime_ms = 100;
        fx.pack.last_ems_msg_ms = 100;
        step(&mut fx, None);
        assert_eq!(fx.pack.mode, PackMode::Connected);

        // Weld: current persists after open.
        fx.pack.pack_current_ma = 80_000;
        fx.contactor.request_open();
        for _ in 0..6 {
            fx.contactor.run(&mut fx.pack, 50);
        }
        assert!(fx.contactor.is_welded());
        step(&mut fx, None);
        assert_eq!(fx.pack.mode, PackMode::Fault);
    }
}
