//! Contactor sequencing with weld detection.
//!
//! OPEN -> PRE_CHARGE -> CLOSING -> CLOSED -> OPENING -> OPEN, with two
//! failure exits: a pre-charge or feedback timeout falls back to OPEN, and
//! residual current after the open command is a welded contact (terminal).
//!
//! Pre-charge closes the pre-charge relay plus the main negative and waits
//! for the pack voltage to reach 95% of the recorded bus target; closing the
//! main positive without both auxiliary feedback inputs inside 100 ms is a
//! mechanical defect, not a retry condition.

use std::sync::Arc;
use tracing::{debug, error, info};

use crate::domain::types::{ContactorState, FaultKind, PackData};
use crate::hardware::{GpioPin, Hal};

/// Pre-charge must finish within this window.
pub const PRECHARGE_TIMEOUT_MS: u32 = 5000;
/// Feedback confirmation window after commanding the main positive.
pub const CLOSE_CONFIRM_MS: u32 = 100;
/// Residual-current window after the open command before declaring a weld.
pub const WELD_DETECT_MS: u32 = 200;
/// |I| below this confirms an open circuit, milliamps.
pub const OPEN_CURRENT_MA: i32 = 1000;
/// Pre-charge completes at this percentage of the bus target.
pub const PRECHARGE_VOLT_PCT: u32 = 95;

/// Contactor state machine for one pack.
pub struct ContactorFsm {
    hal: Arc<dyn Hal>,
    state: ContactorState,
    state_timer_ms: u32,
    target_bus_mv: u32,
    close_requested: bool,
    open_requested: bool,
}

impl ContactorFsm {
    pub fn new(hal: Arc<dyn Hal>) -> Self {
        let fsm = Self {
            hal,
            state: ContactorState::Open,
            state_timer_ms: 0,
            target_bus_mv: 0,
            close_requested: false,
            open_requested: false,
        };
        fsm.all_off();
        fsm
    }

    pub fn state(&self) -> ContactorState {
        self.state
    }

    pub fn is_welded(&self) -> bool {
        self.state == ContactorState::Welded
    }

    /// Request a close toward the given bus voltage. Only honored from OPEN.
    pub fn request_close(&mut self, bus_voltage_mv: u32) {
        if self.state == ContactorState::Open {
            self.close_requested = true;
            self.target_bus_mv = bus_voltage_mv;
        }
    }

    /// Request an open. Honored from PRE_CHARGE, CLOSING and CLOSED.
    pub fn request_open(&mut self) {
        if matches!(
            self.state,
            ContactorState::PreCharge | ContactorState::Closing | ContactorState::Closed
        ) {
            self.open_requested = true;
        }
    }

    /// Advance the state machine by `dt_ms`.
    pub fn run(&mut self, pack: &mut PackData, dt_ms: u32) {
        self.state_timer_ms = self.state_timer_ms.saturating_add(dt_ms);

        match self.state {
            ContactorState::Open => {
                if self.close_requested {
                    self.close_requested = false;
                    self.enter(ContactorState::PreCharge);
                    self.hal.gpio_write(GpioPin::ContactorNeg, true);
                    self.hal.gpio_write(GpioPin::PrechargeRelay, true);
                }
            }

            ContactorState::PreCharge => {
                if self.open_requested {
                    self.open_requested = false;
                    self.all_off();
                    self.enter(ContactorState::Opening);
                } else {
                    let target_mv = self.target_bus_mv * PRECHARGE_VOLT_PCT / 100;
                    if pack.pack_voltage_mv >= target_mv {
                        self.enter(ContactorState::Closing);
                        self.hal.gpio_write(GpioPin::ContactorPos, true);
                        self.hal.gpio_write(GpioPin::PrechargeRelay, false);
                    } else if self.state_timer_ms >= PRECHARGE_TIMEOUT_MS {
                        info!(
                            pack_voltage_mv = pack.pack_voltage_mv,
                            target_mv, "pre-charge timeout, reopening"
                        );
                        self.all_off();
                        self.enter(ContactorState::Open);
                    }
                }
            }

            ContactorState::Closing => {
                if self.open_requested {
                    self.open_requested = false;
                    self.all_off();
                    self.enter(ContactorState::Opening);
                } else {
                    let pos_fb = self.hal.gpio_read(GpioPin::ContactorFbPos);
                    let neg_fb = self.hal.gpio_read(GpioPin::ContactorFbNeg);
                    if pos_fb && neg_fb {
                        self.enter(ContactorState::Closed);
                    } else if self.state_timer_ms >= CLOSE_CONFIRM_MS {
                        info!("contactor feedback not confirmed, reopening");
                        self.all_off();
                        self.enter(ContactorState::Open);
                    }
                }
            }

            ContactorState::Closed => {
                if self.open_requested {
                    self.open_requested = false;
                    self.all_off();
                    self.enter(ContactorState::Opening);
                }
            }

            ContactorState::Opening => {
                if pack.pack_current_ma.abs() < OPEN_CURRENT_MA {
                    self.enter(ContactorState::Open);
                } else if self.state_timer_ms >= WELD_DETECT_MS {
                    error!(
                        pack_current_ma = pack.pack_current_ma,
                        "current persists after open command: contactor welded"
                    );
                    self.state = ContactorState::Welded;
                    pack.faults.set(FaultKind::ContactorWeld);
                    pack.fault_latched = true;
                }
            }

            // Terminal; requires external intervention.
            ContactorState::Welded => {}
        }

        pack.contactor_state = self.state;
    }

    fn enter(&mut self, state: ContactorState) {
        debug!(from = %self.state, to = %state, "contactor transition");
        self.state = state;
        self.state_timer_ms = 0;
    }

    fn all_off(&self) {
        self.hal.gpio_write(GpioPin::ContactorPos, false);
        self.hal.gpio_write(GpioPin::ContactorNeg, false);
        self.hal.gpio_write(GpioPin::PrechargeRelay, false);
    }
}
