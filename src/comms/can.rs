//! CAN message set: periodic status frames out, EMS commands in.
//!
//! Demo protocol, not J1939. All multi-byte fields are big-endian. Frame IDs:
//!
//! | id      | payload                                                     |
//! |---------|-------------------------------------------------------------|
//! | `0x100` | mode, pack 0.1 V, pack 0.1 A, SoC %, max temp +40, faults   |
//! | `0x105` | charge / discharge limits, mA                               |
//! | `0x108` | heartbeat: uptime ms                                        |
//! | `0x130` | max / min / avg cell mV, imbalance mV                       |
//! | `0x131+`| cell-voltage broadcast, four cells per frame, cycling       |
//! | `0x140` | max / min temp 0.1 C, charge / discharge limits 0.1 A       |
//! | `0x200` | EMS command in: code, charge A i16, discharge A i16         |
//! | `0x210` | EMS heartbeat in (watchdog feed)                            |
//!
//! The pack reports current in the internal convention, positive = charging.
//! Unknown command codes are rejected at decode and never reach the FSM.

use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::domain::types::{EmsCommand, EmsRequest, PackData, CELLS_PER_PACK};
use crate::hardware::{CanFrame, Hal};

pub const ID_STATUS: u32 = 0x100;
pub const ID_LIMITS: u32 = 0x105;
pub const ID_HEARTBEAT: u32 = 0x108;
pub const ID_VOLTAGES: u32 = 0x130;
pub const ID_CELL_BROADCAST_BASE: u32 = 0x131;
pub const ID_TEMPS: u32 = 0x140;
pub const ID_EMS_COMMAND: u32 = 0x200;
pub const ID_EMS_HEARTBEAT: u32 = 0x210;

/// ceil(308 / 4) frames to cover every series element.
pub const CELL_BROADCAST_FRAMES: u8 = ((CELLS_PER_PACK + 3) / 4) as u8;

/// EMS command codes on the wire.
pub const CMD_CONNECT_CHARGE: u8 = 1;
pub const CMD_CONNECT_DISCHARGE: u8 = 2;
pub const CMD_DISCONNECT: u8 = 3;
pub const CMD_RESET_FAULTS: u8 = 4;
pub const CMD_POWER_SAVE: u8 = 5;
pub const CMD_SET_LIMITS: u8 = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown EMS command code {0}")]
    UnknownCommand(u8),

    #[error("frame {id:#x} too short: dlc {dlc}")]
    ShortFrame { id: u32, dlc: u8 },

    #[error("unexpected frame id {0:#x}")]
    UnexpectedId(u32),
}

// -- encoders ---------------------------------------------------------------

pub fn encode_status(pack: &PackData) -> CanFrame {
    let mut frame = CanFrame { id: ID_STATUS, dlc: 8, data: [0; 8] };
    frame.data[0] = pack.mode.code();
    BigEndian::write_u16(&mut frame.data[1..3], (pack.pack_voltage_mv / 100) as u16);
    BigEndian::write_i16(&mut frame.data[3..5], (pack.pack_current_ma / 100) as i16);
    frame.data[5] = (pack.soc_hundredths / 100) as u8;
    frame.data[6] = (pack.max_temp_deci_c / 10 + 40).clamp(0, 255) as u8;
    frame.data[7] = pack.faults.low_byte();
    frame
}

pub fn encode_limits(pack: &PackData) -> CanFrame {
    let mut frame = CanFrame { id: ID_LIMITS, dlc: 8, data: [0; 8] };
    BigEndian::write_u32(&mut frame.data[0..4], (pack.charge_limit_a * 1000.0) as u32);
    BigEndian::write_u32(&mut frame.data[4..8], (pack.discharge_limit_a * 1000.0) as u32);
    frame
}

pub fn encode_heartbeat(uptime_ms: u32) -> CanFrame {
    let mut frame = CanFrame { id: ID_HEARTBEAT, dlc: 8, data: [0; 8] };
    BigEndian::write_u32(&mut frame.data[0..4], uptime_ms);
    frame
}

pub fn encode_voltages(pack: &PackData) -> CanFrame {
    let mut frame = CanFrame { id: ID_VOLTAGES, dlc: 8, data: [0; 8] };
    let min_mv = if pack.min_cell_mv == u16::MAX { 0 } else { pack.min_cell_mv };
    BigEndian::write_u16(&mut frame.data[0..2], pack.max_cell_mv);
    BigEndian::write_u16(&mut frame.data[2..4], min_mv);
    BigEndian::write_u16(&mut frame.data[4..6], pack.avg_cell_mv);
    BigEndian::write_u16(&mut frame.data[6..8], pack.max_cell_mv.saturating_sub(min_mv));
    frame
}

pub fn encode_temps(pack: &PackData) -> CanFrame {
    let mut frame = CanFrame { id: ID_TEMPS, dlc: 8, data: [0; 8] };
    BigEndian::write_i16(&mut frame.data[0..2], pack.max_temp_deci_c);
    BigEndian::write_i16(&mut frame.data[2..4], pack.min_temp_deci_c);
    BigEndian::write_i16(&mut frame.data[4..6], (pack.charge_limit_a * 10.0) as i16);
    BigEndian::write_i16(&mut frame.data[6..8], (pack.discharge_limit_a * 10.0) as i16);
    frame
}

/// One slice of the cycling cell-voltage broadcast: four cells per frame.
pub fn encode_cell_broadcast(pack: &PackData, frame_idx: u8) -> CanFrame {
    let mut frame =
        CanFrame { id: ID_CELL_BROADCAST_BASE + frame_idx as u32, dlc: 8, data: [0; 8] };
    let base = frame_idx as usize * 4;
    for slot in 0..4 {
        let idx = base + slot;
        let mv = if idx < CELLS_PER_PACK { pack.cell_mv[idx] } else { 0 };
        BigEndian::write_u16(&mut frame.data[slot * 2..slot * 2 + 2], mv);
    }
    frame
}

/// EMS-side command encoder (the counterpart the BMS decodes). Used by the
/// simulator and the tests to put commands on the wire.
pub fn encode_ems_command(code: u8, charge_a: i16, discharge_a: i16) -> CanFrame {
    let mut frame = CanFrame { id: ID_EMS_COMMAND, dlc: 5, data: [0; 8] };
    frame.data[0] = code;
    BigEndian::write_i16(&mut frame.data[1..3], charge_a);
    BigEndian::write_i16(&mut frame.data[3..5], discharge_a);
    frame
}

/// EMS heartbeat frame.
pub fn encode_ems_heartbeat() -> CanFrame {
    CanFrame { id: ID_EMS_HEARTBEAT, dlc: 0, data: [0; 8] }
}

// -- decoder ----------------------------------------------------------------

/// Decode an EMS command frame. Limits arrive as whole amps (i16).
pub fn decode_ems_command(frame: &CanFrame, timestamp_ms: u32) -> Result<EmsCommand, CodecError> {
    if frame.id != ID_EMS_COMMAND {
        return Err(CodecError::UnexpectedId(frame.id));
    }
    if frame.dlc < 5 {
        return Err(CodecError::ShortFrame { id: frame.id, dlc: frame.dlc });
    }

    let request = match frame.data[0] {
        CMD_CONNECT_CHARGE => EmsRequest::ConnectCharge,
        CMD_CONNECT_DISCHARGE => EmsRequest::ConnectDischarge,
        CMD_DISCONNECT => EmsRequest::Disconnect,
        CMD_RESET_FAULTS => EmsRequest::ResetFaults,
        CMD_POWER_SAVE => EmsRequest::PowerSave,
        CMD_SET_LIMITS => EmsRequest::SetLimits {
            charge_a: BigEndian::read_i16(&frame.data[1..3]) as f64,
            discharge_a: BigEndian::read_i16(&frame.data[3..5]) as f64,
        },
        other => return Err(CodecError::UnknownCommand(other)),
    };

    Ok(EmsCommand { request, timestamp_ms })
}

// -- bus --------------------------------------------------------------------

/// Periodic TX set plus EMS RX drain for one pack.
pub struct CanBus {
    hal: Arc<dyn Hal>,
    broadcast_idx: u8,
}

impl CanBus {
    pub fn new(hal: Arc<dyn Hal>) -> Self {
        Self { hal, broadcast_idx: 0 }
    }

    /// Transmit the periodic frame set. The cell broadcast advances by one
    /// frame (four cells) per call.
    pub fn tx_periodic(&mut self, pack: &PackData) {
        let frames = [
            encode_status(pack),
            encode_limits(pack),
            encode_heartbeat(pack.uptime_ms),
            encode_voltages(pack),
            encode_cell_broadcast(pack, self.broadcast_idx),
            encode_temps(pack),
        ];
        for frame in frames.iter() {
            if let Err(err) = self.hal.can_transmit(frame) {
                warn!(id = frame.id, error = %err, "CAN transmit failed");
            }
        }

        self.broadcast_idx += 1;
        if self.broadcast_idx >= CELL_BROADCAST_FRAMES {
            self.broadcast_idx = 0;
        }
    }

    /// Drain the RX queue; returns decoded EMS traffic in arrival order.
    /// Malformed or unknown frames are dropped with a log line.
    pub fn rx_poll(&self) -> Vec<EmsCommand> {
        let mut inbound = Vec::new();
        loop {
            let frame = match self.hal.can_receive() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "CAN receive failed");
                    break;
                }
            };

            match frame.id {
                ID_EMS_COMMAND => match decode_ems_command(&frame, self.hal.tick_ms()) {
                    Ok(cmd) => inbound.push(cmd),
                    Err(err) => warn!(error = %err, "rejected EMS frame"),
                },
                ID_EMS_HEARTBEAT => inbound.push(EmsCommand {
                    request: EmsRequest::Heartbeat,
                    timestamp_ms: self.hal.tick_ms(),
                }),
                _ => {}
            }
        }
        inbound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::PackMode;
    use crate::hardware::MockHal;

    fn make_pack() -> PackData {
        let mut pack = PackData::default();
        pack.mode = PackMode::Connected;
        pack.pack_voltage_mv = 1_131_900;
        pack.pack_current_ma = -123_400;
        pack.soc_hundredths = 7250;
        pack.max_temp_deci_c = 315;
        pack.min_temp_deci_c = 228;
        pack.max_cell_mv = 3710;
        pack.min_cell_mv = 3660;
        pack.avg_cell_mv = 3680;
        pack.charge_limit_a = 384.0;
        pack.discharge_limit_a = 640.0;
        pack.uptime_ms = 123_456;
        pack
    }

    #[test]
    fn status_frame_fields_are_big_endian() {
        let pack = make_pack();
        let frame = encode_status(&pack);
        assert_eq!(frame.id, ID_STATUS);
        assert_eq!(frame.data[0], PackMode::Connected.code());
        assert_eq!(BigEndian::read_u16(&frame.data[1..3]), 11319); // 0.1 V
        assert_eq!(BigEndian::read_i16(&frame.data[3..5]), -1234); // 0.1 A
        assert_eq!(frame.data[5], 72); // percent
        assert_eq!(frame.data[6], 31 + 40); // degC with +40 offset
    }

    #[test]
    fn voltage_summary_carries_imbalance() {
        let frame = encode_voltages(&make_pack());
        assert_eq!(BigEndian::read_u16(&frame.data[0..2]), 3710);
        assert_eq!(BigEndian::read_u16(&frame.data[2..4]), 3660);
        assert_eq!(BigEndian::read_u16(&frame.data[6..8]), 50);
    }

    #[test]
    fn limits_frame_in_milliamps() {
        let frame = encode_limits(&make_pack());
        assert_eq!(BigEndian::read_u32(&frame.data[0..4]), 384_000);
        assert_eq!(BigEndian::read_u32(&frame.data[4..8]), 640_000);
    }

    #[test]
    fn cell_broadcast_cycles_four_cells_per_frame() {
        let mut pack = make_pack();
        pack.cell_mv[4] = 4001;
        pack.cell_mv[7] = 4002;

        let frame = encode_cell_broadcast(&pack, 1);
        assert_eq!(frame.id, 0x132);
        assert_eq!(BigEndian::read_u16(&frame.data[0..2]), 4001);
        assert_eq!(BigEndian::read_u16(&frame.data[6..8]), 4002);

        // The final frame starts at cell 304 and covers through cell 307.
        let last = encode_cell_broadcast(&pack, CELL_BROADCAST_FRAMES - 1);
        assert_eq!(BigEndian::read_u16(&last.data[0..2]), pack.cell_mv[304]);
    }

    #[test]
    fn ems_command_roundtrip() {
        let mut frame = CanFrame { id: ID_EMS_COMMAND, dlc: 5, data: [0; 8] };
        frame.data[0] = CMD_SET_LIMITS;
        BigEndian::write_i16(&mut frame.data[1..3], 120);
        BigEndian::write_i16(&mut frame.data[3..5], 250);

        let cmd = decode_ems_command(&frame, 42).unwrap();
        assert_eq!(cmd.timestamp_ms, 42);
        assert_eq!(cmd.request, EmsRequest::SetLimits { charge_a: 120.0, discharge_a: 250.0 });
    }

    #[test]
    fn unknown_command_code_is_rejected() {
        let mut frame = CanFrame { id: ID_EMS_COMMAND, dlc: 5, data: [0; 8] };
        frame.data[0] = 99;
        assert_eq!(decode_ems_command(&frame, 0), Err(CodecError::UnknownCommand(99)));
    }

    #[test]
    fn short_frame_is_rejected() {
        let frame = CanFrame { id: ID_EMS_COMMAND, dlc: 3, data: [0; 8] };
        assert!(matches!(
            decode_ems_command(&frame, 0),
            Err(CodecError::ShortFrame { dlc: 3, .. })
        ));
    }

    #[test]
    fn tx_periodic_emits_six_frames_and_cycles() {
        let hal = Arc::new(MockHal::new());
        let mut bus = CanBus::new(Arc::clone(&hal) as Arc<dyn Hal>);
        let pack = make_pack();

        bus.tx_periodic(&pack);
        let frames = hal.take_can_tx();
        assert_eq!(frames.len(), 6);
        assert_eq!(frames[4].id, ID_CELL_BROADCAST_BASE);

        bus.tx_periodic(&pack);
        let frames = hal.take_can_tx();
        assert_eq!(frames[4].id, ID_CELL_BROADCAST_BASE + 1);
    }

    #[test]
    fn rx_poll_decodes_commands_and_heartbeats() {
        let hal = Arc::new(MockHal::new());
        let bus = CanBus::new(Arc::clone(&hal) as Arc<dyn Hal>);
        hal.set_tick(777);

        let mut cmd = CanFrame { id: ID_EMS_COMMAND, dlc: 5, data: [0; 8] };
        cmd.data[0] = CMD_CONNECT_CHARGE;
        hal.inject_can_rx(cmd);
        hal.inject_can_rx(CanFrame { id: ID_EMS_HEARTBEAT, dlc: 0, data: [0; 8] });
        // Garbage frame: dropped silently.
        let mut bad = CanFrame { id: ID_EMS_COMMAND, dlc: 5, data: [0; 8] };
        bad.data[0] = 200;
        hal.inject_can_rx(bad);

        let inbound = bus.rx_poll();
        assert_eq!(inbound.len(), 2);
        assert_eq!(inbound[0].request, EmsRequest::ConnectCharge);
        assert_eq!(inbound[0].timestamp_ms, 777);
        assert_eq!(inbound[1].request, EmsRequest::Heartbeat);
    }
}
