//! Non-volatile fault logging and operating persistence.
//!
//! A 64-entry ring of fault events (newest overwrites oldest, retrieval index
//! 0 is the newest) plus a persistent operating record: state of charge at
//! last shutdown, total runtime, and lifetime charge/discharge throughput.
//!
//! All NVM traffic is best-effort: a failed write is logged and otherwise
//! ignored, and never affects a control decision.

use std::sync::Arc;
use tracing::warn;

use crate::domain::types::FaultRecord;
use crate::hardware::{Hal, HalError};

/// Ring capacity.
pub const FAULT_LOG_SIZE: usize = 64;

/// Serialized event size in NVM (4 + 1 + 1 pad + 2 + 4).
const EVENT_BYTES: usize = 12;

const ADDR_FAULT_LOG: u32 = 0x0000;
const ADDR_FAULT_HEAD: u32 = ADDR_FAULT_LOG + (FAULT_LOG_SIZE * EVENT_BYTES) as u32;
const ADDR_FAULT_COUNT: u32 = ADDR_FAULT_HEAD + 1;
const ADDR_PERSISTENT: u32 = ADDR_FAULT_COUNT + 3; // 4-byte aligned

/// Marker for events without a cell/sensor index.
pub const NO_CELL_INDEX: u16 = 0xFFFF;

/// One logged fault event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultEvent {
    pub timestamp_ms: u32,
    pub fault_type: u8,
    pub cell_index: u16,
    pub value: i32,
}

impl FaultEvent {
    fn to_bytes(self) -> [u8; EVENT_BYTES] {
        let mut buf = [0u8; EVENT_BYTES];
        buf[0..4].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        buf[4] = self.fault_type;
        buf[6..8].copy_from_slice(&self.cell_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.value.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; EVENT_BYTES]) -> Self {
        Self {
            timestamp_ms: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            fault_type: buf[4],
            cell_index: u16::from_le_bytes(buf[6..8].try_into().unwrap()),
            value: i32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// Lifetime operating record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistentRecord {
    /// SoC at last shutdown, hundredths of a percent.
    pub soc_hundredths: u16,
    /// Total runtime, milliseconds.
    pub runtime_ms: u32,
    /// Lifetime charge throughput, mAh.
    pub charge_mah: u32,
    /// Lifetime discharge throughput, mAh.
    pub discharge_mah: u32,
}

const PERSISTENT_BYTES: usize = 14;

impl PersistentRecord {
    fn to_bytes(self) -> [u8; PERSISTENT_BYTES] {
        let mut buf = [0u8; PERSISTENT_BYTES];
        buf[0..2].copy_from_slice(&self.soc_hundredths.to_le_bytes());
        buf[2..6].copy_from_slice(&self.runtime_ms.to_le_bytes());
        buf[6..10].copy_from_slice(&self.charge_mah.to_le_bytes());
        buf[10..14].copy_from_slice(&self.discharge_mah.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; PERSISTENT_BYTES]) -> Self {
        Self {
            soc_hundredths: u16::from_le_bytes(buf[0..2].try_into().unwrap()),
            runtime_ms: u32::from_le_bytes(buf[2..6].try_into().unwrap()),
            charge_mah: u32::from_le_bytes(buf[6..10].try_into().unwrap()),
            discharge_mah: u32::from_le_bytes(buf[10..14].try_into().unwrap()),
        }
    }
}

/// Fault ring + persistent record, mirrored in RAM and backed by the HAL NVM.
pub struct NvmStore {
    hal: Arc<dyn Hal>,
    events: [FaultEvent; FAULT_LOG_SIZE],
    head: u8,
    count: u8,
    pub persistent: PersistentRecord,
}

impl NvmStore {
    /// Open the store, loading whatever survives in NVM. Corrupt metadata
    /// falls back to an empty log.
    pub fn new(hal: Arc<dyn Hal>) -> Self {
        let mut store = Self {
            hal,
            events: [FaultEvent::default(); FAULT_LOG_SIZE],
            head: 0,
            count: 0,
            persistent: PersistentRecord::default(),
        };
        store.load();
        store
    }

    pub fn count(&self) -> usize {
        self.count as usize
    }

    /// Log one fault event. The newest write replaces the oldest entry once
    /// the ring is full.
    pub fn log_fault(&mut self, timestamp_ms: u32, record: &FaultRecord) {
        let event = FaultEvent {
            timestamp_ms,
            fault_type: record.kind.code(),
            cell_index: record.index.unwrap_or(NO_CELL_INDEX),
            value: record.value,
        };

        let slot = self.head as usize;
        self.events[slot] = event;
        self.head = ((self.head as usize + 1) % FAULT_LOG_SIZE) as u8;
        if (self.count as usize) < FAULT_LOG_SIZE {
            self.count += 1;
        }

        let addr = ADDR_FAULT_LOG + (slot * EVENT_BYTES) as u32;
        self.write_best_effort(addr, &event.to_bytes());
        self.write_best_effort(ADDR_FAULT_HEAD, &[self.head]);
        self.write_best_effort(ADDR_FAULT_COUNT, &[self.count]);
    }

    /// Retrieve an event by recency: index 0 is the newest.
    pub fn get_fault(&self, idx: usize) -> Option<FaultEvent> {
        if idx >= self.count as usize {
            return None;
        }
        let slot = (self.head as usize + FAULT_LOG_SIZE - 1 - idx) % FAULT_LOG_SIZE;
        Some(self.events[slot])
    }

    /// Persist the operating record.
    pub fn save_persistent(&mut self) {
        let bytes = self.persistent.to_bytes();
        self.write_best_effort(ADDR_PERSISTENT, &bytes);
    }

    fn load(&mut self) {
        let mut head = [0u8; 1];
        let mut count = [0u8; 1];
        if self.read(ADDR_FAULT_HEAD, &mut head).is_ok()
            && self.read(ADDR_FAULT_COUNT, &mut count).is_ok()
        {
            self.head = head[0];
            self.count = count[0];
        }
        if self.head as usize >= FAULT_LOG_SIZE {
            self.head = 0;
        }
        if self.count as usize > FAULT_LOG_SIZE {
            self.count = 0;
        }

        for slot in 0..FAULT_LOG_SIZE {
            let mut buf = [0u8; EVENT_BYTES];
            let addr = ADDR_FAULT_LOG + (slot * EVENT_BYTES) as u32;
            if self.read(addr, &mut buf).is_ok() {
                self.events[slot] = FaultEvent::from_bytes(&buf);
            }
        }

        let mut buf = [0u8; PERSISTENT_BYTES];
        if self.read(ADDR_PERSISTENT, &mut buf).is_ok() {
            self.persistent = PersistentRecord::from_bytes(&buf);
        }
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), HalError> {
        self.hal.nvm_read(addr, buf)
    }

    fn write_best_effort(&self, addr: u32, data: &[u8]) {
        if let Err(err) = self.hal.nvm_write(addr, data) {
            warn!(addr, error = %err, "NVM write failed (ignored)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::FaultKind;
    use crate::hardware::MockHal;

    fn make_store() -> (Arc<MockHal>, NvmStore) {
        let hal = Arc::new(MockHal::new());
        let store = NvmStore::new(Arc::clone(&hal) as Arc<dyn Hal>);
        (hal, store)
    }

    fn ov_record(cell: u16, mv: i32) -> FaultRecord {
        FaultRecord { kind: FaultKind::CellOverVoltage, index: Some(cell), value: mv }
    }

    #[test]
    fn newest_first_retrieval() {
        let (_hal, mut store) = make_store();
        store.log_fault(100, &ov_record(1, 4301));
        store.log_fault(200, &ov_record(2, 4302));
        store.log_fault(300, &ov_record(3, 4303));

        assert_eq!(store.count(), 3);
        assert_eq!(store.get_fault(0).unwrap().timestamp_ms, 300);
        assert_eq!(store.get_fault(2).unwrap().timestamp_ms, 100);
        assert_eq!(store.get_fault(3), None);
    }

    #[test]
    fn ring_overwrites_oldest() {
        let (_hal, mut store) = make_store();
        for i in 0..(FAULT_LOG_SIZE as u32 + 10) {
            store.log_fault(i, &ov_record(i as u16, 4300));
        }
        assert_eq!(store.count(), FAULT_LOG_SIZE);
        // Newest is the last write; the oldest surviving entry is 10.
        assert_eq!(store.get_fault(0).unwrap().timestamp_ms, FAULT_LOG_SIZE as u32 + 9);
        assert_eq!(store.get_fault(FAULT_LOG_SIZE - 1).unwrap().timestamp_ms, 10);
    }

    #[test]
    fn survives_reload_from_nvm() {
        let (hal, mut store) = make_store();
        store.log_fault(42, &ov_record(17, 4310));
        store.persistent.soc_hundredths = 6150;
        store.persistent.charge_mah = 123_456;
        store.save_persistent();
        drop(store);

        let reloaded = NvmStore::new(Arc::clone(&hal) as Arc<dyn Hal>);
        assert_eq!(reloaded.count(), 1);
        let event = reloaded.get_fault(0).unwrap();
        assert_eq!(event.timestamp_ms, 42);
        assert_eq!(event.cell_index, 17);
        assert_eq!(event.fault_type, FaultKind::CellOverVoltage.code());
        assert_eq!(reloaded.persistent.soc_hundredths, 6150);
        assert_eq!(reloaded.persistent.charge_mah, 123_456);
    }

    #[test]
    fn nvm_failure_does_not_break_logging() {
        let (hal, mut store) = make_store();
        hal.set_nvm_fail(true);
        store.log_fault(5, &ov_record(0, 4300));
        // The RAM mirror still works; control flow never sees the failure.
        assert_eq!(store.count(), 1);
        assert_eq!(store.get_fault(0).unwrap().timestamp_ms, 5);
    }

    #[test]
    fn missing_index_uses_marker() {
        let (_hal, mut store) = make_store();
        let record =
            FaultRecord { kind: FaultKind::OverCurrentCharge, index: None, value: 400_000 };
        store.log_fault(1, &record);
        assert_eq!(store.get_fault(0).unwrap().cell_index, NO_CELL_INDEX);
        assert_eq!(store.get_fault(0).unwrap().value, 400_000);
    }
}
