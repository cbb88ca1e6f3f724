//! CSV output for simulation runs: one row per recorded step with the bus
//! voltage and each pack's operating state.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::array::Array;

/// Buffered CSV writer for an array simulation.
pub struct CsvRecorder {
    out: BufWriter<File>,
}

impl CsvRecorder {
    /// Create the file and write the header for the given pack ids.
    pub fn create(path: &Path, pack_ids: &[u8]) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("failed to create CSV output {}", path.display()))?;
        let mut out = BufWriter::new(file);

        writeln!(out, "# orca-bms simulation, started {}", Utc::now().to_rfc3339())?;
        write!(out, "time_s,bus_v")?;
        for id in pack_ids {
            write!(
                out,
                ",p{id}_mode,p{id}_contactor,p{id}_soc_pct,p{id}_temp_c,p{id}_current_a,\
                 p{id}_cell_mv,p{id}_charge_lim_a,p{id}_discharge_lim_a,p{id}_fault,p{id}_warn"
            )?;
        }
        writeln!(out)?;

        Ok(Self { out })
    }

    /// Append one row.
    pub fn record(&mut self, time_s: f64, array: &Array) -> Result<()> {
        write!(self.out, "{:.2},{:.1}", time_s, array.bus_voltage_v())?;
        for ctrl in array.controllers() {
            let data = ctrl.data();
            write!(
                self.out,
                ",{},{},{:.2},{:.2},{:.1},{},{:.1},{:.1},{},{}",
                data.mode,
                data.contactor_state,
                ctrl.pack().soc() * 100.0,
                ctrl.pack().temperature_c(),
                ctrl.commanded_current_a(),
                data.avg_cell_mv,
                data.charge_limit_a,
                data.discharge_limit_a,
                u8::from(data.fault_latched),
                u8::from(data.has_warning),
            )?;
        }
        writeln!(self.out)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().context("failed to flush CSV output")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protection::ProtectionConfig;
    use crate::sim::SimDriver;

    #[test]
    fn writes_header_and_rows() {
        let dir = std::env::temp_dir();
        let path = dir.join("orca_bms_recorder_test.csv");
        let driver = SimDriver::new(
            &[(1, 0.5, 25.0), (2, 0.6, 25.0)],
            ProtectionConfig::default(),
            10,
            0,
            1,
        )
        .unwrap();

        {
            let mut recorder = CsvRecorder::create(&path, &[1, 2]).unwrap();
            recorder.record(0.0, driver.array()).unwrap();
            recorder.record(0.1, driver.array()).unwrap();
            recorder.flush().unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("# orca-bms simulation"));
        assert!(lines[1].starts_with("time_s,bus_v,p1_mode"));
        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("NOT_READY"));
        let _ = std::fs::remove_file(&path);
    }
}
