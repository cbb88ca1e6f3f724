use anyhow::Result;
use tracing::{info, warn};

use orca_bms::config::Config;
use orca_bms::sim::{CsvRecorder, ScenarioRunner, SimDriver};
use orca_bms::telemetry;

/// CSV sample period in control ticks worth of milliseconds.
const RECORD_PERIOD_MS: u32 = 100;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    telemetry::init_tracing(&config.telemetry);

    info!(
        scenario = ?config.demo.scenario,
        packs = config.array.packs.len(),
        duration_s = config.demo.duration_s,
        "starting BMS array simulation"
    );

    let driver = SimDriver::from_config(&config)?;
    let pack_ids: Vec<u8> = config.array.packs.iter().map(|p| p.id).collect();
    let mut recorder = match &config.demo.csv_path {
        Some(path) => Some(CsvRecorder::create(path, &pack_ids)?),
        None => None,
    };

    let mut runner = ScenarioRunner::new(
        driver,
        config.demo.scenario,
        config.demo.request_a,
        config.demo.duration_s,
    );

    let mut record_acc_ms = 0;
    let tick_ms = config.demo.tick_ms;

    if config.demo.realtime {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_millis(tick_ms as u64));
        let shutdown = telemetry::shutdown_signal();
        tokio::pin!(shutdown);

        while !runner.finished() {
            tokio::select! {
                _ = interval.tick() => {
                    runner.tick()?;
                    record_acc_ms += tick_ms;
                    if record_acc_ms >= RECORD_PERIOD_MS {
                        record_acc_ms = 0;
                        if let Some(recorder) = recorder.as_mut() {
                            recorder.record(runner.driver().time_s(), runner.driver().array())?;
                        }
                    }
                }
                _ = &mut shutdown => {
                    warn!("interrupted, stopping simulation");
                    break;
                }
            }
        }
    } else {
        while !runner.finished() {
            runner.tick()?;
            record_acc_ms += tick_ms;
            if record_acc_ms >= RECORD_PERIOD_MS {
                record_acc_ms = 0;
                if let Some(recorder) = recorder.as_mut() {
                    recorder.record(runner.driver().time_s(), runner.driver().array())?;
                }
            }
        }
    }

    if let Some(recorder) = recorder.as_mut() {
        recorder.flush()?;
    }

    let array = runner.driver().array();
    for ctrl in array.controllers() {
        info!(
            pack_id = ctrl.id(),
            mode = %ctrl.mode(),
            soc_pct = format!("{:.1}", ctrl.pack().soc() * 100.0),
            temp_c = format!("{:.1}", ctrl.pack().temperature_c()),
            fault = ctrl.data().fault_latched,
            "final pack state"
        );
    }
    info!(bus_v = format!("{:.1}", array.bus_voltage_v()), "simulation complete");

    Ok(())
}
