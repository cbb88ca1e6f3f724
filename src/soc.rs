//! State-of-charge estimation: coulomb counting corrected against the OCV
//! table after a long enough rest.
//!
//! Positive current charges (coulombic efficiency applies on that side only).
//! When the pack has sat below the rest-current threshold for 30 s while in
//! READY, the estimate is re-seeded from the average cell voltage through the
//! inverse OCV curve; the rest timer then restarts so the correction is not
//! re-applied every tick.

use tracing::debug;

use crate::domain::curves;
use crate::domain::pack::COULOMBIC_EFFICIENCY;
use crate::domain::types::{PackData, PackMode, NOMINAL_CAPACITY_AH};

/// |I| below this counts as resting, milliamps.
pub const REST_CURRENT_MA: i32 = 2000;
/// Rest duration required before an OCV correction, milliseconds.
pub const REST_CORRECTION_MS: u32 = 30_000;

/// Coulomb-counting estimator for one pack.
#[derive(Debug, Clone)]
pub struct SocEstimator {
    /// Estimated state of charge in [0, 1].
    soc: f64,
    rest_ms: u32,
}

impl SocEstimator {
    pub fn new(initial_soc: f64) -> Self {
        Self { soc: initial_soc.clamp(0.0, 1.0), rest_ms: 0 }
    }

    pub fn soc(&self) -> f64 {
        self.soc
    }

    /// Integrate the measured current over `dt_ms` and write the estimate
    /// back into the telemetry block.
    pub fn update(&mut self, pack: &mut PackData, dt_ms: u32) {
        let current_a = pack.pack_current_ma as f64 / 1000.0;
        let effective_a =
            if current_a > 0.0 { current_a * COULOMBIC_EFFICIENCY } else { current_a };
        let dt_s = dt_ms as f64 / 1000.0;
        self.soc = (self.soc + effective_a * dt_s / (NOMINAL_CAPACITY_AH * 3600.0)).clamp(0.0, 1.0);

        if pack.pack_current_ma.abs() < REST_CURRENT_MA {
            self.rest_ms = self.rest_ms.saturating_add(dt_ms);
        } else {
            self.rest_ms = 0;
        }

        if self.rest_ms >= REST_CORRECTION_MS && pack.mode == PackMode::Ready {
            let rested_v = pack.avg_cell_mv as f64 / 1000.0;
            let corrected = curves::soc_from_ocv(rested_v);
            debug!(
                pack_soc = self.soc,
                corrected,
                avg_cell_mv = pack.avg_cell_mv,
                "SoC rest correction applied"
            );
            self.soc = corrected;
            self.rest_ms = 0;
        }

        pack.soc_hundredths = (self.soc * 10_000.0).round() as u16;
    }
}
