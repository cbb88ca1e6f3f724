//! Equivalent-circuit pack model: an ideal OCV source in series with the
//! table-derived pack resistance, plus coulomb counting and a lumped
//! first-order thermal model.
//!
//! Heat balance per sub-step:
//!
//! dT/dt = (I^2 R + Q_rev + Q_ext - k_cool (T - T_amb)) / C_th
//!
//! where Q_rev = I * T_K * dOCV/dT * N_cells is the reversible (entropic)
//! term. Its sign matters: at mid/low SoC dOCV/dT < 0, so discharge heats;
//! near full SoC dOCV/dT > 0, so charge heats.

use serde::{Deserialize, Serialize};

use super::curves;
use super::types::{BmsError, CELLS_PER_MODULE, NOMINAL_CAPACITY_AH, NUM_MODULES};

/// Coulombic efficiency applied on the charge side only (NMC 622).
pub const COULOMBIC_EFFICIENCY: f64 = 0.998;
/// Lumped thermal mass, J/degC.
pub const THERMAL_MASS_J_PER_C: f64 = 1_268_000.0;
/// Linear cooling coefficient, W/degC.
pub const COOLING_COEFF_W_PER_C: f64 = 800.0;
/// Machinery-space ambient, degC.
pub const AMBIENT_TEMP_C: f64 = 40.0;
/// Temperature clamp range, degC.
pub const MIN_TEMP_C: f64 = -40.0;
pub const MAX_TEMP_C: f64 = 200.0;
/// Integration sub-step cap in seconds; larger dt is subdivided.
pub const MAX_SUBSTEP_S: f64 = 10.0;

/// Equivalent-circuit state of one pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pack {
    pub id: u8,
    num_modules: usize,
    cells_per_module: usize,
    capacity_ah: f64,

    soc: f64,
    temperature_c: f64,
    /// Applied current in amps, positive = charging.
    current_a: f64,
    cell_voltage_v: f64,
    pack_voltage_v: f64,
}

impl Pack {
    /// Create a pack at the given initial state of charge (clamped to [0, 1])
    /// and temperature.
    pub fn new(id: u8, soc: f64, temperature_c: f64) -> Self {
        let mut pack = Self {
            id,
            num_modules: NUM_MODULES,
            cells_per_module: CELLS_PER_MODULE,
            capacity_ah: NOMINAL_CAPACITY_AH,
            soc: soc.clamp(0.0, 1.0),
            temperature_c,
            current_a: 0.0,
            cell_voltage_v: 0.0,
            pack_voltage_v: 0.0,
        };
        pack.update_voltage();
        pack
    }

    pub fn soc(&self) -> f64 {
        self.soc
    }

    pub fn temperature_c(&self) -> f64 {
        self.temperature_c
    }

    pub fn current_a(&self) -> f64 {
        self.current_a
    }

    pub fn cell_voltage_v(&self) -> f64 {
        self.cell_voltage_v
    }

    pub fn pack_voltage_v(&self) -> f64 {
        self.pack_voltage_v
    }

    pub fn capacity_ah(&self) -> f64 {
        self.capacity_ah
    }

    pub fn series_cells(&self) -> usize {
        self.num_modules * self.cells_per_module
    }

    /// Pack resistance at the current operating point, ohms.
    pub fn resistance_ohm(&self) -> f64 {
        curves::pack_resistance(self.temperature_c, self.soc)
    }

    /// Per-cell open-circuit voltage at the current state of charge.
    pub fn ocv_v(&self) -> f64 {
        curves::ocv_from_soc(self.soc)
    }

    /// Advance the model by `dt_s` seconds at `current_a` amps (positive =
    /// charging). With the contactors open the applied current is forced to
    /// zero regardless of the request. `external_heat_w` feeds the thermal
    /// balance (heaters, neighboring equipment).
    ///
    /// A non-positive `dt_s` fails with `InvalidTimeStep` and leaves the
    /// state untouched. Steps longer than [`MAX_SUBSTEP_S`] are subdivided so
    /// one long call matches the equivalent series of short calls.
    pub fn step(
        &mut self,
        dt_s: f64,
        current_a: f64,
        contactors_closed: bool,
        external_heat_w: f64,
    ) -> Result<(), BmsError> {
        if dt_s <= 0.0 || !dt_s.is_finite() {
            return Err(BmsError::InvalidTimeStep(dt_s));
        }

        let mut remaining = dt_s;
        while remaining > 0.0 {
            let sub = remaining.min(MAX_SUBSTEP_S);
            self.substep(sub, current_a, contactors_closed, external_heat_w);
            remaining -= sub;
        }
        Ok(())
    }

    fn substep(&mut self, dt_s: f64, current_a: f64, contactors_closed: bool, external_heat_w: f64) {
        self.current_a = if contactors_closed { current_a } else { 0.0 };

        // Coulomb counting; efficiency applies on the charge side only.
        let effective_a = if self.current_a > 0.0 {
            self.current_a * COULOMBIC_EFFICIENCY
        } else {
            self.current_a
        };
        let delta_soc = effective_a * dt_s / (self.capacity_ah * 3600.0);
        self.soc = (self.soc + delta_soc).clamp(0.0, 1.0);

        // Thermal balance: Joule + reversible + external - cooling.
        let r_pack = curves::pack_resistance(self.temperature_c, self.soc);
        let n_cells = self.series_cells() as f64;
        let t_kelvin = self.temperature_c + 273.15;
        let q_rev = self.current_a * t_kelvin * curves::docv_dt(self.soc) * n_cells;
        let heat_w = self.current_a * self.current_a * r_pack + q_rev + external_heat_w;
        let cooling_w = COOLING_COEFF_W_PER_C * (self.temperature_c - AMBIENT_TEMP_C);
        self.temperature_c += (heat_w - cooling_w) / THERMAL_MASS_J_PER_C * dt_s;
        self.temperature_c = self.temperature_c.clamp(MIN_TEMP_C, MAX_TEMP_C);

        self.update_voltage();
    }

    fn update_voltage(&mut self) {
        let ocv = curves::ocv_from_soc(self.soc);
        let r_pack = curves::pack_resistance(self.temperature_c, self.soc);
        let n_cells = self.series_cells() as f64;
        self.cell_voltage_v = ocv + self.current_a * r_pack / n_cells;
        self.pack_voltage_v = self.cell_voltage_v * n_cells;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn make_pack(soc: f64, temp_c: f64) -> Pack {
        Pack::new(1, soc, temp_c)
    }

    #[test]
    fn new_clamps_soc() {
        assert_eq!(make_pack(-0.2, 25.0).soc(), 0.0);
        assert_eq!(make_pack(1.7, 25.0).soc(), 1.0);
    }

    #[test]
    fn pack_voltage_is_cell_voltage_times_series_count() {
        let pack = make_pack(0.5, 25.0);
        assert!((pack.pack_voltage_v() - pack.cell_voltage_v() * 308.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_non_positive_dt_without_mutation() {
        let mut pack = make_pack(0.5, 25.0);
        let before = pack.clone();
        assert!(matches!(pack.step(0.0, 100.0, true, 0.0), Err(BmsError::InvalidTimeStep(_))));
        assert!(matches!(pack.step(-1.0, 100.0, true, 0.0), Err(BmsError::InvalidTimeStep(_))));
        assert_eq!(pack.soc(), before.soc());
        assert_eq!(pack.temperature_c(), before.temperature_c());
    }

    #[test]
    fn open_contactors_force_zero_current() {
        let mut pack = make_pack(0.5, 25.0);
        pack.step(10.0, 200.0, false, 0.0).unwrap();
        assert_eq!(pack.current_a(), 0.0);
        assert!((pack.soc() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn long_step_matches_subdivided_steps() {
        let mut one_shot = make_pack(0.4, 25.0);
        let mut split = make_pack(0.4, 25.0);

        one_shot.step(30.0, 128.0, true, 0.0).unwrap();
        for _ in 0..3 {
            split.step(10.0, 128.0, true, 0.0).unwrap();
        }

        assert!((one_shot.soc() - split.soc()).abs() < 1e-6);
        assert!((one_shot.temperature_c() - split.temperature_c()).abs() < 0.01);
    }

    #[test]
    fn one_hour_at_1c_fills_empty_pack() {
        let mut pack = make_pack(0.0, 25.0);
        for _ in 0..3600 {
            pack.step(1.0, 128.0, true, 0.0).unwrap();
        }
        // 0.998 coulombic efficiency keeps it just shy of exactly full.
        assert!(pack.soc() >= 0.99 && pack.soc() <= 1.0);
    }

    #[test]
    fn discharge_at_mid_soc_is_exothermic() {
        // dOCV/dT < 0 at 50% SoC, so Q_rev > 0 when discharging.
        let mut discharging = make_pack(0.5, 25.0);
        let mut idle = make_pack(0.5, 25.0);

        for _ in 0..10 {
            discharging.step(10.0, -100.0, true, 0.0).unwrap();
            idle.step(10.0, 0.0, true, 0.0).unwrap();
        }
        assert!(discharging.temperature_c() > idle.temperature_c());
    }

    #[test]
    fn charge_near_full_is_exothermic_via_entropic_term() {
        // dOCV/dT > 0 above 95% SoC, so Q_rev > 0 when charging.
        let n_cells = 308.0;
        let t_kelvin = 25.0 + 273.15;
        let q_rev = 50.0 * t_kelvin * crate::domain::curves::docv_dt(0.97) * n_cells;
        assert!(q_rev > 0.0);
    }

    #[test]
    fn external_heat_raises_temperature() {
        let mut heated = make_pack(0.5, 40.0);
        let mut plain = make_pack(0.5, 40.0);
        heated.step(60.0, 0.0, true, 5000.0).unwrap();
        plain.step(60.0, 0.0, true, 0.0).unwrap();
        assert!(heated.temperature_c() > plain.temperature_c());
    }

    proptest! {
        #[test]
        fn state_stays_bounded_after_any_step(
            soc in 0.0f64..=1.0,
            temp in -40.0f64..=90.0,
            current in -700.0f64..=700.0,
            dt in 0.001f64..=120.0,
        ) {
            let mut pack = make_pack(soc, temp);
            pack.step(dt, current, true, 0.0).unwrap();
            prop_assert!((0.0..=1.0).contains(&pack.soc()));
            prop_assert!((MIN_TEMP_C..=MAX_TEMP_C).contains(&pack.temperature_c()));
        }
    }
}
