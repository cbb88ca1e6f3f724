//! Safe operating-current envelopes.
//!
//! Three independent derating curves (temperature, state of charge, cell
//! voltage) each produce a (charge, discharge) pair in amps; the effective
//! envelope is their element-wise minimum, floored at zero. A latched fault
//! forces both sides to zero regardless of conditions.

use crate::domain::curves::{
    linterp, CELLV_CHARGE_BP, CELLV_CHARGE_CR, CELLV_DISCHARGE_BP, CELLV_DISCHARGE_CR,
    SOC_CHARGE_BP, SOC_CHARGE_CR, SOC_DISCHARGE_BP, SOC_DISCHARGE_CR, TEMP_CHARGE_BP,
    TEMP_CHARGE_CR, TEMP_DISCHARGE_BP, TEMP_DISCHARGE_CR,
};
use crate::domain::types::{CurrentLimit, PackData, NOMINAL_CAPACITY_AH};

/// Temperature-based envelope: charge is zero below 5 C and above 55 C with a
/// 3 C plateau at 15..35 C; discharge keeps a 0.2 C cold floor and a 5 C
/// plateau at 10..25 C.
pub fn by_temperature(temp_c: f64, capacity_ah: f64) -> CurrentLimit {
    CurrentLimit {
        charge_a: (linterp(&TEMP_CHARGE_BP, &TEMP_CHARGE_CR, temp_c) * capacity_ah).max(0.0),
        discharge_a: (linterp(&TEMP_DISCHARGE_BP, &TEMP_DISCHARGE_CR, temp_c) * capacity_ah)
            .max(0.0),
    }
}

/// SoC-based envelope: charge derates above 85% down to 0.5 C at full;
/// discharge is reduced below 20%.
pub fn by_soc(soc: f64, capacity_ah: f64) -> CurrentLimit {
    CurrentLimit {
        charge_a: (linterp(&SOC_CHARGE_BP, &SOC_CHARGE_CR, soc) * capacity_ah).max(0.0),
        discharge_a: (linterp(&SOC_DISCHARGE_BP, &SOC_DISCHARGE_CR, soc) * capacity_ah).max(0.0),
    }
}

/// Cell-voltage-based envelope: charge reaches zero at 4.200 V, discharge is
/// zero at or below 3.200 V.
pub fn by_cell_voltage(cell_v: f64, capacity_ah: f64) -> CurrentLimit {
    CurrentLimit {
        charge_a: (linterp(&CELLV_CHARGE_BP, &CELLV_CHARGE_CR, cell_v) * capacity_ah).max(0.0),
        discharge_a: (linterp(&CELLV_DISCHARGE_BP, &CELLV_DISCHARGE_CR, cell_v) * capacity_ah)
            .max(0.0),
    }
}

/// Min-of-three envelope for scalar inputs.
pub fn envelope(temp_c: f64, soc: f64, cell_v: f64, capacity_ah: f64) -> CurrentLimit {
    by_temperature(temp_c, capacity_ah)
        .min(by_soc(soc, capacity_ah))
        .min(by_cell_voltage(cell_v, capacity_ah))
}

/// Pack-level envelope from measured telemetry: worst-case cell selection
/// (max cell bounds the charge side, min cell the discharge side), hottest
/// sensor for the temperature curve. A latched pack gets a zero envelope.
pub fn pack_envelope(pack: &PackData, soc: f64) -> CurrentLimit {
    if pack.fault_latched {
        return CurrentLimit::ZERO;
    }

    let temp_c = pack.max_temp_deci_c as f64 / 10.0;
    let by_temp = by_temperature(temp_c, NOMINAL_CAPACITY_AH);
    let by_state = by_soc(soc, NOMINAL_CAPACITY_AH);

    let charge_v = pack.max_cell_mv as f64 / 1000.0;
    let min_mv = if pack.min_cell_mv == u16::MAX { 0 } else { pack.min_cell_mv };
    let discharge_v = min_mv as f64 / 1000.0;
    let by_voltage = CurrentLimit {
        charge_a: by_cell_voltage(charge_v, NOMINAL_CAPACITY_AH).charge_a,
        discharge_a: by_cell_voltage(discharge_v, NOMINAL_CAPACITY_AH).discharge_a,
    };

    by_temp.min(by_state).min(by_voltage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const CAP: f64 = NOMINAL_CAPACITY_AH;

    #[rstest]
    #[case(-25.0, 0.0, 0.2 * CAP)] // cold end: no charge, 0.2 C discharge
    #[case(25.0, 3.0 * CAP, 5.0 * CAP)] // both plateaus
    #[case(45.0, 2.0 * CAP, 3.8 * CAP)]
    #[case(70.0, 0.0, 0.0)]
    fn temperature_breakpoints(#[case] t: f64, #[case] charge: f64, #[case] discharge: f64) {
        let lim = by_temperature(t, CAP);
        assert!((lim.charge_a - charge).abs() < 1e-9, "charge at {t} C");
        assert!((lim.discharge_a - discharge).abs() < 1e-9, "discharge at {t} C");
    }

    #[test]
    fn soc_charge_tapers_to_half_c_at_full() {
        let lim = by_soc(1.0, CAP);
        assert!((lim.charge_a - 0.5 * CAP).abs() < 1e-9);
    }

    #[test]
    fn soc_discharge_reduced_when_nearly_empty() {
        let empty = by_soc(0.0, CAP);
        let mid = by_soc(0.5, CAP);
        assert!((empty.discharge_a - 1.0 * CAP).abs() < 1e-9);
        assert!((mid.discharge_a - 5.0 * CAP).abs() < 1e-9);
    }

    #[test]
    fn cell_voltage_charge_zero_at_ceiling() {
        assert_eq!(by_cell_voltage(4.200, CAP).charge_a, 0.0);
        assert_eq!(by_cell_voltage(4.250, CAP).charge_a, 0.0);
    }

    #[test]
    fn cell_voltage_discharge_zero_at_floor() {
        assert_eq!(by_cell_voltage(3.200, CAP).discharge_a, 0.0);
        assert_eq!(by_cell_voltage(3.100, CAP).discharge_a, 0.0);
        assert!(by_cell_voltage(3.300, CAP).discharge_a > 0.0);
    }

    #[test]
    fn envelope_is_min_of_three() {
        // 25 C and mid-SoC allow 3 C charge, but a 4.15 V cell pulls the
        // charge side down to the voltage curve.
        let e = envelope(25.0, 0.5, 4.15, CAP);
        let v = by_cell_voltage(4.15, CAP);
        assert!((e.charge_a - v.charge_a).abs() < 1e-9);
    }

    #[test]
    fn latched_pack_envelope_is_zero() {
        let mut pack = PackData::default();
        pack.max_cell_mv = 3675;
        pack.min_cell_mv = 3675;
        pack.max_temp_deci_c = 250;
        pack.fault_latched = true;
        assert_eq!(pack_envelope(&pack, 0.5), CurrentLimit::ZERO);
    }

    #[test]
    fn pack_envelope_uses_worst_case_cells() {
        let mut pack = PackData::default();
        pack.max_temp_deci_c = 250;
        pack.max_cell_mv = 4150; // limits charge
        pack.min_cell_mv = 3300; // limits discharge
        let e = pack_envelope(&pack, 0.5);
        assert!((e.charge_a - by_cell_voltage(4.150, CAP).charge_a).abs() < 1e-9);
        assert!((e.discharge_a - by_cell_voltage(3.300, CAP).discharge_a).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn envelopes_are_never_negative(
            t in -60.0f64..=100.0,
            s in -0.5f64..=1.5,
            v in 2.0f64..=4.5,
        ) {
            let e = envelope(t, s, v, CAP);
            prop_assert!(e.charge_a >= 0.0);
            prop_assert!(e.discharge_a >= 0.0);
        }
    }
}
