//! Reference tables for the NMC 622 pack: OCV(SoC), module resistance R(T, SoC),
//! entropic coefficient dOCV/dT, and the current-derating breakpoint curves.
//!
//! All tables are part of the BMS contract and are verified verbatim by the
//! test suite. Interpolation is linear (edge-clamped) in one dimension and
//! bilinear (edge-clamped) over the resistance grid.

use super::types::NUM_MODULES;

/// Linear interpolation over a breakpoint table.
///
/// `bp` must be sorted ascending with at least two entries. Input is clamped
/// to the table range.
pub fn linterp(bp: &[f64], val: &[f64], x: f64) -> f64 {
    debug_assert!(bp.len() >= 2 && bp.len() == val.len());
    let x = x.clamp(bp[0], bp[bp.len() - 1]);

    let mut lo = 0;
    let mut hi = bp.len() - 2;
    while lo < hi {
        let mid = (lo + hi + 1) / 2;
        if bp[mid] <= x {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }

    let span = bp[lo + 1] - bp[lo];
    if span < 1e-15 {
        return val[lo];
    }
    val[lo] + (val[lo + 1] - val[lo]) * (x - bp[lo]) / span
}

// ---------------------------------------------------------------------------
// Open-circuit voltage: 24-point NMC 622 curve, volts per cell.
// ---------------------------------------------------------------------------

const OCV_SOC_BP: [f64; 24] = [
    0.00, 0.02, 0.05, 0.08, 0.10, 0.15, 0.20, 0.25, //
    0.30, 0.35, 0.40, 0.45, 0.50, 0.55, 0.60, 0.65, //
    0.70, 0.75, 0.80, 0.85, 0.90, 0.95, 0.98, 1.00,
];

const OCV_VOLT_BP: [f64; 24] = [
    3.000, 3.280, 3.420, 3.480, 3.510, 3.555, 3.590, 3.610, //
    3.625, 3.638, 3.650, 3.662, 3.675, 3.690, 3.710, 3.735, //
    3.765, 3.800, 3.845, 3.900, 3.960, 4.030, 4.100, 4.190,
];

/// Per-cell open-circuit voltage for a state of charge in [0, 1].
/// Inputs outside the range are clamped.
pub fn ocv_from_soc(soc: f64) -> f64 {
    linterp(&OCV_SOC_BP, &OCV_VOLT_BP, soc.clamp(0.0, 1.0))
}

/// Inverse OCV lookup: state of charge for a rested cell voltage.
/// Used by the SoC estimator's rest correction.
pub fn soc_from_ocv(cell_v: f64) -> f64 {
    linterp(&OCV_VOLT_BP, &OCV_SOC_BP, cell_v)
}

/// Entropic coefficient dOCV/dT in V/K, 7-band step function (no
/// interpolation across bands). Negative at low SoC, positive near full.
pub fn docv_dt(soc: f64) -> f64 {
    if soc < 0.10 {
        -0.10e-3
    } else if soc < 0.25 {
        -0.25e-3
    } else if soc < 0.50 {
        -0.45e-3
    } else if soc < 0.70 {
        -0.35e-3
    } else if soc < 0.85 {
        -0.15e-3
    } else if soc < 0.95 {
        0.05e-3
    } else {
        0.15e-3
    }
}

// ---------------------------------------------------------------------------
// Module resistance R(T, SoC), milliohms per module, 6 temperatures x 7 SoCs.
// U-shaped in SoC (minimum at 50%), rises sharply as temperature drops.
// ---------------------------------------------------------------------------

const R_TEMPS: [f64; 6] = [-10.0, 0.0, 10.0, 25.0, 35.0, 45.0];
const R_SOCS: [f64; 7] = [0.05, 0.20, 0.35, 0.50, 0.65, 0.80, 0.95];

/// Milliohms per module; rows = SoC, columns = temperature.
const R_TABLE: [[f64; 6]; 7] = [
    [15.3, 9.7, 6.2, 5.0, 4.4, 4.1], // SoC 5%
    [10.9, 7.2, 4.7, 3.6, 3.3, 3.1], // SoC 20%
    [9.9, 6.6, 4.3, 3.3, 3.0, 2.8],  // SoC 35%
    [9.3, 6.2, 4.0, 3.1, 2.8, 2.6],  // SoC 50% (minimum)
    [9.6, 6.4, 4.2, 3.2, 2.9, 2.7],  // SoC 65%
    [10.2, 6.8, 4.4, 3.4, 3.1, 2.9], // SoC 80%
    [13.5, 8.9, 5.6, 4.2, 3.9, 3.6], // SoC 95%
];

fn bracket(bp: &[f64], x: f64) -> (usize, f64) {
    let mut i = 0;
    for k in (0..bp.len() - 1).rev() {
        if bp[k] <= x {
            i = k;
            break;
        }
    }
    let frac = (x - bp[i]) / (bp[i + 1] - bp[i]);
    (i, frac)
}

/// Single-module resistance in ohms, bilinear over the R(T, SoC) grid with
/// edge clamping.
pub fn module_resistance(temp_c: f64, soc: f64) -> f64 {
    let t = temp_c.clamp(R_TEMPS[0], R_TEMPS[R_TEMPS.len() - 1]);
    let s = soc.clamp(R_SOCS[0], R_SOCS[R_SOCS.len() - 1]);

    let (ti, tf) = bracket(&R_TEMPS, t);
    let (si, sf) = bracket(&R_SOCS, s);

    let r00 = R_TABLE[si][ti];
    let r01 = R_TABLE[si][ti + 1];
    let r10 = R_TABLE[si + 1][ti];
    let r11 = R_TABLE[si + 1][ti + 1];

    let r0 = r00 + (r01 - r00) * tf;
    let r1 = r10 + (r11 - r10) * tf;
    (r0 + (r1 - r0) * sf) * 1e-3
}

/// Whole-pack resistance in ohms: 22 modules in series.
pub fn pack_resistance(temp_c: f64, soc: f64) -> f64 {
    module_resistance(temp_c, soc) * NUM_MODULES as f64
}

// ---------------------------------------------------------------------------
// Current-derating breakpoint curves, C-rates (positive magnitudes).
// ---------------------------------------------------------------------------

/// Temperature-based charge derating: zero below 5 C and above 55 C,
/// 3 C plateau between 15 and 35 C.
pub const TEMP_CHARGE_BP: [f64; 8] = [-25.0, 0.0, 5.0, 15.0, 35.0, 45.0, 55.0, 65.0];
pub const TEMP_CHARGE_CR: [f64; 8] = [0.0, 0.0, 0.0, 3.0, 3.0, 2.0, 0.0, 0.0];

/// Temperature-based discharge derating: 0.2 C floor at the cold end,
/// 5 C plateau between 10 and 25 C, zero at 70 C.
pub const TEMP_DISCHARGE_BP: [f64; 15] = [
    -25.0, -15.0, -10.0, -5.0, 0.0, 5.0, 10.0, 25.0, 30.0, 35.0, 45.0, 55.0, 60.0, 65.0, 70.0,
];
pub const TEMP_DISCHARGE_CR: [f64; 15] = [
    0.2, 0.2, 1.0, 1.5, 2.0, 4.5, 5.0, 5.0, 4.5, 4.0, 3.8, 3.8, 0.2, 0.2, 0.0,
];

/// SoC-based charge derating: full 3 C up to 85%, tapering to 0.5 C at 100%.
pub const SOC_CHARGE_BP: [f64; 5] = [0.0, 0.85, 0.90, 0.95, 1.00];
pub const SOC_CHARGE_CR: [f64; 5] = [3.0, 3.0, 2.0, 1.0, 0.5];

/// SoC-based discharge derating: reduced below 20%.
pub const SOC_DISCHARGE_BP: [f64; 9] = [0.00, 0.02, 0.05, 0.08, 0.10, 0.15, 0.20, 0.50, 1.00];
pub const SOC_DISCHARGE_CR: [f64; 9] = [1.0, 1.0, 2.2, 2.2, 4.0, 4.0, 5.0, 5.0, 5.0];

/// Cell-voltage-based charge derating: zero at 4.200 V.
pub const CELLV_CHARGE_BP: [f64; 3] = [3.000, 4.100, 4.200];
pub const CELLV_CHARGE_CR: [f64; 3] = [3.0, 3.0, 0.0];

/// Cell-voltage-based discharge derating: zero at or below 3.200 V.
pub const CELLV_DISCHARGE_BP: [f64; 7] = [3.000, 3.200, 3.300, 3.400, 3.450, 3.550, 4.200];
pub const CELLV_DISCHARGE_CR: [f64; 7] = [0.0, 0.0, 2.0, 2.5, 3.8, 5.0, 5.0];

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn ocv_endpoints() {
        assert!((ocv_from_soc(0.0) - 3.000).abs() < 1e-9);
        assert!((ocv_from_soc(1.0) - 4.190).abs() < 1e-9);
    }

    #[test]
    fn ocv_clamps_out_of_range_inputs() {
        assert_eq!(ocv_from_soc(-0.5), ocv_from_soc(0.0));
        assert_eq!(ocv_from_soc(1.5), ocv_from_soc(1.0));
    }

    #[test]
    fn ocv_inverse_roundtrip_at_breakpoints() {
        for (&s, &v) in OCV_SOC_BP.iter().zip(OCV_VOLT_BP.iter()) {
            assert!((soc_from_ocv(v) - s).abs() < 1e-9);
        }
    }

    #[test]
    fn docv_dt_sign_bands() {
        assert!(docv_dt(0.05) < 0.0);
        assert!(docv_dt(0.50) < 0.0);
        assert!(docv_dt(0.90) > 0.0);
        assert!(docv_dt(0.99) > 0.0);
    }

    #[test]
    fn resistance_at_grid_points() {
        // 25 C, 50% SoC is the 3.1 mOhm baseline cell of the table.
        assert!((module_resistance(25.0, 0.50) - 3.1e-3).abs() < 1e-9);
        // Cold corner.
        assert!((module_resistance(-10.0, 0.05) - 15.3e-3).abs() < 1e-9);
    }

    #[test]
    fn resistance_edge_clamped() {
        assert_eq!(module_resistance(-40.0, 0.5), module_resistance(-10.0, 0.5));
        assert_eq!(module_resistance(80.0, 0.5), module_resistance(45.0, 0.5));
        assert_eq!(module_resistance(25.0, 0.0), module_resistance(25.0, 0.05));
        assert_eq!(module_resistance(25.0, 1.0), module_resistance(25.0, 0.95));
    }

    proptest! {
        #[test]
        fn ocv_within_bounds_and_monotonic(a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let v_lo = ocv_from_soc(lo);
            let v_hi = ocv_from_soc(hi);
            prop_assert!(v_lo >= 3.000 - 1e-12 && v_hi <= 4.190 + 1e-12);
            prop_assert!(v_hi >= v_lo - 1e-12);
        }

        #[test]
        fn pack_resistance_is_22x_module_and_positive(
            t in -40.0f64..=80.0,
            s in 0.0f64..=1.0,
        ) {
            let rm = module_resistance(t, s);
            let rp = pack_resistance(t, s);
            prop_assert!(rm > 0.0);
            prop_assert!((rp - 22.0 * rm).abs() < 1e-12);
        }

        #[test]
        fn resistance_grows_as_temperature_drops(s in 0.05f64..=0.95) {
            prop_assert!(module_resistance(-10.0, s) > module_resistance(25.0, s));
        }
    }
}
