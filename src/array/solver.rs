//! Kirchhoff / equalization current distribution across parallel packs.
//!
//! Each connected pack is an ideal OCV source behind its pack resistance:
//! I_k = (V_bus - OCV_k) / R_k. In Kirchhoff mode the bus voltage is chosen
//! so the currents sum to the (pre-clamped) target; in equalization mode the
//! net current is forced to zero so packs exchange energy among themselves.
//!
//! Per-pack envelopes are enforced by active-set iteration: solve the
//! unconstrained system over the active packs, clamp violators to their
//! envelope, fold their current into the residual, repeat. Each round clamps
//! at least one more pack and clamped packs never re-enter, so the loop
//! terminates within n rounds.

use tracing::debug;

/// Conductance floor below which the system is treated as singular.
pub const MIN_CONDUCTANCE_S: f64 = 1e-12;
/// Post-solve tolerance: a pack more than 1% over its envelope is hard
/// clamped. The resulting KCL residual is left for the next physics step.
pub const LIMIT_TOLERANCE: f64 = 0.01;

/// Electrical view of one connected pack.
#[derive(Debug, Clone, Copy)]
pub struct PackNode {
    /// Whole-pack series resistance, ohms.
    pub resistance_ohm: f64,
    /// Open-circuit stack voltage: OCV(SoC) x series cells, volts.
    pub source_v: f64,
    /// Charge envelope, amps (positive magnitude).
    pub charge_limit_a: f64,
    /// Discharge envelope, amps (positive magnitude).
    pub discharge_limit_a: f64,
}

/// Solver output: the bus voltage and one current per input node
/// (positive = charging that pack).
#[derive(Debug, Clone)]
pub struct Solution {
    pub bus_voltage_v: f64,
    pub currents_a: Vec<f64>,
}

/// Distribute `target_a` (ignored in equalization mode) among `nodes`.
///
/// `array_charge_limit_a` / `array_discharge_limit_a` pre-clamp the target.
/// `fallback_bus_v` is returned when every node degenerates (no conductance).
pub fn solve(
    nodes: &[PackNode],
    target_a: f64,
    equalization: bool,
    array_charge_limit_a: f64,
    array_discharge_limit_a: f64,
    fallback_bus_v: f64,
) -> Solution {
    let n = nodes.len();
    if n == 0 {
        return Solution { bus_voltage_v: fallback_bus_v, currents_a: Vec::new() };
    }

    let clamped_target = if equalization {
        0.0
    } else if target_a > 0.0 {
        target_a.min(array_charge_limit_a)
    } else {
        target_a.max(-array_discharge_limit_a)
    };

    let mut currents = vec![0.0f64; n];
    let mut active = vec![true; n];
    let mut clamped = vec![false; n];
    let mut residual = clamped_target;

    for round in 0..n {
        let (sum_g, sum_src_g) = active_sums(nodes, &active);
        if sum_g < MIN_CONDUCTANCE_S {
            break;
        }

        let v_bus = if equalization {
            let clamped_sum: f64 = currents
                .iter()
                .zip(clamped.iter())
                .filter(|(_, &c)| c)
                .map(|(&i, _)| i)
                .sum();
            (sum_src_g - clamped_sum) / sum_g
        } else {
            (sum_src_g + residual) / sum_g
        };

        let mut any_clamped = false;
        for (k, node) in nodes.iter().enumerate() {
            if !active[k] {
                continue;
            }
            let i_k = (v_bus - node.source_v) / node.resistance_ohm;

            if i_k > 0.0 && i_k > node.charge_limit_a {
                currents[k] = node.charge_limit_a;
                active[k] = false;
                clamped[k] = true;
                if !equalization {
                    residual -= node.charge_limit_a;
                }
                any_clamped = true;
            } else if i_k < 0.0 && -i_k > node.discharge_limit_a {
                currents[k] = -node.discharge_limit_a;
                active[k] = false;
                clamped[k] = true;
                if !equalization {
                    residual -= -node.discharge_limit_a;
                }
                any_clamped = true;
            } else {
                currents[k] = i_k;
            }
        }

        if !any_clamped {
            debug!(round, v_bus, "solver converged");
            if !equalization {
                post_solve_clamp(nodes, &mut currents);
            }
            return Solution { bus_voltage_v: v_bus, currents_a: currents };
        }
    }

    // Every round clamped someone (or the system went singular): one last
    // unconstrained solve over whatever is still active.
    let (sum_g, sum_src_g) = active_sums(nodes, &active);
    if active.iter().any(|&a| a) && sum_g >= MIN_CONDUCTANCE_S {
        let clamped_sum: f64 = currents
            .iter()
            .zip(clamped.iter())
            .filter(|(_, &c)| c)
            .map(|(&i, _)| i)
            .sum();
        let v_bus = if equalization {
            (sum_src_g - clamped_sum) / sum_g
        } else {
            (sum_src_g + residual) / sum_g
        };
        for (k, node) in nodes.iter().enumerate() {
            if active[k] {
                currents[k] = (v_bus - node.source_v) / node.resistance_ohm;
            }
        }
        return Solution { bus_voltage_v: v_bus, currents_a: currents };
    }

    // Everyone clamped: report the mean terminal voltage at the assigned
    // currents as the bus estimate.
    let v_bus = nodes
        .iter()
        .zip(currents.iter())
        .map(|(node, &i)| node.source_v + i * node.resistance_ohm)
        .sum::<f64>()
        / n as f64;
    Solution { bus_voltage_v: v_bus, currents_a: currents }
}

fn active_sums(nodes: &[PackNode], active: &[bool]) -> (f64, f64) {
    let mut sum_g = 0.0;
    let mut sum_src_g = 0.0;
    for (node, &is_active) in nodes.iter().zip(active.iter()) {
        if is_active {
            let g = 1.0 / node.resistance_ohm;
            sum_g += g;
            sum_src_g += node.source_v * g;
        }
    }
    (sum_g, sum_src_g)
}

fn post_solve_clamp(nodes: &[PackNode], currents: &mut [f64]) {
    for (node, current) in nodes.iter().zip(currents.iter_mut()) {
        if *current > 0.0 && *current > node.charge_limit_a * (1.0 + LIMIT_TOLERANCE) {
            *current = node.charge_limit_a;
        } else if *current < 0.0 && -*current > node.discharge_limit_a * (1.0 + LIMIT_TOLERANCE) {
            *current = -node.discharge_limit_a;
        }
    }
}
