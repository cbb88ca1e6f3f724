//! Array control: a fleet of pack controllers sharing one DC bus.
//!
//! The array owns its controllers exclusively. Each array tick runs every
//! pack's control stack, distributes the requested bus current among the
//! CONNECTED packs with the clamped Kirchhoff solver (or equalizes them when
//! no current is requested), then advances the pack physics with the
//! assigned currents.

pub mod solver;

use tracing::info;

use crate::controller::PackController;
use crate::domain::types::{BmsError, CurrentLimit, PackMode, MAX_PACKS};
pub use solver::{PackNode, Solution};

/// What the EMS wants from the array this tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArrayRequest {
    /// Total bus current in amps, positive = charging the array.
    Current(f64),
    /// Zero net current; packs exchange energy among themselves.
    Equalize,
}

/// Multi-pack array on a shared DC bus.
pub struct Array {
    controllers: Vec<PackController>,
    bus_voltage_v: f64,
    charge_limit_a: f64,
    discharge_limit_a: f64,
}

impl Array {
    /// Build an array from per-pack controllers. Pack ids must be unique and
    /// the fleet bounded by [`MAX_PACKS`].
    pub fn new(controllers: Vec<PackController>) -> Result<Self, BmsError> {
        if controllers.len() > MAX_PACKS {
            return Err(BmsError::TooManyPacks(controllers.len()));
        }
        for (i, a) in controllers.iter().enumerate() {
            for b in controllers.iter().skip(i + 1) {
                if a.id() == b.id() {
                    return Err(BmsError::DuplicatePackId(a.id()));
                }
            }
        }

        let mut array = Self {
            controllers,
            bus_voltage_v: 0.0,
            charge_limit_a: 0.0,
            discharge_limit_a: 0.0,
        };
        array.update_bus_voltage();
        Ok(array)
    }

    pub fn controllers(&self) -> &[PackController] {
        &self.controllers
    }

    pub fn controllers_mut(&mut self) -> &mut [PackController] {
        &mut self.controllers
    }

    pub fn controller(&self, idx: usize) -> &PackController {
        &self.controllers[idx]
    }

    pub fn bus_voltage_v(&self) -> f64 {
        self.bus_voltage_v
    }

    /// Aggregated array envelope (charge, discharge) in amps.
    pub fn envelope(&self) -> CurrentLimit {
        CurrentLimit { charge_a: self.charge_limit_a, discharge_a: self.discharge_limit_a }
    }

    fn connected_indices(&self) -> Vec<usize> {
        self.controllers
            .iter()
            .enumerate()
            .filter(|(_, c)| c.mode() == PackMode::Connected)
            .map(|(i, _)| i)
            .collect()
    }

    /// Array envelopes: the weakest connected pack scaled by the connected
    /// count. Conservative for unequal packs.
    pub fn compute_limits(&mut self) {
        let connected = self.connected_indices();
        if connected.is_empty() {
            self.charge_limit_a = 0.0;
            self.discharge_limit_a = 0.0;
            return;
        }
        let n = connected.len() as f64;
        let min_charge = connected
            .iter()
            .map(|&i| self.controllers[i].envelope().charge_a)
            .fold(f64::INFINITY, f64::min);
        let min_discharge = connected
            .iter()
            .map(|&i| self.controllers[i].envelope().discharge_a)
            .fold(f64::INFINITY, f64::min);
        self.charge_limit_a = min_charge * n;
        self.discharge_limit_a = min_discharge * n;
    }

    /// Bus estimate when nothing is connected: mean pack voltage over
    /// CONNECTED packs, else over READY packs.
    pub fn update_bus_voltage(&mut self) {
        for mode in [PackMode::Connected, PackMode::Ready] {
            let packs: Vec<f64> = self
                .controllers
                .iter()
                .filter(|c| c.mode() == mode)
                .map(|c| c.pack().pack_voltage_v())
                .collect();
            if !packs.is_empty() {
                self.bus_voltage_v = packs.iter().sum::<f64>() / packs.len() as f64;
                return;
            }
        }
    }

    /// Connect the best READY pack: lowest SoC for charge duty, highest for
    /// discharge duty. No-op if anything is already on (or joining) the bus.
    pub fn connect_first(&mut self, for_charge: bool) {
        let busy = self
            .controllers
            .iter()
            .any(|c| matches!(c.mode(), PackMode::Connected | PackMode::Connecting));
        if busy {
            return;
        }

        let candidate = self
            .controllers
            .iter()
            .enumerate()
            .filter(|(_, c)| c.mode() == PackMode::Ready)
            .min_by(|(_, a), (_, b)| {
                let (sa, sb) = (a.pack().soc(), b.pack().soc());
                if for_charge {
                    sa.total_cmp(&sb)
                } else {
                    sb.total_cmp(&sa)
                }
            })
            .map(|(i, _)| i);

        if let Some(idx) = candidate {
            let bus_mv = (self.bus_voltage_v * 1000.0) as u32;
            if let Err(err) = self.controllers[idx].request_connect(bus_mv) {
                info!(pack_id = self.controllers[idx].id(), error = %err, "connect-first rejected");
            }
        }
    }

    /// Once one pack holds the bus, bring every remaining READY pack on.
    pub fn connect_remaining(&mut self, for_charge: bool) {
        let _ = for_charge;
        let any_connected = self.controllers.iter().any(|c| c.mode() == PackMode::Connected);
        if !any_connected {
            return;
        }

        let bus_mv = (self.bus_voltage_v * 1000.0) as u32;
        for ctrl in self.controllers.iter_mut() {
            if ctrl.mode() == PackMode::Ready {
                if let Err(err) = ctrl.request_connect(bus_mv) {
                    info!(pack_id = ctrl.id(), error = %err, "connect-remaining rejected");
                }
            }
        }
    }

    pub fn disconnect_all(&mut self) {
        for ctrl in self.controllers.iter_mut() {
            ctrl.request_disconnect();
        }
    }

    /// Attempt a manual reset on every latched pack; denied packs stay put.
    pub fn reset_all_faults(&mut self) {
        for ctrl in self.controllers.iter_mut() {
            if ctrl.data().fault_latched {
                let _ = ctrl.manual_fault_reset();
            }
        }
    }

    /// One array tick: per-pack control stacks, current distribution, pack
    /// physics. `external_heat_w` is indexed like the controller list.
    pub fn step(
        &mut self,
        dt_ms: u32,
        request: ArrayRequest,
        external_heat_w: Option<&[f64]>,
    ) -> Result<(), BmsError> {
        let dt_s = dt_ms as f64 / 1000.0;
        let heat = |idx: usize| external_heat_w.and_then(|h| h.get(idx).copied()).unwrap_or(0.0);

        for ctrl in self.controllers.iter_mut() {
            ctrl.tick(dt_ms);
        }

        let connected = self.connected_indices();
        self.compute_limits();

        if connected.is_empty() {
            self.update_bus_voltage();
        } else {
            let nodes: Vec<PackNode> = connected
                .iter()
                .map(|&i| {
                    let ctrl = &self.controllers[i];
                    let envelope = ctrl.envelope();
                    PackNode {
                        resistance_ohm: ctrl.pack().resistance_ohm(),
                        source_v: ctrl.pack().ocv_v() * ctrl.pack().series_cells() as f64,
                        charge_limit_a: envelope.charge_a,
                        discharge_limit_a: envelope.discharge_a,
                    }
                })
                .collect();

            let (target, equalize) = match request {
                ArrayRequest::Current(a) if a != 0.0 => (a, false),
                _ => (0.0, true),
            };

            let solution = solver::solve(
                &nodes,
                target,
                equalize,
                self.charge_limit_a,
                self.discharge_limit_a,
                self.bus_voltage_v,
            );
            self.bus_voltage_v = solution.bus_voltage_v;

            for (k, &idx) in connected.iter().enumerate() {
                self.controllers[idx].step_physics(dt_s, solution.currents_a[k], heat(idx))?;
            }
        }

        for idx in 0..self.controllers.len() {
            if self.controllers[idx].mode() != PackMode::Connected {
                self.controllers[idx].step_physics(dt_s, 0.0, heat(idx))?;
            }
        }

        self.compute_limits();
        Ok(())
    }
}
