//! Layered configuration: `Bms.toml` merged with `BMS_`-prefixed environment
//! variables. Every field has a default so the binary runs with no file
//! present.

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use validator::Validate;

use crate::protection::ProtectionConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Config {
    #[validate(nested)]
    #[serde(default)]
    pub array: ArrayConfig,

    #[validate(nested)]
    #[serde(default)]
    pub protection: ProtectionSettings,

    #[validate(nested)]
    #[serde(default)]
    pub demo: DemoConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[validate(nested)]
    #[serde(default)]
    pub sim: SimConfig,
}

impl Config {
    /// Load `Bms.toml` (if present) and `BMS_*` environment overrides on top
    /// of the defaults, then validate.
    pub fn load() -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("Bms.toml"))
            .merge(Env::prefixed("BMS_").split("__"))
            .extract()
            .context("failed to load configuration")?;
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

/// One pack seed: identity and initial model state.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PackSeed {
    pub id: u8,

    #[validate(range(min = 0.0, max = 1.0))]
    pub soc: f64,

    #[validate(range(min = -40.0, max = 90.0))]
    pub temperature_c: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ArrayConfig {
    #[validate(nested, length(min = 1, max = 8))]
    pub packs: Vec<PackSeed>,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            packs: vec![
                PackSeed { id: 1, soc: 0.45, temperature_c: 25.0 },
                PackSeed { id: 2, soc: 0.55, temperature_c: 25.0 },
                PackSeed { id: 3, soc: 0.65, temperature_c: 25.0 },
            ],
        }
    }
}

/// Warning hysteresis deadbands (clear thresholds). Defaults match the
/// protection module's constant block.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProtectionSettings {
    #[validate(range(min = 4000, max = 4225))]
    pub ov_warn_clear_mv: u16,

    #[validate(range(min = 3000, max = 3500))]
    pub uv_warn_clear_mv: u16,

    #[validate(range(min = 400, max = 650))]
    pub ot_warn_clear_deci_c: i16,
}

impl Default for ProtectionSettings {
    fn default() -> Self {
        let defaults = ProtectionConfig::default();
        Self {
            ov_warn_clear_mv: defaults.ov_warn_clear_mv,
            uv_warn_clear_mv: defaults.uv_warn_clear_mv,
            ot_warn_clear_deci_c: defaults.ot_warn_clear_deci_c,
        }
    }
}

impl From<&ProtectionSettings> for ProtectionConfig {
    fn from(settings: &ProtectionSettings) -> Self {
        Self {
            ov_warn_clear_mv: settings.ov_warn_clear_mv,
            uv_warn_clear_mv: settings.uv_warn_clear_mv,
            ot_warn_clear_deci_c: settings.ot_warn_clear_deci_c,
        }
    }
}

/// Demo scenarios shipped with the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Connect the fleet and charge at the requested current.
    Charge,
    /// Connect the fleet and discharge at the requested current.
    Discharge,
    /// Connect the fleet and let the packs equalize.
    Equalization,
    /// Charge, then force a stuck-high cell halfway through the run.
    CellFault,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DemoConfig {
    pub scenario: Scenario,

    /// Simulated duration in seconds.
    #[validate(range(min = 1, max = 86_400))]
    pub duration_s: u32,

    /// Base control tick, milliseconds.
    #[validate(range(min = 1, max = 1000))]
    pub tick_ms: u32,

    /// Requested bus current magnitude in amps (sign comes from scenario).
    #[validate(range(min = 0.0, max = 5000.0))]
    pub request_a: f64,

    /// CSV output path; `None` disables recording.
    pub csv_path: Option<PathBuf>,

    /// Tick in wall-clock time instead of free-running.
    pub realtime: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            scenario: Scenario::Charge,
            duration_s: 120,
            tick_ms: 10,
            request_a: 200.0,
            csv_path: Some(PathBuf::from("bms_sim.csv")),
            realtime: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log filter, `tracing_subscriber::EnvFilter` syntax. `RUST_LOG` wins
    /// when set.
    pub filter: String,
    /// Emit JSON log lines instead of the human format.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { filter: "info".into(), json: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SimConfig {
    /// Uniform measurement noise applied to simulated cell readings, mV.
    #[validate(range(min = 0, max = 50))]
    pub noise_cell_mv: u16,

    /// Noise seed, for reproducible runs.
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self { noise_cell_mv: 0, seed: 42 }
    }
}
