//! TOML configuration: actuator descriptors, calibration schedule, bus
//! parameters, and queue limits.

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::ccm::SuffixMap;
use crate::registry::ActuatorDescriptor;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub actuators: Vec<ActuatorDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub multicast_addr: String,
    pub port: u16,
    /// Retransmissions per logical command.
    pub repeat: u32,
    /// Spacing between retransmissions, milliseconds.
    pub repeat_spacing_ms: u64,
    pub suffix: SuffixMap,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            multicast_addr: crate::ccm::MULTICAST_ADDR.to_string(),
            port: crate::ccm::MULTICAST_PORT,
            repeat: 3,
            repeat_spacing_ms: 50,
            suffix: SuffixMap::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Local hour (0-23) for the daily position reset.
    pub daily_reset_hour: u8,
    /// Calibrate every limited actuator on process start.
    pub on_startup: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            daily_reset_hour: 0,
            on_startup: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Waiting jobs held per actuator per level.
    pub capacity: usize,
    /// Seconds a queued job may wait before it is discarded.
    pub ttl_sec: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            ttl_sec: 300,
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. Any structural or range problem here
/// is fatal; the hub never starts with a config it only half understands.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.calibration.daily_reset_hour > 23 {
        bail!(
            "calibration.daily_reset_hour must be 0-23, got {}",
            config.calibration.daily_reset_hour
        );
    }
    if config.bus.repeat == 0 {
        bail!("bus.repeat must be at least 1");
    }
    if config.queue.capacity == 0 {
        bail!("queue.capacity must be at least 1");
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ActuatorRegistry, Kind};

    const SAMPLE: &str = r#"
[calibration]
daily_reset_hour = 2
on_startup = true

[queue]
capacity = 8
ttl_sec = 120

[[actuators]]
id = "VenSdWin"
kind = "duration"
full_open_sec = 60.0
full_close_sec = 55.0
has_limit = true
cooling_sec = 5.0
reversal_cooling_sec = 10.0

[[actuators]]
id = "Irri"
kind = "duration"
full_open_sec = 3000.0
full_close_sec = 3000.0
has_limit = false
max_duration_sec = 3600.0
cooling_sec = 3.0

[[actuators]]
id = "VenFan"
kind = "onoff"
cooling_sec = 30.0
"#;

    #[test]
    fn parse_sample_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.actuators.len(), 3);
        assert_eq!(config.calibration.daily_reset_hour, 2);
        assert!(config.calibration.on_startup);
        assert_eq!(config.queue.capacity, 8);
        assert_eq!(config.actuators[2].kind, Kind::OnOff);
    }

    #[test]
    fn parsed_actuators_pass_registry_validation() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let reg = ActuatorRegistry::from_descriptors(config.actuators).unwrap();
        assert!(reg.describe("Irri").unwrap().max_duration_sec.is_some());
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.actuators.is_empty());
        assert_eq!(config.bus.multicast_addr, "224.0.0.1");
        assert_eq!(config.bus.port, 16520);
        assert_eq!(config.bus.repeat, 3);
        assert_eq!(config.calibration.daily_reset_hour, 0);
        assert_eq!(config.queue.capacity, 16);
        assert_eq!(config.queue.ttl_sec, 300);
    }

    #[test]
    fn suffix_overrides_apply() {
        let config: Config = toml::from_str(
            r#"
[bus.suffix]
l3 = ""
"#,
        )
        .unwrap();
        assert_eq!(config.bus.suffix.l3, "");
        // untouched levels keep their defaults
        assert_eq!(config.bus.suffix.l2, "rcA");
    }

    #[test]
    fn out_of_range_reset_hour_rejected() {
        let config: Config = toml::from_str("[calibration]\ndaily_reset_hour = 24\n").unwrap();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn zero_repeat_rejected() {
        let config: Config = toml::from_str("[bus]\nrepeat = 0\n").unwrap();
        assert!(validate(&config).is_err());
    }
}
