//! Meter configuration
//!
//! JSON file describing the serial port, the HDLC link, engine timing and
//! the registers to read. Every section has defaults matching a Ziv meter on
//! an optical probe, so an empty object is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

use crate::dlms::{obis, LinkSettings};
use crate::poller::ReadStep;
use crate::protocol::{AttributeRef, EngineConfig, DEFAULT_BAUD_RATE, RECEIVE_SLACK};

/// Value attribute of a COSEM register
pub const REGISTER_VALUE_ATTRIBUTE: u8 = 2;

/// Longest LOW password that keeps the AARQ within a one-byte length
const MAX_PASSWORD_LEN: usize = 64;

/// Errors that can occur while loading a configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("Could not read config: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid configuration JSON
    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Device path or COM name
    pub name: String,
    /// Line speed; the meter expects 9600
    pub baud_rate: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            name: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Presentation of a published reading
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Unit of measurement, e.g. "Wh"
    #[serde(default)]
    pub unit: String,
    /// Decimals shown when logging
    #[serde(default)]
    pub accuracy_decimals: u8,
    /// Kind of quantity, e.g. "energy"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    /// How the value evolves, e.g. "total_increasing"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_class: Option<String>,
}

impl SensorConfig {
    fn energy() -> Self {
        Self {
            unit: "Wh".to_string(),
            accuracy_decimals: 0,
            device_class: Some("energy".to_string()),
            state_class: Some("total_increasing".to_string()),
        }
    }

    fn power() -> Self {
        Self {
            unit: "W".to_string(),
            accuracy_decimals: 0,
            device_class: Some("power".to_string()),
            state_class: Some("measurement".to_string()),
        }
    }

    /// Render a value with the configured decimals and unit
    pub fn format(&self, value: f64) -> String {
        let decimals = usize::from(self.accuracy_decimals);
        if self.unit.is_empty() {
            format!("{value:.decimals$}")
        } else {
            format!("{value:.decimals$} {}", self.unit)
        }
    }
}

/// One register to read each cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Name used in logs and output
    pub name: String,
    /// OBIS code, e.g. "1.0.1.8.0.255"
    pub logical_name: String,
    /// Attribute index, 2 by default
    #[serde(default = "default_attribute")]
    pub attribute: u8,
    /// Multiplier applied before publishing
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Publish the value when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor: Option<SensorConfig>,
}

fn default_attribute() -> u8 {
    REGISTER_VALUE_ATTRIBUTE
}

fn default_scale() -> f64 {
    1.0
}

impl ReadConfig {
    fn new(name: &str, logical_name: &str, scale: f64, sensor: SensorConfig) -> Self {
        Self {
            name: name.to_string(),
            logical_name: logical_name.to_string(),
            attribute: REGISTER_VALUE_ATTRIBUTE,
            scale,
            sensor: Some(sensor),
        }
    }

    /// Attribute this read targets
    pub fn attribute_ref(&self) -> AttributeRef {
        AttributeRef::new(self.logical_name.clone(), self.attribute)
    }
}

/// Registers read from a Ziv meter by default
///
/// Power registers count in decawatts.
pub fn default_reads() -> Vec<ReadConfig> {
    vec![
        ReadConfig::new("Import energy", "1.0.1.8.0.255", 1.0, SensorConfig::energy()),
        ReadConfig::new("Export energy", "1.0.2.8.0.255", 1.0, SensorConfig::energy()),
        ReadConfig::new("Import power", "1.0.1.7.0.255", 10.0, SensorConfig::power()),
        ReadConfig::new("Export power", "1.0.2.7.0.255", 10.0, SensorConfig::power()),
    ]
}

fn default_tick_interval() -> u64 {
    16
}

/// Complete meter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Serial port
    #[serde(default)]
    pub port: PortConfig,
    /// HDLC addressing and authentication
    #[serde(default)]
    pub link: LinkSettings,
    /// Engine timing and framing
    #[serde(default)]
    pub engine: EngineConfig,
    /// Time between read cycles; none means a single cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_interval_ms: Option<u64>,
    /// Time between engine ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Registers read each cycle, in order
    #[serde(default = "default_reads")]
    pub reads: Vec<ReadConfig>,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            port: PortConfig::default(),
            link: LinkSettings::default(),
            engine: EngineConfig::default(),
            update_interval_ms: None,
            tick_interval_ms: default_tick_interval(),
            reads: default_reads(),
        }
    }
}

impl MeterConfig {
    /// Load and validate a configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: MeterConfig = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!("loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check values the engine and codec cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.engine.send_chunk == 0 {
            return invalid("engine.send_chunk must be at least 1".into());
        }
        if self.engine.timeout_ms == 0 {
            return invalid("engine.timeout_ms must be at least 1".into());
        }
        if self.engine.slack < RECEIVE_SLACK {
            return invalid(format!("engine.slack must be at least {RECEIVE_SLACK}"));
        }
        if self.tick_interval_ms == 0 {
            return invalid("tick_interval_ms must be at least 1".into());
        }
        if self.update_interval_ms == Some(0) {
            return invalid("update_interval_ms must be at least 1".into());
        }
        if self.link.client_address >= 0x80 {
            return invalid(format!(
                "link.client_address {:#x} does not fit in one byte",
                self.link.client_address
            ));
        }
        if self.link.password.len() > MAX_PASSWORD_LEN {
            return invalid("link.password is too long".into());
        }

        let mut names = HashSet::new();
        for read in &self.reads {
            if !names.insert(read.name.as_str()) {
                return invalid(format!("duplicate read name \"{}\"", read.name));
            }
            if let Err(e) = obis::parse_logical_name(&read.logical_name) {
                return invalid(format!("{}: {e}", read.name));
            }
            if read.attribute == 0 {
                return invalid(format!("{}: attribute index 0 is not readable", read.name));
            }
            if !read.scale.is_finite() {
                return invalid(format!("{}: scale must be a finite number", read.name));
            }
        }

        if self.port.baud_rate != DEFAULT_BAUD_RATE {
            tracing::warn!(
                "meter expects {DEFAULT_BAUD_RATE} baud, config asks for {}",
                self.port.baud_rate
            );
        }
        Ok(())
    }

    /// Read steps in configured order, without sinks
    pub fn read_steps(&self) -> Vec<ReadStep> {
        self.reads
            .iter()
            .map(|r| ReadStep::new(r.name.clone(), r.attribute_ref(), r.scale))
            .collect()
    }
}
