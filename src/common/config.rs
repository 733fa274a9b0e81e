//! Simulation configuration (`config.toml`).
//!
//! Every key is optional; a missing file section falls back to the defaults
//! below.

use embassy_time::Duration;
use log::LevelFilter;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::end_device::MacParameters;
use crate::lorawan::AddressGenerator;
use crate::network::FrameCounterWidth;

/// Largest application payload accepted in an uplink.
pub const MAX_PACKET_SIZE: usize = 222;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SimulationSection {
    pub duration_secs: u64,
    /// Seeds shadowing and application offsets.
    pub seed: u64,
    pub log_level: Option<String>,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            duration_secs: 3600,
            seed: 1,
            log_level: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MacSection {
    pub max_transmissions: u8,
    pub receive_delay1_ms: u64,
    pub receive_delay2_ms: u64,
    pub receive_window_ms: u64,
    pub confirmed: bool,
}

impl Default for MacSection {
    fn default() -> Self {
        Self {
            max_transmissions: 8,
            receive_delay1_ms: 1000,
            receive_delay2_ms: 2000,
            receive_window_ms: 100,
            confirmed: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct NetworkSection {
    /// Delay between an uplink and the scheduler's first reply opportunity.
    pub reply_delay_ms: u64,
    pub frame_counter_width: FrameCounterWidth,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            reply_delay_ms: 1000,
            frame_counter_width: FrameCounterWidth::Full,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ApplicationSection {
    /// Install a periodic sender on every device.
    pub enabled: bool,
    pub period_secs: u64,
    pub packet_size: usize,
}

impl Default for ApplicationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            period_secs: 600,
            packet_size: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SimulationConfig {
    pub simulation: SimulationSection,
    pub mac: MacSection,
    pub network: NetworkSection,
    pub address: AddressGenerator,
    pub application: ApplicationSection,
}

impl SimulationConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Derive the config path from a scene file path.
    ///
    /// Replaces the scene filename with "config.toml" in the same directory.
    pub fn config_path_from_scene(scene_path: &str) -> PathBuf {
        let scene = Path::new(scene_path);
        scene.parent().unwrap_or(Path::new(".")).join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mac = &self.mac;
        if mac.max_transmissions == 0 {
            return Err(ConfigError::Invalid("mac.max-transmissions must be at least 1".to_string()));
        }
        if mac.receive_window_ms == 0 {
            return Err(ConfigError::Invalid("mac.receive-window-ms must be positive".to_string()));
        }
        if mac.receive_delay2_ms < mac.receive_delay1_ms + mac.receive_window_ms {
            return Err(ConfigError::Invalid(format!(
                "mac.receive-delay2-ms ({}) must leave room for the first window ({} + {})",
                mac.receive_delay2_ms, mac.receive_delay1_ms, mac.receive_window_ms
            )));
        }
        if self.network.reply_delay_ms == 0 {
            return Err(ConfigError::Invalid("network.reply-delay-ms must be positive".to_string()));
        }
        if self.application.period_secs == 0 {
            return Err(ConfigError::Invalid("application.period-secs must be positive".to_string()));
        }
        if self.application.packet_size > MAX_PACKET_SIZE {
            return Err(ConfigError::Invalid(format!(
                "application.packet-size {} exceeds {} bytes",
                self.application.packet_size, MAX_PACKET_SIZE
            )));
        }
        if self.address.nwk_id > 0x7f {
            return Err(ConfigError::Invalid(format!("address.nwk-id {} does not fit in 7 bits", self.address.nwk_id)));
        }
        self.log_level()?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<Option<LevelFilter>, ConfigError> {
        self.simulation
            .log_level
            .as_deref()
            .map(|level| {
                level
                    .parse::<LevelFilter>()
                    .map_err(|_| ConfigError::Invalid(format!("unknown simulation.log-level '{}'", level)))
            })
            .transpose()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.simulation.duration_secs)
    }

    pub fn reply_delay(&self) -> Duration {
        Duration::from_millis(self.network.reply_delay_ms)
    }

    pub fn mac_parameters(&self) -> MacParameters {
        MacParameters {
            max_transmissions: self.mac.max_transmissions,
            receive_delay1: Duration::from_millis(self.mac.receive_delay1_ms),
            receive_delay2: Duration::from_millis(self.mac.receive_delay2_ms),
            receive_window_duration: Duration::from_millis(self.mac.receive_window_ms),
            confirmed: self.mac.confirmed,
        }
    }
}
