//! Input files shared by the binary and the scenario harness.
//!
//! - `scene`: JSON scene (radio parameters, gateways, end devices)
//! - `config`: TOML simulation configuration

pub mod config;
pub mod scene;

pub use config::{ConfigError, SimulationConfig};
pub use scene::{EndDeviceConfig, GatewayConfig, Scene, SceneLoadError, load_scene};
