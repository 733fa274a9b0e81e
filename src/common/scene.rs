//! Scene loading, parsing, and validation logic.
//!
//! A scene is the JSON description of the physical layout: channel and
//! modulation parameters, gateway positions and the end devices with their
//! class and transmit power.

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use thiserror::Error;

use crate::end_device::DeviceClass;
use crate::simulation::signal_calculations::{LoraParameters, PathLossParameters};
use crate::simulation::types::Point;

/// Error type for scene loading failures.
#[derive(Debug, Error)]
pub enum SceneLoadError {
    #[error("Failed to read file: {0}")]
    FileReadError(String),
    #[error("Failed to parse JSON: {0}")]
    ParseError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    pub gateway_id: u32,
    pub position: Point,
    /// Downlink transmit power in dBm.
    #[serde(default = "default_tx_power")]
    pub tx_power: f32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EndDeviceConfig {
    pub device_id: u32,
    #[serde(default)]
    pub class: DeviceClass,
    pub position: Point,
    /// Transmit power in dBm.
    #[serde(default = "default_tx_power")]
    pub tx_power: f32,
    /// Overrides the configured message type for this device.
    #[serde(default)]
    pub confirmed: Option<bool>,
}

fn default_tx_power() -> f32 {
    14.0
}

/// Root structure representing the entire scene.
#[derive(Debug, Deserialize, Clone)]
pub struct Scene {
    #[serde(default)]
    pub path_loss_parameters: PathLossParameters,
    #[serde(default)]
    pub lora_parameters: LoraParameters,
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,
    pub end_devices: Vec<EndDeviceConfig>,
}

/// Load, parse and validate a scene file.
pub fn load_scene(path: &str) -> Result<Scene, SceneLoadError> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path))
        .map_err(|e| SceneLoadError::FileReadError(e.to_string()))?;
    parse_scene(&data)
}

pub fn parse_scene(data: &str) -> Result<Scene, SceneLoadError> {
    let scene: Scene = serde_json::from_str(data)
        .context("Invalid JSON format")
        .map_err(|e| SceneLoadError::ParseError(format!("{:#}", e)))?;

    validate_scene(&scene).map_err(SceneLoadError::ValidationError)?;
    Ok(scene)
}

/// Check the scene for values the simulation cannot work with.
pub fn validate_scene(scene: &Scene) -> Result<(), String> {
    const MAX_WORLD_COORD: f64 = 100_000.0;
    const MAX_DEVICES: usize = 10_000;
    const MIN_TX_POWER: f32 = -10.0;
    const MAX_TX_POWER: f32 = 30.0;

    if scene.end_devices.is_empty() {
        return Err("Scene must contain at least one end device".to_string());
    }
    if scene.end_devices.len() > MAX_DEVICES {
        return Err(format!("End device count {} exceeds maximum of {}", scene.end_devices.len(), MAX_DEVICES));
    }

    let mut device_ids = HashSet::new();
    for device in &scene.end_devices {
        if !device_ids.insert(device.device_id) {
            return Err(format!("Duplicate device_id found: {}", device.device_id));
        }
        if device.position.x.abs() > MAX_WORLD_COORD || device.position.y.abs() > MAX_WORLD_COORD {
            return Err(format!(
                "End device {} position ({}, {}) exceeds world bounds (+/-{})",
                device.device_id, device.position.x, device.position.y, MAX_WORLD_COORD
            ));
        }
        if device.tx_power < MIN_TX_POWER || device.tx_power > MAX_TX_POWER {
            return Err(format!(
                "End device {} tx_power {} dBm outside realistic range ({} to {} dBm)",
                device.device_id, device.tx_power, MIN_TX_POWER, MAX_TX_POWER
            ));
        }
    }

    let mut gateway_ids = HashSet::new();
    for gateway in &scene.gateways {
        if !gateway_ids.insert(gateway.gateway_id) {
            return Err(format!("Duplicate gateway_id found: {}", gateway.gateway_id));
        }
        if gateway.position.x.abs() > MAX_WORLD_COORD || gateway.position.y.abs() > MAX_WORLD_COORD {
            return Err(format!(
                "Gateway {} position ({}, {}) exceeds world bounds (+/-{})",
                gateway.gateway_id, gateway.position.x, gateway.position.y, MAX_WORLD_COORD
            ));
        }
    }

    let lora = &scene.lora_parameters;
    if lora.spreading_factor < 5 || lora.spreading_factor > 12 {
        return Err(format!("Invalid spreading_factor {}, must be 5-12", lora.spreading_factor));
    }
    if lora.bandwidth == 0 {
        return Err("Invalid bandwidth, must be positive".to_string());
    }
    if lora.coding_rate < 1 || lora.coding_rate > 4 {
        return Err(format!("Invalid coding_rate {}, must be 1-4 (representing 4/5 to 4/8)", lora.coding_rate));
    }
    if lora.preamble_symbols < 0.0 {
        return Err("Invalid preamble_symbols, must be non-negative".to_string());
    }

    let path_loss = &scene.path_loss_parameters;
    if path_loss.path_loss_exponent <= 0.0 {
        return Err("Invalid path_loss_exponent, must be positive".to_string());
    }
    if path_loss.shadowing_sigma < 0.0 {
        return Err("Invalid shadowing_sigma, must be non-negative".to_string());
    }

    Ok(())
}
