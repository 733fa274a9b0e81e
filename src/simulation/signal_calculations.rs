//! Radio link model.
//!
//! Contains helpers for:
//! - Log-distance path loss with seeded log-normal shadowing
//! - LoRa airtime (SX127x symbol formula)
//! - Demodulation floor (noise floor plus per-SF SNR limit)
//! - Effective range estimate for a given transmit power
//!
//! Units:
//! - Power: dBm
//! - Time: seconds (f64) inside the formulas, embassy `Duration` at the API
//! - Distance: meters

use embassy_time::Duration;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;

/// Parameters defining the radio channel propagation model.
///
/// Log-distance path loss with log-normal shadowing:
/// `PL(d) = PL(d0) + 10 * n * log10(d / d0) + X_sigma` with `d0 = 1 m`.
#[derive(Debug, Deserialize, Clone)]
pub struct PathLossParameters {
    /// Path loss exponent (n). 2.0 is free space, 2.7 to 3.5 is typical for urban areas.
    pub path_loss_exponent: f32,

    /// Standard deviation of the shadowing term in dB. 0.0 disables shadowing.
    pub shadowing_sigma: f32,

    /// Path loss at 1 meter in dB.
    pub path_loss_at_reference_distance: f32,

    /// Receiver thermal noise floor in dBm.
    pub noise_floor: f32,
}

impl Default for PathLossParameters {
    fn default() -> Self {
        Self {
            path_loss_exponent: 3.76,
            shadowing_sigma: 0.0,
            path_loss_at_reference_distance: 7.7,
            noise_floor: -123.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoraParameters {
    pub bandwidth: u32,
    pub spreading_factor: u8,
    /// 1..=4, meaning 4/5..4/8.
    pub coding_rate: u32,
    pub preamble_symbols: f32,
    pub crc_enabled: bool,
    // Low Data Rate Optimization (DE); usually on when T_sym >= 16 ms
    pub low_data_rate_optimization: bool,
}

impl Default for LoraParameters {
    fn default() -> Self {
        Self {
            bandwidth: 125_000,
            spreading_factor: 7,
            coding_rate: 1,
            preamble_symbols: 8.0,
            crc_enabled: true,
            low_data_rate_optimization: false,
        }
    }
}

/// Sample the path loss (dB) at `distance` meters.
///
/// Distances under the 1 m reference return the reference loss. Each call
/// draws a fresh shadowing value from `rng`.
pub fn calculate_path_loss<R: rand::Rng + ?Sized>(distance: f32, params: &PathLossParameters, rng: &mut R) -> f32 {
    if distance < 1.0 {
        return params.path_loss_at_reference_distance;
    }
    let path_loss = params.path_loss_at_reference_distance + 10.0 * params.path_loss_exponent * distance.log10();
    let shadowing = match Normal::new(0.0_f32, params.shadowing_sigma) {
        Ok(normal) if params.shadowing_sigma > 0.0 => normal.sample(rng),
        _ => 0.0,
    };
    path_loss + shadowing
}

/// Received power (dBm) for one transmission: `P_tx - PL(d)`.
pub fn calculate_rssi<R: rand::Rng + ?Sized>(distance: f32, tx_power_dbm: f32, params: &PathLossParameters, rng: &mut R) -> f32 {
    tx_power_dbm - calculate_path_loss(distance, params, rng)
}

pub fn calculate_snr_limit(lora_parameters: &LoraParameters) -> f32 {
    match lora_parameters.spreading_factor {
        5 => -2.5,
        6 => -5.0,
        7 => -7.5,
        8 => -10.0,
        9 => -12.5,
        10 => -15.0,
        11 => -17.5,
        _ => -20.0,
    }
}

/// Weakest signal (dBm) a receiver still demodulates.
pub fn calculate_receiving_limit(lora_parameters: &LoraParameters, path_loss_parameters: &PathLossParameters) -> f32 {
    path_loss_parameters.noise_floor + calculate_snr_limit(lora_parameters)
}

/// Distance at which the mean received power meets the receiving limit.
///
/// Shadowing is not sampled, so the estimate is stable across calls.
pub fn calculate_effective_distance(tx_power_dbm: f32, lora_parameters: &LoraParameters, path_loss_parameters: &PathLossParameters) -> f32 {
    // P_tx - (PL0 + 10n log10 d) = RL  =>  d = 10^((P_tx - RL - PL0) / (10n))
    let pl0 = path_loss_parameters.path_loss_at_reference_distance;
    let rl = calculate_receiving_limit(lora_parameters, path_loss_parameters);
    let numerator = tx_power_dbm - rl - pl0;
    if numerator <= 0.0 {
        return 0.0;
    }
    10.0_f32.powf(numerator / (10.0 * path_loss_parameters.path_loss_exponent))
}

/// Time on air of a frame of `payload_size` bytes.
pub fn calculate_air_time(lora_parameters: &LoraParameters, payload_size: usize) -> Duration {
    // T_sym = 2^SF / BW
    let symbol_time = 2.0_f64.powi(lora_parameters.spreading_factor as i32) / lora_parameters.bandwidth as f64;
    let preamble_time = (lora_parameters.preamble_symbols as f64 + 4.25) * symbol_time;

    // N_payload = 8 + max(ceil((8PL - 4SF + 28 + 16CRC - 20IH) / (4(SF - 2DE))) * (CR + 4), 0), explicit header
    let sf = lora_parameters.spreading_factor as f64;
    let crc = if lora_parameters.crc_enabled { 1.0 } else { 0.0 };
    let de = if lora_parameters.low_data_rate_optimization { 1.0 } else { 0.0 };
    let numerator = 8.0 * payload_size as f64 - 4.0 * sf + 28.0 + 16.0 * crc;
    let base = (numerator / (4.0 * (sf - 2.0 * de))).ceil();
    let payload_symbols = 8.0 + (base * (lora_parameters.coding_rate as f64 + 4.0)).max(0.0);

    Duration::from_micros(((preamble_time + payload_symbols * symbol_time) * 1_000_000.0).round() as u64)
}

/// Channel shared by every transmitter in a simulation.
///
/// Owns the seeded RNG, so a scene replayed with the same seed samples the
/// same shadowing values.
pub struct LinkModel {
    path_loss: PathLossParameters,
    lora: LoraParameters,
    rng: StdRng,
}

impl LinkModel {
    pub fn new(path_loss: PathLossParameters, lora: LoraParameters, seed: u64) -> Self {
        Self {
            path_loss,
            lora,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn lora(&self) -> &LoraParameters {
        &self.lora
    }

    pub fn airtime(&self, payload_size: usize) -> Duration {
        calculate_air_time(&self.lora, payload_size)
    }

    pub fn receiving_limit(&self) -> f32 {
        calculate_receiving_limit(&self.lora, &self.path_loss)
    }

    pub fn effective_distance(&self, tx_power_dbm: f32) -> f32 {
        calculate_effective_distance(tx_power_dbm, &self.lora, &self.path_loss)
    }

    /// Sample one link. Returns the RSSI when the receiver can demodulate it.
    pub fn reaches(&mut self, distance: f64, tx_power_dbm: f32) -> Option<f32> {
        let rssi = calculate_rssi(distance as f32, tx_power_dbm, &self.path_loss, &mut self.rng);
        (rssi >= self.receiving_limit()).then_some(rssi)
    }

    /// The simulation RNG, shared with the application layer.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}
