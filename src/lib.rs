//! LoRaWAN end-device MAC and network-server reply scheduling on a
//! discrete-event timeline.
//!
//! - `lorawan`: frame and MAC command codec, device addressing
//! - `end_device`: Class A and Class C MAC with confirmed-uplink retries
//! - `network`: device registry, reply scheduler and network controller
//! - `simulation`: event queue, trace bus, radio model and the world
//! - `common`: scene and configuration loading
//! - `time_driver`: virtual clock behind `embassy_time::Instant::now()`

pub mod common;
pub mod end_device;
pub mod lorawan;
pub mod network;
pub mod simulation;
pub mod time_driver;
