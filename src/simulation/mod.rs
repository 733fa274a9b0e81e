//! Discrete-event simulation core.
//!
//! This module provides the infrastructure the MAC and the network server run
//! on. It integrates:
//! - A deterministic event queue driving a virtual clock
//! - The trace bus every component reports through
//! - Radio reachability and airtime calculations
//! - The world that wires devices, gateways and the server together
//!
//! ## Module Organization
//!
//! - `types`: Identifiers, coordinates and the `Event` enum
//! - `event_queue`: Ordered timeline with cancellable event handles
//! - `trace`: Observable simulation events and their subscribers
//! - `signal_calculations`: Path loss, link budget and LoRa airtime
//! - `application`: Periodic traffic generator installed on devices
//! - `network`: The simulated world and its event loop

pub mod application;
pub mod event_queue;
pub mod network;
pub mod signal_calculations;
pub mod trace;
pub mod types;


pub use event_queue::{EventId, EventQueue};
pub use network::{Network, NetworkStats};
pub use trace::{TraceEvent, TraceLog, TraceSink};
pub use types::{DeviceId, Event, GatewayId, Point, ReceiveWindow};
