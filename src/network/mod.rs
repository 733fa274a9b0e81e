//! Network server side of the simulation.
//!
//! ## Module Organization
//!
//! - `status`: device and gateway registry, duplicate detection, reply buffers
//! - `scheduler`: receive-window opportunities and gateway fallback
//! - `controller`: pluggable reply policies (acks, link checks)
//! - `server`: the entry point the simulated gateways deliver uplinks to

pub mod controller;
pub mod scheduler;
pub mod server;
pub mod status;

pub use controller::{ConfirmedMessagesComponent, ControllerComponent, LinkCheckComponent, NetworkController};
pub use scheduler::{NetworkScheduler, OpportunityOutcome, SchedulingOutcome};
pub use server::NetworkServer;
pub use status::{
    Downlink, DutyCycleEligibility, EndDeviceStatus, FrameCounterWidth, GatewayEligibility, GatewayStatus, NetworkStatus, Reply,
};
