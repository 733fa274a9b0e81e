//! Type definitions shared across the simulation.
//!
//! Contains:
//! - Node identifiers for end devices and gateways
//! - Receive window numbering
//! - World coordinates
//! - The `Event` enum driving the discrete-event loop

use embassy_time::Duration;
use serde::Deserialize;
use std::fmt;

use crate::lorawan::{DeviceAddress, Packet};

/// Index of an end device inside the simulated world.
///
/// This is the non-owning reference the network server keeps to a device's
/// MAC; it never outlives the world that handed it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub usize);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ed{}", self.0)
    }
}

/// Address of a gateway as seen by the network server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GatewayId(pub usize);

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gw{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiveWindow {
    First,
    Second,
}

impl ReceiveWindow {
    pub fn number(self) -> u8 {
        match self {
            ReceiveWindow::First => 1,
            ReceiveWindow::Second => 2,
        }
    }
}

impl fmt::Display for ReceiveWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RX{}", self.number())
    }
}

/// Simple 2D point in meters.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Everything that can happen on the simulated timeline.
#[derive(Debug, Clone)]
pub enum Event {
    /// Periodic application wants to send its next payload.
    ApplicationTick { device: DeviceId },
    /// One-off application send request.
    ApplicationSend { device: DeviceId, payload: Vec<u8> },
    TransmissionFinished { device: DeviceId },
    OpenFirstWindow { device: DeviceId },
    CloseFirstWindow { device: DeviceId },
    OpenSecondWindow { device: DeviceId },
    CloseSecondWindow { device: DeviceId },
    /// Class C idle listening chain.
    OpenContinuousWindow { device: DeviceId },
    /// A frame's preamble reaches a device.
    ReceptionStarted {
        device: DeviceId,
        packet: Packet,
        airtime: Duration,
    },
    ReceptionFinished { device: DeviceId, packet: Packet },
    /// An uplink finished arriving at a gateway.
    GatewayReception {
        gateway: GatewayId,
        packet: Packet,
        rssi: f32,
    },
    /// Network scheduler evaluates a reply opportunity.
    ReceiveWindowOpportunity {
        address: DeviceAddress,
        window: ReceiveWindow,
        device: DeviceId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_euclidean() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(300.0, 400.0);
        assert_eq!(a.distance_to(&b), 500.0);
        assert_eq!(b.distance_to(&a), 500.0);
    }

    #[test]
    fn identifiers_render_compactly() {
        assert_eq!(DeviceId(3).to_string(), "ed3");
        assert_eq!(GatewayId(0).to_string(), "gw0");
        assert_eq!(ReceiveWindow::Second.to_string(), "RX2");
    }
}
