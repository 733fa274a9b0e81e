//! Network-side registry of end devices and gateways.
//!
//! Keeps, per device, the last uplink with every gateway that heard it, the
//! reply being prepared and the downlink frame counter. Per gateway it keeps
//! the duty-cycle state of the RX1 and RX2 sub-bands.

use embassy_time::{Duration, Instant};
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::end_device::DeviceClass;
use crate::lorawan::{DeviceAddress, Frame, FrameError, FrameHeader, MacCommand, MacHeader, MessageType, Packet};
use crate::simulation::signal_calculations::{LoraParameters, calculate_air_time};
use crate::simulation::types::{DeviceId, GatewayId, ReceiveWindow};

/// Bits of the frame counter compared when looking for duplicate uplinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameCounterWidth {
    /// Only the least significant byte; counters 256 apart collide.
    LowByte,
    #[default]
    Full,
}

impl FrameCounterWidth {
    pub fn same_frame(self, a: u16, b: u16) -> bool {
        match self {
            FrameCounterWidth::LowByte => a as u8 == b as u8,
            FrameCounterWidth::Full => a == b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewayReception {
    pub gateway: GatewayId,
    pub rssi: f32,
    pub received_at: Instant,
}

/// Last uplink stored for a device.
#[derive(Debug, Clone)]
pub struct ReceivedPacketInfo {
    pub packet: Packet,
    pub frame: Frame,
    /// Every gateway that reported this uplink, in arrival order.
    pub receptions: Vec<GatewayReception>,
}

impl ReceivedPacketInfo {
    pub fn best_rssi(&self) -> Option<f32> {
        self.receptions.iter().map(|r| r.rssi).reduce(f32::max)
    }
}

/// Reply being prepared for a device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub needs_reply: bool,
    /// Set the ACK bit on the downlink.
    pub ack: bool,
    pub commands: Vec<MacCommand>,
    pub payload: Vec<u8>,
}

impl Reply {
    pub fn needs(&self) -> bool {
        self.needs_reply || self.ack || !self.commands.is_empty() || !self.payload.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct EndDeviceStatus {
    pub address: DeviceAddress,
    pub device: DeviceId,
    pub class: DeviceClass,
    pub last_packet: Option<ReceivedPacketInfo>,
    pub reply: Reply,
    downlink_counter: u16,
}

impl EndDeviceStatus {
    fn new(address: DeviceAddress, device: DeviceId, class: DeviceClass) -> Self {
        Self {
            address,
            device,
            class,
            last_packet: None,
            reply: Reply::default(),
            downlink_counter: 0,
        }
    }

    pub fn last_frame_counter(&self) -> Option<u16> {
        self.last_packet.as_ref().map(|info| info.frame.frame_header.frame_counter)
    }

    pub fn downlink_counter(&self) -> u16 {
        self.downlink_counter
    }

    pub fn initialize_reply(&mut self) {
        self.reply = Reply::default();
    }
}

/// Duty-cycle bookkeeping of one gateway.
#[derive(Debug, Clone)]
pub struct GatewayStatus {
    pub id: GatewayId,
    // Indexed by window number - 1
    next_available: [Instant; 2],
}

impl GatewayStatus {
    /// RX1 replies share the uplink sub-band (1%), RX2 uses the 10% sub-band.
    pub fn duty_cycle(window: ReceiveWindow) -> f64 {
        match window {
            ReceiveWindow::First => 0.01,
            ReceiveWindow::Second => 0.1,
        }
    }

    fn new(id: GatewayId) -> Self {
        Self {
            id,
            next_available: [Instant::from_ticks(0); 2],
        }
    }

    pub fn is_available(&self, window: ReceiveWindow, now: Instant) -> bool {
        now >= self.next_available[window.number() as usize - 1]
    }

    pub fn next_available(&self, window: ReceiveWindow) -> Instant {
        self.next_available[window.number() as usize - 1]
    }

    /// Account for a transmission: the sub-band stays closed for `airtime / duty_cycle`.
    pub fn charge(&mut self, window: ReceiveWindow, airtime: Duration, now: Instant) {
        let blocked = Duration::from_ticks((airtime.as_ticks() as f64 / Self::duty_cycle(window)).ceil() as u64);
        self.next_available[window.number() as usize - 1] = now + blocked;
    }
}

/// Decides whether a gateway may carry a reply in a given window.
pub trait GatewayEligibility {
    fn is_eligible(&self, gateway: &GatewayStatus, window: ReceiveWindow, now: Instant) -> bool;
}

/// Default rule: the window's sub-band must be out of its duty-cycle off time.
#[derive(Debug, Clone, Copy, Default)]
pub struct DutyCycleEligibility;

impl GatewayEligibility for DutyCycleEligibility {
    fn is_eligible(&self, gateway: &GatewayStatus, window: ReceiveWindow, now: Instant) -> bool {
        gateway.is_available(window, now)
    }
}

impl<F> GatewayEligibility for F
where
    F: Fn(&GatewayStatus, ReceiveWindow, Instant) -> bool,
{
    fn is_eligible(&self, gateway: &GatewayStatus, window: ReceiveWindow, now: Instant) -> bool {
        self(gateway, window, now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkRecord {
    Stored,
    /// Same frame counter as the stored uplink; only the gateway was added.
    Duplicate,
}

/// A reply handed to the transport.
#[derive(Debug, Clone)]
pub struct Downlink {
    pub gateway: GatewayId,
    pub address: DeviceAddress,
    pub window: ReceiveWindow,
    pub packet: Packet,
}

pub struct NetworkStatus {
    devices: BTreeMap<DeviceAddress, EndDeviceStatus>,
    gateways: BTreeMap<GatewayId, GatewayStatus>,
    eligibility: Box<dyn GatewayEligibility>,
    counter_width: FrameCounterWidth,
    // Used to charge gateway duty cycles
    lora: LoraParameters,
    outbox: Vec<Downlink>,
}

impl NetworkStatus {
    pub fn new(counter_width: FrameCounterWidth) -> Self {
        Self {
            devices: BTreeMap::new(),
            gateways: BTreeMap::new(),
            eligibility: Box::new(DutyCycleEligibility),
            counter_width,
            lora: LoraParameters::default(),
            outbox: Vec::new(),
        }
    }

    pub fn set_lora_parameters(&mut self, lora: LoraParameters) {
        self.lora = lora;
    }

    pub fn set_eligibility<G>(&mut self, eligibility: G)
    where
        G: GatewayEligibility + 'static,
    {
        self.eligibility = Box::new(eligibility);
    }

    pub fn counter_width(&self) -> FrameCounterWidth {
        self.counter_width
    }

    /// Create the record on first call; later calls only refresh the device link.
    pub fn register_or_update(&mut self, address: DeviceAddress, device: DeviceId, class: DeviceClass) {
        self.devices
            .entry(address)
            .and_modify(|status| {
                status.device = device;
                status.class = class;
            })
            .or_insert_with(|| EndDeviceStatus::new(address, device, class));
    }

    pub fn register_gateway(&mut self, id: GatewayId) {
        self.gateways.entry(id).or_insert_with(|| GatewayStatus::new(id));
    }

    pub fn device(&self, address: DeviceAddress) -> Option<&EndDeviceStatus> {
        self.devices.get(&address)
    }

    pub fn device_mut(&mut self, address: DeviceAddress) -> Option<&mut EndDeviceStatus> {
        self.devices.get_mut(&address)
    }

    pub(crate) fn registered(&self, address: DeviceAddress) -> &EndDeviceStatus {
        self.devices.get(&address).unwrap_or_else(|| unregistered(address))
    }

    pub(crate) fn registered_mut(&mut self, address: DeviceAddress) -> &mut EndDeviceStatus {
        self.devices.get_mut(&address).unwrap_or_else(|| unregistered(address))
    }

    pub fn gateway(&self, id: GatewayId) -> Option<&GatewayStatus> {
        self.gateways.get(&id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &EndDeviceStatus> {
        self.devices.values()
    }

    /// Whether `frame_counter` matches the last stored uplink of the device.
    pub fn is_duplicate(&self, address: DeviceAddress, frame_counter: u16) -> bool {
        self.registered(address)
            .last_frame_counter()
            .is_some_and(|stored| self.counter_width.same_frame(stored, frame_counter))
    }

    pub fn record_uplink(&mut self, packet: Packet, frame: Frame, gateway: GatewayId, rssi: f32) -> UplinkRecord {
        let counter_width = self.counter_width;
        let address = frame.frame_header.address;
        let reception = GatewayReception {
            gateway,
            rssi,
            received_at: Instant::now(),
        };
        let status = self.registered_mut(address);

        if let Some(info) = status.last_packet.as_mut() {
            if counter_width.same_frame(info.frame.frame_header.frame_counter, frame.frame_header.frame_counter) {
                if !info.receptions.iter().any(|r| r.gateway == gateway) {
                    info.receptions.push(reception);
                }
                return UplinkRecord::Duplicate;
            }
        }
        status.last_packet = Some(ReceivedPacketInfo {
            packet,
            frame,
            receptions: vec![reception],
        });
        UplinkRecord::Stored
    }

    /// Strongest eligible gateway among those that heard the last uplink.
    pub fn best_gateway(&self, address: DeviceAddress, window: ReceiveWindow) -> Option<GatewayId> {
        let now = Instant::now();
        let info = self.registered(address).last_packet.as_ref()?;
        let mut candidates: Vec<&GatewayReception> = info.receptions.iter().collect();
        candidates.sort_by(|a, b| b.rssi.total_cmp(&a.rssi));
        candidates
            .into_iter()
            .filter_map(|reception| self.gateways.get(&reception.gateway))
            .find(|gateway| self.eligibility.is_eligible(gateway, window, now))
            .map(|gateway| gateway.id)
    }

    pub fn needs_reply(&self, address: DeviceAddress) -> bool {
        self.registered(address).reply.needs()
    }

    pub fn set_pending_reply(&mut self, address: DeviceAddress, reply: Reply) {
        self.registered_mut(address).reply = reply;
    }

    pub fn clear_pending_reply(&mut self, address: DeviceAddress) {
        self.registered_mut(address).initialize_reply();
    }

    /// Encode the pending reply as an unconfirmed downlink and advance the
    /// device's downlink frame counter.
    pub fn reply_for_device(&mut self, address: DeviceAddress, window: ReceiveWindow) -> Result<Packet, FrameError> {
        let status = self.registered_mut(address);
        let mut header = FrameHeader::downlink(address);
        header.ack = status.reply.ack;
        header.frame_counter = status.downlink_counter;
        header.commands = status.reply.commands.clone();
        let frame = Frame::new(MacHeader::new(MessageType::UnconfirmedDataDown), header, status.reply.payload.clone());
        let bytes = frame.encode()?;
        status.downlink_counter = status.downlink_counter.wrapping_add(1);
        log::debug!("reply for {} in {}: {} bytes, fcnt {}", address, window, bytes.len(), frame.frame_header.frame_counter);
        Ok(Packet::new(bytes))
    }

    /// Hand a downlink to the transport and charge the gateway's duty cycle.
    pub fn send_through_gateway(&mut self, packet: Packet, gateway: GatewayId, address: DeviceAddress, window: ReceiveWindow) {
        let airtime = calculate_air_time(&self.lora, packet.len());
        match self.gateways.get_mut(&gateway) {
            Some(status) => status.charge(window, airtime, Instant::now()),
            None => log::warn!("sending through unregistered gateway {}", gateway),
        }
        self.outbox.push(Downlink {
            gateway,
            address,
            window,
            packet,
        });
    }

    pub fn take_downlinks(&mut self) -> Vec<Downlink> {
        std::mem::take(&mut self.outbox)
    }
}

fn unregistered(address: DeviceAddress) -> ! {
    panic!("device {} is not registered with the network server", address)
}
