//! Simulation world: devices, gateways and the network server on one timeline.
//!
//! High-level flow of one uplink:
//! 1) The MAC returns a packet from `send`; the world puts it on the air.
//! 2) `TransmissionFinished` is queued first, then one `GatewayReception`
//!    per gateway in range, all at the end of the airtime. Listening devices
//!    in range start receiving immediately.
//! 3) The server schedules a receive-window opportunity; when it sends a
//!    reply the world drains the downlink and delivers it to every device
//!    within reach of the gateway.
//!
//! Events scheduled for the same tick run in the order they were queued, so
//! the MAC has opened RX1 by the time a reply for RX1 is transmitted.

use embassy_time::{Duration, Instant};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::common::{Scene, SimulationConfig};
use crate::end_device::{DeviceClass, EndDeviceMac, MacParameters};
use crate::lorawan::{AddressGenerator, DeviceAddress, Packet};
use crate::network::{GatewayEligibility, NetworkController, NetworkServer, NetworkStatus};

use super::application::PeriodicSender;
use super::event_queue::{EventId, EventQueue};
use super::signal_calculations::{LinkModel, LoraParameters, PathLossParameters};
use super::trace::{TraceEvent, TraceSink};
use super::types::{DeviceId, Event, GatewayId, Point, ReceiveWindow};

pub struct DeviceNode {
    pub mac: EndDeviceMac,
    pub position: Point,
    pub tx_power: f32,
    pub application: Option<PeriodicSender>,
}

pub struct GatewayNode {
    pub id: GatewayId,
    pub position: Point,
    pub tx_power: f32,
}

/// Counters over the whole run, fed from the trace bus.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub uplinks_sent: u64,
    pub retransmissions: u64,
    pub gateway_receptions: u64,
    pub duplicate_receptions: u64,
    pub replies_sent: u64,
    pub replies_abandoned: u64,
    pub downlinks_received: u64,
    pub confirmed_successes: u64,
    pub confirmed_failures: u64,
}

impl NetworkStats {
    fn observe(&mut self, event: &TraceEvent) {
        match event {
            TraceEvent::StartSending { retransmission: true, .. } => self.retransmissions += 1,
            TraceEvent::StartSending { .. } => self.uplinks_sent += 1,
            TraceEvent::SchedulerReceivedPacket { duplicate, .. } => {
                self.gateway_receptions += 1;
                if *duplicate {
                    self.duplicate_receptions += 1;
                }
            }
            TraceEvent::ReplySent { .. } => self.replies_sent += 1,
            TraceEvent::ReplyAbandoned { .. } => self.replies_abandoned += 1,
            TraceEvent::PacketReceived { .. } => self.downlinks_received += 1,
            TraceEvent::RequiredTransmissions { success: true, .. } => self.confirmed_successes += 1,
            TraceEvent::RequiredTransmissions { success: false, .. } => self.confirmed_failures += 1,
            _ => {}
        }
    }
}

impl fmt::Display for NetworkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "uplinks sent:          {}", self.uplinks_sent)?;
        writeln!(f, "retransmissions:       {}", self.retransmissions)?;
        writeln!(f, "gateway receptions:    {} ({} duplicates)", self.gateway_receptions, self.duplicate_receptions)?;
        writeln!(f, "replies sent:          {}", self.replies_sent)?;
        writeln!(f, "replies abandoned:     {}", self.replies_abandoned)?;
        writeln!(f, "downlinks received:    {}", self.downlinks_received)?;
        write!(
            f,
            "confirmed uplinks:     {} acknowledged, {} failed",
            self.confirmed_successes, self.confirmed_failures
        )
    }
}

pub struct Network {
    queue: EventQueue<Event>,
    devices: Vec<DeviceNode>,
    addresses: BTreeMap<DeviceAddress, DeviceId>,
    gateways: Vec<GatewayNode>,
    server: NetworkServer,
    link: LinkModel,
    trace: TraceSink,
    stats: Rc<RefCell<NetworkStats>>,
    mac_parameters: MacParameters,
    address_generator: AddressGenerator,
}

impl Network {
    /// Empty world at virtual time zero.
    pub fn new(config: &SimulationConfig, path_loss: PathLossParameters, lora: LoraParameters) -> Self {
        let queue = EventQueue::new();
        let trace = TraceSink::new();
        let stats = Rc::new(RefCell::new(NetworkStats::default()));
        let observer = stats.clone();
        trace.subscribe(move |event| observer.borrow_mut().observe(event));

        let link = LinkModel::new(path_loss, lora.clone(), config.simulation.seed);
        let mut status = NetworkStatus::new(config.network.frame_counter_width);
        status.set_lora_parameters(lora);
        let controller = NetworkController::with_default_components(link.receiving_limit());
        let server = NetworkServer::new(status, controller, config.reply_delay(), trace.clone());

        Self {
            queue,
            devices: Vec::new(),
            addresses: BTreeMap::new(),
            gateways: Vec::new(),
            server,
            link,
            trace,
            stats,
            mac_parameters: config.mac_parameters(),
            address_generator: config.address.clone(),
        }
    }

    /// Build the world described by a scene.
    pub fn from_scene(scene: &Scene, config: &SimulationConfig) -> Self {
        let mut network = Self::new(config, scene.path_loss_parameters.clone(), scene.lora_parameters.clone());

        for gateway in &scene.gateways {
            let id = network.add_gateway(gateway.position, gateway.tx_power);
            log::info!(
                "{} (scene id {}) at ({:.0}, {:.0}), downlink range ~{:.0} m",
                id,
                gateway.gateway_id,
                gateway.position.x,
                gateway.position.y,
                network.link.effective_distance(gateway.tx_power)
            );
        }
        for device in &scene.end_devices {
            let id = network.add_end_device(device.class, device.position, device.tx_power);
            if let Some(confirmed) = device.confirmed {
                network.devices[id.0].mac.set_confirmed(confirmed);
            }
            if config.application.enabled {
                network.install_periodic_sender(
                    id,
                    Duration::from_secs(config.application.period_secs),
                    config.application.packet_size,
                );
            }
            log::info!(
                "{} (scene id {}, {}) address {} at ({:.0}, {:.0}), uplink range ~{:.0} m",
                id,
                device.device_id,
                device.class,
                network.devices[id.0].mac.address(),
                device.position.x,
                device.position.y,
                network.link.effective_distance(device.tx_power)
            );
        }
        network
    }

    pub fn add_gateway(&mut self, position: Point, tx_power: f32) -> GatewayId {
        let id = GatewayId(self.gateways.len());
        self.gateways.push(GatewayNode { id, position, tx_power });
        self.server.register_gateway(id);
        id
    }

    /// Create a device, register it with the server and start its MAC.
    pub fn add_end_device(&mut self, class: DeviceClass, position: Point, tx_power: f32) -> DeviceId {
        let id = DeviceId(self.devices.len());
        let address = self.address_generator.next_address();
        let mut mac = EndDeviceMac::new(id, address, class, self.mac_parameters.clone(), self.trace.clone());
        mac.start(&mut self.queue);
        self.server.register_device(address, id, class);
        self.addresses.insert(address, id);
        self.devices.push(DeviceNode {
            mac,
            position,
            tx_power,
            application: None,
        });
        id
    }

    pub fn install_periodic_sender(&mut self, device: DeviceId, period: Duration, packet_size: usize) {
        let application = PeriodicSender::new(period, packet_size);
        let offset = application.initial_delay(self.link.rng());
        self.devices[device.0].application = Some(application);
        self.queue.schedule(offset, Event::ApplicationTick { device });
    }

    /// One-off send request at an absolute virtual time.
    pub fn schedule_send(&mut self, device: DeviceId, at: Instant, payload: Vec<u8>) -> EventId {
        self.queue.schedule_at(at, Event::ApplicationSend { device, payload })
    }

    pub fn set_gateway_eligibility<G>(&mut self, eligibility: G)
    where
        G: GatewayEligibility + 'static,
    {
        self.server.status_mut().set_eligibility(eligibility);
    }

    pub fn cancel_receive_window_opportunity(&mut self, address: DeviceAddress) -> bool {
        self.server.cancel_receive_window_opportunity(address, &mut self.queue)
    }

    pub fn schedule_receive_window_opportunity(&mut self, address: DeviceAddress, window: ReceiveWindow, delay: Duration) -> EventId {
        self.server
            .schedule_receive_window_opportunity(address, window, delay, &mut self.queue)
    }

    pub fn now(&self) -> Instant {
        self.queue.now()
    }

    pub fn trace(&self) -> &TraceSink {
        &self.trace
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats.borrow().clone()
    }

    pub fn server(&self) -> &NetworkServer {
        &self.server
    }

    pub fn device(&self, id: DeviceId) -> Option<&DeviceNode> {
        self.devices.get(id.0)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut DeviceNode> {
        self.devices.get_mut(id.0)
    }

    pub fn devices(&self) -> &[DeviceNode] {
        &self.devices
    }

    pub fn gateways(&self) -> &[GatewayNode] {
        &self.gateways
    }

    /// Process every event due strictly before `stop`, then move the clock to `stop`.
    pub fn run_until(&mut self, stop: Instant) {
        while let Some((_, event)) = self.queue.pop_until(stop) {
            self.handle(event);
        }
        self.queue.advance_to(stop);
    }

    pub fn run_for(&mut self, duration: Duration) {
        let stop = self.queue.now() + duration;
        self.run_until(stop);
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::ApplicationTick { device } => {
                let node = &mut self.devices[device.0];
                let Some(application) = node.application.as_mut() else {
                    log::warn!("{}: application tick without an application", device);
                    return;
                };
                let payload = application.next_payload();
                let period = application.period();
                self.queue.schedule(period, Event::ApplicationTick { device });
                let packet = node.mac.send(payload, &mut self.queue);
                self.transmit_uplink(device, packet);
            }
            Event::ApplicationSend { device, payload } => {
                let packet = self.devices[device.0].mac.send(payload, &mut self.queue);
                self.transmit_uplink(device, packet);
            }
            Event::TransmissionFinished { device } => self.devices[device.0].mac.transmission_finished(&mut self.queue),
            Event::OpenFirstWindow { device } => self.devices[device.0].mac.open_first_window(&mut self.queue),
            Event::CloseFirstWindow { device } => self.devices[device.0].mac.close_first_window(),
            Event::OpenSecondWindow { device } => self.devices[device.0].mac.open_second_window(&mut self.queue),
            Event::CloseSecondWindow { device } => {
                let packet = self.devices[device.0].mac.close_second_window(&mut self.queue);
                self.transmit_uplink(device, packet);
            }
            Event::OpenContinuousWindow { device } => self.devices[device.0].mac.continuous_window_tick(&mut self.queue),
            Event::ReceptionStarted { device, packet, airtime } => {
                if self.devices[device.0].mac.start_reception() {
                    self.queue.schedule(airtime, Event::ReceptionFinished { device, packet });
                }
            }
            Event::ReceptionFinished { device, packet } => {
                let packet = self.devices[device.0].mac.receive(packet, &mut self.queue);
                self.transmit_uplink(device, packet);
            }
            Event::GatewayReception { gateway, packet, rssi } => {
                self.server.receive(packet, gateway, rssi, &mut self.queue);
            }
            Event::ReceiveWindowOpportunity { address, window, .. } => {
                self.server.on_receive_window_opportunity(address, window, &mut self.queue);
                self.transmit_downlinks();
            }
        }
    }

    fn transmit_uplink(&mut self, sender: DeviceId, packet: Option<Packet>) {
        let Some(packet) = packet else {
            return;
        };
        let airtime = self.link.airtime(packet.len());
        let (position, tx_power) = {
            let node = &self.devices[sender.0];
            (node.position, node.tx_power)
        };
        log::debug!("{}: uplink of {} bytes on air for {} ms", sender, packet.len(), airtime.as_millis());

        // Queued before any reception so the MAC arms its windows first
        self.queue.schedule(airtime, Event::TransmissionFinished { device: sender });

        for gateway in &self.gateways {
            if let Some(rssi) = self.link.reaches(position.distance_to(&gateway.position), tx_power) {
                self.queue.schedule(
                    airtime,
                    Event::GatewayReception {
                        gateway: gateway.id,
                        packet: packet.clone(),
                        rssi,
                    },
                );
            }
        }
        for (index, node) in self.devices.iter().enumerate() {
            if index == sender.0 {
                continue;
            }
            if self.link.reaches(position.distance_to(&node.position), tx_power).is_some() {
                self.queue.schedule(
                    Duration::from_ticks(0),
                    Event::ReceptionStarted {
                        device: DeviceId(index),
                        packet: packet.clone(),
                        airtime,
                    },
                );
            }
        }
    }

    fn transmit_downlinks(&mut self) {
        for downlink in self.server.take_downlinks() {
            let Some(gateway) = self.gateways.get(downlink.gateway.0) else {
                log::warn!("downlink through unknown {}", downlink.gateway);
                continue;
            };
            let airtime = self.link.airtime(downlink.packet.len());
            let mut delivered = false;
            for (index, node) in self.devices.iter().enumerate() {
                if self.link.reaches(gateway.position.distance_to(&node.position), gateway.tx_power).is_none() {
                    continue;
                }
                delivered |= self.addresses.get(&downlink.address) == Some(&DeviceId(index));
                self.queue.schedule(
                    Duration::from_ticks(0),
                    Event::ReceptionStarted {
                        device: DeviceId(index),
                        packet: downlink.packet.clone(),
                        airtime,
                    },
                );
            }
            if !delivered {
                log::debug!("{}: downlink from {} lost on the way", downlink.address, gateway.id);
            }
        }
    }
}
