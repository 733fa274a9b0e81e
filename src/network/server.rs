use embassy_time::Duration;

use crate::end_device::DeviceClass;
use crate::lorawan::{DeviceAddress, Direction, Packet};
use crate::simulation::event_queue::{EventId, EventQueue};
use crate::simulation::trace::{TraceEvent, TraceSink};
use crate::simulation::types::{DeviceId, Event, GatewayId, ReceiveWindow};

use super::controller::NetworkController;
use super::scheduler::{NetworkScheduler, OpportunityOutcome, SchedulingOutcome};
use super::status::{Downlink, NetworkStatus, UplinkRecord};

/// Network server: registry, scheduler and controller behind one entry point.
pub struct NetworkServer {
    status: NetworkStatus,
    scheduler: NetworkScheduler,
    controller: NetworkController,
    trace: TraceSink,
}

impl NetworkServer {
    pub fn new(status: NetworkStatus, controller: NetworkController, reply_delay: Duration, trace: TraceSink) -> Self {
        Self {
            status,
            scheduler: NetworkScheduler::new(reply_delay, trace.clone()),
            controller,
            trace,
        }
    }

    pub fn status(&self) -> &NetworkStatus {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut NetworkStatus {
        &mut self.status
    }

    pub fn controller_mut(&mut self) -> &mut NetworkController {
        &mut self.controller
    }

    pub fn register_device(&mut self, address: DeviceAddress, device: DeviceId, class: DeviceClass) {
        self.status.register_or_update(address, device, class);
    }

    pub fn register_gateway(&mut self, gateway: GatewayId) {
        self.status.register_gateway(gateway);
    }

    /// An uplink reported by `gateway`.
    ///
    /// Malformed frames are logged and dropped. Otherwise the scheduler looks
    /// at the frame before it is recorded, so a second report of the same
    /// uplink is recognised as a duplicate.
    pub fn receive(&mut self, packet: Packet, gateway: GatewayId, rssi: f32, queue: &mut EventQueue<Event>) -> Option<SchedulingOutcome> {
        let frame = match packet.decode(Direction::Uplink) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("{}: dropping malformed uplink: {}", gateway, err);
                return None;
            }
        };
        let address = frame.frame_header.address;

        let outcome = self.scheduler.on_received_packet(&frame, &self.status, queue);
        let duplicate = outcome == SchedulingOutcome::Duplicate;
        self.trace.emit(TraceEvent::SchedulerReceivedPacket {
            address,
            gateway,
            packet: packet.clone(),
            duplicate,
        });

        if self.status.record_uplink(packet, frame, gateway, rssi) == UplinkRecord::Stored {
            self.controller.on_received_packet(self.status.registered_mut(address));
        }
        Some(outcome)
    }

    pub fn on_receive_window_opportunity(&mut self, address: DeviceAddress, window: ReceiveWindow, queue: &mut EventQueue<Event>) -> OpportunityOutcome {
        self.scheduler
            .on_receive_window_opportunity(address, window, &mut self.status, &mut self.controller, queue)
    }

    pub fn cancel_receive_window_opportunity(&mut self, address: DeviceAddress, queue: &mut EventQueue<Event>) -> bool {
        self.scheduler.cancel_opportunity(address, queue)
    }

    pub fn schedule_receive_window_opportunity(
        &mut self,
        address: DeviceAddress,
        window: ReceiveWindow,
        delay: Duration,
        queue: &mut EventQueue<Event>,
    ) -> EventId {
        let device = self.status.registered(address).device;
        self.scheduler.schedule_opportunity(address, window, device, delay, queue)
    }

    pub fn pending_receive_window_opportunity(&self, address: DeviceAddress, queue: &EventQueue<Event>) -> Option<EventId> {
        self.scheduler.pending_opportunity(address, queue)
    }

    pub fn take_downlinks(&mut self) -> Vec<Downlink> {
        self.status.take_downlinks()
    }
}
