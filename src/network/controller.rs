//! Network controller: pluggable policies that shape replies.
//!
//! Components see every new uplink (`on_received_packet`) and get a last
//! chance to edit the reply right before the scheduler decides whether one
//! is needed (`before_sending_reply`). Both hooks run synchronously.

use std::collections::BTreeSet;

use crate::lorawan::{DeviceAddress, MacCommand};

use super::status::EndDeviceStatus;

pub trait ControllerComponent {
    fn name(&self) -> &'static str;

    /// A new (non-duplicate) uplink was stored in `status.last_packet`.
    fn on_received_packet(&mut self, status: &mut EndDeviceStatus);

    fn before_sending_reply(&mut self, _status: &mut EndDeviceStatus) {}
}

/// Acknowledges confirmed uplinks.
#[derive(Debug, Default)]
pub struct ConfirmedMessagesComponent;

impl ControllerComponent for ConfirmedMessagesComponent {
    fn name(&self) -> &'static str {
        "confirmed-messages"
    }

    fn on_received_packet(&mut self, status: &mut EndDeviceStatus) {
        let Some(info) = status.last_packet.as_ref() else {
            return;
        };
        if info.frame.mac_header.is_confirmed() {
            log::debug!("{}: confirmed uplink, ack owed", status.address);
            status.reply.ack = true;
            status.reply.needs_reply = true;
        }
    }
}

/// Answers LinkCheckReq.
///
/// The answer is built right before sending so it counts every gateway that
/// reported the uplink, including late duplicates.
#[derive(Debug)]
pub struct LinkCheckComponent {
    demodulation_floor: f32,
    requested: BTreeSet<DeviceAddress>,
}

impl LinkCheckComponent {
    /// `demodulation_floor` is the weakest RSSI (dBm) a gateway still decodes.
    pub fn new(demodulation_floor: f32) -> Self {
        Self {
            demodulation_floor,
            requested: BTreeSet::new(),
        }
    }
}

impl ControllerComponent for LinkCheckComponent {
    fn name(&self) -> &'static str {
        "link-check"
    }

    fn on_received_packet(&mut self, status: &mut EndDeviceStatus) {
        let Some(info) = status.last_packet.as_ref() else {
            return;
        };
        // Membership follows the latest uplink only
        if info.frame.frame_header.commands.contains(&MacCommand::LinkCheckReq) {
            self.requested.insert(status.address);
            status.reply.needs_reply = true;
        } else {
            self.requested.remove(&status.address);
        }
    }

    fn before_sending_reply(&mut self, status: &mut EndDeviceStatus) {
        if !self.requested.remove(&status.address) {
            return;
        }
        let Some(info) = status.last_packet.as_ref() else {
            return;
        };
        let margin = info
            .best_rssi()
            .map(|rssi| (rssi - self.demodulation_floor).clamp(0.0, 254.0) as u8)
            .unwrap_or(0);
        let gateway_count = info.receptions.len().min(u8::MAX as usize) as u8;
        status.reply.commands.push(MacCommand::LinkCheckAns { margin, gateway_count });
    }
}

/// Ordered list of controller components.
#[derive(Default)]
pub struct NetworkController {
    components: Vec<Box<dyn ControllerComponent>>,
}

impl NetworkController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Controller with the stock components: acks, then link checks.
    pub fn with_default_components(demodulation_floor: f32) -> Self {
        let mut controller = Self::new();
        controller.install(ConfirmedMessagesComponent);
        controller.install(LinkCheckComponent::new(demodulation_floor));
        controller
    }

    pub fn install<C>(&mut self, component: C)
    where
        C: ControllerComponent + 'static,
    {
        log::debug!("installing controller component {}", component.name());
        self.components.push(Box::new(component));
    }

    pub fn component_names(&self) -> Vec<&'static str> {
        self.components.iter().map(|c| c.name()).collect()
    }

    pub fn on_received_packet(&mut self, status: &mut EndDeviceStatus) {
        for component in self.components.iter_mut() {
            component.on_received_packet(status);
        }
    }

    pub fn before_sending_reply(&mut self, status: &mut EndDeviceStatus) {
        for component in self.components.iter_mut() {
            component.before_sending_reply(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::end_device::DeviceClass;
    use crate::lorawan::{Frame, FrameHeader, MacHeader, MessageType, Packet};
    use crate::network::status::{FrameCounterWidth, NetworkStatus};
    use crate::simulation::types::{DeviceId, GatewayId};
    use crate::time_driver;

    const ADDRESS: DeviceAddress = DeviceAddress::from_u32(0x6c00_0748);

    fn status_after_uplink(message_type: MessageType, commands: Vec<MacCommand>, rssi: &[f32]) -> NetworkStatus {
        time_driver::reset();
        let mut status = NetworkStatus::new(FrameCounterWidth::Full);
        status.register_or_update(ADDRESS, DeviceId(0), DeviceClass::A);
        let mut header = FrameHeader::uplink(ADDRESS);
        header.commands = commands;
        let frame = Frame::new(MacHeader::new(message_type), header, Vec::new());
        let packet = Packet::new(frame.encode().unwrap());
        for (gateway, rssi) in rssi.iter().enumerate() {
            status.register_gateway(GatewayId(gateway));
            status.record_uplink(packet.clone(), frame.clone(), GatewayId(gateway), *rssi);
        }
        status
    }

    #[test]
    fn confirmed_uplink_owes_an_ack() {
        let mut status = status_after_uplink(MessageType::ConfirmedDataUp, Vec::new(), &[-90.0]);
        let mut controller = NetworkController::with_default_components(-130.0);
        controller.on_received_packet(status.registered_mut(ADDRESS));
        let reply = &status.device(ADDRESS).unwrap().reply;
        assert!(reply.ack && reply.needs_reply);
    }

    #[test]
    fn unconfirmed_uplink_needs_nothing() {
        let mut status = status_after_uplink(MessageType::UnconfirmedDataUp, Vec::new(), &[-90.0]);
        let mut controller = NetworkController::with_default_components(-130.0);
        controller.on_received_packet(status.registered_mut(ADDRESS));
        controller.before_sending_reply(status.registered_mut(ADDRESS));
        assert!(!status.needs_reply(ADDRESS));
    }

    #[test]
    fn link_check_answer_counts_every_gateway() {
        let mut status = status_after_uplink(MessageType::UnconfirmedDataUp, vec![MacCommand::LinkCheckReq], &[-100.0, -95.5, -120.0]);
        let mut controller = NetworkController::with_default_components(-130.0);
        controller.on_received_packet(status.registered_mut(ADDRESS));
        assert!(status.needs_reply(ADDRESS));

        controller.before_sending_reply(status.registered_mut(ADDRESS));
        controller.before_sending_reply(status.registered_mut(ADDRESS));
        assert_eq!(
            status.device(ADDRESS).unwrap().reply.commands,
            vec![MacCommand::LinkCheckAns { margin: 34, gateway_count: 3 }]
        );
    }

    #[test]
    fn link_check_request_does_not_outlive_an_abandoned_reply() {
        let mut status = status_after_uplink(MessageType::UnconfirmedDataUp, vec![MacCommand::LinkCheckReq], &[-90.0]);
        let mut controller = NetworkController::with_default_components(-130.0);
        controller.on_received_packet(status.registered_mut(ADDRESS));
        status.clear_pending_reply(ADDRESS);

        let mut header = FrameHeader::uplink(ADDRESS);
        header.frame_counter = 1;
        let frame = Frame::new(MacHeader::new(MessageType::UnconfirmedDataUp), header, Vec::new());
        let packet = Packet::new(frame.encode().unwrap());
        status.record_uplink(packet, frame, GatewayId(0), -90.0);
        controller.on_received_packet(status.registered_mut(ADDRESS));
        controller.before_sending_reply(status.registered_mut(ADDRESS));

        assert!(!status.needs_reply(ADDRESS));
        assert!(status.device(ADDRESS).unwrap().reply.commands.is_empty());
    }

    #[test]
    fn components_run_in_install_order() {
        let controller = NetworkController::with_default_components(-130.0);
        assert_eq!(controller.component_names(), vec!["confirmed-messages", "link-check"]);
    }
}
