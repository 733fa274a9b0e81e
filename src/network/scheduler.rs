//! Reply scheduling.
//!
//! Every new uplink schedules one receive-window opportunity per device. When
//! the opportunity fires the scheduler picks a gateway for that window, falls
//! back to the other window when none is eligible, and hands the reply to the
//! registry for transmission.

use embassy_time::Duration;
use std::collections::BTreeMap;

use crate::lorawan::{DeviceAddress, Frame};
use crate::simulation::event_queue::{EventId, EventQueue};
use crate::simulation::trace::{TraceEvent, TraceSink};
use crate::simulation::types::{DeviceId, Event, GatewayId, ReceiveWindow};

use super::controller::NetworkController;
use super::status::NetworkStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingOutcome {
    /// Same frame counter as the stored uplink; nothing scheduled.
    Duplicate,
    Scheduled { window: ReceiveWindow, id: EventId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpportunityOutcome {
    Rescheduled(ReceiveWindow),
    Abandoned,
    Sent(GatewayId),
    /// A gateway was available but there was nothing to say.
    NoReplyNeeded,
}

pub struct NetworkScheduler {
    reply_delay: Duration,
    // At most one opportunity per device
    opportunities: BTreeMap<DeviceAddress, EventId>,
    trace: TraceSink,
}

impl NetworkScheduler {
    pub fn new(reply_delay: Duration, trace: TraceSink) -> Self {
        Self {
            reply_delay,
            opportunities: BTreeMap::new(),
            trace,
        }
    }

    pub fn reply_delay(&self) -> Duration {
        self.reply_delay
    }

    /// Must run before the uplink is recorded, since the duplicate check
    /// compares against the previously stored frame.
    pub fn on_received_packet(&mut self, frame: &Frame, status: &NetworkStatus, queue: &mut EventQueue<Event>) -> SchedulingOutcome {
        let address = frame.frame_header.address;
        if status.is_duplicate(address, frame.frame_header.frame_counter) {
            log::debug!("{}: fcnt {} already received by another gateway", address, frame.frame_header.frame_counter);
            return SchedulingOutcome::Duplicate;
        }

        let device = status.registered(address);
        // Class C is always listening, so the RX1 attempt is skipped
        let window = if device.class.is_always_listening() {
            ReceiveWindow::Second
        } else {
            ReceiveWindow::First
        };
        let id = self.schedule_opportunity(address, window, device.device, self.reply_delay, queue);
        SchedulingOutcome::Scheduled { window, id }
    }

    /// Schedule an opportunity, replacing any still pending for the device.
    pub fn schedule_opportunity(
        &mut self,
        address: DeviceAddress,
        window: ReceiveWindow,
        device: DeviceId,
        delay: Duration,
        queue: &mut EventQueue<Event>,
    ) -> EventId {
        self.cancel_opportunity(address, queue);
        let id = queue.schedule(delay, Event::ReceiveWindowOpportunity { address, window, device });
        self.opportunities.insert(address, id);
        id
    }

    /// Returns whether a pending opportunity was removed.
    pub fn cancel_opportunity(&mut self, address: DeviceAddress, queue: &mut EventQueue<Event>) -> bool {
        self.opportunities.remove(&address).is_some_and(|id| queue.cancel(id))
    }

    pub fn pending_opportunity(&self, address: DeviceAddress, queue: &EventQueue<Event>) -> Option<EventId> {
        self.opportunities.get(&address).copied().filter(|id| queue.is_pending(*id))
    }

    pub fn on_receive_window_opportunity(
        &mut self,
        address: DeviceAddress,
        window: ReceiveWindow,
        status: &mut NetworkStatus,
        controller: &mut NetworkController,
        queue: &mut EventQueue<Event>,
    ) -> OpportunityOutcome {
        log::debug!("{}: opening receive window {}", address, window.number());
        self.trace.emit(TraceEvent::ReceiveWindowOpened { address, window });

        let (device, class) = {
            let registered = status.registered(address);
            (registered.device, registered.class)
        };

        let Some(gateway) = status.best_gateway(address, window) else {
            let fallback = match (window, class.is_always_listening()) {
                (ReceiveWindow::First, false) => Some(ReceiveWindow::Second),
                (ReceiveWindow::Second, true) => Some(ReceiveWindow::First),
                _ => None,
            };
            if let Some(next) = fallback {
                log::debug!("{}: no suitable gateway for {}, trying {}", address, window, next);
                self.schedule_opportunity(address, next, device, self.reply_delay, queue);
                return OpportunityOutcome::Rescheduled(next);
            }
            self.abandon(address, window, status);
            return OpportunityOutcome::Abandoned;
        };
        log::debug!("{}: found available gateway {}", address, gateway);

        controller.before_sending_reply(status.registered_mut(address));
        if !status.needs_reply(address) {
            return OpportunityOutcome::NoReplyNeeded;
        }

        match status.reply_for_device(address, window) {
            Ok(packet) => {
                log::info!("{}: sending reply in {} through {}", address, window, gateway);
                status.send_through_gateway(packet.clone(), gateway, address, window);
                status.clear_pending_reply(address);
                self.trace.emit(TraceEvent::ReplySent {
                    address,
                    gateway,
                    window,
                    packet,
                });
                OpportunityOutcome::Sent(gateway)
            }
            Err(err) => {
                log::error!("{}: could not encode reply: {}", address, err);
                self.abandon(address, window, status);
                OpportunityOutcome::Abandoned
            }
        }
    }

    fn abandon(&mut self, address: DeviceAddress, window: ReceiveWindow, status: &mut NetworkStatus) {
        if !status.needs_reply(address) {
            return;
        }
        log::warn!("{}: giving up on reply, no suitable gateway in {}", address, window);
        status.clear_pending_reply(address);
        self.trace.emit(TraceEvent::ReplyAbandoned { address, window });
    }
}
