//! Observable simulation events.
//!
//! Components receive a `TraceSink` when they are built and report state
//! changes through it. Subscribers run synchronously, in registration order,
//! at the exact point of the change, so they see the same ordering as the
//! event loop. A subscriber must not subscribe further observers from inside
//! its callback.

use embassy_time::Instant;
use std::cell::RefCell;
use std::rc::Rc;

use super::types::{DeviceId, GatewayId, ReceiveWindow};
use crate::end_device::MacState;
use crate::lorawan::{DeviceAddress, Packet};

#[derive(Debug, Clone)]
pub enum TraceEvent {
    /// A device put a frame on the air.
    StartSending {
        device: DeviceId,
        packet: Packet,
        retransmission: bool,
    },
    MacStateChanged { device: DeviceId, state: MacState },
    /// RX1 or RX2 opened on the device.
    ListeningWindowOpened { device: DeviceId, window: ReceiveWindow },
    /// A downlink addressed to the device was handed to the application.
    PacketReceived { device: DeviceId, packet: Packet },
    /// Class C continuous window opened; `count` restarts with each uplink.
    ContinuousWindowOpened { device: DeviceId, count: u32 },
    /// Outcome of a confirmed uplink.
    RequiredTransmissions {
        device: DeviceId,
        transmissions: u8,
        success: bool,
        first_attempt: Instant,
        packet: Packet,
    },
    SchedulerReceivedPacket {
        address: DeviceAddress,
        gateway: GatewayId,
        packet: Packet,
        duplicate: bool,
    },
    /// The scheduler evaluated a reply opportunity.
    ReceiveWindowOpened { address: DeviceAddress, window: ReceiveWindow },
    ReplySent {
        address: DeviceAddress,
        gateway: GatewayId,
        window: ReceiveWindow,
        packet: Packet,
    },
    ReplyAbandoned { address: DeviceAddress, window: ReceiveWindow },
}

type Subscriber = Box<dyn FnMut(&TraceEvent)>;

/// Shared handle to the list of subscribers.
#[derive(Clone, Default)]
pub struct TraceSink {
    subscribers: Rc<RefCell<Vec<Subscriber>>>,
}

impl TraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: FnMut(&TraceEvent) + 'static,
    {
        self.subscribers.borrow_mut().push(Box::new(subscriber));
    }

    pub fn emit(&self, event: TraceEvent) {
        let mut subscribers = self.subscribers.borrow_mut();
        for subscriber in subscribers.iter_mut() {
            subscriber(&event);
        }
    }
}

/// Subscriber that keeps every event, for harnesses and tests.
#[derive(Clone, Default)]
pub struct TraceLog {
    events: Rc<RefCell<Vec<TraceEvent>>>,
}

impl TraceLog {
    pub fn attach(sink: &TraceSink) -> Self {
        let log = Self::default();
        let events = log.events.clone();
        sink.subscribe(move |event| events.borrow_mut().push(event.clone()));
        log
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.borrow().clone()
    }

    pub fn count<P>(&self, predicate: P) -> usize
    where
        P: Fn(&TraceEvent) -> bool,
    {
        self.events.borrow().iter().filter(|event| predicate(event)).count()
    }
}
