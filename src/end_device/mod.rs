//! End-device MAC.
//!
//! One `EndDeviceMac` type serves both device classes. The class is a
//! capability flag: Class A sleeps between and after its two receive windows,
//! Class C falls back to a continuous receive window instead. Uplink
//! construction, MAC command handling and the confirmed-uplink retransmission
//! engine are shared.
//!
//! The MAC does not own a radio. Entry points that may put a frame on the
//! air return it (`Some(packet)`) and the caller hands it to the channel,
//! which later reports `transmission_finished`.
//!
//! ## Module Organization
//!
//! - `class_a`: RX1/RX2 windows and the downlink decision tree
//! - `class_c`: continuous receive window
//! - `retransmission`: confirmed-uplink retry bookkeeping

mod class_a;
mod class_c;
pub mod retransmission;

use embassy_time::{Duration, Instant};
use serde::Deserialize;
use std::fmt;

pub use retransmission::RetransmissionParameters;

use crate::lorawan::frame::MAX_FOPTS_LEN;
use crate::lorawan::mac_command::BATTERY_EXTERNAL_POWER;
use crate::lorawan::{DeviceAddress, Frame, FrameError, FrameHeader, MacCommand, MacHeader, MessageType, Packet};
use crate::simulation::event_queue::{EventId, EventQueue};
use crate::simulation::trace::{TraceEvent, TraceSink};
use crate::simulation::types::{DeviceId, Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
pub enum DeviceClass {
    #[default]
    #[serde(alias = "a")]
    A,
    #[serde(alias = "c")]
    C,
}

impl DeviceClass {
    /// Class C devices listen whenever they are not transmitting.
    pub fn is_always_listening(self) -> bool {
        self == DeviceClass::C
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::A => write!(f, "Class A"),
            DeviceClass::C => write!(f, "Class C"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacState {
    Idle,
    Transmitting,
    ListeningWindow1,
    ListeningWindow2,
    ContinuousListening,
    /// A frame is being received; window closes are ignored until it ends.
    Receiving,
    Sleep,
}

#[derive(Debug, Clone)]
pub struct MacParameters {
    /// Transmissions allowed for one confirmed uplink, the first one included.
    pub max_transmissions: u8,
    /// RX1 opens this long after the uplink ends.
    pub receive_delay1: Duration,
    /// RX2 opens this long after the uplink ends.
    pub receive_delay2: Duration,
    pub receive_window_duration: Duration,
    pub confirmed: bool,
}

impl Default for MacParameters {
    fn default() -> Self {
        Self {
            max_transmissions: 8,
            receive_delay1: Duration::from_secs(1),
            receive_delay2: Duration::from_secs(2),
            receive_window_duration: Duration::from_millis(100),
            confirmed: false,
        }
    }
}

/// Last LinkCheckAns received from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkCheck {
    pub margin: u8,
    pub gateway_count: u8,
    pub received_at: Instant,
}

pub struct EndDeviceMac {
    id: DeviceId,
    address: DeviceAddress,
    class: DeviceClass,
    params: MacParameters,
    state: MacState,
    frame_counter: u16,
    retx: RetransmissionParameters,
    // One live handle per slot; replaced handles are either fired or cancelled
    first_receive_window: EventId,
    second_receive_window: EventId,
    close_window: EventId,
    continuous_window: EventId,
    continuous_window_count: u32,
    postponed: Option<Vec<u8>>,
    // MAC commands riding on the next uplink
    pending_commands: Vec<MacCommand>,
    ack_owed: bool,
    data_rate: u8,
    tx_power: u8,
    aggregated_duty_cycle: f64,
    last_link_check: Option<LinkCheck>,
    trace: TraceSink,
}

impl EndDeviceMac {
    pub fn new(id: DeviceId, address: DeviceAddress, class: DeviceClass, params: MacParameters, trace: TraceSink) -> Self {
        Self {
            id,
            address,
            class,
            params,
            state: MacState::Idle,
            frame_counter: 0,
            retx: RetransmissionParameters::default(),
            first_receive_window: EventId::default(),
            second_receive_window: EventId::default(),
            close_window: EventId::default(),
            continuous_window: EventId::default(),
            continuous_window_count: 0,
            postponed: None,
            pending_commands: Vec::new(),
            ack_owed: false,
            data_rate: 0,
            tx_power: 0,
            aggregated_duty_cycle: 1.0,
            last_link_check: None,
            trace,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn parameters(&self) -> &MacParameters {
        &self.params
    }

    pub fn state(&self) -> MacState {
        self.state
    }

    /// Frame counter the next new uplink will carry.
    pub fn frame_counter(&self) -> u16 {
        self.frame_counter
    }

    pub fn retransmission(&self) -> &RetransmissionParameters {
        &self.retx
    }

    /// Continuous-window openings since the last uplink (or boot).
    pub fn continuous_window_count(&self) -> u32 {
        self.continuous_window_count
    }

    pub fn last_link_check(&self) -> Option<LinkCheck> {
        self.last_link_check
    }

    pub fn data_rate(&self) -> u8 {
        self.data_rate
    }

    /// TX power index set by LinkAdrReq; every step lowers output by 2 dB.
    pub fn tx_power_reduction_db(&self) -> f32 {
        2.0 * self.tx_power as f32
    }

    pub fn aggregated_duty_cycle(&self) -> f64 {
        self.aggregated_duty_cycle
    }

    pub fn set_confirmed(&mut self, confirmed: bool) {
        self.params.confirmed = confirmed;
    }

    /// Piggyback a LinkCheckReq on the next uplink.
    pub fn request_link_check(&mut self) {
        self.pending_commands.push(MacCommand::LinkCheckReq);
    }

    /// Bring the MAC up at the current virtual time.
    pub fn start(&mut self, queue: &mut EventQueue<Event>) {
        if self.class.is_always_listening() {
            self.start_continuous_listening(queue);
        }
    }

    /// Transmitting, inside a window, or with a window still to come.
    pub fn is_busy(&self, queue: &EventQueue<Event>) -> bool {
        matches!(
            self.state,
            MacState::Transmitting | MacState::Receiving | MacState::ListeningWindow1 | MacState::ListeningWindow2
        ) || queue.is_pending(self.first_receive_window)
            || queue.is_pending(self.second_receive_window)
    }

    /// Application send request.
    ///
    /// While a receive cycle is running the payload is postponed until the
    /// cycle ends. An unacknowledged confirmed uplink with transmissions left
    /// is resent instead of building a new frame.
    pub fn send(&mut self, payload: Vec<u8>, queue: &mut EventQueue<Event>) -> Option<Packet> {
        if self.is_busy(queue) {
            log::debug!("{}: busy ({:?}), postponing {} byte payload", self.id, self.state, payload.len());
            if self.postponed.replace(payload).is_some() {
                log::warn!("{}: dropped an older postponed payload", self.id);
            }
            return None;
        }

        if self.retx.waiting_ack {
            if self.retx.can_retry() {
                log::info!("{}: previous confirmed uplink unacknowledged, resending it instead", self.id);
                return self.retransmit(queue);
            }
            self.report_failure();
        }

        let packet = match self.build_uplink(payload) {
            Ok(packet) => packet,
            Err(err) => {
                log::error!("{}: could not encode uplink: {}", self.id, err);
                return None;
            }
        };
        if self.params.confirmed {
            self.retx.start(packet.clone(), self.params.max_transmissions, queue.now());
        }
        Some(self.transmit(packet, false, queue))
    }

    /// The radio finished sending; arm RX1 and RX2.
    pub fn transmission_finished(&mut self, queue: &mut EventQueue<Event>) {
        if self.state != MacState::Transmitting {
            log::warn!("{}: transmission finished while {:?}", self.id, self.state);
            return;
        }
        self.first_receive_window = queue.schedule(self.params.receive_delay1, Event::OpenFirstWindow { device: self.id });
        self.second_receive_window = queue.schedule(self.params.receive_delay2, Event::OpenSecondWindow { device: self.id });
        self.idle_between_windows();
    }

    fn build_uplink(&mut self, payload: Vec<u8>) -> Result<Packet, FrameError> {
        let mut header = FrameHeader::uplink(self.address);
        header.frame_counter = self.frame_counter;
        header.ack = self.ack_owed;
        header.commands = self.take_fitting_commands();
        let message_type = if self.params.confirmed {
            MessageType::ConfirmedDataUp
        } else {
            MessageType::UnconfirmedDataUp
        };
        let bytes = Frame::new(MacHeader::new(message_type), header, payload).encode()?;
        self.ack_owed = false;
        self.frame_counter = self.frame_counter.wrapping_add(1);
        Ok(Packet::new(bytes))
    }

    // Commands that do not fit into FOpts wait for the following uplink
    fn take_fitting_commands(&mut self) -> Vec<MacCommand> {
        let mut used = 0;
        let mut fitting = Vec::new();
        let mut rest = Vec::new();
        for command in self.pending_commands.drain(..) {
            if used + command.encoded_len() <= MAX_FOPTS_LEN {
                used += command.encoded_len();
                fitting.push(command);
            } else {
                rest.push(command);
            }
        }
        self.pending_commands = rest;
        fitting
    }

    fn retransmit(&mut self, queue: &mut EventQueue<Event>) -> Option<Packet> {
        let packet = self.retx.packet.clone()?;
        Some(self.transmit(packet, true, queue))
    }

    fn transmit(&mut self, packet: Packet, retransmission: bool, queue: &mut EventQueue<Event>) -> Packet {
        if self.retx.waiting_ack {
            self.retx.consume_attempt();
        }
        // A new uplink starts a new receive cycle
        queue.cancel(self.continuous_window);
        self.continuous_window_count = 0;
        self.set_state(MacState::Transmitting);
        log::debug!(
            "{}: transmitting {} bytes{} ({} transmissions left)",
            self.id,
            packet.len(),
            if retransmission { " again" } else { "" },
            self.retx.retx_left
        );
        self.trace.emit(TraceEvent::StartSending {
            device: self.id,
            packet: packet.clone(),
            retransmission,
        });
        packet
    }

    fn idle_between_windows(&mut self) {
        if self.class.is_always_listening() {
            self.open_continuous_window();
        } else {
            self.set_state(MacState::Sleep);
        }
    }

    /// Both windows are over without a downlink for this device.
    fn finish_receive_cycle(&mut self, queue: &mut EventQueue<Event>) -> Option<Packet> {
        if self.retx.waiting_ack {
            return self.retry_or_fail(queue);
        }
        self.send_postponed(queue)
    }

    fn retry_or_fail(&mut self, queue: &mut EventQueue<Event>) -> Option<Packet> {
        if self.retx.can_retry() {
            log::debug!("{}: no acknowledgement, retransmitting ({} left)", self.id, self.retx.retx_left);
            return self.retransmit(queue);
        }
        self.report_failure();
        self.send_postponed(queue)
    }

    fn report_failure(&mut self) {
        let transmissions = self.retx.transmissions_used(self.params.max_transmissions);
        log::info!("{}: giving up on confirmed uplink after {} transmissions", self.id, transmissions);
        self.report_outcome(transmissions, false);
    }

    fn report_outcome(&mut self, transmissions: u8, success: bool) {
        if let (Some(first_attempt), Some(packet)) = (self.retx.first_attempt, self.retx.packet.take()) {
            self.trace.emit(TraceEvent::RequiredTransmissions {
                device: self.id,
                transmissions,
                success,
                first_attempt,
                packet,
            });
        }
        self.retx.reset();
    }

    fn send_postponed(&mut self, queue: &mut EventQueue<Event>) -> Option<Packet> {
        let payload = self.postponed.take()?;
        log::debug!("{}: sending postponed payload", self.id);
        self.send(payload, queue)
    }

    fn apply_commands(&mut self, commands: &[MacCommand], now: Instant) {
        for command in commands {
            match *command {
                MacCommand::LinkCheckAns { margin, gateway_count } => {
                    log::debug!("{}: link check margin {} dB via {} gateways", self.id, margin, gateway_count);
                    self.last_link_check = Some(LinkCheck {
                        margin,
                        gateway_count,
                        received_at: now,
                    });
                }
                MacCommand::LinkAdrReq { data_rate, tx_power, .. } => {
                    self.data_rate = data_rate;
                    self.tx_power = tx_power;
                    self.pending_commands.push(MacCommand::LinkAdrAns {
                        power_ack: true,
                        data_rate_ack: true,
                        channel_mask_ack: true,
                    });
                }
                MacCommand::DutyCycleReq { max_duty_cycle } => {
                    self.aggregated_duty_cycle = 1.0 / f64::from(1u32 << max_duty_cycle);
                    self.pending_commands.push(MacCommand::DutyCycleAns);
                }
                MacCommand::DevStatusReq => self.pending_commands.push(MacCommand::DevStatusAns {
                    battery: BATTERY_EXTERNAL_POWER,
                    margin: 0,
                }),
                other => log::warn!("{}: ignoring {:?} in a downlink", self.id, other),
            }
        }
    }

    fn set_state(&mut self, state: MacState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.trace.emit(TraceEvent::MacStateChanged { device: self.id, state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::trace::TraceLog;
    use crate::simulation::types::ReceiveWindow;

    const AIRTIME: Duration = Duration::from_millis(50);

    fn own_address() -> DeviceAddress {
        DeviceAddress::new(54, 1864)
    }

    fn other_address() -> DeviceAddress {
        DeviceAddress::new(54, 1865)
    }

    fn downlink(address: DeviceAddress, message_type: MessageType, commands: Vec<MacCommand>) -> Packet {
        let mut header = FrameHeader::downlink(address);
        header.commands = commands;
        Packet::new(Frame::new(MacHeader::new(message_type), header, Vec::new()).encode().unwrap())
    }

    fn foreign_uplink() -> Packet {
        let header = FrameHeader::uplink(other_address());
        Packet::new(Frame::new(MacHeader::new(MessageType::UnconfirmedDataUp), header, vec![1]).encode().unwrap())
    }

    fn confirmed(max_transmissions: u8) -> MacParameters {
        MacParameters {
            max_transmissions,
            confirmed: true,
            ..MacParameters::default()
        }
    }

    /// Drives one MAC the way the world does, with a fixed airtime.
    struct Harness {
        mac: EndDeviceMac,
        queue: EventQueue<Event>,
        log: TraceLog,
        sent: Vec<(Instant, Packet)>,
    }

    impl Harness {
        fn new(class: DeviceClass, params: MacParameters) -> Self {
            let mut queue = EventQueue::new();
            let sink = TraceSink::new();
            let log = TraceLog::attach(&sink);
            let mut mac = EndDeviceMac::new(DeviceId(0), own_address(), class, params, sink);
            mac.start(&mut queue);
            Self {
                mac,
                queue,
                log,
                sent: Vec::new(),
            }
        }

        fn on_air(&mut self, packet: Option<Packet>) {
            if let Some(packet) = packet {
                self.sent.push((self.queue.now(), packet));
                self.queue.schedule(AIRTIME, Event::TransmissionFinished { device: DeviceId(0) });
            }
        }

        fn send(&mut self, payload: &[u8]) -> bool {
            let packet = self.mac.send(payload.to_vec(), &mut self.queue);
            let transmitted = packet.is_some();
            self.on_air(packet);
            transmitted
        }

        fn inject(&mut self, at_ms: u64, packet: Packet, airtime: Duration) {
            self.queue.schedule_at(
                Instant::from_millis(at_ms),
                Event::ReceptionStarted {
                    device: DeviceId(0),
                    packet,
                    airtime,
                },
            );
        }

        fn run_until_ms(&mut self, ms: u64) {
            let deadline = Instant::from_millis(ms);
            while let Some((_, event)) = self.queue.pop_until(deadline) {
                let packet = match event {
                    Event::TransmissionFinished { .. } => {
                        self.mac.transmission_finished(&mut self.queue);
                        None
                    }
                    Event::OpenFirstWindow { .. } => {
                        self.mac.open_first_window(&mut self.queue);
                        None
                    }
                    Event::CloseFirstWindow { .. } => {
                        self.mac.close_first_window();
                        None
                    }
                    Event::OpenSecondWindow { .. } => {
                        self.mac.open_second_window(&mut self.queue);
                        None
                    }
                    Event::CloseSecondWindow { .. } => self.mac.close_second_window(&mut self.queue),
                    Event::OpenContinuousWindow { .. } => {
                        self.mac.continuous_window_tick(&mut self.queue);
                        None
                    }
                    Event::ReceptionStarted { device, packet, airtime } => {
                        if self.mac.start_reception() {
                            self.queue.schedule(airtime, Event::ReceptionFinished { device, packet });
                        }
                        None
                    }
                    Event::ReceptionFinished { packet, .. } => self.mac.receive(packet, &mut self.queue),
                    _ => None,
                };
                self.on_air(packet);
            }
            self.queue.advance_to(deadline);
        }

        fn outcomes(&self) -> Vec<(u8, bool)> {
            self.log
                .events()
                .into_iter()
                .filter_map(|event| match event {
                    TraceEvent::RequiredTransmissions { transmissions, success, .. } => Some((transmissions, success)),
                    _ => None,
                })
                .collect()
        }

        fn windows_opened(&self, window: ReceiveWindow) -> usize {
            self.log
                .count(|event| matches!(event, TraceEvent::ListeningWindowOpened { window: w, .. } if *w == window))
        }

        fn packets_received(&self) -> usize {
            self.log.count(|event| matches!(event, TraceEvent::PacketReceived { .. }))
        }
    }

    #[test]
    fn class_a_opens_both_windows_then_sleeps() {
        let mut h = Harness::new(DeviceClass::A, MacParameters::default());
        assert!(h.send(b"hello"));
        assert_eq!(h.mac.state(), MacState::Transmitting);

        h.run_until_ms(5_000);
        assert_eq!(h.windows_opened(ReceiveWindow::First), 1);
        assert_eq!(h.windows_opened(ReceiveWindow::Second), 1);
        assert_eq!(h.mac.state(), MacState::Sleep);
        assert_eq!(h.mac.frame_counter(), 1);
        assert!(h.outcomes().is_empty());
        assert!(!h.mac.is_busy(&h.queue));
    }

    #[test]
    fn uplink_carries_address_counter_and_type() {
        let mut h = Harness::new(DeviceClass::A, confirmed(4));
        h.send(&[7, 7]);
        let frame = h.sent[0].1.decode(crate::lorawan::Direction::Uplink).unwrap();
        assert_eq!(frame.mac_header.message_type, MessageType::ConfirmedDataUp);
        assert_eq!(frame.frame_header.address, own_address());
        assert_eq!(frame.frame_header.frame_counter, 0);
        assert_eq!(frame.payload, vec![7, 7]);
    }

    #[test]
    fn unacknowledged_uplink_fails_once_after_max_transmissions() {
        let mut h = Harness::new(DeviceClass::A, confirmed(3));
        h.send(b"data");
        h.run_until_ms(60_000);

        assert_eq!(h.sent.len(), 3);
        let first = &h.sent[0].1;
        assert!(h.sent.iter().all(|(_, packet)| packet.same_instance(first)));
        assert_eq!(h.outcomes(), vec![(3, false)]);
        assert!(!h.mac.retransmission().waiting_ack);
        // Retries keep the frame counter; the next new uplink moves on
        assert_eq!(h.mac.frame_counter(), 1);
    }

    #[test]
    fn retransmission_starts_when_second_window_closes() {
        let mut h = Harness::new(DeviceClass::A, confirmed(2));
        h.send(b"data");
        h.run_until_ms(10_000);
        // Uplink ends at 50 ms, RX2 opens at 2050 ms and closes at 2150 ms
        assert_eq!(h.sent[1].0, Instant::from_millis(2_150));
    }

    #[test]
    fn downlink_in_first_window_acknowledges_and_cancels_second() {
        let mut h = Harness::new(DeviceClass::A, confirmed(8));
        h.send(b"data");
        h.inject(1_060, downlink(own_address(), MessageType::UnconfirmedDataDown, Vec::new()), Duration::from_millis(30));
        h.run_until_ms(10_000);

        assert_eq!(h.packets_received(), 1);
        assert_eq!(h.windows_opened(ReceiveWindow::Second), 0);
        assert_eq!(h.outcomes(), vec![(1, true)]);
        assert_eq!(h.sent.len(), 1);
        assert_eq!(h.mac.state(), MacState::Sleep);
    }

    #[test]
    fn foreign_downlink_after_second_window_triggers_retry() {
        let mut h = Harness::new(DeviceClass::A, confirmed(2));
        h.send(b"data");
        // Reception overlaps the RX2 close, so the close is ignored
        h.inject(2_060, downlink(other_address(), MessageType::UnconfirmedDataDown, Vec::new()), Duration::from_millis(200));
        h.run_until_ms(3_000);

        assert_eq!(h.packets_received(), 0);
        assert_eq!(h.sent.len(), 2);
        assert_eq!(h.sent[1].0, Instant::from_millis(2_260));

        h.run_until_ms(20_000);
        assert_eq!(h.outcomes(), vec![(2, false)]);
    }

    #[test]
    fn overheard_uplink_with_no_transmissions_left_fails() {
        let mut h = Harness::new(DeviceClass::A, confirmed(1));
        h.send(b"data");
        h.inject(2_060, foreign_uplink(), Duration::from_millis(200));
        h.run_until_ms(20_000);

        assert_eq!(h.sent.len(), 1);
        assert_eq!(h.outcomes(), vec![(1, false)]);
        assert_eq!(h.mac.state(), MacState::Sleep);
    }

    #[test]
    fn foreign_frame_before_second_window_changes_nothing() {
        let mut h = Harness::new(DeviceClass::A, confirmed(2));
        h.send(b"data");
        h.inject(1_060, foreign_uplink(), Duration::from_millis(20));
        h.run_until_ms(2_100);
        assert_eq!(h.sent.len(), 1);
        assert!(h.mac.retransmission().waiting_ack);
    }

    #[test]
    fn frames_outside_windows_are_not_received() {
        let mut h = Harness::new(DeviceClass::A, MacParameters::default());
        h.send(b"data");
        h.inject(500, downlink(own_address(), MessageType::UnconfirmedDataDown, Vec::new()), Duration::from_millis(30));
        h.run_until_ms(5_000);
        assert_eq!(h.packets_received(), 0);
    }

    #[test]
    fn malformed_frame_is_dropped_and_radio_sleeps() {
        let mut h = Harness::new(DeviceClass::A, MacParameters::default());
        h.send(b"data");
        h.inject(1_060, Packet::new(vec![0xc0]), Duration::from_millis(10));
        h.run_until_ms(1_080);
        assert_eq!(h.mac.state(), MacState::Sleep);
        assert_eq!(h.packets_received(), 0);
    }

    #[test]
    fn undecodable_frame_spanning_second_window_triggers_retry() {
        // Unknown message type, then a downlink header cut short
        for garbage in [vec![0xc0], vec![0x60, 0x48]] {
            let mut h = Harness::new(DeviceClass::A, confirmed(2));
            h.send(b"data");
            // Starts in RX1 and still runs when RX2 is due, so RX2 never opens
            h.inject(1_100, Packet::new(garbage), Duration::from_millis(1_000));
            h.run_until_ms(3_000);

            assert_eq!(h.windows_opened(ReceiveWindow::Second), 0);
            assert_eq!(h.sent.len(), 2);
            assert_eq!(h.sent[1].0, Instant::from_millis(2_100));

            h.run_until_ms(20_000);
            assert_eq!(h.outcomes(), vec![(2, false)]);
        }
    }

    #[test]
    fn busy_send_is_postponed_until_cycle_ends() {
        let mut h = Harness::new(DeviceClass::A, MacParameters::default());
        assert!(h.send(b"one"));
        assert!(!h.send(b"two"));
        h.run_until_ms(10_000);

        assert_eq!(h.sent.len(), 2);
        assert_eq!(h.sent[1].0, Instant::from_millis(2_150));
        let frame = h.sent[1].1.decode(crate::lorawan::Direction::Uplink).unwrap();
        assert_eq!(frame.frame_header.frame_counter, 1);
        assert_eq!(frame.payload, b"two".to_vec());
    }

    #[test]
    fn downlink_commands_are_applied_and_answered() {
        let mut h = Harness::new(DeviceClass::A, MacParameters::default());
        h.send(b"data");
        let commands = vec![
            MacCommand::LinkAdrReq {
                data_rate: 3,
                tx_power: 2,
                channel_mask: 0x0007,
                redundancy: 1,
            },
            MacCommand::DutyCycleReq { max_duty_cycle: 4 },
            MacCommand::LinkCheckAns { margin: 12, gateway_count: 2 },
            MacCommand::DevStatusReq,
        ];
        h.inject(1_060, downlink(own_address(), MessageType::ConfirmedDataDown, commands), Duration::from_millis(30));
        h.run_until_ms(3_000);

        assert_eq!(h.mac.data_rate(), 3);
        assert_eq!(h.mac.tx_power_reduction_db(), 4.0);
        assert_eq!(h.mac.aggregated_duty_cycle(), 1.0 / 16.0);
        let link_check = h.mac.last_link_check().unwrap();
        assert_eq!((link_check.margin, link_check.gateway_count), (12, 2));
        assert_eq!(link_check.received_at, Instant::from_millis(1_090));

        h.mac.request_link_check();
        h.send(b"next");
        let frame = h.sent[1].1.decode(crate::lorawan::Direction::Uplink).unwrap();
        assert!(frame.frame_header.ack);
        assert_eq!(
            frame.frame_header.commands,
            vec![
                MacCommand::LinkAdrAns {
                    power_ack: true,
                    data_rate_ack: true,
                    channel_mask_ack: true,
                },
                MacCommand::DutyCycleAns,
                MacCommand::DevStatusAns {
                    battery: BATTERY_EXTERNAL_POWER,
                    margin: 0,
                },
                MacCommand::LinkCheckReq,
            ]
        );
    }

    #[test]
    fn class_c_boot_opens_three_continuous_windows() {
        let mut h = Harness::new(DeviceClass::C, MacParameters::default());
        assert_eq!(h.mac.continuous_window_count(), 1);
        h.run_until_ms(3_000);
        assert_eq!(h.mac.continuous_window_count(), 3);
        h.run_until_ms(10_000);
        assert_eq!(h.mac.continuous_window_count(), 3);
        assert_eq!(h.mac.state(), MacState::ContinuousListening);
    }

    #[test]
    fn class_c_reopens_continuous_window_around_each_receive_window() {
        let mut h = Harness::new(DeviceClass::C, MacParameters::default());
        h.run_until_ms(1_000);
        h.send(b"data");
        assert_eq!(h.mac.continuous_window_count(), 0);

        h.run_until_ms(1_100);
        assert_eq!(h.mac.continuous_window_count(), 1);
        h.run_until_ms(2_200);
        assert_eq!(h.mac.continuous_window_count(), 2);
        h.run_until_ms(5_000);
        assert_eq!(h.mac.continuous_window_count(), 3);
        assert_eq!(h.windows_opened(ReceiveWindow::First), 1);
        assert_eq!(h.windows_opened(ReceiveWindow::Second), 1);
        assert_eq!(h.mac.state(), MacState::ContinuousListening);
    }

    #[test]
    fn class_c_receives_between_windows_and_stops_the_cycle() {
        let mut h = Harness::new(DeviceClass::C, confirmed(3));
        h.send(b"data");
        h.inject(500, downlink(own_address(), MessageType::UnconfirmedDataDown, Vec::new()), Duration::from_millis(30));
        h.run_until_ms(5_000);

        assert_eq!(h.packets_received(), 1);
        assert_eq!(h.outcomes(), vec![(1, true)]);
        assert_eq!(h.windows_opened(ReceiveWindow::First), 0);
        assert_eq!(h.mac.continuous_window_count(), 1);
        assert_eq!(h.mac.state(), MacState::ContinuousListening);
    }

    #[test]
    fn state_changes_are_traced() {
        let mut h = Harness::new(DeviceClass::A, MacParameters::default());
        h.send(b"x");
        h.run_until_ms(100);
        let states: Vec<MacState> = h
            .log
            .events()
            .into_iter()
            .filter_map(|event| match event {
                TraceEvent::MacStateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![MacState::Transmitting, MacState::Sleep]);
    }
}
