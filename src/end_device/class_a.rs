//! Receive windows and downlink handling.
//!
//! RX1 and RX2 open after every uplink. This is the whole of Class A
//! behaviour and the base Class C builds on.

use crate::lorawan::{Direction, Frame, MacHeader, MessageType, Packet};
use crate::simulation::event_queue::EventQueue;
use crate::simulation::trace::TraceEvent;
use crate::simulation::types::{Event, ReceiveWindow};

use super::{EndDeviceMac, MacState};

impl EndDeviceMac {
    pub fn open_first_window(&mut self, queue: &mut EventQueue<Event>) {
        self.open_window(ReceiveWindow::First, queue);
    }

    pub fn open_second_window(&mut self, queue: &mut EventQueue<Event>) {
        self.open_window(ReceiveWindow::Second, queue);
    }

    fn open_window(&mut self, window: ReceiveWindow, queue: &mut EventQueue<Event>) {
        if self.state == MacState::Receiving {
            log::debug!("{}: still receiving, {} skipped", self.id, window);
            return;
        }
        let (state, close) = match window {
            ReceiveWindow::First => (MacState::ListeningWindow1, Event::CloseFirstWindow { device: self.id }),
            ReceiveWindow::Second => (MacState::ListeningWindow2, Event::CloseSecondWindow { device: self.id }),
        };
        self.set_state(state);
        self.trace.emit(TraceEvent::ListeningWindowOpened { device: self.id, window });
        self.close_window = queue.schedule(self.params.receive_window_duration, close);
    }

    pub fn close_first_window(&mut self) {
        // Anything else means a reception holds the radio or the cycle ended early
        if self.state != MacState::ListeningWindow1 {
            return;
        }
        self.idle_between_windows();
    }

    /// Closing RX2 without a downlink ends the receive cycle; a pending
    /// confirmed uplink is retransmitted or reported as failed here.
    pub fn close_second_window(&mut self, queue: &mut EventQueue<Event>) -> Option<Packet> {
        if self.state != MacState::ListeningWindow2 {
            return None;
        }
        self.idle_between_windows();
        self.finish_receive_cycle(queue)
    }

    /// A preamble arrives. Returns whether the device locks onto it.
    pub fn start_reception(&mut self) -> bool {
        match self.state {
            MacState::ListeningWindow1 | MacState::ListeningWindow2 | MacState::ContinuousListening => {
                self.set_state(MacState::Receiving);
                true
            }
            _ => false,
        }
    }

    /// A frame was fully received.
    ///
    /// - Overheard uplink, downlink for another device, or a frame that does
    ///   not decode: if an ack is awaited and RX2 is already over, retransmit
    ///   or give up.
    /// - Downlink for this device: cancel the remaining windows, apply its
    ///   MAC commands, notify the application and count it as the ack.
    ///
    /// The radio goes back to sleep (Class C: continuous listening) either way.
    pub fn receive(&mut self, packet: Packet, queue: &mut EventQueue<Event>) -> Option<Packet> {
        self.resume_after_reception();

        let outcome = match MacHeader::peek(packet.bytes()) {
            Err(err) => {
                log::warn!("{}: discarding malformed frame: {}", self.id, err);
                self.after_foreign_frame(queue)
            }
            Ok(header) if header.is_uplink() => {
                log::debug!("{}: overheard an uplink", self.id);
                self.after_foreign_frame(queue)
            }
            Ok(_) => match packet.decode(Direction::Downlink) {
                Err(err) => {
                    log::warn!("{}: discarding malformed downlink: {}", self.id, err);
                    self.after_foreign_frame(queue)
                }
                Ok(frame) if frame.frame_header.address != self.address => {
                    log::debug!("{}: downlink for {} is noise here", self.id, frame.frame_header.address);
                    self.after_foreign_frame(queue)
                }
                Ok(frame) => self.accept_downlink(frame, packet.clone(), queue),
            },
        };

        match outcome {
            Some(packet) => Some(packet),
            None if !self.is_busy(queue) => self.send_postponed(queue),
            None => None,
        }
    }

    fn resume_after_reception(&mut self) {
        if self.class.is_always_listening() {
            self.set_state(MacState::ContinuousListening);
        } else {
            self.set_state(MacState::Sleep);
        }
    }

    fn after_foreign_frame(&mut self, queue: &mut EventQueue<Event>) -> Option<Packet> {
        if self.retx.waiting_ack && queue.is_expired(self.second_receive_window) {
            return self.retry_or_fail(queue);
        }
        None
    }

    fn accept_downlink(&mut self, frame: Frame, packet: Packet, queue: &mut EventQueue<Event>) -> Option<Packet> {
        log::debug!(
            "{}: downlink received (fcnt {}, {} MAC commands)",
            self.id,
            frame.frame_header.frame_counter,
            frame.frame_header.commands.len()
        );
        queue.cancel(self.first_receive_window);
        queue.cancel(self.second_receive_window);
        queue.cancel(self.continuous_window);

        self.ack_owed = frame.mac_header.message_type == MessageType::ConfirmedDataDown;
        self.apply_commands(&frame.frame_header.commands, queue.now());
        self.trace.emit(TraceEvent::PacketReceived { device: self.id, packet });

        if self.retx.waiting_ack {
            let transmissions = self.retx.transmissions_used(self.params.max_transmissions);
            log::info!("{}: confirmed uplink acknowledged after {} transmissions", self.id, transmissions);
            self.report_outcome(transmissions, true);
        }
        self.send_postponed(queue)
    }
}
