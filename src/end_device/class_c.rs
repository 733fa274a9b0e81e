//! Class C continuous reception.
//!
//! A Class C device listens whenever it is not transmitting or inside RX1/RX2.
//! Each receive cycle opens the continuous window up to three times: when the
//! uplink ends, when RX1 closes and when RX2 closes. The last opening stays
//! open until the next uplink. After boot the same three openings come from a
//! self-rescheduling event paced at the receive delays.

use embassy_time::Duration;

use crate::simulation::event_queue::EventQueue;
use crate::simulation::trace::TraceEvent;
use crate::simulation::types::Event;

use super::{EndDeviceMac, MacState};

impl EndDeviceMac {
    pub(super) fn start_continuous_listening(&mut self, queue: &mut EventQueue<Event>) {
        queue.cancel(self.continuous_window);
        self.continuous_window_count = 0;
        self.continuous_window_tick(queue);
    }

    /// Handler for `Event::OpenContinuousWindow`.
    pub fn continuous_window_tick(&mut self, queue: &mut EventQueue<Event>) {
        self.open_continuous_window();

        let offsets = [Duration::from_ticks(0), self.params.receive_delay1, self.params.receive_delay2];
        let count = self.continuous_window_count as usize;
        if count < offsets.len() {
            let delay = offsets[count].checked_sub(offsets[count - 1]).unwrap_or(Duration::from_ticks(0));
            self.continuous_window = queue.schedule(delay, Event::OpenContinuousWindow { device: self.id });
        }
    }

    pub(super) fn open_continuous_window(&mut self) {
        self.continuous_window_count += 1;
        if self.state != MacState::Receiving {
            self.set_state(MacState::ContinuousListening);
        }
        log::debug!("{}: continuous window opened ({} this cycle)", self.id, self.continuous_window_count);
        self.trace.emit(TraceEvent::ContinuousWindowOpened {
            device: self.id,
            count: self.continuous_window_count,
        });
    }
}
