use embassy_time::Instant;

use crate::lorawan::Packet;

/// Bookkeeping for the confirmed uplink currently waiting for an ack.
#[derive(Debug, Clone, Default)]
pub struct RetransmissionParameters {
    pub waiting_ack: bool,
    /// Transmissions still allowed; decremented by every send of the packet.
    pub retx_left: u8,
    pub first_attempt: Option<Instant>,
    pub packet: Option<Packet>,
}

impl RetransmissionParameters {
    pub fn start(&mut self, packet: Packet, max_transmissions: u8, now: Instant) {
        self.waiting_ack = true;
        self.retx_left = max_transmissions;
        self.first_attempt = Some(now);
        self.packet = Some(packet);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn consume_attempt(&mut self) {
        self.retx_left = self.retx_left.saturating_sub(1);
    }

    pub fn can_retry(&self) -> bool {
        self.waiting_ack && self.retx_left > 0 && self.packet.is_some()
    }

    pub fn transmissions_used(&self, max_transmissions: u8) -> u8 {
        max_transmissions.saturating_sub(self.retx_left)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempts_count_down_without_underflow() {
        let mut retx = RetransmissionParameters::default();
        retx.start(Packet::new(vec![1, 2, 3]), 2, Instant::from_secs(1));
        retx.consume_attempt();
        assert!(retx.can_retry());
        assert_eq!(retx.transmissions_used(2), 1);

        retx.consume_attempt();
        retx.consume_attempt();
        assert_eq!(retx.retx_left, 0);
        assert!(!retx.can_retry());
        assert_eq!(retx.transmissions_used(2), 2);
    }

    #[test]
    fn reset_clears_everything() {
        let mut retx = RetransmissionParameters::default();
        retx.start(Packet::new(vec![9]), 8, Instant::from_secs(4));
        retx.reset();
        assert!(!retx.waiting_ack);
        assert_eq!(retx.retx_left, 0);
        assert!(retx.first_attempt.is_none());
        assert!(retx.packet.is_none());
    }
}
