use embassy_time::Duration;
use rand::Rng;

/// Sends a fixed-size payload every `period`.
///
/// The first send happens after a random offset within one period so that
/// devices started together do not transmit in lockstep.
#[derive(Debug, Clone)]
pub struct PeriodicSender {
    period: Duration,
    packet_size: usize,
    sent: u32,
}

impl PeriodicSender {
    pub fn new(period: Duration, packet_size: usize) -> Self {
        Self {
            period,
            packet_size,
            sent: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn initial_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Duration::from_ticks(rng.gen_range(0..self.period.as_ticks().max(1)))
    }

    /// Payload for the next send; bytes carry the low byte of the send count.
    pub fn next_payload(&mut self) -> Vec<u8> {
        let fill = self.sent as u8;
        self.sent = self.sent.wrapping_add(1);
        vec![fill; self.packet_size]
    }
}
