//! Deterministic discrete-event queue.
//!
//! Events are keyed by `(tick, sequence)`. The sequence number grows with every
//! `schedule` call, so two events due at the same virtual time run in the
//! order they were enqueued. Cancelled events are removed from the map, which
//! makes `cancel` naturally idempotent.

use embassy_time::{Duration, Instant};
use std::collections::BTreeMap;

use crate::time_driver;

/// Handle to a scheduled event.
///
/// A default handle refers to nothing and is therefore always expired, which
/// lets components initialize their event slots without scheduling anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EventId {
    at: u64,
    seq: u64,
}

impl EventId {
    /// Virtual time the event was scheduled for.
    pub fn at(&self) -> Instant {
        Instant::from_ticks(self.at)
    }
}

pub struct EventQueue<E> {
    now: u64,
    // Sequence 0 is reserved for the default handle
    next_seq: u64,
    events: BTreeMap<(u64, u64), E>,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventQueue<E> {
    /// Create an empty queue at virtual time zero.
    ///
    /// The thread's time driver is rewound as well.
    pub fn new() -> Self {
        time_driver::reset();
        Self {
            now: 0,
            next_seq: 1,
            events: BTreeMap::new(),
        }
    }

    pub fn now(&self) -> Instant {
        Instant::from_ticks(self.now)
    }

    pub fn schedule(&mut self, delay: Duration, event: E) -> EventId {
        let at = self.now.saturating_add(delay.as_ticks());
        self.insert(at, event)
    }

    /// Schedule at an absolute time. Times in the past are clamped to now.
    pub fn schedule_at(&mut self, at: Instant, event: E) -> EventId {
        let at = at.as_ticks().max(self.now);
        self.insert(at, event)
    }

    fn insert(&mut self, at: u64, event: E) -> EventId {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.insert((at, seq), event);
        EventId { at, seq }
    }

    /// Cancel a pending event. Returns whether something was removed.
    pub fn cancel(&mut self, id: EventId) -> bool {
        self.events.remove(&(id.at, id.seq)).is_some()
    }

    pub fn is_pending(&self, id: EventId) -> bool {
        self.events.contains_key(&(id.at, id.seq))
    }

    /// Fired, cancelled, or never scheduled.
    pub fn is_expired(&self, id: EventId) -> bool {
        !self.is_pending(id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn next_event_time(&self) -> Option<Instant> {
        self.events.keys().next().map(|&(at, _)| Instant::from_ticks(at))
    }

    /// Remove the earliest event due strictly before `deadline` and advance
    /// the clock to its time.
    pub fn pop_until(&mut self, deadline: Instant) -> Option<(EventId, E)> {
        let (&(at, seq), _) = self.events.iter().next()?;
        if at >= deadline.as_ticks() {
            return None;
        }
        let event = self.events.remove(&(at, seq))?;
        self.set_now(at);
        Some((EventId { at, seq }, event))
    }

    /// Move the clock forward without running anything.
    pub fn advance_to(&mut self, at: Instant) {
        let at = at.as_ticks();
        if at > self.now {
            self.set_now(at);
        }
    }

    fn set_now(&mut self, at: u64) {
        self.now = at;
        time_driver::advance_to(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &mut EventQueue<&'static str>, deadline: Instant) -> Vec<(u64, &'static str)> {
        let mut fired = Vec::new();
        while let Some((_, event)) = queue.pop_until(deadline) {
            fired.push((queue.now().as_millis(), event));
        }
        fired
    }

    #[test]
    fn same_tick_events_run_in_enqueue_order() {
        let mut queue = EventQueue::new();
        queue.schedule(Duration::from_millis(10), "first");
        queue.schedule(Duration::from_millis(5), "earlier");
        queue.schedule(Duration::from_millis(10), "second");
        queue.schedule_at(Instant::from_millis(10), "third");

        let fired = drain(&mut queue, Instant::from_secs(1));
        assert_eq!(fired, vec![(5, "earlier"), (10, "first"), (10, "second"), (10, "third")]);
    }

    #[test]
    fn cancel_is_idempotent_and_tracks_expiry() {
        let mut queue = EventQueue::new();
        let id = queue.schedule(Duration::from_millis(10), "x");
        assert!(queue.is_pending(id));
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert!(queue.is_expired(id));
        assert!(drain(&mut queue, Instant::from_secs(1)).is_empty());
    }

    #[test]
    fn fired_and_default_handles_are_expired() {
        let mut queue = EventQueue::new();
        assert!(queue.is_expired(EventId::default()));
        assert!(!queue.cancel(EventId::default()));

        let id = queue.schedule(Duration::from_millis(1), "x");
        let (popped, _) = queue.pop_until(Instant::from_secs(1)).unwrap();
        assert_eq!(popped, id);
        assert!(queue.is_expired(id));
        assert!(!queue.cancel(id));
    }

    #[test]
    fn deadline_is_exclusive() {
        let mut queue = EventQueue::new();
        queue.schedule(Duration::from_secs(3), "at-stop");
        queue.schedule(Duration::from_secs(2), "before-stop");
        let fired = drain(&mut queue, Instant::from_secs(3));
        assert_eq!(fired, vec![(2000, "before-stop")]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn cancel_then_reschedule_fires_once_at_new_time() {
        let mut queue = EventQueue::new();
        let stale = queue.schedule(Duration::from_secs(1), "opportunity");
        queue.cancel(stale);
        queue.schedule(Duration::from_millis(1200), "opportunity");
        let fired = drain(&mut queue, Instant::from_secs(5));
        assert_eq!(fired, vec![(1200, "opportunity")]);
    }

    #[test]
    fn popping_moves_embassy_clock() {
        let mut queue = EventQueue::new();
        queue.schedule(Duration::from_millis(750), ());
        queue.pop_until(Instant::from_secs(1));
        assert_eq!(Instant::now(), Instant::from_millis(750));

        queue.advance_to(Instant::from_secs(2));
        assert_eq!(Instant::now(), Instant::from_secs(2));
        assert_eq!(queue.schedule(Duration::from_millis(0), ()).at(), Instant::from_secs(2));
    }

    #[test]
    fn schedule_at_in_the_past_clamps_to_now() {
        let mut queue: EventQueue<()> = EventQueue::new();
        queue.advance_to(Instant::from_secs(4));
        let id = queue.schedule_at(Instant::from_secs(1), ());
        assert_eq!(id.at(), Instant::from_secs(4));
        assert_eq!(queue.next_event_time(), Some(Instant::from_secs(4)));
    }
}
