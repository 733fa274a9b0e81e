//! Virtual time driver for embassy-time.
//!
//! The simulation never looks at the host clock. The event queue owns the
//! virtual timeline and pushes every advance into this driver, so that
//! `embassy_time::Instant::now()` reports simulated time wherever it is read.
//!
//! State is thread-local: every simulation (and every test thread) runs on its
//! own timeline.

use core::task::Waker;
use embassy_time_driver::{Driver, time_driver_impl};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

thread_local! {
    // Current virtual time in embassy ticks
    static VIRTUAL_NOW: Cell<u64> = const { Cell::new(0) };
    // Map of virtual-timestamp -> list of wakers
    static PENDING_WAKERS: RefCell<BTreeMap<u64, Vec<Waker>>> = RefCell::new(BTreeMap::new());
}

/// Current virtual time in ticks.
pub fn now_ticks() -> u64 {
    VIRTUAL_NOW.with(|now| now.get())
}

/// Rewind the timeline to zero and forget every registered waker.
pub fn reset() {
    VIRTUAL_NOW.with(|now| now.set(0));
    PENDING_WAKERS.with(|queue| queue.borrow_mut().clear());
}

/// Move virtual time forward and wake everything that became due.
///
/// Requests to move backwards are ignored; the timeline is monotonic.
pub fn advance_to(ticks: u64) {
    let current = now_ticks();
    if ticks < current {
        log::warn!("Ignoring attempt to move virtual time backwards ({} -> {})", current, ticks);
        return;
    }
    VIRTUAL_NOW.with(|now| now.set(ticks));

    // Collect under the borrow, wake outside it (a waker may schedule again)
    let ready: Vec<Waker> = PENDING_WAKERS.with(|queue| {
        let mut queue = queue.borrow_mut();
        let later = queue.split_off(&(ticks + 1));
        let due = std::mem::replace(&mut *queue, later);
        due.into_values().flatten().collect()
    });
    for waker in ready {
        waker.wake();
    }
}

/// Number of wakers still waiting for a future deadline.
pub fn pending_wakers() -> usize {
    PENDING_WAKERS.with(|queue| queue.borrow().values().map(Vec::len).sum())
}

struct VirtualDriver;

impl Driver for VirtualDriver {
    fn now(&self) -> u64 {
        now_ticks()
    }

    fn schedule_wake(&self, at: u64, waker: &Waker) {
        if at <= now_ticks() {
            waker.wake_by_ref();
            return;
        }
        PENDING_WAKERS.with(|queue| queue.borrow_mut().entry(at).or_default().push(waker.clone()));
    }
}

// Register as the global time driver for embassy-time
time_driver_impl!(static DRIVER: VirtualDriver = VirtualDriver);

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_time::{Duration, Instant};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct CountingWaker(AtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Arc<CountingWaker>, Waker) {
        let inner = Arc::new(CountingWaker(AtomicUsize::new(0)));
        (inner.clone(), Waker::from(inner))
    }

    #[test]
    fn instant_now_follows_virtual_clock() {
        reset();
        assert_eq!(Instant::now().as_ticks(), 0);
        let target = Instant::from_millis(1500);
        advance_to(target.as_ticks());
        assert_eq!(Instant::now(), target);
        assert_eq!(Instant::now().as_millis(), 1500);
    }

    #[test]
    fn wakers_fire_only_when_due() {
        reset();
        let (counter, waker) = counting_waker();
        let deadline = Duration::from_secs(2).as_ticks();
        DRIVER.schedule_wake(deadline, &waker);
        assert_eq!(pending_wakers(), 1);

        advance_to(deadline - 1);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        advance_to(deadline);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(pending_wakers(), 0);
    }

    #[test]
    fn past_deadline_wakes_immediately() {
        reset();
        advance_to(1_000);
        let (counter, waker) = counting_waker();
        DRIVER.schedule_wake(500, &waker);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(pending_wakers(), 0);
    }

    #[test]
    fn time_never_moves_backwards() {
        reset();
        advance_to(5_000);
        advance_to(10);
        assert_eq!(now_ticks(), 5_000);
    }
}
