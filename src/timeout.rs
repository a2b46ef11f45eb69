use std::collections::BTreeSet;
use std::sync::Arc;

use axerrno::{ax_err, AxResult};
use parking_lot::Mutex;

use crate::hal::{Clock, HostTimer};
use crate::message::DeviceBus;

/// Number of timeout slots available to device models.
pub const TIMEOUT_SLOTS: usize = 32;

/// How long a timeout requested in the past is held back after the host
/// timer fired for it, in milliseconds.
pub const LATE_WINDOW_MS: u64 = 1;

/// A fixed pool of one-shot timeout slots ordered by deadline.
///
/// Slot ids start at 1.
#[derive(Debug)]
pub struct TimeoutList {
    allocated: usize,
    deadlines: [Option<u64>; TIMEOUT_SLOTS],
    pending: BTreeSet<(u64, usize)>,
}

impl TimeoutList {
    pub const fn new() -> Self {
        Self {
            allocated: 0,
            deadlines: [None; TIMEOUT_SLOTS],
            pending: BTreeSet::new(),
        }
    }

    /// Hands out the next unused slot id.
    pub fn alloc(&mut self) -> Option<usize> {
        if self.allocated == TIMEOUT_SLOTS {
            return None;
        }
        self.allocated += 1;
        Some(self.allocated)
    }

    fn index(&self, nr: usize) -> AxResult<usize> {
        if nr == 0 || nr > self.allocated {
            return ax_err!(InvalidInput, format!("invalid timeout slot {}", nr));
        }
        Ok(nr - 1)
    }

    /// Arms slot `nr` for `deadline`, replacing an earlier request.
    ///
    /// Returns whether the slot is now the earliest pending one.
    pub fn request(&mut self, nr: usize, deadline: u64) -> AxResult<bool> {
        let index = self.index(nr)?;
        if let Some(old) = self.deadlines[index].replace(deadline) {
            self.pending.remove(&(old, nr));
        }
        self.pending.insert((deadline, nr));
        Ok(self.pending.first() == Some(&(deadline, nr)))
    }

    /// Disarms slot `nr`. Returns whether it was pending.
    pub fn cancel(&mut self, nr: usize) -> AxResult<bool> {
        let index = self.index(nr)?;
        Ok(match self.deadlines[index].take() {
            Some(deadline) => self.pending.remove(&(deadline, nr)),
            None => false,
        })
    }

    /// The earliest slot whose deadline is not after `now`.
    pub fn trigger(&self, now: u64) -> Option<usize> {
        self.pending
            .first()
            .filter(|(deadline, _)| *deadline <= now)
            .map(|(_, nr)| *nr)
    }

    /// The earliest pending deadline, `u64::MAX` if none.
    pub fn timeout(&self) -> u64 {
        self.pending.first().map_or(u64::MAX, |(deadline, _)| *deadline)
    }
}

impl Default for TimeoutList {
    fn default() -> Self {
        Self::new()
    }
}

/// The head request that last reprogrammed the host timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LateTimeout {
    nr: usize,
    deadline: u64,
    issued: u64,
    until: u64,
}

impl LateTimeout {
    pub fn new(clock: &dyn Clock, nr: usize, deadline: u64) -> Self {
        let issued = clock.now();
        Self {
            nr,
            deadline,
            issued,
            until: clock.abstime(LATE_WINDOW_MS, 1000),
        }
    }

    /// Whether firing slot `nr` at `now` has to be postponed: the slot was
    /// requested with a deadline already in the past and the host timer
    /// fired within the late window of that request.
    pub fn apply(&self, nr: usize, now: u64) -> bool {
        self.nr == nr && self.deadline <= self.issued && now < self.until
    }
}

/// Multiplexes the timeout slots of all device models onto one host timer.
pub struct Timeouts {
    list: Mutex<TimeoutList>,
    late: Mutex<Option<LateTimeout>>,
    timer: Arc<dyn HostTimer>,
    clock: Arc<dyn Clock>,
}

impl Timeouts {
    pub fn new(timer: Arc<dyn HostTimer>, clock: Arc<dyn Clock>) -> Self {
        Self {
            list: Mutex::new(TimeoutList::new()),
            late: Mutex::new(None),
            timer,
            clock,
        }
    }

    pub fn alloc(&self) -> AxResult<usize> {
        match self.list.lock().alloc() {
            Some(nr) => Ok(nr),
            None => ax_err!(NoMemory, "timeout slots exhausted"),
        }
    }

    /// Arms slot `nr` for absolute clock time `abstime` and reprograms the
    /// host timer if it became the earliest deadline.
    pub fn request(&self, nr: usize, abstime: u64) -> AxResult {
        let head = self.list.lock().request(nr, abstime)?;
        if head {
            *self.late.lock() = Some(LateTimeout::new(self.clock.as_ref(), nr, abstime));
            self.program(abstime)?;
        }
        Ok(())
    }

    pub fn cancel(&self, nr: usize) -> AxResult<bool> {
        self.list.lock().cancel(nr)
    }

    /// Earliest pending deadline, `u64::MAX` if none.
    pub fn next_deadline(&self) -> u64 {
        self.list.lock().timeout()
    }

    fn program(&self, abstime: u64) -> AxResult {
        let us = self.clock.delta(abstime, 1_000_000).max(1);
        trace!("host timer in {} us", us);
        self.timer.trigger_once(us)
    }

    /// Host-timer callback: reports every expired slot to `bus` in deadline
    /// order and rearms the host timer for the next pending deadline.
    pub fn check_timeouts(&self, bus: &dyn DeviceBus) -> AxResult {
        let next = self.check_and_wakeup(bus);
        if next == u64::MAX {
            return Ok(());
        }
        self.program(next)
    }

    fn check_and_wakeup(&self, bus: &dyn DeviceBus) -> u64 {
        let late = self.late.lock().take();
        let now = self.clock.now();
        let mut fired = 0;

        loop {
            // the list lock is not held while the bus runs, device models
            // request new timeouts from within their handlers
            let (nr, deadline) = {
                let mut list = self.list.lock();
                let Some(nr) = list.trigger(now) else {
                    return list.timeout();
                };
                if fired == 0 && late.is_some_and(|late| late.apply(nr, now)) {
                    return self.clock.abstime(1, 1000);
                }
                let deadline = list.timeout();
                if !matches!(list.cancel(nr), Ok(true)) {
                    warn!("timeout {} not cancelled", nr);
                }
                (nr, deadline)
            };

            bus.timeout(nr, deadline);
            fired += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::mock::{MockBus, MockClock, MockHostTimer};
    use axerrno::AxError;

    fn timeouts() -> (Timeouts, Arc<MockClock>, Arc<MockHostTimer>) {
        // one tick per microsecond
        let clock = Arc::new(MockClock::new(1_000_000));
        let timer = Arc::new(MockHostTimer::default());
        (Timeouts::new(timer.clone(), clock.clone()), clock, timer)
    }

    #[test]
    fn list_orders_by_deadline() {
        let mut list = TimeoutList::new();
        let a = list.alloc().unwrap();
        let b = list.alloc().unwrap();
        assert_eq!((a, b), (1, 2));

        assert_eq!(list.timeout(), u64::MAX);
        assert_eq!(list.request(a, 100), Ok(true));
        assert_eq!(list.request(b, 200), Ok(false));
        assert_eq!(list.timeout(), 100);

        // re-request replaces the old deadline
        assert_eq!(list.request(b, 50), Ok(true));
        assert_eq!(list.trigger(49), None);
        assert_eq!(list.trigger(60), Some(b));
        assert_eq!(list.cancel(b), Ok(true));
        assert_eq!(list.cancel(b), Ok(false));
        assert_eq!(list.trigger(60), None);
        assert_eq!(list.trigger(100), Some(a));
    }

    #[test]
    fn list_rejects_unknown_slots() {
        let mut list = TimeoutList::new();
        assert_eq!(list.request(1, 10), Err(AxError::InvalidInput));
        for _ in 0..TIMEOUT_SLOTS {
            assert!(list.alloc().is_some());
        }
        assert_eq!(list.alloc(), None);
        assert_eq!(list.request(0, 10), Err(AxError::InvalidInput));
        assert_eq!(list.request(TIMEOUT_SLOTS + 1, 10), Err(AxError::InvalidInput));
    }

    #[test]
    fn earlier_request_reprograms_once() {
        let (timeouts, clock, timer) = timeouts();
        clock.set(1000);
        let nr = timeouts.alloc().unwrap();
        let other = timeouts.alloc().unwrap();

        timeouts.request(nr, 11_000).unwrap();
        assert_eq!(timer.programmed(), vec![10_000]);

        // a later deadline leaves the host timer alone
        timeouts.request(other, 20_000).unwrap();
        assert_eq!(timer.programmed(), vec![10_000]);

        timeouts.request(nr, 6_000).unwrap();
        assert_eq!(timer.programmed(), vec![10_000, 5_000]);
    }

    #[test]
    fn expired_slots_fire_in_order() {
        let (timeouts, clock, timer) = timeouts();
        let bus = MockBus::default();
        let a = timeouts.alloc().unwrap();
        let b = timeouts.alloc().unwrap();
        let c = timeouts.alloc().unwrap();

        clock.set(100);
        timeouts.request(b, 300).unwrap();
        timeouts.request(a, 200).unwrap();
        timeouts.request(c, 900).unwrap();

        clock.set(400);
        timeouts.check_timeouts(&bus).unwrap();

        assert_eq!(bus.timeouts(), vec![(a, 200), (b, 300)]);
        assert_eq!(timeouts.next_deadline(), 900);
        assert_eq!(timer.programmed().last(), Some(&500));

        clock.set(1000);
        timeouts.check_timeouts(&bus).unwrap();
        assert_eq!(bus.timeouts().len(), 3);
        assert_eq!(timeouts.next_deadline(), u64::MAX);
    }

    #[test]
    fn cancelled_slot_does_not_fire() {
        let (timeouts, clock, _) = timeouts();
        let bus = MockBus::default();
        let a = timeouts.alloc().unwrap();
        let b = timeouts.alloc().unwrap();

        clock.set(100);
        timeouts.request(a, 200).unwrap();
        timeouts.request(b, 300).unwrap();
        assert_eq!(timeouts.cancel(a), Ok(true));
        assert_eq!(timeouts.cancel(a), Ok(false));
        assert_eq!(timeouts.next_deadline(), 300);

        clock.set(400);
        timeouts.check_timeouts(&bus).unwrap();
        assert_eq!(bus.timeouts(), vec![(b, 300)]);
        assert_eq!(timeouts.cancel(7), Err(AxError::InvalidInput));
    }

    #[test]
    fn late_request_is_held_back_once() {
        let (timeouts, clock, timer) = timeouts();
        let bus = MockBus::default();
        let nr = timeouts.alloc().unwrap();

        clock.set(5000);
        timeouts.request(nr, 4000).unwrap();
        assert_eq!(timer.programmed(), vec![1]);

        clock.set(5001);
        timeouts.check_timeouts(&bus).unwrap();
        assert!(bus.timeouts().is_empty());
        assert_eq!(timer.programmed().last(), Some(&1000));

        clock.set(6001);
        timeouts.check_timeouts(&bus).unwrap();
        assert_eq!(bus.timeouts(), vec![(nr, 4000)]);
    }
}
