//! Radio time scheduler.
//!
//! A single half-duplex radio is multiplexed between advertising, scanning, and up to a handful
//! of connections. Each participant reserves a time slot `[start, end]` ahead of time; the
//! scheduler keeps the reservations disjoint and hands them out in chronological order.
//!
//! When a new reservation overlaps existing ones, a fixed priority order decides who keeps the
//! airtime: advertising beats connections beats scanning, and between two connections the one
//! that has gone longest without radio time wins. Losing reservations are *evicted* and
//! returned to the caller, which reschedules them before their slot would have started.
//!
//! All comparisons use signed wrapping arithmetic on [`Instant`]s, so slots scheduled across a
//! timer wraparound order correctly.
//!
//! [`Instant`]: ../../time/struct.Instant.html

use {
    crate::{link::ConnHandle, time::Instant, Error},
    heapless::{consts::*, Vec},
};

/// Maximum number of simultaneously reserved slots.
type Capacity = U8;

/// The participant owning a reserved time slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SchedOwner {
    /// The advertiser. Periodic advertising events must not be starved, so these reservations
    /// take precedence over everything else.
    Advertising,

    /// The scanner/initiator. Scanning is opportunistic background work and loses every
    /// conflict.
    Scanning,

    /// An established connection's next connection event.
    Connection(ConnHandle),
}

impl SchedOwner {
    fn priority(&self) -> u8 {
        match self {
            SchedOwner::Advertising => 2,
            SchedOwner::Connection(_) => 1,
            SchedOwner::Scanning => 0,
        }
    }
}

/// A reserved slice of radio time.
#[derive(Debug, Copy, Clone)]
pub struct ScheduleItem {
    pub owner: SchedOwner,

    /// First microsecond of the reservation (the anchor point, minus any RX window widening).
    pub start: Instant,

    /// Last microsecond of the reservation.
    pub end: Instant,

    /// When this owner last actually got radio time.
    ///
    /// Used as the fairness key between two connections competing for the same slot: the
    /// longest-starved connection wins.
    pub last_scheduled: Instant,
}

impl ScheduleItem {
    fn overlaps(&self, other: &ScheduleItem) -> bool {
        self.start.micros_until(other.end) > 0 && other.start.micros_until(self.end) > 0
    }

    /// Returns whether this reservation survives a conflict against `other`.
    fn beats(&self, other: &ScheduleItem) -> bool {
        let (own, theirs) = (self.owner.priority(), other.owner.priority());
        if own != theirs {
            return own > theirs;
        }

        // Connection against connection: strictly longer-starved wins, the incumbent keeps the
        // slot on a tie.
        self.last_scheduled.micros_until(other.last_scheduled) > 0
    }
}

/// Reservations cancelled by a successful insert, returned to the caller for rescheduling.
pub type Evicted = Vec<ScheduleItem, Capacity>;

/// Keeps upcoming radio reservations sorted and disjoint.
pub struct Scheduler {
    items: Vec<ScheduleItem, Capacity>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Reserves a time slot, evicting lower-priority overlapping reservations.
    ///
    /// On success, returns the reservations that lost their slot; the caller must reschedule
    /// each of them before `item.start`. If any overlapping reservation outranks the new one,
    /// or the schedule is full, nothing is modified and `Error::Exhausted` is returned.
    pub fn insert(&mut self, item: ScheduleItem) -> Result<Evicted, Error> {
        if self
            .items
            .iter()
            .any(|existing| item.overlaps(existing) && !item.beats(existing))
        {
            return Err(Error::Exhausted);
        }

        let mut evicted = Evicted::new();
        let mut i = 0;
        while i < self.items.len() {
            if item.overlaps(&self.items[i]) {
                // Vec::push can't fail here, eviction frees at least as many slots.
                evicted.push(self.items[i]).ok();
                self.remove_at(i);
            } else {
                i += 1;
            }
        }

        let insert_at = self
            .items
            .iter()
            .position(|existing| item.start.micros_until(existing.start) > 0)
            .unwrap_or_else(|| self.items.len());

        self.items.push(item).map_err(|_| Error::Exhausted)?;
        self.items[insert_at..].rotate_right(1);
        Ok(evicted)
    }

    /// Cancels all reservations held by `owner`.
    ///
    /// Removing an owner with no reservations is a no-op.
    pub fn remove(&mut self, owner: SchedOwner) {
        let mut i = 0;
        while i < self.items.len() {
            if self.items[i].owner == owner {
                self.remove_at(i);
            } else {
                i += 1;
            }
        }
    }

    /// Takes the earliest reservation whose slot has begun at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<ScheduleItem> {
        if self.items.first()?.start.is_before_or_at(now) {
            let item = self.items[0];
            self.remove_at(0);
            Some(item)
        } else {
            None
        }
    }

    /// Returns the start of the earliest reservation, which is when the radio is needed next.
    pub fn next_time(&self) -> Option<Instant> {
        self.items.first().map(|item| item.start)
    }

    /// Returns the start of the earliest reservation *not* held by `owner`.
    ///
    /// This is the deadline by which `owner`, once on the air, has to hand the radio back.
    pub fn next_time_for_other(&self, owner: SchedOwner) -> Option<Instant> {
        self.items
            .iter()
            .find(|item| item.owner != owner)
            .map(|item| item.start)
    }

    /// Returns whether `owner` currently holds a reservation.
    pub fn contains(&self, owner: SchedOwner) -> bool {
        self.items.iter().any(|item| item.owner == owner)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Removes the item at `i`, keeping the remaining items in order.
    fn remove_at(&mut self, i: usize) {
        self.items[i..].rotate_left(1);
        self.items.pop();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(micros: u32) -> Instant {
        Instant::from_raw_micros(micros)
    }

    fn conn(handle: u16) -> SchedOwner {
        SchedOwner::Connection(ConnHandle::new(handle))
    }

    fn item(owner: SchedOwner, start: u32, end: u32, last: u32) -> ScheduleItem {
        ScheduleItem {
            owner,
            start: t(start),
            end: t(end),
            last_scheduled: t(last),
        }
    }

    #[test]
    fn pops_in_chronological_order() {
        let mut sched = Scheduler::new();
        sched.insert(item(conn(1), 3_000, 4_000, 0)).unwrap();
        sched.insert(item(conn(0), 1_000, 2_000, 0)).unwrap();
        sched.insert(item(SchedOwner::Advertising, 5_000, 6_000, 0)).unwrap();

        assert_eq!(sched.next_time(), Some(t(1_000)));
        assert!(sched.pop_due(t(500)).is_none());
        assert_eq!(sched.pop_due(t(1_000)).unwrap().owner, conn(0));
        assert_eq!(sched.pop_due(t(10_000)).unwrap().owner, conn(1));
        assert_eq!(
            sched.pop_due(t(10_000)).unwrap().owner,
            SchedOwner::Advertising
        );
        assert!(sched.is_empty());
    }

    #[test]
    fn ordering_survives_timer_wraparound() {
        let mut sched = Scheduler::new();
        let before_wrap = u32::max_value() - 1_000;
        sched.insert(item(conn(1), 500, 1_500, 0)).unwrap();
        sched.insert(item(conn(0), before_wrap, before_wrap + 500, 0)).unwrap();

        // The pre-wrap slot is "earlier" than the post-wrap one.
        assert_eq!(sched.next_time(), Some(t(before_wrap)));
        assert_eq!(sched.pop_due(t(before_wrap)).unwrap().owner, conn(0));
        assert_eq!(sched.pop_due(t(600)).unwrap().owner, conn(1));
    }

    #[test]
    fn advertising_evicts_connection() {
        let mut sched = Scheduler::new();
        sched.insert(item(conn(0), 1_000, 2_000, 0)).unwrap();

        let evicted = sched
            .insert(item(SchedOwner::Advertising, 1_500, 2_500, 0))
            .unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].owner, conn(0));
        assert!(!sched.contains(conn(0)));
        assert!(sched.contains(SchedOwner::Advertising));
    }

    #[test]
    fn connection_cannot_evict_advertising() {
        let mut sched = Scheduler::new();
        sched
            .insert(item(SchedOwner::Advertising, 1_000, 2_000, 0))
            .unwrap();
        assert_eq!(
            sched.insert(item(conn(0), 1_500, 2_500, 0)).unwrap_err(),
            Error::Exhausted
        );
        assert!(sched.contains(SchedOwner::Advertising));
    }

    #[test]
    fn starved_connection_wins_conflict() {
        let mut sched = Scheduler::new();
        // Connection 0 got radio time recently, connection 1 has been waiting longer.
        sched.insert(item(conn(0), 1_000, 2_000, 900)).unwrap();
        let evicted = sched.insert(item(conn(1), 1_500, 2_500, 100)).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].owner, conn(0));

        // The reverse does not hold: a recently served connection loses.
        let mut sched = Scheduler::new();
        sched.insert(item(conn(1), 1_000, 2_000, 100)).unwrap();
        assert!(sched.insert(item(conn(0), 1_500, 2_500, 900)).is_err());
    }

    #[test]
    fn disjoint_slots_all_coexist() {
        let mut sched = Scheduler::new();
        sched.insert(item(conn(0), 1_000, 2_000, 0)).unwrap();
        let evicted = sched.insert(item(conn(1), 2_000, 3_000, 0)).unwrap();
        assert!(evicted.is_empty());
        assert!(sched.contains(conn(0)));
        assert!(sched.contains(conn(1)));
    }

    #[test]
    fn next_time_skips_own_reservations() {
        let mut sched = Scheduler::new();
        sched.insert(item(conn(0), 1_000, 2_000, 0)).unwrap();
        sched.insert(item(conn(1), 3_000, 4_000, 0)).unwrap();

        assert_eq!(sched.next_time_for_other(conn(0)), Some(t(3_000)));
        assert_eq!(sched.next_time_for_other(conn(1)), Some(t(1_000)));
        assert_eq!(sched.next_time_for_other(SchedOwner::Advertising), Some(t(1_000)));
        assert_eq!(Scheduler::new().next_time_for_other(conn(0)), None);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut sched = Scheduler::new();
        sched.insert(item(conn(0), 1_000, 2_000, 0)).unwrap();
        sched.remove(conn(0));
        sched.remove(conn(0));
        assert!(sched.is_empty());
    }

    #[test]
    fn scanning_loses_to_everything() {
        let mut sched = Scheduler::new();
        sched
            .insert(item(SchedOwner::Scanning, 1_000, 2_000, 0))
            .unwrap();
        let evicted = sched.insert(item(conn(0), 1_200, 2_200, 0)).unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].owner, SchedOwner::Scanning);
    }
}
