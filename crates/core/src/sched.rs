//! Peripheral event scheduler.
//!
//! Each peripheral owns one slot identified by an [`EventTag`]; scheduling
//! the same tag again keeps the earlier of the two due cycles. Peripherals
//! recompute their next due cycle on every register write and reschedule,
//! so a too-early entry only costs one extra update call, never a missed
//! one. The engine peeks the global minimum with [`Scheduler::next_cycle`]
//! to know how far it may run (or sleep) without consulting peripherals.

pub use crate::peripherals::EventTag;

const NUM_TAGS: usize = EventTag::COUNT;

/// Fixed-capacity event queue: one pending due cycle per tag.
pub struct Scheduler {
    cycles: [u64; NUM_TAGS],
    /// Bit n set = tag n has a live entry
    live: u32,
    /// Cached index of the earliest live entry, or NUM_TAGS if empty
    least: usize,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            cycles: [u64::MAX; NUM_TAGS],
            live: 0,
            least: NUM_TAGS,
        }
    }

    pub fn clear(&mut self) {
        *self = Scheduler::new();
    }

    /// Insert-or-keep-earliest: the tag's entry becomes
    /// min(existing, cycle).
    pub fn schedule(&mut self, cycle: u64, tag: EventTag) {
        let i = tag as usize;
        if self.live & (1 << i) != 0 && self.cycles[i] <= cycle {
            return;
        }
        self.cycles[i] = cycle;
        self.live |= 1 << i;
        if self.least >= NUM_TAGS || cycle < self.cycles[self.least] {
            self.least = i;
        }
    }

    /// Earliest live entry, if any.
    pub fn next(&self) -> Option<(u64, EventTag)> {
        if self.least < NUM_TAGS {
            Some((self.cycles[self.least], EventTag::from_index(self.least)))
        } else {
            None
        }
    }

    /// Due cycle of the earliest live entry; u64::MAX when empty.
    pub fn next_cycle(&self) -> u64 {
        if self.least < NUM_TAGS {
            self.cycles[self.least]
        } else {
            u64::MAX
        }
    }

    /// Remove and return the earliest live entry.
    pub fn pop(&mut self) -> Option<(u64, EventTag)> {
        let (cycle, tag) = self.next()?;
        self.cycles[self.least] = u64::MAX;
        self.live &= !(1 << self.least);
        self.recompute_least();
        Some((cycle, tag))
    }

    /// Drop every entry due strictly before `cycle`. Used after reset and
    /// after restoring a save state so stale entries from the previous run
    /// cannot fire.
    pub fn clear_to_cycle(&mut self, cycle: u64) {
        for i in 0..NUM_TAGS {
            if self.live & (1 << i) != 0 && self.cycles[i] < cycle {
                self.cycles[i] = u64::MAX;
                self.live &= !(1 << i);
            }
        }
        self.recompute_least();
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn recompute_least(&mut self) {
        let mut least = NUM_TAGS;
        let mut best = u64::MAX;
        for i in 0..NUM_TAGS {
            if self.live & (1 << i) != 0 && self.cycles[i] < best {
                best = self.cycles[i];
                least = i;
            }
        }
        self.least = least;
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

    #[test]
    fn test_empty_queue() {
        let q = Scheduler::new();
        assert!(q.is_empty());
        assert_eq!(q.next_cycle(), u64::MAX);
        assert!(q.next().is_none());
    }

    #[test]
    fn test_pop_order() {
        let mut q = Scheduler::new();
        q.schedule(300, EventTag::Spi);
        q.schedule(100, EventTag::Timer1);
        q.schedule(200, EventTag::Eeprom);
        assert_eq!(q.pop(), Some((100, EventTag::Timer1)));
        assert_eq!(q.pop(), Some((200, EventTag::Eeprom)));
        assert_eq!(q.pop(), Some((300, EventTag::Spi)));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_one_entry_per_tag() {
        let mut q = Scheduler::new();
        q.schedule(500, EventTag::Timer0);
        q.schedule(400, EventTag::Timer0);
        q.schedule(600, EventTag::Timer0);
        // keeps the earliest
        assert_eq!(q.pop(), Some((400, EventTag::Timer0)));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_pop_always_minimal() {
        // pseudo-random schedule sequence, pop must always return the
        // minimum among live tags
        let mut q = Scheduler::new();
        let mut seed = 0x12345678u32;
        let mut rng = || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };
        for _ in 0..200 {
            let tag = EventTag::from_index(rng() as usize % EventTag::COUNT);
            q.schedule((rng() % 10000) as u64, tag);
        }
        let mut prev = 0u64;
        while let Some((c, _)) = q.pop() {
            assert!(c >= prev);
            prev = c;
        }
    }

    #[test]
    fn test_clear_to_cycle() {
        let mut q = Scheduler::new();
        q.schedule(10, EventTag::Timer0);
        q.schedule(20, EventTag::Timer1);
        q.schedule(30, EventTag::Adc);
        q.clear_to_cycle(25);
        assert_eq!(q.pop(), Some((30, EventTag::Adc)));
        assert!(q.pop().is_none());
    }
}
