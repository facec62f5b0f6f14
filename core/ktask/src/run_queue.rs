//! Priority run queue.

use alloc::collections::VecDeque;

use crate::{UnitRef, config::PRIORITY_LEVELS};

/// One FIFO bucket per priority plus a presence mask.
///
/// Bit `p` of the mask is set iff bucket `p` is non-empty, so picking the
/// next unit is a single bit scan. Only the owning CPU touches a queue.
pub struct RunQueue {
    buckets: [VecDeque<UnitRef>; PRIORITY_LEVELS],
    mask: u32,
    len: usize,
}

const _: () = assert!(PRIORITY_LEVELS <= u32::BITS as usize);

impl RunQueue {
    /// Creates an empty run queue.
    pub fn new() -> Self {
        Self {
            buckets: core::array::from_fn(|_| VecDeque::new()),
            mask: 0,
            len: 0,
        }
    }

    /// Appends `unit` to the tail of its priority bucket.
    pub fn enqueue(&mut self, unit: UnitRef) {
        let prio = unit.priority() as usize;
        self.buckets[prio].push_back(unit);
        self.mask |= 1 << prio;
        self.len += 1;
    }

    /// Pops the head of the highest non-empty bucket.
    ///
    /// # Panics
    ///
    /// Panics if the presence mask names a bucket that is empty.
    pub fn pick_next(&mut self) -> Option<UnitRef> {
        if self.mask == 0 {
            return None;
        }
        let prio = (u32::BITS - 1 - self.mask.leading_zeros()) as usize;
        let bucket = &mut self.buckets[prio];
        let Some(unit) = bucket.pop_front() else {
            panic!("run queue bucket {prio} flagged but empty");
        };
        if bucket.is_empty() {
            self.mask &= !(1 << prio);
        }
        self.len -= 1;
        Some(unit)
    }

    /// Removes `unit` from its bucket, returning whether it was queued.
    pub fn remove(&mut self, unit: &UnitRef) -> bool {
        let prio = unit.priority() as usize;
        let bucket = &mut self.buckets[prio];
        let Some(pos) = bucket.iter().position(|u| alloc::sync::Arc::ptr_eq(u, unit)) else {
            return false;
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            self.mask &= !(1 << prio);
        }
        self.len -= 1;
        true
    }

    /// Highest priority with a queued unit.
    pub fn highest_priority(&self) -> Option<u8> {
        (self.mask != 0).then(|| (u32::BITS - 1 - self.mask.leading_zeros()) as u8)
    }

    /// Presence bitmask; bit `p` set iff priority `p` has queued units.
    #[inline]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Number of queued units.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing is queued.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of units queued at `prio`.
    pub fn bucket_len(&self, prio: u8) -> usize {
        self.buckets[prio as usize].len()
    }
}

impl Default for RunQueue {
    fn default() -> Self {
        Self::new()
    }
}
