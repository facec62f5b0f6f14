//! Bounded exponential backoff for contended lock words.

use core::hint::spin_loop;

/// Upper bound on the number of pause instructions issued per step.
const BACKOFF_LIMIT: u32 = 1000;

/// Exponential spin backoff.
///
/// Each call to [`Backoff::spin`] pauses for the current step count and then
/// doubles it, saturating at a fixed ceiling so a waiter keeps polling the
/// lock word often enough to notice a release.
#[derive(Debug)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    /// Creates a backoff starting at a single pause.
    #[inline]
    pub const fn new() -> Self {
        Self { step: 1 }
    }

    /// Pauses, then widens the next pause.
    #[inline]
    pub fn spin(&mut self) {
        for _ in 0..self.step {
            spin_loop();
        }
        self.step = (self.step << 1).min(BACKOFF_LIMIT);
    }

    /// Whether the ceiling has been reached.
    #[inline]
    pub fn is_saturated(&self) -> bool {
        self.step >= BACKOFF_LIMIT
    }

    /// Starts over from a single pause.
    #[inline]
    pub fn reset(&mut self) {
        self.step = 1;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
