//! Per-job deadline timer over the wrapping microsecond tick domain.

use docan_common::time;

/// A single one-shot deadline. Entities carrying a timer are kept sorted
/// by `(is_set, expiry)` with unset timers ordering last.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct DeadlineTimer {
    expiry_us: u32,
    is_set: bool,
}

impl DeadlineTimer {
    pub(crate) fn set(&mut self, expiry_us: u32) {
        self.expiry_us = expiry_us;
        self.is_set = true;
    }

    pub(crate) fn is_set(&self) -> bool {
        self.is_set
    }

    /// Whether the deadline has been reached, regardless of the set flag.
    pub(crate) fn expired(&self, now_us: u32) -> bool {
        time::less_or_equal(self.expiry_us, now_us)
    }

    /// Clears the set flag and reports `true` exactly once when the
    /// deadline is reached.
    pub(crate) fn update(&mut self, now_us: u32) -> bool {
        if self.is_set && self.expired(now_us) {
            self.is_set = false;
            return true;
        }
        false
    }

    /// Ordering for the expiry sorted job lists: a set timer sorts before
    /// an unset one, two set timers by wrap-aware expiry.
    pub(crate) fn is_before(&self, other: &DeadlineTimer) -> bool {
        if !self.is_set {
            return false;
        }
        if !other.is_set {
            return true;
        }
        time::less(self.expiry_us, other.expiry_us)
    }
}
