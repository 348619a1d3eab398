//! Bandwidth throttle.
//!
//! Byte accounting against a fixed ceiling. The window never rolls over on
//! its own; only [`BandwidthThrottle::reset`] clears it.

use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthThrottle {
    max_bytes_per_window: u64,
    spent_this_window: u64,
}

impl BandwidthThrottle {
    pub fn new(max_bytes_per_window: u64) -> Self {
        Self {
            max_bytes_per_window,
            spent_this_window: 0,
        }
    }

    /// Reserves `n_bytes` if they fit in what is left of the window.
    /// A rejection leaves the counter untouched.
    pub fn try_reserve(&mut self, n_bytes: usize) -> bool {
        let n = n_bytes as u64;
        match self.spent_this_window.checked_add(n) {
            Some(total) if total <= self.max_bytes_per_window => {
                self.spent_this_window = total;
                true
            }
            _ => {
                trace!(
                    requested = n,
                    spent = self.spent_this_window,
                    limit = self.max_bytes_per_window,
                    "Bandwidth reservation rejected"
                );
                false
            }
        }
    }

    pub fn reset(&mut self) {
        self.spent_this_window = 0;
    }

    pub fn spent(&self) -> u64 {
        self.spent_this_window
    }

    pub fn remaining(&self) -> u64 {
        self.max_bytes_per_window.saturating_sub(self.spent_this_window)
    }

    pub fn limit(&self) -> u64 {
        self.max_bytes_per_window
    }

    /// Changing the limit keeps what was already spent.
    pub fn set_limit(&mut self, max_bytes_per_window: u64) {
        self.max_bytes_per_window = max_bytes_per_window;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_request_rejected() {
        let mut t = BandwidthThrottle::new(10);
        assert!(!t.try_reserve(36));
        assert_eq!(t.spent(), 0);
    }

    #[test]
    fn exhaustion_persists_until_reset() {
        let mut t = BandwidthThrottle::new(72);
        assert!(t.try_reserve(36));
        assert!(t.try_reserve(36));
        assert!(!t.try_reserve(1));
        assert_eq!(t.remaining(), 0);
        t.reset();
        assert!(t.try_reserve(36));
        assert_eq!(t.spent(), 36);
    }

    #[test]
    fn zero_byte_reservation_always_fits() {
        let mut t = BandwidthThrottle::new(0);
        assert!(t.try_reserve(0));
    }
}
