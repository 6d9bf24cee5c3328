//! Coordination flags shared between the cellular state machine and the
//! network interface manager.
//!
//! Requests are consumed with an atomic swap so each one is acted on exactly
//! once; a request raised while another is pending merges into it.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct CellularFlags {
    scan_in_progress:     AtomicBool,
    link_reset_requested: AtomicBool,
    rescan_requested:     AtomicBool,
    ready:                AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlagSnapshot {
    pub scan_in_progress:     bool,
    pub link_reset_requested: bool,
    pub rescan_requested:     bool,
    pub ready:                bool,
}

impl CellularFlags {
    pub fn scanning(&self) -> bool {
        self.scan_in_progress.load(Ordering::Acquire)
    }

    pub fn set_scanning(&self, on: bool) {
        self.scan_in_progress.store(on, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, on: bool) {
        self.ready.store(on, Ordering::Release);
    }

    /// Raise a rescan request.  Returns `false` if one was already pending.
    pub fn request_rescan(&self) -> bool {
        !self.rescan_requested.swap(true, Ordering::AcqRel)
    }

    pub fn rescan_requested(&self) -> bool {
        self.rescan_requested.load(Ordering::Acquire)
    }

    /// Consume a pending rescan request.
    pub fn take_rescan_request(&self) -> bool {
        self.rescan_requested.swap(false, Ordering::AcqRel)
    }

    pub fn request_link_reset(&self) -> bool {
        !self.link_reset_requested.swap(true, Ordering::AcqRel)
    }

    pub fn link_reset_requested(&self) -> bool {
        self.link_reset_requested.load(Ordering::Acquire)
    }

    pub fn take_link_reset(&self) -> bool {
        self.link_reset_requested.swap(false, Ordering::AcqRel)
    }

    pub fn snapshot(&self) -> FlagSnapshot {
        FlagSnapshot {
            scan_in_progress:     self.scanning(),
            link_reset_requested: self.link_reset_requested(),
            rescan_requested:     self.rescan_requested(),
            ready:                self.is_ready(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn request_is_consumed_exactly_once() {
        let f = CellularFlags::default();
        assert!(f.request_rescan());
        assert!(!f.request_rescan());
        assert!(f.take_rescan_request());
        assert!(!f.take_rescan_request());
    }

    #[test]
    fn concurrent_requests_are_not_lost() {
        const ROUNDS: usize = 1000;
        let f = Arc::new(CellularFlags::default());

        // Each accepted request must be consumed before the next one is accepted.
        let setter = {
            let f = Arc::clone(&f);
            std::thread::spawn(move || {
                for _ in 0..ROUNDS {
                    while !f.request_link_reset() {
                        std::thread::yield_now();
                    }
                }
            })
        };
        let consumer = {
            let f = Arc::clone(&f);
            std::thread::spawn(move || {
                let mut consumed = 0;
                while consumed < ROUNDS {
                    if f.take_link_reset() {
                        consumed += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
                consumed
            })
        };

        setter.join().unwrap();
        assert_eq!(consumer.join().unwrap(), ROUNDS);
        assert!(!f.link_reset_requested());
    }
}
