//! Reference Edge Monitor
//!
//! The edge interrupt stores the microsecond timestamp of the reference edge;
//! the poller picks it up exactly once.

use crate::clock::MicrosClock;
use crate::shared::Shared;

pub struct EdgeMonitor {
    pending: Shared<Option<u32>>,
    overwritten: Shared<u32>,
}

impl EdgeMonitor {
    pub const fn new() -> Self {
        EdgeMonitor {
            pending: Shared::new(None),
            overwritten: Shared::new(0),
        }
    }

    /// Edge interrupt handler.
    pub fn on_edge<C: MicrosClock + ?Sized>(&self, clock: &C) {
        critical_section::with(|cs| {
            // Reading the clock on handler entry keeps the capture latency constant
            let timestamp = clock.now_micros();
            if self.pending.replace(cs, Some(timestamp)).is_some() {
                let count = self.overwritten.get(cs);
                self.overwritten.set(cs, count.wrapping_add(1));
            }
        });
    }

    /// Take the pending edge timestamp, if any.
    pub fn poll_edge(&self) -> Option<u32> {
        self.pending.take()
    }

    /// Edges replaced before the poller serviced them.
    pub fn overwritten(&self) -> u32 {
        self.overwritten.load()
    }
}

impl Default for EdgeMonitor {
    fn default() -> Self {
        Self::new()
    }
}
