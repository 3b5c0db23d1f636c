//! Monotonic microsecond time source.
//!
//! The local clock is a free-running 32-bit microsecond counter derived from the
//! same oscillator that drives the tick timer. It wraps after about 71.6 minutes,
//! so only wrapping differences between two reads are meaningful.

/// Wrapping microsecond counter, read from both handler and poller context.
#[cfg_attr(test, mockall::automock)]
pub trait MicrosClock {
    fn now_micros(&self) -> u32;
}

impl<C: MicrosClock + ?Sized> MicrosClock for &C {
    fn now_micros(&self) -> u32 {
        (**self).now_micros()
    }
}

/// Elapsed microseconds from `earlier` to `later`, tolerant of one wrap.
pub fn micros_since(later: u32, earlier: u32) -> u32 {
    later.wrapping_sub(earlier)
}

/// Extends the wrapping 32-bit clock to a 64-bit uptime.
///
/// Correct as long as `advance` is called at least once per wrap period,
/// which the poll loop does many times per second.
#[derive(Debug, Clone, Copy)]
pub struct Uptime {
    last_raw: u32,
    elapsed_micros: u64,
}

impl Uptime {
    pub fn start(now: u32) -> Self {
        Uptime {
            last_raw: now,
            elapsed_micros: 0,
        }
    }

    pub fn advance(&mut self, now: u32) -> u64 {
        self.elapsed_micros += u64::from(micros_since(now, self.last_raw));
        self.last_raw = now;
        self.elapsed_micros
    }

    pub fn micros(&self) -> u64 {
        self.elapsed_micros
    }

    pub fn secs(&self) -> u64 {
        self.elapsed_micros / 1_000_000
    }
}
