use core::convert::Infallible;
use embedded_hal::digital::OutputPin;
use crate::waveform::DriveLevel;

/// Free-running tick counter with a programmable compare threshold.
///
/// The counter counts up at the prescaled oscillator rate; reaching the compare
/// value fires the tick interrupt and restarts the counter from zero.
#[cfg_attr(test, mockall::automock)]
pub trait TickTimer {
    /// Current value of the live counter.
    fn counter(&self) -> u32;

    /// Overwrite the live counter.
    fn set_counter(&mut self, ticks: u32);

    /// Current compare threshold.
    fn compare(&self) -> u32;

    /// Program the compare threshold for the running period.
    fn set_compare(&mut self, ticks: u32);
}

/// Sink for the two actuator drive lines.
///
/// Implementations should switch both lines in a single port write where the
/// hardware allows it.
#[cfg_attr(test, mockall::automock)]
pub trait DriveOutput {
    fn write(&mut self, level: DriveLevel);
}

/// Drive lines on two independent `embedded-hal` pins.
///
/// Lines are raised before they are lowered, so switching between the two
/// polarities passes through the short (both high) encoding and never through
/// an undefined one.
pub struct PinPair<N, P> {
    negative: N,
    positive: P,
}

impl<N, P> PinPair<N, P>
where
    N: OutputPin<Error = Infallible>,
    P: OutputPin<Error = Infallible>,
{
    pub fn new(negative: N, positive: P) -> Self {
        PinPair { negative, positive }
    }

    pub fn release(self) -> (N, P) {
        (self.negative, self.positive)
    }

    fn apply(&mut self, level: DriveLevel) -> Result<(), Infallible> {
        let (negative, positive) = level.lines();
        if negative {
            self.negative.set_high()?;
        }
        if positive {
            self.positive.set_high()?;
        }
        if !negative {
            self.negative.set_low()?;
        }
        if !positive {
            self.positive.set_low()?;
        }
        Ok(())
    }
}

impl<N, P> DriveOutput for PinPair<N, P>
where
    N: OutputPin<Error = Infallible>,
    P: OutputPin<Error = Infallible>,
{
    fn write(&mut self, level: DriveLevel) {
        match self.apply(level) {
            Ok(()) => {}
            Err(never) => match never {},
        }
    }
}
