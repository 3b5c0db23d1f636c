//! Waveform Generator - the tick-driven drive pulse train
//!
//! One full cycle spans one reference interval (1 s) and consists of
//! [`HALF_WAVES_PER_CYCLE`] half-waves. Even half-waves carry alternating
//! positive/negative drive pulses, odd half-waves short the actuator, and
//! half-wave 0 is the blanking slot whose pulse is suppressed. The
//! reference edge is expected to land inside that blanking slot.
//!
//! The tick handler only advances the phase and writes the precomputed level
//! and compare value. Period changes and phase rewrites come from the poller
//! through the shared cells below.

use critical_section::CriticalSection;
use serde::{Deserialize, Serialize};
use crate::shared::Shared;
use crate::traits::{DriveOutput, TickTimer};

/// Half-waves in one drive cycle (one reference interval).
pub const HALF_WAVES_PER_CYCLE: u8 = 32;

/// Encoding of the two drive lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriveLevel {
    /// Both lines high: the H-bridge shorts the actuator (slow decay), which
    /// makes the shutter transparent.
    Short,
    /// Negative-polarity line only.
    Negative,
    /// Positive-polarity line only.
    Positive,
}

impl DriveLevel {
    /// `(negative_line, positive_line)`
    pub const fn lines(self) -> (bool, bool) {
        match self {
            DriveLevel::Short => (true, true),
            DriveLevel::Negative => (true, false),
            DriveLevel::Positive => (false, true),
        }
    }
}

/// Output level for a half-wave index.
pub const fn drive_level(half_wave_index: u8) -> DriveLevel {
    let index = half_wave_index % HALF_WAVES_PER_CYCLE;
    if index == 0 || index % 2 == 1 {
        DriveLevel::Short
    } else if index % 4 == 0 {
        DriveLevel::Positive
    } else {
        DriveLevel::Negative
    }
}

/// Split of one half-wave into an active drive segment and a brake segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DutySplit {
    pub duty_percent: u8,
    pub active_ticks: u32,
    pub brake_ticks: u32,
}

impl DutySplit {
    /// `active_ticks + brake_ticks == period_ticks` for any percentage; values
    /// above 100 are treated as 100.
    pub fn from_period(period_ticks: u32, duty_percent: u8) -> Self {
        let duty_percent = duty_percent.min(100);
        let active_ticks = (u64::from(period_ticks) * u64::from(duty_percent) / 100) as u32;
        DutySplit {
            duty_percent,
            active_ticks,
            brake_ticks: period_ticks - active_ticks,
        }
    }
}

/// Timer periods published by the poller and consumed by the tick handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickPeriods {
    pub period_ticks: u32,
    pub split: Option<DutySplit>,
}

/// Which part of the current half-wave the generator is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    Active,
    Brake,
}

/// Position within the drive cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhaseState {
    pub half_wave_index: u8,
    pub sub_tick_offset: u32,
}

/// Generator state mutated on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivePhase {
    pub half_wave_index: u8,
    pub segment: Segment,
}

impl LivePhase {
    /// Level the lines hold while the generator sits in this segment.
    pub const fn level(&self) -> DriveLevel {
        match self.segment {
            Segment::Brake => DriveLevel::Short,
            Segment::Active => drive_level(self.half_wave_index),
        }
    }
}

impl TickPeriods {
    pub const fn uniform(period_ticks: u32) -> Self {
        TickPeriods { period_ticks, split: None }
    }

    pub fn with_duty(period_ticks: u32, duty_percent: Option<u8>) -> Self {
        TickPeriods {
            period_ticks,
            split: duty_percent.map(|duty| DutySplit::from_period(period_ticks, duty)),
        }
    }

    /// State, level and compare value that follow the segment ending now.
    pub fn next_segment(&self, live: LivePhase) -> (LivePhase, DriveLevel, u32) {
        if let Some(split) = self.split {
            if live.segment == Segment::Active && split.brake_ticks > 0 {
                let next = LivePhase { segment: Segment::Brake, ..live };
                return (next, DriveLevel::Short, split.brake_ticks);
            }
        }

        let half_wave_index = (live.half_wave_index + 1) % HALF_WAVES_PER_CYCLE;
        match self.split {
            Some(split) if split.active_ticks == 0 => (
                LivePhase { half_wave_index, segment: Segment::Brake },
                DriveLevel::Short,
                split.brake_ticks,
            ),
            Some(split) => (
                LivePhase { half_wave_index, segment: Segment::Active },
                drive_level(half_wave_index),
                split.active_ticks,
            ),
            None => (
                LivePhase { half_wave_index, segment: Segment::Active },
                drive_level(half_wave_index),
                self.period_ticks,
            ),
        }
    }

    /// Map an offset into the half-wave onto `(segment, counter, compare)`.
    pub fn locate(&self, sub_tick_offset: u32) -> (Segment, u32, u32) {
        let (segment, counter, compare) = match self.split {
            Some(split) if sub_tick_offset < split.active_ticks => {
                (Segment::Active, sub_tick_offset, split.active_ticks)
            }
            Some(split) => (
                Segment::Brake,
                sub_tick_offset - split.active_ticks,
                split.brake_ticks,
            ),
            None => (Segment::Active, sub_tick_offset, self.period_ticks),
        };
        let compare = compare.max(1);
        (segment, counter.min(compare - 1), compare)
    }

    /// Inverse of [`TickPeriods::locate`].
    pub fn offset_of(&self, segment: Segment, counter: u32) -> u32 {
        match (segment, self.split) {
            (Segment::Brake, Some(split)) => split.active_ticks + counter,
            _ => counter,
        }
    }
}

/// Tick-driven generator state, shared between the tick handler and the poller.
pub struct WaveformGenerator {
    live: Shared<LivePhase>,
    periods: Shared<TickPeriods>,
}

impl WaveformGenerator {
    /// Starts in the blanking half-wave; usable in a `static`.
    pub const fn new(periods: TickPeriods) -> Self {
        WaveformGenerator {
            live: Shared::new(LivePhase {
                half_wave_index: 0,
                segment: Segment::Active,
            }),
            periods: Shared::new(periods),
        }
    }

    /// Program the timer for the first half-wave. Call once before enabling
    /// the tick interrupt.
    pub fn start<T, O>(&self, timer: &mut T, output: &mut O)
    where
        T: TickTimer + ?Sized,
        O: DriveOutput + ?Sized,
    {
        critical_section::with(|cs| {
            let periods = self.periods.get(cs);
            let live = self.live.get(cs);
            let (segment, _, compare) = periods.locate(0);
            self.live.set(cs, LivePhase { segment, ..live });
            output.write(drive_level(live.half_wave_index));
            timer.set_counter(0);
            timer.set_compare(compare);
        });
    }

    /// Tick interrupt handler.
    pub fn on_tick<T, O>(&self, timer: &mut T, output: &mut O)
    where
        T: TickTimer + ?Sized,
        O: DriveOutput + ?Sized,
    {
        critical_section::with(|cs| {
            let periods = self.periods.get(cs);
            let (next, level, compare) = periods.next_segment(self.live.get(cs));
            output.write(level);
            timer.set_compare(compare);
            self.live.set(cs, next);
        });
    }

    /// Make new periods effective from the next tick.
    pub fn publish_periods(&self, periods: TickPeriods) {
        self.periods.store(periods);
    }

    pub fn periods(&self) -> TickPeriods {
        self.periods.load()
    }

    pub fn periods_in(&self, cs: CriticalSection<'_>) -> TickPeriods {
        self.periods.get(cs)
    }

    pub fn live(&self) -> LivePhase {
        self.live.load()
    }

    /// Current position, reconstructed from the live state and timer counter.
    pub fn phase<T: TickTimer + ?Sized>(&self, timer: &T) -> PhaseState {
        critical_section::with(|cs| self.phase_in(cs, timer))
    }

    fn phase_in<T: TickTimer + ?Sized>(&self, cs: CriticalSection<'_>, timer: &T) -> PhaseState {
        let periods = self.periods.get(cs);
        let live = self.live.get(cs);
        PhaseState {
            half_wave_index: live.half_wave_index,
            sub_tick_offset: periods.offset_of(live.segment, timer.counter()),
        }
    }

    /// Overwrite phase, output level and live timer inside the caller's
    /// critical section. Returns the phase that was replaced.
    pub fn overwrite<T, O>(
        &self,
        cs: CriticalSection<'_>,
        phase: PhaseState,
        timer: &mut T,
        output: &mut O,
    ) -> PhaseState
    where
        T: TickTimer + ?Sized,
        O: DriveOutput + ?Sized,
    {
        let previous = self.phase_in(cs, timer);
        let periods = self.periods.get(cs);
        let (segment, counter, compare) = periods.locate(phase.sub_tick_offset);
        let live = LivePhase {
            half_wave_index: phase.half_wave_index % HALF_WAVES_PER_CYCLE,
            segment,
        };
        self.live.set(cs, live);
        // A jump into blanking must not leave the old drive level on until the next tick
        output.write(live.level());
        timer.set_compare(compare);
        timer.set_counter(counter);
        previous
    }
}
