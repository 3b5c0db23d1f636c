//! Phase Corrector
//!
//! Once per accepted edge while locked, the poller measures how long ago the
//! edge happened, converts that into the phase the generator *should* be at,
//! and overwrites the generator state, output level and live timer counter
//! with it.
//!
//! The write races the tick interrupt. If the next tick is about to fire the
//! corrector first waits (bounded, in the poller) until it has passed, so the
//! handler never runs between reading and rewriting the counter.

use embedded_hal::delay::DelayNs;
use serde::{Deserialize, Serialize};
use crate::clock::{micros_since, MicrosClock};
use crate::config::CorrectorConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::traits::{DriveOutput, TickTimer};
use crate::waveform::{PhaseState, WaveformGenerator, HALF_WAVES_PER_CYCLE};

/// Phase `observed_ticks` after the start of a cycle of `period_ticks` half-waves.
pub fn locate(observed_ticks: u64, period_ticks: u32) -> PhaseState {
    let period = u64::from(period_ticks.max(1));
    PhaseState {
        half_wave_index: ((observed_ticks / period) % u64::from(HALF_WAVES_PER_CYCLE)) as u8,
        sub_tick_offset: (observed_ticks % period) as u32,
    }
}

/// Outcome of one correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correction {
    pub observed_ticks: u32,
    pub previous: PhaseState,
    pub corrected: PhaseState,
    pub avoided: bool,
}

pub struct PhaseCorrector {
    config: CorrectorConfig,
    tick_micros: u32,
    corrections: u32,
    avoidances: u32,
    last: Option<Correction>,
}

impl PhaseCorrector {
    pub fn new(config: CorrectorConfig, tick_micros: u32) -> Self {
        PhaseCorrector {
            config,
            tick_micros: tick_micros.max(1),
            corrections: 0,
            avoidances: 0,
            last: None,
        }
    }

    /// Resynchronise the generator to the edge captured at `edge_timestamp`.
    #[allow(clippy::too_many_arguments)]
    pub fn correct<C, T, O, D, S>(
        &mut self,
        generator: &WaveformGenerator,
        edge_timestamp: u32,
        clock: &C,
        timer: &mut T,
        output: &mut O,
        delay: &mut D,
        sink: &mut S,
    ) -> Correction
    where
        C: MicrosClock + ?Sized,
        T: TickTimer + ?Sized,
        O: DriveOutput + ?Sized,
        D: DelayNs + ?Sized,
        S: DiagnosticSink + ?Sized,
    {
        let avoided = self.avoid_tick(timer, delay, sink);

        let (observed_ticks, previous, corrected) = critical_section::with(|cs| {
            let now = clock.now_micros();
            let observed_ticks = micros_since(now, edge_timestamp) / self.tick_micros;
            // The counter write lands a fixed number of ticks after `now`
            let compensated = u64::from(observed_ticks) + u64::from(self.config.latency_compensation_ticks);
            let period_ticks = generator.periods_in(cs).period_ticks;
            let corrected = locate(compensated, period_ticks);
            let previous = generator.overwrite(cs, corrected, timer, output);
            (observed_ticks, previous, corrected)
        });

        self.corrections = self.corrections.wrapping_add(1);
        sink.emit(&Diagnostic::PhaseCorrected { observed_ticks, previous, corrected });

        let correction = Correction { observed_ticks, previous, corrected, avoided };
        self.last = Some(correction);
        correction
    }

    /// Wait out an imminent tick. Returns true if a wait was needed.
    fn avoid_tick<T, D, S>(&mut self, timer: &mut T, delay: &mut D, sink: &mut S) -> bool
    where
        T: TickTimer + ?Sized,
        D: DelayNs + ?Sized,
        S: DiagnosticSink + ?Sized,
    {
        let remaining_ticks = timer.compare().saturating_sub(timer.counter());
        if remaining_ticks >= self.config.avoidance_threshold_ticks {
            return false;
        }

        let wait_micros = remaining_ticks
            .saturating_add(self.config.avoidance_margin_ticks)
            .saturating_mul(self.tick_micros);
        delay.delay_us(wait_micros);

        self.avoidances = self.avoidances.wrapping_add(1);
        sink.emit(&Diagnostic::AvoidanceTriggered { remaining_ticks, wait_micros });
        true
    }

    pub fn corrections(&self) -> u32 {
        self.corrections
    }

    pub fn avoidances(&self) -> u32 {
        self.avoidances
    }

    pub fn last(&self) -> Option<Correction> {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockMicrosClock;
    use crate::diagnostics::{MockDiagnosticSink, RecordingSink};
    use crate::traits::{MockDriveOutput, MockTickTimer};
    use crate::waveform::DriveLevel;
    use crate::waveform::TickPeriods;
    use mockall::mock;
    use mockall::predicate::*;
    use proptest::prelude::*;

    mock! {
        pub Delay {}
        impl DelayNs for Delay {
            fn delay_ns(&mut self, ns: u32);
        }
    }

    fn no_compensation() -> CorrectorConfig {
        CorrectorConfig {
            latency_compensation_ticks: 0,
            ..CorrectorConfig::default()
        }
    }

    fn any_output() -> MockDriveOutput {
        let mut output = MockDriveOutput::new();
        output.expect_write().return_const(());
        output
    }

    fn timer_far_from_tick() -> MockTickTimer {
        let mut timer = MockTickTimer::new();
        timer.expect_compare().return_const(7808u32);
        timer.expect_counter().return_const(1000u32);
        timer.expect_set_compare().return_const(());
        timer.expect_set_counter().return_const(());
        timer
    }

    #[test]
    fn test_locate_scenario() {
        // 250_013 = 32 * 7808 + 157: one full cycle plus 157 ticks
        let phase = locate(250_013, 7808);
        assert_eq!(phase, PhaseState { half_wave_index: 0, sub_tick_offset: 157 });
    }

    #[test]
    fn test_locate_mid_cycle() {
        let phase = locate(3 * 7811 + 42, 7811);
        assert_eq!(phase, PhaseState { half_wave_index: 3, sub_tick_offset: 42 });
    }

    #[test]
    fn test_correct_writes_located_phase() {
        let generator = WaveformGenerator::new(TickPeriods::uniform(7808));
        let mut timer = MockTickTimer::new();
        timer.expect_compare().return_const(7808u32);
        timer.expect_counter().return_const(1000u32);
        timer.expect_set_compare().with(eq(7808)).times(1).return_const(());
        timer.expect_set_counter().with(eq(157)).times(1).return_const(());

        let mut clock = MockMicrosClock::new();
        // 250_013 ticks of 4us after the edge
        clock.expect_now_micros().return_const(5_000_000u32 + 1_000_052);

        let mut delay = MockDelay::new();
        delay.expect_delay_ns().never();
        let mut sink = RecordingSink::new();

        let mut output = MockDriveOutput::new();
        output.expect_write().with(eq(DriveLevel::Short)).times(1).return_const(());
        let mut corrector = PhaseCorrector::new(no_compensation(), 4);
        let correction = corrector.correct(&generator, 5_000_000, &clock, &mut timer, &mut output, &mut delay, &mut sink);

        assert_eq!(correction.observed_ticks, 250_013);
        assert_eq!(correction.corrected, PhaseState { half_wave_index: 0, sub_tick_offset: 157 });
        assert!(!correction.avoided);
        assert_eq!(generator.live().half_wave_index, 0);
        assert_eq!(corrector.corrections(), 1);
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_latency_compensation_carries_into_index() {
        let generator = WaveformGenerator::new(TickPeriods::uniform(100));
        let mut timer = MockTickTimer::new();
        timer.expect_compare().return_const(100u32);
        timer.expect_counter().return_const(10u32);
        timer.expect_set_compare().return_const(());
        timer.expect_set_counter().with(eq(3)).times(1).return_const(());

        let mut clock = MockMicrosClock::new();
        clock.expect_now_micros().return_const(98u32 * 4);
        let mut delay = MockDelay::new();
        let mut sink = RecordingSink::new();

        let config = CorrectorConfig { latency_compensation_ticks: 5, ..CorrectorConfig::default() };
        let mut output = MockDriveOutput::new();
        output.expect_write().with(eq(DriveLevel::Short)).times(1).return_const(());
        let mut corrector = PhaseCorrector::new(config, 4);
        let correction = corrector.correct(&generator, 0, &clock, &mut timer, &mut output, &mut delay, &mut sink);

        // 98 + 5 = 103 -> half-wave 1, offset 3
        assert_eq!(correction.corrected, PhaseState { half_wave_index: 1, sub_tick_offset: 3 });
    }

    #[test]
    fn test_avoidance_waits_past_imminent_tick() {
        let generator = WaveformGenerator::new(TickPeriods::uniform(7808));
        let mut timer = MockTickTimer::new();
        timer.expect_compare().return_const(7808u32);
        timer.expect_counter().return_const(7788u32); // 20 ticks to go
        timer.expect_set_compare().return_const(());
        timer.expect_set_counter().return_const(());

        let mut clock = MockMicrosClock::new();
        clock.expect_now_micros().return_const(4_000u32);

        let mut delay = MockDelay::new();
        // (20 + 8) ticks * 4us
        delay.expect_delay_ns().with(eq(112_000)).times(1).return_const(());

        let mut sink = RecordingSink::new();
        let mut output = any_output();
        let mut corrector = PhaseCorrector::new(no_compensation(), 4);
        let correction = corrector.correct(&generator, 0, &clock, &mut timer, &mut output, &mut delay, &mut sink);

        assert!(correction.avoided);
        assert_eq!(corrector.avoidances(), 1);
        assert_eq!(
            sink.events()[0],
            Diagnostic::AvoidanceTriggered { remaining_ticks: 20, wait_micros: 112 }
        );
        assert!(matches!(sink.events()[1], Diagnostic::PhaseCorrected { .. }));
    }

    #[test]
    fn test_correction_is_idempotent() {
        let generator = WaveformGenerator::new(TickPeriods::uniform(7811));
        let mut timer = timer_far_from_tick();
        let mut clock = MockMicrosClock::new();
        clock.expect_now_micros().return_const(2_345_678u32);
        let mut delay = MockDelay::new();
        let mut sink = MockDiagnosticSink::new();
        sink.expect_emit().return_const(());

        let mut output = any_output();
        let mut corrector = PhaseCorrector::new(CorrectorConfig::default(), 4);
        let first = corrector.correct(&generator, 2_000_000, &clock, &mut timer, &mut output, &mut delay, &mut sink);
        let second = corrector.correct(&generator, 2_000_000, &clock, &mut timer, &mut output, &mut delay, &mut sink);

        assert_eq!(first.corrected, second.corrected);
        assert_eq!(corrector.last(), Some(second));
    }

    #[test]
    fn test_duty_split_correction_lands_in_brake() {
        let generator = WaveformGenerator::new(TickPeriods::with_duty(1000, Some(40)));
        let mut timer = MockTickTimer::new();
        timer.expect_compare().return_const(400u32);
        timer.expect_counter().return_const(0u32);
        timer.expect_set_compare().with(eq(600)).times(1).return_const(());
        timer.expect_set_counter().with(eq(250)).times(1).return_const(());

        let mut clock = MockMicrosClock::new();
        clock.expect_now_micros().return_const(650u32 * 4);
        let mut delay = MockDelay::new();
        let mut sink = RecordingSink::new();

        let mut output = MockDriveOutput::new();
        output.expect_write().with(eq(DriveLevel::Short)).times(1).return_const(());
        let mut corrector = PhaseCorrector::new(no_compensation(), 4);
        let correction = corrector.correct(&generator, 0, &clock, &mut timer, &mut output, &mut delay, &mut sink);
        assert_eq!(correction.corrected, PhaseState { half_wave_index: 0, sub_tick_offset: 650 });
        assert_eq!(generator.live().segment, crate::waveform::Segment::Brake);
    }

    proptest! {
        /// The located phase brackets the observed tick count within one cycle.
        #[test]
        fn locate_brackets_observed(observed in any::<u32>(), period in 1u32..20_000) {
            let phase = locate(u64::from(observed), period);
            prop_assert!(phase.half_wave_index < HALF_WAVES_PER_CYCLE);
            prop_assert!(phase.sub_tick_offset < period);

            let cycle = u64::from(period) * u64::from(HALF_WAVES_PER_CYCLE);
            let within = u64::from(observed) % cycle;
            let start = u64::from(phase.half_wave_index) * u64::from(period);
            prop_assert!(start + u64::from(phase.sub_tick_offset) <= within);
            prop_assert!(within < start + u64::from(period));
        }
    }
}
