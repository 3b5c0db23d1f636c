//! Discipline Controller - the poll-loop side of the shutter engine
//!
//! The controller owns everything that runs outside interrupt context:
//! 1. **Lock State Machine**: classifies each reference interval
//! 2. **Calibration Engine**: recomputes the half-wave period at window boundaries
//! 3. **Phase Corrector**: realigns the running generator to every accepted edge
//!
//! The edge monitor and waveform generator are borrowed, not owned; on the
//! target they live in statics shared with the interrupt handlers.

use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};
use std::sync::{Arc, RwLock};
use crate::calibration::CalibrationEngine;
use crate::clock::{micros_since, MicrosClock, Uptime};
use crate::config::SystemConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::edge::EdgeMonitor;
use crate::lock::{CalibrationWindow, EdgeOutcome, LockState, LockStateMachine, Violation};
use crate::phase::PhaseCorrector;
use crate::status::LockStatus;
use crate::traits::{DriveOutput, TickTimer};
use crate::waveform::WaveformGenerator;

/// Main-loop controller
pub struct DisciplineController<'a, C, T, O, D, S>
where
    C: MicrosClock,
    T: TickTimer,
    O: DriveOutput,
    D: DelayNs,
    S: DiagnosticSink,
{
    // Shared with the interrupt handlers
    monitor: &'a EdgeMonitor,
    generator: &'a WaveformGenerator,

    // Hardware and collaborators
    clock: C,
    timer: T,
    output: O,
    delay: D,
    sink: S,
    config: SystemConfig,

    // Engine
    lock: LockStateMachine,
    calibration: CalibrationEngine,
    corrector: PhaseCorrector,

    // 64-bit view of the wrapping micros clock, for grace and rate limits
    uptime: Uptime,
    last_overrun_warning_secs: Option<u64>,

    // Metrics (for status display)
    edges: u32,
    violations: u32,
    lock_losses: u32,
    overruns: u32,
    last_deviation_micros: Option<i64>,

    // Shared status for observers
    status_shared: Arc<RwLock<LockStatus>>,
}

impl<'a, C, T, O, D, S> DisciplineController<'a, C, T, O, D, S>
where
    C: MicrosClock,
    T: TickTimer,
    O: DriveOutput,
    D: DelayNs,
    S: DiagnosticSink,
{
    /// Publishes the nominal-frequency period to the generator. `config` is
    /// expected to have passed [`SystemConfig::validate`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        monitor: &'a EdgeMonitor,
        generator: &'a WaveformGenerator,
        clock: C,
        timer: T,
        output: O,
        delay: D,
        sink: S,
        status_shared: Arc<RwLock<LockStatus>>,
        config: SystemConfig,
    ) -> Self {
        let osc = &config.oscillator;
        let calibration = CalibrationEngine::new(osc.clone(), config.lock.target_interval_micros);
        let periods = calibration.tick_periods();
        generator.publish_periods(periods);

        info!("=== Shutter Discipline Initialization ===");
        info!("Oscillator: {:.0}Hz nominal, prescaler {}, {}us/tick",
              osc.nominal_frequency_hz, osc.prescaler, osc.tick_micros);
        info!("Half-wave: {} ticks (safety margin {})", periods.period_ticks, osc.safety_margin_ticks);
        match periods.split {
            Some(split) => info!("Duty: {}% (active {} / brake {} ticks)",
                                 split.duty_percent, split.active_ticks, split.brake_ticks),
            None => info!("Duty: off"),
        }
        info!("Lock: +/-{}us, stable after {}, calibrate every {} pulses",
              config.lock.tolerance_micros, config.lock.stable_pulses, config.lock.calibrate_pulses);
        info!("=== Ready ===");

        let uptime = Uptime::start(clock.now_micros());
        let corrector = PhaseCorrector::new(config.corrector.clone(), osc.tick_micros);
        let lock = LockStateMachine::new(config.lock.clone());

        let controller = DisciplineController {
            monitor,
            generator,
            clock,
            timer,
            output,
            delay,
            sink,
            config,
            lock,
            calibration,
            corrector,
            uptime,
            last_overrun_warning_secs: None,
            edges: 0,
            violations: 0,
            lock_losses: 0,
            overruns: 0,
            last_deviation_micros: None,
            status_shared,
        };
        controller.update_shared_status();
        controller
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    pub fn get_status_shared(&self) -> Arc<RwLock<LockStatus>> {
        self.status_shared.clone()
    }

    pub fn state(&self) -> LockState {
        self.lock.state()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn uptime_micros(&self) -> u64 {
        self.uptime.micros()
    }

    pub fn log_status(&self) {
        let periods = self.generator.periods();
        info!("[POLL] {:12}  valid:{:3}  window:{:3}  period:{} ticks  freq:{:.0}Hz  corr:{}  avoid:{}",
              self.lock.state(),
              self.lock.consecutive_valid(),
              self.lock.pulses_since_calibration(),
              periods.period_ticks,
              self.calibration.state().calibrated_frequency_hz,
              self.corrector.corrections(),
              self.corrector.avoidances());
    }

    /// One pass of the main loop. Call as often as possible; returns what the
    /// serviced edge did, or `None` if no edge was pending.
    pub fn poll(&mut self) -> Option<EdgeOutcome> {
        // Take the edge before reading the clock so `now` is never older than it
        let pending = self.monitor.poll_edge();
        let now = self.clock.now_micros();
        self.uptime.advance(now);

        let timestamp = pending?;
        self.edges = self.edges.wrapping_add(1);
        self.check_latency(micros_since(now, timestamp));

        let outcome = self.lock.on_edge(timestamp);
        if let Some(violation) = outcome.violation {
            self.report_violation(violation);
        }
        if let Some((from, to)) = outcome.transition {
            self.sink.emit(&Diagnostic::StateChanged { from, to });
        }
        if let Some(window) = outcome.calibration {
            self.apply_calibration(window);
        }

        // Corrections use the period the calibration above just published
        if outcome.wants_correction(self.lock.state()) {
            self.corrector.correct(
                self.generator,
                timestamp,
                &self.clock,
                &mut self.timer,
                &mut self.output,
                &mut self.delay,
                &mut self.sink,
            );
        }

        self.update_shared_status();
        Some(outcome)
    }

    // ========================================================================
    // EDGE HANDLING
    // ========================================================================

    fn in_startup_grace(&self) -> bool {
        self.uptime.micros() < u64::from(self.config.lock.startup_grace_micros)
    }

    fn report_violation(&mut self, violation: Violation) {
        let deviation_micros = violation.deviation_micros();
        self.violations = self.violations.wrapping_add(1);
        self.last_deviation_micros = Some(deviation_micros);

        let event = match violation {
            Violation::Tolerance { .. } => Diagnostic::ToleranceViolation { deviation_micros },
            Violation::LockLost { .. } => {
                self.lock_losses = self.lock_losses.wrapping_add(1);
                Diagnostic::LockLost { deviation_micros }
            }
        };

        // Power-up settles with a partial first interval
        if self.in_startup_grace() {
            debug!("[EDGE] Deviation {:+}us inside startup grace, not reported", deviation_micros);
            return;
        }
        self.sink.emit(&event);
    }

    fn apply_calibration(&mut self, window: CalibrationWindow) {
        let Some(cal) = self.calibration.calibrate(window.pulses, window.elapsed_micros) else {
            warn!("[CAL] Ignoring empty {:?} window ({} pulses / {}us)",
                  window.kind, window.pulses, window.elapsed_micros);
            return;
        };

        debug!("[CAL] {:?} window closed", window.kind);
        self.generator.publish_periods(cal.tick_periods());
        self.sink.emit(&Diagnostic::Calibrated {
            pulses: cal.pulses,
            elapsed_micros: cal.elapsed_micros,
            frequency_hz: cal.frequency_hz,
            period_ticks: cal.period_ticks,
            split: cal.split,
        });
    }

    /// Flag edges serviced too late for an accurate correction, at most
    /// once per warning interval.
    fn check_latency(&mut self, latency_micros: u32) {
        let corrector = &self.config.corrector;
        if latency_micros <= corrector.overrun_threshold_micros {
            return;
        }
        self.overruns = self.overruns.wrapping_add(1);

        let now_secs = self.uptime.secs();
        let due = match self.last_overrun_warning_secs {
            None => true,
            Some(last) => now_secs.saturating_sub(last) >= corrector.overrun_warning_interval_secs,
        };
        if due {
            self.last_overrun_warning_secs = Some(now_secs);
            self.sink.emit(&Diagnostic::PollerOverrun { latency_micros });
        } else {
            debug!("[POLL] Edge serviced {}us late (warning suppressed)", latency_micros);
        }
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    fn update_shared_status(&self) {
        if let Ok(mut status) = self.status_shared.write() {
            let osc = self.calibration.state();

            status.state = self.lock.state();
            status.consecutive_valid = self.lock.consecutive_valid();
            status.pulses_since_calibration = self.lock.pulses_since_calibration();
            status.edges = self.edges;

            status.period_ticks = osc.period_ticks;
            status.frequency_hz = osc.calibrated_frequency_hz;
            status.split = osc.split;
            status.calibrations = self.calibration.calibrations();

            status.corrections = self.corrector.corrections();
            status.avoidances = self.corrector.avoidances();
            status.violations = self.violations;
            status.lock_losses = self.lock_losses;
            status.overruns = self.overruns;
            status.overwritten_edges = self.monitor.overwritten();
            status.last_deviation_micros = self.last_deviation_micros;
            status.last_correction = self.corrector.last();

            status.uptime_secs = self.uptime.secs();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::RecordingSink;
    use crate::traits::{MockDriveOutput, MockTickTimer};
    use crate::waveform::TickPeriods;
    use mockall::mock;
    use std::cell::Cell;
    use std::rc::Rc;

    const SECOND: u32 = 1_000_000;
    const LATENCY: u32 = 200;

    mock! {
        pub Delay {}
        impl DelayNs for Delay {
            fn delay_ns(&mut self, ns: u32);
        }
    }

    #[derive(Clone)]
    struct FakeClock(Rc<Cell<u32>>);

    impl MicrosClock for FakeClock {
        fn now_micros(&self) -> u32 {
            self.0.get()
        }
    }

    type TestController<'a> = DisciplineController<'a, FakeClock, MockTickTimer, MockDriveOutput, MockDelay, RecordingSink>;

    fn quiet_timer() -> MockTickTimer {
        let mut timer = MockTickTimer::new();
        timer.expect_compare().return_const(7811u32);
        timer.expect_counter().return_const(100u32);
        timer.expect_set_compare().return_const(());
        timer.expect_set_counter().return_const(());
        timer
    }

    fn quiet_output() -> MockDriveOutput {
        let mut output = MockDriveOutput::new();
        output.expect_write().return_const(());
        output
    }

    fn controller<'a>(
        monitor: &'a EdgeMonitor,
        generator: &'a WaveformGenerator,
        clock: &FakeClock,
        config: SystemConfig,
    ) -> TestController<'a> {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut delay = MockDelay::new();
        delay.expect_delay_ns().never();
        let status = Arc::new(RwLock::new(LockStatus::default()));
        DisciplineController::new(
            monitor,
            generator,
            clock.clone(),
            quiet_timer(),
            quiet_output(),
            delay,
            RecordingSink::new(),
            status,
            config,
        )
    }

    /// Fire the edge interrupt at `at`, then run the poller `latency` later.
    fn edge(controller: &mut TestController, monitor: &EdgeMonitor, clock: &FakeClock, at: u32, latency: u32) -> EdgeOutcome {
        clock.0.set(at);
        monitor.on_edge(clock);
        clock.0.set(at.wrapping_add(latency));
        controller.poll().expect("edge was pending")
    }

    fn run_edges(controller: &mut TestController, monitor: &EdgeMonitor, clock: &FakeClock, origin: u32, edges: u32) {
        for k in 0..=edges {
            edge(controller, monitor, clock, origin.wrapping_add(k * SECOND), LATENCY);
        }
    }

    #[test]
    fn test_poll_without_edge_does_nothing() {
        let monitor = EdgeMonitor::new();
        let generator = WaveformGenerator::new(TickPeriods::uniform(1));
        let clock = FakeClock(Rc::new(Cell::new(0)));
        let mut delay = MockDelay::new();
        delay.expect_delay_ns().never();

        // No timer or output expectations: any access would panic
        let mut controller = DisciplineController::new(
            &monitor,
            &generator,
            clock.clone(),
            MockTickTimer::new(),
            MockDriveOutput::new(),
            delay,
            RecordingSink::new(),
            Arc::new(RwLock::new(LockStatus::default())),
            SystemConfig::default(),
        );

        assert_eq!(generator.periods().period_ticks, 7811, "nominal period published");
        clock.0.set(500_000);
        assert!(controller.poll().is_none());
        assert!(controller.sink().events().is_empty());
        assert_eq!(controller.uptime_micros(), 500_000);
    }

    #[test]
    fn test_scenario_stable_then_disciplined() {
        let monitor = EdgeMonitor::new();
        let generator = WaveformGenerator::new(TickPeriods::uniform(1));
        let clock = FakeClock(Rc::new(Cell::new(1_000)));
        let mut controller = controller(&monitor, &generator, &clock, SystemConfig::default());

        run_edges(&mut controller, &monitor, &clock, 1_000, 9);
        assert_eq!(controller.state(), LockState::Accumulating);
        assert_eq!(controller.get_status_shared().read().unwrap().corrections, 0);

        edge(&mut controller, &monitor, &clock, 1_000 + 10 * SECOND, LATENCY);
        assert_eq!(controller.state(), LockState::Stable);
        {
            let status = controller.get_status_shared();
            let status = status.read().unwrap();
            assert_eq!(status.calibrations, 1);
            assert_eq!(status.corrections, 1);
            assert_eq!(status.period_ticks, 7811);
        }

        for k in 11..70 {
            edge(&mut controller, &monitor, &clock, 1_000 + k * SECOND, LATENCY);
            assert_eq!(controller.state(), LockState::Stable, "edge {}", k);
        }
        edge(&mut controller, &monitor, &clock, 1_000 + 70 * SECOND, LATENCY);
        assert_eq!(controller.state(), LockState::Disciplined);

        let status = controller.get_status_shared().read().unwrap().clone();
        assert_eq!(status.calibrations, 2);
        assert_eq!(status.corrections, 61);
        assert_eq!(status.edges, 71);
        assert_eq!(status.violations, 0);

        let sink = controller.sink();
        assert_eq!(sink.count(|e| matches!(e, Diagnostic::Calibrated { .. })), 2);
        assert_eq!(sink.count(|e| matches!(e, Diagnostic::StateChanged { .. })), 3);
        assert_eq!(sink.count(|e| matches!(e, Diagnostic::PhaseCorrected { .. })), 61);
        assert_eq!(sink.count(|e| matches!(e, Diagnostic::PollerOverrun { .. })), 0);
    }

    #[test]
    fn test_scenario_lock_lost_from_disciplined() {
        let monitor = EdgeMonitor::new();
        let generator = WaveformGenerator::new(TickPeriods::uniform(1));
        let clock = FakeClock(Rc::new(Cell::new(0)));
        let mut controller = controller(&monitor, &generator, &clock, SystemConfig::default());

        run_edges(&mut controller, &monitor, &clock, 0, 70);
        assert_eq!(controller.state(), LockState::Disciplined);

        let late = 70 * SECOND + 1_015_000;
        let outcome = edge(&mut controller, &monitor, &clock, late, LATENCY);
        assert!(!outcome.accepted);
        assert_eq!(controller.state(), LockState::Unlocked);

        let events = controller.sink().events();
        assert!(events.contains(&Diagnostic::LockLost { deviation_micros: 15_000 }));
        assert!(events.contains(&Diagnostic::StateChanged {
            from: LockState::Disciplined,
            to: LockState::Unlocked,
        }));

        {
            let status = controller.get_status_shared();
            let status = status.read().unwrap();
            assert_eq!(status.lock_losses, 1);
            assert_eq!(status.last_deviation_micros, Some(15_000));
            assert_eq!(status.consecutive_valid, 0);
        }

        // Relock starts over from the violating edge
        edge(&mut controller, &monitor, &clock, late + SECOND, LATENCY);
        assert_eq!(controller.state(), LockState::Accumulating);
    }

    #[test]
    fn test_violation_inside_startup_grace_is_silent() {
        let monitor = EdgeMonitor::new();
        let generator = WaveformGenerator::new(TickPeriods::uniform(1));
        let clock = FakeClock(Rc::new(Cell::new(0)));
        let mut controller = controller(&monitor, &generator, &clock, SystemConfig::default());

        edge(&mut controller, &monitor, &clock, 0, LATENCY);
        edge(&mut controller, &monitor, &clock, 500_000, LATENCY);
        assert_eq!(controller.state(), LockState::Unlocked);
        assert_eq!(controller.get_status_shared().read().unwrap().violations, 1);
        assert_eq!(controller.sink().count(|e| matches!(e, Diagnostic::ToleranceViolation { .. })), 0);

        // Past the grace period the same fault is reported
        edge(&mut controller, &monitor, &clock, 3_500_000, LATENCY);
        assert!(controller
            .sink()
            .events()
            .contains(&Diagnostic::ToleranceViolation { deviation_micros: 2_000_000 }));
    }

    #[test]
    fn test_overrun_warning_is_rate_limited() {
        let monitor = EdgeMonitor::new();
        let generator = WaveformGenerator::new(TickPeriods::uniform(1));
        let clock = FakeClock(Rc::new(Cell::new(0)));
        let mut controller = controller(&monitor, &generator, &clock, SystemConfig::default());
        let overruns = |c: &TestController<'_>| c.sink().count(|e| matches!(e, Diagnostic::PollerOverrun { .. }));

        edge(&mut controller, &monitor, &clock, 0, 60_000);
        assert_eq!(overruns(&controller), 1);
        assert!(controller.sink().events().contains(&Diagnostic::PollerOverrun { latency_micros: 60_000 }));

        edge(&mut controller, &monitor, &clock, SECOND, 60_000);
        assert_eq!(overruns(&controller), 1);
        assert_eq!(controller.get_status_shared().read().unwrap().overruns, 2);

        // Within the threshold: not an overrun at all
        edge(&mut controller, &monitor, &clock, 2 * SECOND, 50_000);
        assert_eq!(controller.get_status_shared().read().unwrap().overruns, 2);

        // An hour later the warning is due again
        edge(&mut controller, &monitor, &clock, 3_601 * SECOND, 60_000);
        assert_eq!(overruns(&controller), 2);
    }

    /// Clock whose read lets the edge interrupt fire just after it samples.
    struct InterruptedClock<'a> {
        now: Rc<Cell<u32>>,
        monitor: &'a EdgeMonitor,
        fire_after_read: Cell<bool>,
    }

    impl MicrosClock for InterruptedClock<'_> {
        fn now_micros(&self) -> u32 {
            let now = self.now.get();
            if self.fire_after_read.replace(false) {
                self.now.set(now + 4);
                self.monitor.on_edge(&FakeClock(self.now.clone()));
            }
            now
        }
    }

    #[test]
    fn test_edge_during_clock_read_is_not_an_overrun() {
        let _ = env_logger::builder().is_test(true).try_init();
        let monitor = EdgeMonitor::new();
        let generator = WaveformGenerator::new(TickPeriods::uniform(1));
        let now = Rc::new(Cell::new(1_000));
        let clock = InterruptedClock { now: now.clone(), monitor: &monitor, fire_after_read: Cell::new(false) };
        let mut delay = MockDelay::new();
        delay.expect_delay_ns().never();
        let mut controller = DisciplineController::new(
            &monitor,
            &generator,
            clock,
            quiet_timer(),
            quiet_output(),
            delay,
            RecordingSink::new(),
            Arc::new(RwLock::new(LockStatus::default())),
            SystemConfig::default(),
        );

        now.set(SECOND);
        controller.clock.fire_after_read.set(true);
        assert!(controller.poll().is_none(), "edge arrived after the pending check");

        now.set(SECOND + LATENCY);
        assert!(controller.poll().is_some());
        assert!(controller.sink().events().is_empty(), "{:?}", controller.sink().events());
        assert_eq!(controller.get_status_shared().read().unwrap().overruns, 0);

        // A genuine overrun later in the hour is still reported
        now.set(2 * SECOND);
        monitor.on_edge(&FakeClock(now.clone()));
        now.set(2 * SECOND + 60_000);
        controller.poll();
        assert!(controller.sink().events().contains(&Diagnostic::PollerOverrun { latency_micros: 60_000 }));
    }

    #[test]
    fn test_calibration_publishes_drifted_period() {
        let monitor = EdgeMonitor::new();
        let generator = WaveformGenerator::new(TickPeriods::uniform(1));
        let clock = FakeClock(Rc::new(Cell::new(0)));
        let mut config = SystemConfig::default();
        config.oscillator.duty_percent = Some(50);
        let mut controller = controller(&monitor, &generator, &clock, config);

        // +500 ppm: 16_008_000 Hz -> 7816.4 -> 7816 - 1
        for k in 0..=10u32 {
            edge(&mut controller, &monitor, &clock, k * 1_000_500, LATENCY);
        }
        assert_eq!(controller.state(), LockState::Stable);

        let periods = generator.periods();
        assert_eq!(periods.period_ticks, 7815);
        let split = periods.split.expect("duty split");
        assert_eq!(split.active_ticks + split.brake_ticks, 7815);

        let status = controller.get_status_shared().read().unwrap().clone();
        assert!((status.frequency_hz - 16_008_000.0).abs() < 1e-3);
        assert_eq!(status.split, Some(split));
    }

    #[test]
    fn test_survives_clock_wrap() {
        let monitor = EdgeMonitor::new();
        let generator = WaveformGenerator::new(TickPeriods::uniform(1));
        let origin = u32::MAX - 3 * SECOND;
        let clock = FakeClock(Rc::new(Cell::new(origin)));
        let mut controller = controller(&monitor, &generator, &clock, SystemConfig::default());

        run_edges(&mut controller, &monitor, &clock, origin, 15);
        assert_eq!(controller.state(), LockState::Stable);
        assert_eq!(controller.get_status_shared().read().unwrap().violations, 0);
        assert_eq!(controller.get_status_shared().read().unwrap().uptime_secs, 15);
    }
}
