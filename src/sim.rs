//! Host simulator
//!
//! Runs the real edge handler, tick handler and controller against a modelled
//! board: a 32-bit microsecond clock and a tick timer that both count on a
//! drifting oscillator, and a 1 Hz reference with uniform jitter. Time is kept
//! in local (oscillator) microseconds, so the reference interval is what
//! stretches or shrinks with the drift.

use anyhow::{ensure, Result};
use embedded_hal::delay::DelayNs;
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use crate::calibration::CalibrationEngine;
use crate::clock::MicrosClock;
use crate::config::SystemConfig;
use crate::controller::DisciplineController;
use crate::diagnostics::{Diagnostic, LogSink, RecordingSink};
use crate::edge::EdgeMonitor;
use crate::lock::LockState;
use crate::status::LockStatus;
use crate::traits::{DriveOutput, TickTimer};
use crate::waveform::{DriveLevel, WaveformGenerator, HALF_WAVES_PER_CYCLE};

/// Where the first reference edge falls relative to power-up.
const FIRST_EDGE_MICROS: u64 = 250_000;
const STATUS_LOG_EVERY_EDGES: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimScenario {
    pub seconds: u32,
    pub drift_ppm: f64,
    pub jitter_micros: u32,
    pub poll_latency_micros: u32,
    /// Spurious extra edges, in reference seconds after power-up
    pub glitch_at_secs: Vec<f64>,
    pub seed: u64,
    /// Initial micros clock value
    pub clock_origin: u32,
}

impl Default for SimScenario {
    fn default() -> Self {
        SimScenario {
            seconds: 120,
            drift_ppm: 0.0,
            jitter_micros: 2,
            poll_latency_micros: 300,
            glitch_at_secs: Vec::new(),
            seed: 1,
            // Wraps 30 s into the run
            clock_origin: u32::MAX - 30_000_000,
        }
    }
}

/// Generator position observed as a reference edge arrived.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EdgeSample {
    pub edge: u32,
    pub state: LockState,
    pub blanking: bool,
    /// Distance from the nearest cycle start; positive when the cycle began before the edge
    pub phase_error_micros: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub edges: u32,
    pub final_state: LockState,
    pub disciplined_edges: u32,
    pub blank_at_edge: u32,
    pub max_phase_error_micros: i64,
    pub ticks: u64,
    pub level_changes: u64,
    pub samples: Vec<EdgeSample>,
    pub diagnostics: Vec<Diagnostic>,
    pub status: LockStatus,
}

impl SimReport {
    pub fn count(&self, matches: impl Fn(&Diagnostic) -> bool) -> usize {
        self.diagnostics.iter().filter(|event| matches(event)).count()
    }

    pub fn log_summary(&self) {
        info!("=== Simulation Summary ===");
        info!("Edges: {}  Final state: {}", self.edges, self.final_state);
        info!("Disciplined edges: {}  in blanking: {}  max phase error: {}us",
              self.disciplined_edges, self.blank_at_edge, self.max_phase_error_micros);
        info!("Period: {} ticks  Frequency: {:.1}Hz  Calibrations: {}",
              self.status.period_ticks, self.status.frequency_hz, self.status.calibrations);
        info!("Corrections: {}  Avoidances: {}  Violations: {}  Lock losses: {}  Overruns: {}",
              self.status.corrections, self.status.avoidances, self.status.violations,
              self.status.lock_losses, self.status.overruns);
        info!("Ticks: {}  Output changes: {}", self.ticks, self.level_changes);
    }
}

// --- Board model ---

struct BoardState {
    now: u64, // local microseconds since power-up
    counter_base: u64,
    compare: u32,
    level: DriveLevel,
    ticks: u64,
    level_changes: u64,
}

struct Board {
    tick_micros: u64,
    origin: u32,
    state: RefCell<BoardState>,
    monitor: EdgeMonitor,
    generator: WaveformGenerator,
}

impl Board {
    fn new(config: &SystemConfig, origin: u32) -> Self {
        let periods = CalibrationEngine::new(config.oscillator.clone(), config.lock.target_interval_micros)
            .tick_periods();
        Board {
            tick_micros: u64::from(config.oscillator.tick_micros),
            origin,
            state: RefCell::new(BoardState {
                now: 0,
                counter_base: 0,
                compare: 1,
                level: DriveLevel::Short,
                ticks: 0,
                level_changes: 0,
            }),
            monitor: EdgeMonitor::new(),
            generator: WaveformGenerator::new(periods),
        }
    }

    fn now(&self) -> u64 {
        self.state.borrow().now
    }

    fn next_tick_at(&self) -> u64 {
        let state = self.state.borrow();
        let due = state.counter_base + u64::from(state.compare.max(1)) * self.tick_micros;
        // A compare value written below the running counter fires at once
        due.max(state.now)
    }

    /// Advance local time to `until`, firing every tick interrupt on the way.
    fn run_until(&self, until: u64) {
        loop {
            let next = self.next_tick_at();
            if next > until {
                break;
            }
            {
                let mut state = self.state.borrow_mut();
                state.now = next;
                state.counter_base = next;
                state.ticks += 1;
            }
            self.generator.on_tick(&mut SimTimer(self), &mut SimOutput(self));
        }
        let mut state = self.state.borrow_mut();
        state.now = state.now.max(until);
    }
}

#[derive(Clone, Copy)]
struct SimClock<'a>(&'a Board);

impl MicrosClock for SimClock<'_> {
    fn now_micros(&self) -> u32 {
        // Truncation is the 32-bit wrap
        self.0.origin.wrapping_add(self.0.now() as u32)
    }
}

struct SimTimer<'a>(&'a Board);

impl TickTimer for SimTimer<'_> {
    fn counter(&self) -> u32 {
        let state = self.0.state.borrow();
        (state.now.saturating_sub(state.counter_base) / self.0.tick_micros) as u32
    }

    fn set_counter(&mut self, ticks: u32) {
        let mut state = self.0.state.borrow_mut();
        state.counter_base = state.now.saturating_sub(u64::from(ticks) * self.0.tick_micros);
    }

    fn compare(&self) -> u32 {
        self.0.state.borrow().compare
    }

    fn set_compare(&mut self, ticks: u32) {
        self.0.state.borrow_mut().compare = ticks;
    }
}

struct SimOutput<'a>(&'a Board);

impl DriveOutput for SimOutput<'_> {
    fn write(&mut self, level: DriveLevel) {
        let mut state = self.0.state.borrow_mut();
        if state.level != level {
            state.level_changes += 1;
            state.level = level;
        }
    }
}

/// Busy-wait: the tick interrupt keeps firing while the poller waits.
struct SimDelay<'a>(&'a Board);

impl DelayNs for SimDelay<'_> {
    fn delay_ns(&mut self, ns: u32) {
        let until = self.0.now() + (u64::from(ns) + 999) / 1000;
        self.0.run_until(until);
    }
}

// --- Runner ---

/// Run `scenario` against `config` until its duration elapses or `stop` is set.
pub fn run(scenario: &SimScenario, config: &SystemConfig, stop: &AtomicBool) -> Result<SimReport> {
    config.validate()?;
    let osc = &config.oscillator;
    let ticks_per_micro = osc.nominal_frequency_hz / f64::from(osc.prescaler) * f64::from(osc.tick_micros) / 1e6;
    ensure!(
        (ticks_per_micro - 1.0).abs() < 1e-9,
        "tick_micros ({}) does not match {:.0}Hz / {}",
        osc.tick_micros,
        osc.nominal_frequency_hz,
        osc.prescaler
    );
    ensure!(scenario.drift_ppm.abs() < 100_000.0, "drift_ppm out of range");

    let board = Board::new(config, scenario.clock_origin);
    let clock = SimClock(&board);
    let status = Arc::new(RwLock::new(LockStatus::default()));
    let mut controller = DisciplineController::new(
        &board.monitor,
        &board.generator,
        clock,
        SimTimer(&board),
        SimOutput(&board),
        SimDelay(&board),
        RecordingSink::forwarding(LogSink),
        status,
        config.clone(),
    );
    board.generator.start(&mut SimTimer(&board), &mut SimOutput(&board));

    let edges = schedule(scenario, config.lock.target_interval_micros);
    let interval = local_interval(scenario, config.lock.target_interval_micros);
    let end = (f64::from(scenario.seconds) * interval) as u64;
    let latency = u64::from(scenario.poll_latency_micros);

    let mut samples = Vec::new();
    let mut serviced = 0u32;
    let mut real_edges = 0u32;

    info!("[SIM] {}s, drift {:+.1}ppm, jitter {}us, poll latency {}us, {} glitch(es)",
          scenario.seconds, scenario.drift_ppm, scenario.jitter_micros,
          scenario.poll_latency_micros, scenario.glitch_at_secs.len());

    for (edge_at, glitch) in edges {
        if edge_at >= end || stop.load(Ordering::SeqCst) {
            break;
        }

        board.run_until(edge_at);
        if !glitch {
            if controller.state() == LockState::Disciplined {
                samples.push(sample(&board, real_edges, controller.state()));
            }
            real_edges += 1;
            if real_edges % STATUS_LOG_EVERY_EDGES == 0 {
                controller.log_status();
            }
        }

        board.monitor.on_edge(&clock);
        board.run_until(edge_at + latency);
        controller.poll();
        serviced += 1;
    }
    if !stop.load(Ordering::SeqCst) {
        board.run_until(end);
    }

    let status = controller
        .get_status_shared()
        .read()
        .map(|status| status.clone())
        .unwrap_or_default();
    let diagnostics = controller.sink().events().to_vec();
    let final_state = controller.state();
    drop(controller);

    let state = board.state.borrow();
    Ok(SimReport {
        edges: serviced,
        final_state,
        disciplined_edges: samples.len() as u32,
        blank_at_edge: samples.iter().filter(|s| s.blanking).count() as u32,
        max_phase_error_micros: samples.iter().map(|s| s.phase_error_micros.abs()).max().unwrap_or(0),
        ticks: state.ticks,
        level_changes: state.level_changes,
        samples,
        diagnostics,
        status,
    })
}

/// Reference interval in local microseconds.
fn local_interval(scenario: &SimScenario, target_interval_micros: u32) -> f64 {
    f64::from(target_interval_micros) * (1.0 + scenario.drift_ppm * 1e-6)
}

/// Edge arrival times in local microseconds, paired with a glitch flag.
fn schedule(scenario: &SimScenario, target_interval_micros: u32) -> Vec<(u64, bool)> {
    let mut rng = StdRng::seed_from_u64(scenario.seed);
    let interval = local_interval(scenario, target_interval_micros);
    let jitter = i64::from(scenario.jitter_micros);

    let mut edges: Vec<(u64, bool)> = (0..=scenario.seconds)
        .map(|k| {
            let ideal = FIRST_EDGE_MICROS as f64 + f64::from(k) * interval;
            let at = ideal.round() as i64 + rng.random_range(-jitter..=jitter);
            (at.max(0) as u64, false)
        })
        .collect();

    edges.extend(
        scenario
            .glitch_at_secs
            .iter()
            .map(|&secs| ((FIRST_EDGE_MICROS as f64 + secs.max(0.0) * interval) as u64, true)),
    );
    edges.sort();
    edges
}

fn sample(board: &Board, edge: u32, state: LockState) -> EdgeSample {
    let phase = board.generator.phase(&SimTimer(board));
    let period = i64::from(board.generator.periods().period_ticks);
    let cycle = period * i64::from(HALF_WAVES_PER_CYCLE);

    let position = i64::from(phase.half_wave_index) * period + i64::from(phase.sub_tick_offset);
    let error_ticks = if position * 2 < cycle { position } else { position - cycle };

    EdgeSample {
        edge,
        state,
        blanking: phase.half_wave_index == 0,
        phase_error_micros: error_ticks * board.tick_micros as i64,
    }
}
