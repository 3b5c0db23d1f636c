//! Calibration Engine - measures the real oscillator frequency against the
//! reference edges and derives the half-wave tick period.
//!
//! The period is always rounded down (and then shortened by the safety
//! margin), so each generated cycle ends slightly before the next reference
//! edge. The edge and its phase correction therefore arrive while the
//! generator is already in the blanking half-wave, never in a drive pulse.

use log::debug;
use serde::{Deserialize, Serialize};
use crate::config::OscillatorConfig;
use crate::waveform::{DutySplit, TickPeriods, HALF_WAVES_PER_CYCLE};

/// Oscillator frequency implied by `pulses` reference intervals spanning
/// `elapsed_micros` of local clock time.
pub fn effective_frequency_hz(
    nominal_frequency_hz: f64,
    pulses: u32,
    elapsed_micros: u32,
    target_interval_micros: u32,
) -> f64 {
    nominal_frequency_hz * f64::from(elapsed_micros) / f64::from(pulses) / f64::from(target_interval_micros)
}

/// Unrounded ticks per half-wave at `frequency_hz`.
pub fn ideal_period_ticks(frequency_hz: f64, prescaler: u32, half_waves_per_second: u32) -> f64 {
    frequency_hz / f64::from(prescaler) / f64::from(half_waves_per_second)
}

/// Down-rounded half-wave period minus the safety margin, never below one tick.
pub fn period_ticks(frequency_hz: f64, prescaler: u32, half_waves_per_second: u32, safety_margin_ticks: u32) -> u32 {
    let ideal = ideal_period_ticks(frequency_hz, prescaler, half_waves_per_second);
    // Float-to-int `as` saturates; NaN maps to 0 and is caught by the max(1)
    let floored = ideal.floor() as u32;
    floored.saturating_sub(safety_margin_ticks).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OscillatorState {
    pub period_ticks: u32,
    pub nominal_frequency_hz: f64,
    pub calibrated_frequency_hz: f64,
    pub safety_margin_ticks: u32,
    pub split: Option<DutySplit>,
}

/// Result of one calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub pulses: u32,
    pub elapsed_micros: u32,
    pub frequency_hz: f64,
    pub period_ticks: u32,
    pub split: Option<DutySplit>,
}

impl Calibration {
    pub fn tick_periods(&self) -> TickPeriods {
        TickPeriods {
            period_ticks: self.period_ticks,
            split: self.split,
        }
    }
}

pub struct CalibrationEngine {
    config: OscillatorConfig,
    target_interval_micros: u32,
    state: OscillatorState,
    calibrations: u32,
}

impl CalibrationEngine {
    /// Starts from the nominal frequency; nothing is carried over from a
    /// previous run.
    pub fn new(config: OscillatorConfig, target_interval_micros: u32) -> Self {
        let nominal = config.nominal_frequency_hz;
        let period_ticks = period_ticks(
            nominal,
            config.prescaler,
            u32::from(HALF_WAVES_PER_CYCLE),
            config.safety_margin_ticks,
        );
        let state = OscillatorState {
            period_ticks,
            nominal_frequency_hz: nominal,
            calibrated_frequency_hz: nominal,
            safety_margin_ticks: config.safety_margin_ticks,
            split: config.duty_percent.map(|duty| DutySplit::from_period(period_ticks, duty)),
        };
        CalibrationEngine {
            config,
            target_interval_micros,
            state,
            calibrations: 0,
        }
    }

    /// Recompute frequency and period from a calibration window.
    /// Returns `None` for an empty window, leaving the state untouched.
    pub fn calibrate(&mut self, pulses: u32, elapsed_micros: u32) -> Option<Calibration> {
        if pulses == 0 || elapsed_micros == 0 {
            return None;
        }

        let frequency_hz = effective_frequency_hz(
            self.config.nominal_frequency_hz,
            pulses,
            elapsed_micros,
            self.target_interval_micros,
        );
        let period_ticks = period_ticks(
            frequency_hz,
            self.config.prescaler,
            u32::from(HALF_WAVES_PER_CYCLE),
            self.config.safety_margin_ticks,
        );
        let split = self
            .config
            .duty_percent
            .map(|duty| DutySplit::from_period(period_ticks, duty));

        debug!("[CAL] window={} pulses/{}us freq={:.1}Hz period={} ticks",
               pulses, elapsed_micros, frequency_hz, period_ticks);

        self.state.calibrated_frequency_hz = frequency_hz;
        self.state.period_ticks = period_ticks;
        self.state.split = split;
        self.calibrations += 1;

        Some(Calibration {
            pulses,
            elapsed_micros,
            frequency_hz,
            period_ticks,
            split,
        })
    }

    pub fn state(&self) -> &OscillatorState {
        &self.state
    }

    pub fn tick_periods(&self) -> TickPeriods {
        TickPeriods {
            period_ticks: self.state.period_ticks,
            split: self.state.split,
        }
    }

    pub fn calibrations(&self) -> u32 {
        self.calibrations
    }
}
