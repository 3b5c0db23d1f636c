//! Structured diagnostic events and the sinks that consume them.
//!
//! Every runtime fault is non-fatal and self-healing; it is reported here
//! and the generator keeps running.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use crate::lock::LockState;
use crate::waveform::{DutySplit, PhaseState};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Diagnostic {
    StateChanged {
        from: LockState,
        to: LockState,
    },
    Calibrated {
        pulses: u32,
        elapsed_micros: u32,
        frequency_hz: f64,
        period_ticks: u32,
        split: Option<DutySplit>,
    },
    ToleranceViolation {
        deviation_micros: i64,
    },
    LockLost {
        deviation_micros: i64,
    },
    AvoidanceTriggered {
        remaining_ticks: u32,
        wait_micros: u32,
    },
    PollerOverrun {
        latency_micros: u32,
    },
    PhaseCorrected {
        observed_ticks: u32,
        previous: PhaseState,
        corrected: PhaseState,
    },
}

#[cfg_attr(test, mockall::automock)]
pub trait DiagnosticSink {
    fn emit(&mut self, event: &Diagnostic);
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for &mut S {
    fn emit(&mut self, event: &Diagnostic) {
        (**self).emit(event)
    }
}

/// Writes diagnostics through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn emit(&mut self, event: &Diagnostic) {
        match *event {
            Diagnostic::StateChanged { from, to } => {
                info!("[LOCK] === {} === (was {})", to, from);
            }
            Diagnostic::Calibrated { pulses, elapsed_micros, frequency_hz, period_ticks, split } => {
                info!("[CAL] Window: {} pulses / {}us", pulses, elapsed_micros);
                info!("[CAL] Oscillator: {:.0}Hz  Half-wave: {} ticks", frequency_hz, period_ticks);
                if let Some(split) = split {
                    info!("[CAL] Duty {}%: active {} / brake {} ticks",
                          split.duty_percent, split.active_ticks, split.brake_ticks);
                }
            }
            Diagnostic::ToleranceViolation { deviation_micros } => {
                warn!("[LOCK] Unexpected reference edge. Deviation: {:+}us", deviation_micros);
            }
            Diagnostic::LockLost { deviation_micros } => {
                warn!("[LOCK] Lock lost. Deviation: {:+}us", deviation_micros);
            }
            Diagnostic::AvoidanceTriggered { remaining_ticks, wait_micros } => {
                info!("[PHASE] Avoidance triggered: {} ticks to next tick, waited {}us",
                      remaining_ticks, wait_micros);
            }
            Diagnostic::PollerOverrun { latency_micros } => {
                warn!("[POLL] Edge serviced {}ms late; other tasks in the loop take too long",
                      latency_micros / 1000);
            }
            Diagnostic::PhaseCorrected { observed_ticks, previous, corrected } => {
                debug!("[PHASE] observed={} ticks  was {}:{}  now {}:{}",
                       observed_ticks,
                       previous.half_wave_index, previous.sub_tick_offset,
                       corrected.half_wave_index, corrected.sub_tick_offset);
            }
        }
    }
}

/// Keeps every event (and optionally forwards it), for tests and the simulator.
#[derive(Debug, Default)]
pub struct RecordingSink<S = LogSink> {
    events: Vec<Diagnostic>,
    forward: Option<S>,
}

impl RecordingSink<LogSink> {
    pub fn new() -> Self {
        RecordingSink { events: Vec::new(), forward: None }
    }
}

impl<S: DiagnosticSink> RecordingSink<S> {
    pub fn forwarding(inner: S) -> Self {
        RecordingSink { events: Vec::new(), forward: Some(inner) }
    }

    pub fn events(&self) -> &[Diagnostic] {
        &self.events
    }

    pub fn count(&self, matches: impl Fn(&Diagnostic) -> bool) -> usize {
        self.events.iter().filter(|event| matches(event)).count()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl<S: DiagnosticSink> DiagnosticSink for RecordingSink<S> {
    fn emit(&mut self, event: &Diagnostic) {
        self.events.push(*event);
        if let Some(inner) = self.forward.as_mut() {
            inner.emit(event);
        }
    }
}
