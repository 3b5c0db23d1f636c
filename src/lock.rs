//! Lock State Machine
//!
//! ```text
//! UNLOCKED --valid--> ACCUMULATING --K_STABLE valid--> STABLE --K_CALIBRATE--> DISCIPLINED
//!    ^                                                                          |
//!    +------------------ any out-of-tolerance interval (no hysteresis) ---------+
//! ```
//!
//! Reaching STABLE triggers a short-window calibration; every K_CALIBRATE
//! pulses after that triggers a full-window calibration. The window restarts
//! after each calibration.

use serde::{Deserialize, Serialize};
use std::fmt;
use crate::clock::micros_since;
use crate::config::LockConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LockState {
    Unlocked,
    Accumulating,
    Stable,
    Disciplined,
}

impl LockState {
    /// Phase corrections are applied in these states.
    pub fn is_locked(self) -> bool {
        matches!(self, LockState::Stable | LockState::Disciplined)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockState::Unlocked => "UNLOCKED",
            LockState::Accumulating => "ACCUMULATING",
            LockState::Stable => "STABLE",
            LockState::Disciplined => "DISCIPLINED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// First calibration on reaching STABLE
    Short,
    /// Periodic calibration over K_CALIBRATE pulses
    Full,
}

/// Calibration window closed by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationWindow {
    pub kind: WindowKind,
    pub pulses: u32,
    pub elapsed_micros: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    /// Out-of-tolerance interval outside DISCIPLINED
    Tolerance { deviation_micros: i64 },
    /// Out-of-tolerance interval while DISCIPLINED
    LockLost { deviation_micros: i64 },
}

impl Violation {
    pub fn deviation_micros(&self) -> i64 {
        match *self {
            Violation::Tolerance { deviation_micros } | Violation::LockLost { deviation_micros } => deviation_micros,
        }
    }
}

/// What one edge did to the lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EdgeOutcome {
    pub interval_micros: Option<u32>,
    pub accepted: bool,
    pub transition: Option<(LockState, LockState)>,
    pub calibration: Option<CalibrationWindow>,
    pub violation: Option<Violation>,
}

impl EdgeOutcome {
    /// True when the edge was accepted in STABLE or DISCIPLINED.
    pub fn wants_correction(&self, state: LockState) -> bool {
        self.accepted && state.is_locked()
    }
}

pub struct LockStateMachine {
    config: LockConfig,
    state: LockState,
    consecutive_valid: u32,
    pulses_since_calibration: u32,
    window_start: u32,
    previous_edge: Option<u32>,
}

impl LockStateMachine {
    pub fn new(config: LockConfig) -> Self {
        LockStateMachine {
            config,
            state: LockState::Unlocked,
            consecutive_valid: 0,
            pulses_since_calibration: 0,
            window_start: 0,
            previous_edge: None,
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn consecutive_valid(&self) -> u32 {
        self.consecutive_valid
    }

    pub fn pulses_since_calibration(&self) -> u32 {
        self.pulses_since_calibration
    }

    pub fn window_start(&self) -> u32 {
        self.window_start
    }

    /// Classify the edge at `timestamp` and advance or reset the lock.
    pub fn on_edge(&mut self, timestamp: u32) -> EdgeOutcome {
        let mut outcome = EdgeOutcome::default();

        let previous = match self.previous_edge.replace(timestamp) {
            Some(previous) => previous,
            None => {
                // First edge ever: nothing to measure yet, open the window
                self.window_start = timestamp;
                return outcome;
            }
        };

        let interval = micros_since(timestamp, previous);
        outcome.interval_micros = Some(interval);
        let deviation = i64::from(interval) - i64::from(self.config.target_interval_micros);

        let before = self.state;
        if deviation.unsigned_abs() <= u64::from(self.config.tolerance_micros) {
            outcome.accepted = true;
            outcome.calibration = self.accept(timestamp);
        } else {
            outcome.violation = Some(self.reset(timestamp, deviation));
        }

        if self.state != before {
            outcome.transition = Some((before, self.state));
        }
        outcome
    }

    fn accept(&mut self, timestamp: u32) -> Option<CalibrationWindow> {
        self.consecutive_valid = self.consecutive_valid.saturating_add(1);

        match self.state {
            LockState::Unlocked | LockState::Accumulating => {
                if self.consecutive_valid >= self.config.stable_pulses {
                    self.state = LockState::Stable;
                    Some(self.close_window(WindowKind::Short, self.consecutive_valid, timestamp))
                } else {
                    self.state = LockState::Accumulating;
                    None
                }
            }
            LockState::Stable | LockState::Disciplined => {
                self.pulses_since_calibration += 1;
                if self.pulses_since_calibration >= self.config.calibrate_pulses {
                    self.state = LockState::Disciplined;
                    Some(self.close_window(WindowKind::Full, self.pulses_since_calibration, timestamp))
                } else {
                    None
                }
            }
        }
    }

    fn close_window(&mut self, kind: WindowKind, pulses: u32, timestamp: u32) -> CalibrationWindow {
        let window = CalibrationWindow {
            kind,
            pulses,
            elapsed_micros: micros_since(timestamp, self.window_start),
        };
        // Fresh window each time rather than a rolling one
        self.pulses_since_calibration = 0;
        self.window_start = timestamp;
        window
    }

    fn reset(&mut self, timestamp: u32, deviation_micros: i64) -> Violation {
        let lost = self.state == LockState::Disciplined;
        self.state = LockState::Unlocked;
        self.consecutive_valid = 0;
        self.pulses_since_calibration = 0;
        self.window_start = timestamp;

        if lost {
            Violation::LockLost { deviation_micros }
        } else {
            Violation::Tolerance { deviation_micros }
        }
    }
}
