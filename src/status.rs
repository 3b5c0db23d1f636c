use serde::{Deserialize, Serialize};
use crate::lock::LockState;
use crate::phase::Correction;
use crate::waveform::DutySplit;

/// Lock status published by the poller after every serviced edge
///
/// This struct contains everything an observer (the simulator report, a
/// status LED task, a host-side monitor) needs to:
/// - Show the lock state and how far it is from the next state
/// - Show the calibrated oscillator and the programmed half-wave period
/// - Count the self-healing faults seen so far
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LockStatus {
    // ========================================================================
    // Lock
    // ========================================================================
    pub state: LockState,

    /// Consecutive in-tolerance intervals since the last reset
    pub consecutive_valid: u32,

    /// Pulses in the current calibration window (STABLE/DISCIPLINED only)
    pub pulses_since_calibration: u32,

    /// Edges serviced by the poller
    pub edges: u32,

    // ========================================================================
    // Oscillator
    // ========================================================================
    pub period_ticks: u32,

    /// Last calibrated frequency; the nominal one until the first calibration
    pub frequency_hz: f64,

    pub split: Option<DutySplit>,
    pub calibrations: u32,

    // ========================================================================
    // Faults and corrections
    // ========================================================================
    pub corrections: u32,
    pub avoidances: u32,

    /// Out-of-tolerance intervals, including those inside the startup grace period
    pub violations: u32,
    pub lock_losses: u32,
    pub overruns: u32,

    /// Edges replaced before the poller serviced them
    pub overwritten_edges: u32,

    /// Deviation of the last out-of-tolerance interval from the target (us)
    pub last_deviation_micros: Option<i64>,

    pub last_correction: Option<Correction>,

    pub uptime_secs: u64,
}

impl Default for LockStatus {
    fn default() -> Self {
        LockStatus {
            state: LockState::Unlocked,
            consecutive_valid: 0,
            pulses_since_calibration: 0,
            edges: 0,

            period_ticks: 0,
            frequency_hz: 0.0,
            split: None,
            calibrations: 0,

            corrections: 0,
            avoidances: 0,
            violations: 0,
            lock_losses: 0,
            overruns: 0,
            overwritten_edges: 0,
            last_deviation_micros: None,
            last_correction: None,

            uptime_secs: 0,
        }
    }
}
