use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use crate::calibration::ideal_period_ticks;
use crate::waveform::HALF_WAVES_PER_CYCLE;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub oscillator: OscillatorConfig,
    pub lock: LockConfig,
    pub corrector: CorrectorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OscillatorConfig {
    pub nominal_frequency_hz: f64,
    pub prescaler: u32,
    pub tick_micros: u32,           // Timer resolution at this prescaler
    pub safety_margin_ticks: u32,   // Subtracted after down-rounding; impact = margin * 32 ticks per cycle
    pub duty_percent: Option<u8>,   // None = no active/brake split
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub target_interval_micros: u32,
    pub tolerance_micros: u32,
    pub stable_pulses: u32,         // "K_STABLE"
    pub calibrate_pulses: u32,      // "K_CALIBRATE"
    pub startup_grace_micros: u32,  // Deviations expected right after power-up
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectorConfig {
    pub avoidance_threshold_ticks: u32,
    pub avoidance_margin_ticks: u32,
    pub latency_compensation_ticks: u32,
    pub overrun_threshold_micros: u32,
    pub overrun_warning_interval_secs: u64,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            oscillator: OscillatorConfig::default(),
            lock: LockConfig::default(),
            corrector: CorrectorConfig::default(),
        }
    }
}

impl Default for OscillatorConfig {
    fn default() -> Self {
        OscillatorConfig {
            nominal_frequency_hz: 16_000_000.0, // Ceramic resonator, +/- 0.5%
            prescaler: 64,
            tick_micros: 4,
            safety_margin_ticks: 1,
            duty_percent: None,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            target_interval_micros: 1_000_000,
            tolerance_micros: 10_000, // 2 x 0.5% resonator tolerance
            stable_pulses: 10,
            calibrate_pulses: 60,
            startup_grace_micros: 2_000_000,
        }
    }
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        CorrectorConfig {
            avoidance_threshold_ticks: 50,
            avoidance_margin_ticks: 8,
            latency_compensation_ticks: 2,
            overrun_threshold_micros: 50_000,
            overrun_warning_interval_secs: 3600,
        }
    }
}

impl SystemConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: SystemConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let osc = &self.oscillator;
        let lock = &self.lock;

        ensure!(
            osc.nominal_frequency_hz.is_finite() && osc.nominal_frequency_hz > 0.0,
            "nominal_frequency_hz must be positive (got {})",
            osc.nominal_frequency_hz
        );
        ensure!(osc.prescaler > 0, "prescaler must be positive");
        ensure!(osc.tick_micros > 0, "tick_micros must be positive");
        if let Some(duty) = osc.duty_percent {
            ensure!(duty <= 100, "duty_percent must be within 0..=100 (got {})", duty);
        }

        ensure!(lock.target_interval_micros > 0, "target_interval_micros must be positive");
        ensure!(
            lock.tolerance_micros < lock.target_interval_micros,
            "tolerance_micros ({}) must be below target_interval_micros ({})",
            lock.tolerance_micros,
            lock.target_interval_micros
        );
        ensure!(lock.stable_pulses >= 1, "stable_pulses must be at least 1");
        ensure!(lock.calibrate_pulses >= 1, "calibrate_pulses must be at least 1");

        // The calibration window is measured with the wrapping 32-bit micros clock
        let longest_window = u64::from(lock.calibrate_pulses.max(lock.stable_pulses))
            * (u64::from(lock.target_interval_micros) + u64::from(lock.tolerance_micros));
        ensure!(
            longest_window < u64::from(u32::MAX),
            "calibration window of {} us exceeds the microsecond clock range",
            longest_window
        );

        let ideal = ideal_period_ticks(osc.nominal_frequency_hz, osc.prescaler, u32::from(HALF_WAVES_PER_CYCLE));
        ensure!(
            ideal.floor() > f64::from(osc.safety_margin_ticks),
            "safety_margin_ticks ({}) leaves no half-wave period (ideal {:.1} ticks)",
            osc.safety_margin_ticks,
            ideal
        );

        Ok(())
    }
}
