//! pwm.rs
//! Throttle → pulse-width → register-count mapping and PWM frequency
//! resolution for a 12-bit, 4096-counts-per-cycle PWM controller.
//!
//! The timing hardware systematically overshoots the requested frequency,
//! so requests are pre-scaled by an empirical correction factor before the
//! integer prescale is computed, and the achievable output frequency is
//! recovered by dividing the correction back out.

use log::{info, warn};
use serde::Serialize;
use snafu::Snafu;

/// Counts per PWM cycle (12-bit window).
pub const PWM_RESOLUTION: f64 = 4096.0;

/// Highest addressable count within one cycle.
pub const MAX_COUNT: u16 = 4095;

/// Internal oscillator feeding the prescaler.
pub const REFERENCE_CLOCK_HZ: f64 = 25_000_000.0;

/// Empirical correction for the hardware's frequency overshoot.
pub const FREQUENCY_SCALING_FACTOR: f64 = 0.97;

/// Fixed delay (counts) before each pulse goes high. Staggering channel
/// rise times keeps the ESCs from drawing inrush current simultaneously.
pub const ON_DELAY_COUNTS: u16 = 10;

/// Margin (µs) required between the PWM window and the longest pulse the
/// rig must command; closer than this risks clipping the output.
const WINDOW_MARGIN_US: f64 = 50.0;

#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum PwmError {
    #[snafu(display("throttle bounds [{min_throttle}, {max_throttle}] and pulse bounds \
                     [{min_pulse_width}, {max_pulse_width}] must both be increasing"))]
    InvalidLimits {
        min_throttle: f64,
        max_throttle: f64,
        min_pulse_width: f64,
        max_pulse_width: f64,
    },

    #[snafu(display("explicit count {counts} is outside 0..={max}", max = MAX_COUNT))]
    CountsOutOfRange { counts: u16 },

    #[snafu(display("requested frequency {requested_hz} Hz cannot be reached with a \
                     non-negative prescale"))]
    UnresolvableFrequency { requested_hz: f64 },
}

/// Throttle and pulse-width operating range of the connected ESCs.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PwmLimits {
    /// Throttle bounds, percent.
    pub min_throttle: f64,
    pub max_throttle: f64,
    /// Pulse-width bounds, microseconds.
    pub min_pulse_width: f64,
    pub max_pulse_width: f64,
}

/// Outcome of resolving a requested PWM frequency onto the integer
/// prescaler.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FrequencyPlan {
    pub requested_hz: f64,
    /// Request after the overshoot correction.
    pub corrected_hz: f64,
    pub ideal_prescale: f64,
    /// Nearest integer the hardware accepts.
    pub prescale: u16,
    /// Frequency the divider actually produces from the reference clock.
    pub commanded_hz: f64,
    /// Estimated true output frequency (correction divided back out).
    pub output_hz: f64,
    /// One output cycle, microseconds.
    pub window_width_us: f64,
    /// True when the window leaves less than the safety margin above the
    /// longest pulse width; resolution loss there clips the output.
    pub clipping_risk: bool,
}

/// One channel command in register form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseCommand {
    pub on: u16,
    pub off: u16,
    /// Pulse width reproduced from the rounded counts, microseconds.
    pub pulse_width_us: f64,
}

/// Resolve `requested_hz` onto the prescaler: correct for overshoot,
/// round the ideal divider to the nearest integer, then recover the
/// frequency the hardware will really produce.
pub fn resolve_frequency(requested_hz: f64, limits: &PwmLimits) -> Result<FrequencyPlan, PwmError> {
    if requested_hz <= 0.0 {
        return Err(PwmError::UnresolvableFrequency { requested_hz });
    }

    let corrected_hz = FREQUENCY_SCALING_FACTOR * requested_hz;
    let ideal_prescale = REFERENCE_CLOCK_HZ / PWM_RESOLUTION / corrected_hz - 1.0;
    let rounded = ideal_prescale.round();
    if rounded < 0.0 {
        return Err(PwmError::UnresolvableFrequency { requested_hz });
    }
    let prescale = rounded as u16;

    let commanded_hz = REFERENCE_CLOCK_HZ / PWM_RESOLUTION / (prescale as f64 + 1.0);
    let output_hz = commanded_hz / FREQUENCY_SCALING_FACTOR;
    let window_width_us = 1e6 / output_hz;
    let clipping_risk = window_width_us < limits.max_pulse_width + WINDOW_MARGIN_US;

    Ok(FrequencyPlan {
        requested_hz,
        corrected_hz,
        ideal_prescale,
        prescale,
        commanded_hz,
        output_hz,
        window_width_us,
        clipping_risk,
    })
}

/// Maps normalized throttle onto the pulse registers of one PWM device.
/// Construction resolves the operating frequency once; every later count
/// conversion uses the achievable output frequency, not the request.
pub struct PwmMapper {
    limits: PwmLimits,
    plan: FrequencyPlan,
}

impl PwmMapper {
    pub fn new(limits: PwmLimits, requested_hz: f64) -> Result<Self, PwmError> {
        if limits.min_throttle >= limits.max_throttle
            || limits.min_pulse_width >= limits.max_pulse_width
        {
            return Err(PwmError::InvalidLimits {
                min_throttle: limits.min_throttle,
                max_throttle: limits.max_throttle,
                min_pulse_width: limits.min_pulse_width,
                max_pulse_width: limits.max_pulse_width,
            });
        }

        let plan = resolve_frequency(requested_hz, &limits)?;
        info!(
            "PWM frequency plan: requested {:.1} Hz, prescale {} (ideal {:.3}), \
             output {:.2} Hz, window {:.1} µs",
            plan.requested_hz, plan.prescale, plan.ideal_prescale, plan.output_hz,
            plan.window_width_us
        );
        if plan.clipping_risk {
            warn!(
                "PWM window {:.1} µs is within {} µs of the max pulse width {:.1} µs; \
                 raise the frequency margin to avoid output clipping",
                plan.window_width_us, WINDOW_MARGIN_US, limits.max_pulse_width
            );
        }

        Ok(Self { limits, plan })
    }

    pub fn plan(&self) -> &FrequencyPlan {
        &self.plan
    }

    pub fn limits(&self) -> &PwmLimits {
        &self.limits
    }

    /// Achievable throttle for a commanded value: the ESC saturates at
    /// the configured throttle bounds. Used as the actuator model for
    /// anti-windup.
    pub fn saturate(&self, throttle: f64) -> f64 {
        throttle.clamp(self.limits.min_throttle, self.limits.max_throttle)
    }

    fn pulse_width_from_throttle(&self, throttle: f64) -> f64 {
        let l = &self.limits;
        (l.max_pulse_width - l.min_pulse_width) / (l.max_throttle - l.min_throttle)
            * (throttle - l.min_throttle)
            + l.min_pulse_width
    }

    /// Pulse width (µs) reproduced from a register count.
    pub fn pulse_width_from_counts(&self, counts: u16) -> f64 {
        (counts as f64 + 1.0) / (self.plan.output_hz * 1e-6 * PWM_RESOLUTION)
    }

    /// Map a throttle command onto the on/off register pair. Throttle is
    /// saturated to the configured range; the count is rounded onto the
    /// 12-bit window and the achievable pulse width is reported back.
    pub fn throttle_to_counts(&self, throttle: f64) -> PulseCommand {
        let pulse_width = self.pulse_width_from_throttle(self.saturate(throttle));
        let counts = (pulse_width * self.plan.output_hz * 1e-6 * PWM_RESOLUTION).round() - 1.0;
        let counts = counts.clamp(0.0, MAX_COUNT as f64) as u16;
        self.command_from_counts(counts)
    }

    /// Build a command directly from an explicit count value. Counts
    /// outside the device range are rejected without side effects.
    pub fn pulse_from_counts(&self, counts: u16) -> Result<PulseCommand, PwmError> {
        if counts > MAX_COUNT {
            return Err(PwmError::CountsOutOfRange { counts });
        }
        Ok(self.command_from_counts(counts))
    }

    fn command_from_counts(&self, counts: u16) -> PulseCommand {
        PulseCommand {
            on: ON_DELAY_COUNTS,
            off: counts + ON_DELAY_COUNTS,
            pulse_width_us: self.pulse_width_from_counts(counts),
        }
    }
}
