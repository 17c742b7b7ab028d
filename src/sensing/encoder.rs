//! encoder.rs
//! Velocity estimation from cumulative quadrature encoder counts.
//!
//! The counting hardware accumulates without bound, so the estimator
//! watches count magnitude against a safety threshold and requests a
//! counter reset before the hardware integer can overflow. A reset makes
//! exactly one velocity sample discontinuous; that sample is flagged and
//! passed through rather than smoothed over.

use log::warn;

use crate::HardwareError;

/// Raw count magnitude that triggers a counter reset, comfortably below
/// the counting hardware's integer range.
pub const MAX_COUNT_MAGNITUDE: i64 = 1 << 30;

/// Connection state of the counter bank, polled once per tick by the
/// control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Faulted,
}

/// Counter bank collaborator. Reads are blocking with no timeout; a bus
/// failure is fatal to the loop.
pub trait CountSource {
    fn connection_state(&self) -> ConnectionState;

    /// Cumulative count for one channel.
    fn raw_count(&self, channel: usize) -> Result<i64, HardwareError>;

    /// Zero one channel's counter.
    fn reset_count(&mut self, channel: usize) -> Result<(), HardwareError>;
}

/// Output unit for estimated velocities. Base rate is revolutions per
/// second (count delta over counts-per-revolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VelocityUnit {
    Hz,
    RadPerSec,
    Rpm,
}

impl VelocityUnit {
    pub fn multiplier(&self) -> f64 {
        match self {
            VelocityUnit::Hz => 1.0,
            VelocityUnit::RadPerSec => std::f64::consts::TAU,
            VelocityUnit::Rpm => 60.0,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VelocityUnit::Hz => "Hz",
            VelocityUnit::RadPerSec => "rad/s",
            VelocityUnit::Rpm => "rpm",
        }
    }
}

/// One estimated velocity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VelocitySample {
    pub channel: usize,
    pub velocity: f64,
    /// True when a counter reset landed between this sample's reads,
    /// making the count delta meaningless for one tick.
    pub discontinuous: bool,
}

/// Result of one estimator update.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimateBatch {
    /// Measurement timestamp (seconds, loop clock).
    pub timestamp: f64,
    /// Empty on the priming call; one sample per channel afterwards.
    pub samples: Vec<VelocitySample>,
    /// Channels whose counters must be zeroed by the caller before the
    /// next read.
    pub resets: Vec<usize>,
}

struct Previous {
    timestamp: f64,
    signed_counts: Vec<f64>,
}

/// Converts cumulative counts into per-channel instantaneous velocity.
/// Holds the previous signed counts and timestamp; the first update only
/// primes that state.
pub struct VelocityEstimator {
    counts_per_revolution: f64,
    unit: VelocityUnit,
    direction: Vec<f64>,
    max_count_magnitude: i64,
    previous: Option<Previous>,
    pending_discontinuity: Vec<bool>,
}

impl VelocityEstimator {
    /// `counts_per_revolution` is the encoder resolution and must be
    /// positive.
    pub fn new(channels: usize, counts_per_revolution: f64, unit: VelocityUnit) -> Self {
        Self {
            counts_per_revolution,
            unit,
            direction: vec![1.0; channels],
            max_count_magnitude: MAX_COUNT_MAGNITUDE,
            previous: None,
            pending_discontinuity: vec![false; channels],
        }
    }

    pub fn unit(&self) -> VelocityUnit {
        self.unit
    }

    /// Flip the interpreted spin direction of one channel, so the sign of
    /// the velocity matches the sign convention of the ESC input.
    pub fn reverse_direction(&mut self, channel: usize) {
        self.direction[channel] *= -1.0;
    }

    /// Ingest one batch of raw counts taken at `timestamp` (seconds).
    ///
    /// velocity = Δ(signed count) / Δt / counts_per_revolution × unit
    /// multiplier. Channels listed in `resets` exceeded the safety
    /// threshold; the caller must zero them on the device. The estimator
    /// keeps its previous count untouched, so the following tick produces
    /// the one expected discontinuous sample.
    pub fn update(&mut self, raw_counts: &[i64], timestamp: f64) -> EstimateBatch {
        let signed: Vec<f64> = raw_counts
            .iter()
            .zip(&self.direction)
            .map(|(count, sign)| *count as f64 * sign)
            .collect();

        let mut samples = Vec::new();
        if let Some(prev) = &self.previous {
            let dt = (timestamp - prev.timestamp).max(f64::EPSILON);
            for (channel, (now, before)) in signed.iter().zip(&prev.signed_counts).enumerate() {
                let velocity =
                    (now - before) / dt / self.counts_per_revolution * self.unit.multiplier();
                let discontinuous = self.pending_discontinuity[channel];
                self.pending_discontinuity[channel] = false;
                samples.push(VelocitySample {
                    channel,
                    velocity,
                    discontinuous,
                });
            }
        }

        let mut resets = Vec::new();
        for (channel, count) in raw_counts.iter().enumerate() {
            if count.abs() > self.max_count_magnitude {
                warn!(
                    "channel {channel} count {count} exceeds safety threshold, requesting reset"
                );
                resets.push(channel);
                self.pending_discontinuity[channel] = true;
            }
        }

        self.previous = Some(Previous {
            timestamp,
            signed_counts: signed,
        });

        EstimateBatch {
            timestamp,
            samples,
            resets,
        }
    }
}
