//! rig.rs
//! The closed-loop orchestrator: read counts → estimate velocity → PID →
//! register counts → dispatch, at a best-effort fixed rate on a single
//! thread.
//!
//! No hard real-time guarantee is made; the loop paces itself with an
//! absolute deadline schedule and counts overruns. The one ordering
//! guarantee that matters for safety: when the run loop exits on the
//! shutdown flag, every channel is commanded to neutral throttle before
//! control returns to the caller.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use snafu::Snafu;
use spin_sleep::{SpinSleeper, SpinStrategy};

use crate::{
    HardwareError,
    actuation::{
        driver::{NEUTRAL_THROTTLE, PulseDriver},
        pwm::PwmMapper,
    },
    control::{pid::PidController, trajectory::Trajectory},
    sensing::encoder::{ConnectionState, CountSource, VelocityEstimator},
    telemetry::TelemetryLog,
};

#[derive(Debug, Snafu)]
pub enum RigError {
    #[snafu(display("{source}"), context(false))]
    Hardware { source: HardwareError },

    #[snafu(display("counter bank reported a faulted connection"))]
    SensorFaulted,

    #[snafu(display("{controllers} controllers configured for {channels} channels"))]
    ChannelMismatch { controllers: usize, channels: usize },
}

/// What one call to [`ServoRig::step`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Counter bank not attached; nothing read or commanded.
    Skipped,
    /// First measurement recorded; controllers start next tick.
    Primed,
    /// Full tick: measurements taken, commands dispatched.
    Commanded,
}

pub struct RigConfig {
    pub channels: usize,
    pub tick_period: Duration,
}

/// Composes the estimator, the per-channel controllers, the command
/// mapper and the hardware collaborators into one synchronous loop.
/// Exclusive owner of all per-channel state; nothing here needs a lock.
pub struct ServoRig<S: CountSource, D: PulseDriver> {
    config: RigConfig,
    encoders: S,
    driver: D,
    estimator: VelocityEstimator,
    controllers: Vec<PidController>,
    mapper: PwmMapper,
    trajectory: Trajectory,
    telemetry: TelemetryLog,
    run_start: Instant,
    overruns: u64,
}

impl<S: CountSource, D: PulseDriver> ServoRig<S, D> {
    pub fn new(
        config: RigConfig,
        encoders: S,
        driver: D,
        estimator: VelocityEstimator,
        controllers: Vec<PidController>,
        mapper: PwmMapper,
        trajectory: Trajectory,
        telemetry: TelemetryLog,
    ) -> Result<Self, RigError> {
        if controllers.len() != config.channels {
            return Err(RigError::ChannelMismatch {
                controllers: controllers.len(),
                channels: config.channels,
            });
        }
        Ok(Self {
            config,
            encoders,
            driver,
            estimator,
            controllers,
            mapper,
            trajectory,
            telemetry,
            run_start: Instant::now(),
            overruns: 0,
        })
    }

    /// Seconds since the rig was constructed; the shared time base for
    /// measurements, references and controller timestamps.
    fn clock(&self) -> f64 {
        self.run_start.elapsed().as_secs_f64()
    }

    /// Program the prescaler and arm every ESC at neutral throttle.
    pub fn startup(&mut self) -> Result<(), RigError> {
        let prescale = self.mapper.plan().prescale;
        info!("programming prescale {prescale} and arming {} channels", self.config.channels);
        self.driver.set_prescale(prescale)?;
        self.command_all(NEUTRAL_THROTTLE)
    }

    /// One control tick. Does not sleep; pacing belongs to [`Self::run`].
    pub fn step(&mut self) -> Result<TickOutcome, RigError> {
        let tick_start = Instant::now();

        match self.encoders.connection_state() {
            ConnectionState::Connected => {}
            ConnectionState::Disconnected => {
                warn!("counter bank disconnected, skipping tick");
                return Ok(TickOutcome::Skipped);
            }
            ConnectionState::Faulted => return Err(RigError::SensorFaulted),
        }

        // Read every channel back to back: the closest this bus gets to a
        // simultaneous sample.
        let measured_at = self.clock();
        let mut counts = Vec::with_capacity(self.config.channels);
        for channel in 0..self.config.channels {
            counts.push(self.encoders.raw_count(channel)?);
        }

        let batch = self.estimator.update(&counts, measured_at);
        for &channel in &batch.resets {
            self.encoders.reset_count(channel)?;
        }

        for (channel, count) in counts.iter().enumerate() {
            self.telemetry
                .record(&format!("counts_ch{channel}"), *count as f64);
        }

        if batch.samples.is_empty() {
            debug!("estimator primed");
            return Ok(TickOutcome::Primed);
        }

        let command_instant = Instant::now();
        let command_at = self.clock();
        for sample in &batch.samples {
            let channel = sample.channel;
            if sample.discontinuous {
                debug!("channel {channel}: discontinuous velocity sample after counter reset");
            }
            let reference = self.trajectory.reference(channel, command_at);
            let throttle =
                self.controllers[channel].update(reference, (command_at, sample.velocity));
            let pulse = self.mapper.throttle_to_counts(throttle);
            self.driver.set_channel_pulse(channel, pulse.on, pulse.off)?;

            self.telemetry
                .record(&format!("measured_velocity_ch{channel}"), sample.velocity);
            self.telemetry
                .record(&format!("reference_velocity_ch{channel}"), reference);
            self.telemetry
                .record(&format!("commanded_throttle_ch{channel}"), throttle);
            self.telemetry.record(
                &format!("commanded_counts_ch{channel}"),
                (pulse.off - pulse.on) as f64,
            );
        }

        let tick_end = Instant::now();
        self.telemetry.record(
            "iteration_latency",
            tick_end.duration_since(tick_start).as_secs_f64(),
        );
        self.telemetry.record(
            "command_latency",
            tick_end.duration_since(command_instant).as_secs_f64(),
        );
        self.telemetry
            .record("measurement_to_command_latency", command_at - measured_at);

        Ok(TickOutcome::Commanded)
    }

    /// Run ticks at the configured rate until `running` clears, then
    /// command every channel to neutral before returning.
    ///
    /// A hardware failure mid-tick propagates immediately; the neutral
    /// sequence is only guaranteed on the flag-driven exit path.
    pub fn run(&mut self, running: &AtomicBool) -> Result<(), RigError> {
        let period = self.config.tick_period;
        let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);
        let mut next_deadline = Instant::now() + period;

        info!(
            "control loop running: {} channels at {:.1} Hz",
            self.config.channels,
            1.0 / period.as_secs_f64()
        );

        while running.load(Ordering::Acquire) {
            self.step()?;

            let now = Instant::now();
            if now < next_deadline {
                sleeper.sleep(next_deadline - now);
            } else {
                // Tick overran its slot; skip the sleep and note it.
                self.overruns += 1;
            }
            next_deadline += period;
        }

        info!(
            "shutdown requested after {} overruns; commanding neutral throttle",
            self.overruns
        );
        self.shutdown_neutral()
    }

    /// Command every channel to neutral. Attempts all channels even if
    /// one write fails, then reports the first failure.
    pub fn shutdown_neutral(&mut self) -> Result<(), RigError> {
        self.command_all(NEUTRAL_THROTTLE)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn telemetry(&self) -> &TelemetryLog {
        &self.telemetry
    }

    pub fn into_telemetry(self) -> TelemetryLog {
        self.telemetry
    }

    fn command_all(&mut self, throttle: f64) -> Result<(), RigError> {
        let pulse = self.mapper.throttle_to_counts(throttle);
        let mut first_failure = None;
        for channel in 0..self.config.channels {
            if let Err(e) = self.driver.set_channel_pulse(channel, pulse.on, pulse.off) {
                error!("channel {channel}: neutral command failed: {e}");
                first_failure.get_or_insert(e);
            }
        }
        match first_failure {
            None => Ok(()),
            Some(e) => Err(e.into()),
        }
    }
}
