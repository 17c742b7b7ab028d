//! Simulated motor/encoder rig backing the demo binary and the test
//! suite.
//!
//! Each channel models an ESC-driven motor as a first-order lag toward the
//! throttle-proportional steady-state velocity, integrating revolutions
//! into a cumulative encoder count with a little measurement noise. The
//! simulated devices implement the same collaborator traits the real
//! hardware would, so the control loop cannot tell the difference.

use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use log::debug;
use rand::random_range;

use crate::{
    HardwareError,
    actuation::{driver::PulseDriver, pwm::PwmLimits},
    sensing::encoder::{ConnectionState, CountSource},
};

/// Electrical and mechanical parameters of the simulated channels.
#[derive(Debug, Clone, Copy)]
pub struct SimParams {
    pub channels: usize,
    /// Motor velocity constant, rpm per volt.
    pub kv: f64,
    pub supply_voltage: f64,
    /// Throttle magnitude (percent) below which the ESC does not drive.
    pub throttle_deadband: f64,
    pub counts_per_revolution: f64,
    /// First-order lag time constant, seconds.
    pub time_constant: f64,
    /// Peak measurement noise on a count read.
    pub noise_counts: i64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            channels: 3,
            kv: 300.0,
            supply_voltage: 12.0,
            throttle_deadband: 1.2,
            counts_per_revolution: 1024.0,
            time_constant: 0.15,
            noise_counts: 2,
        }
    }
}

/// Steady-state velocity (rev/s) an ESC settles at for a throttle
/// command: linear in throttle, saturated at full scale, dead below the
/// deadband.
pub fn esc_velocity_model(throttle: f64, params: &SimParams) -> f64 {
    let full_scale = params.kv * params.supply_voltage / 60.0;
    if throttle.abs() < params.throttle_deadband {
        return 0.0;
    }
    (throttle / 100.0).clamp(-1.0, 1.0) * full_scale
}

struct SimState {
    velocities: Vec<f64>,
    counts: Vec<f64>,
    throttles: Vec<f64>,
    prescale: Option<u16>,
    connection: ConnectionState,
    bus_fault_pending: bool,
    last_advance: Option<Instant>,
}

/// Point-in-time view of the simulated rig, for assertions and logging.
#[derive(Debug, Clone)]
pub struct SimSnapshot {
    pub velocities: Vec<f64>,
    pub throttles: Vec<f64>,
    pub prescale: Option<u16>,
}

/// Owner of the shared simulation state. `split` hands out the encoder
/// bank and ESC driver halves consumed by the control loop.
pub struct SimRig {
    params: SimParams,
    limits: PwmLimits,
    output_hz: f64,
    state: Arc<Mutex<SimState>>,
}

impl SimRig {
    /// `output_hz` must match the frequency plan the mapper was built
    /// with, so the driver half can invert register counts back into
    /// throttle.
    pub fn new(params: SimParams, limits: PwmLimits, output_hz: f64) -> Self {
        let state = SimState {
            velocities: vec![0.0; params.channels],
            counts: vec![0.0; params.channels],
            throttles: vec![0.0; params.channels],
            prescale: None,
            connection: ConnectionState::Connected,
            bus_fault_pending: false,
            last_advance: None,
        };
        Self {
            params,
            limits,
            output_hz,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn split(&self) -> (SimEncoders, SimEsc) {
        (
            SimEncoders {
                params: self.params,
                state: self.state.clone(),
            },
            SimEsc {
                params: self.params,
                limits: self.limits,
                output_hz: self.output_hz,
                state: self.state.clone(),
            },
        )
    }

    pub fn snapshot(&self) -> SimSnapshot {
        let s = lock(&self.state);
        SimSnapshot {
            velocities: s.velocities.clone(),
            throttles: s.throttles.clone(),
            prescale: s.prescale,
        }
    }

    /// Force a channel's cumulative count, e.g. to just below the overflow
    /// threshold.
    pub fn preload_counts(&self, channel: usize, counts: i64) {
        lock(&self.state).counts[channel] = counts as f64;
    }

    /// Make the next bus transaction fail.
    pub fn inject_bus_fault(&self) {
        lock(&self.state).bus_fault_pending = true;
    }

    pub fn set_connection_state(&self, connection: ConnectionState) {
        lock(&self.state).connection = connection;
    }
}

fn lock(state: &Arc<Mutex<SimState>>) -> std::sync::MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn advance(state: &mut SimState, params: &SimParams) {
    let now = Instant::now();
    let dt = match state.last_advance {
        Some(prev) => now.duration_since(prev).as_secs_f64(),
        None => 0.0,
    };
    state.last_advance = Some(now);
    if dt <= 0.0 {
        return;
    }

    let alpha = (dt / params.time_constant).min(1.0);
    for ch in 0..params.channels {
        let target = esc_velocity_model(state.throttles[ch], params);
        state.velocities[ch] += (target - state.velocities[ch]) * alpha;
        state.counts[ch] += state.velocities[ch] * params.counts_per_revolution * dt;
    }
}

fn take_bus_fault(state: &mut SimState, what: &str) -> Result<(), HardwareError> {
    if state.bus_fault_pending {
        state.bus_fault_pending = false;
        return Err(HardwareError::Bus {
            details: format!("injected fault during {what}"),
        });
    }
    Ok(())
}

/// Encoder-bank half of the simulated rig.
pub struct SimEncoders {
    params: SimParams,
    state: Arc<Mutex<SimState>>,
}

impl CountSource for SimEncoders {
    fn connection_state(&self) -> ConnectionState {
        lock(&self.state).connection
    }

    fn raw_count(&self, channel: usize) -> Result<i64, HardwareError> {
        if channel >= self.params.channels {
            return Err(HardwareError::BadChannel { channel });
        }
        let mut s = lock(&self.state);
        take_bus_fault(&mut s, "count read")?;
        advance(&mut s, &self.params);
        let noise = if self.params.noise_counts > 0 {
            random_range(-self.params.noise_counts..=self.params.noise_counts)
        } else {
            0
        };
        Ok(s.counts[channel] as i64 + noise)
    }

    fn reset_count(&mut self, channel: usize) -> Result<(), HardwareError> {
        if channel >= self.params.channels {
            return Err(HardwareError::BadChannel { channel });
        }
        let mut s = lock(&self.state);
        take_bus_fault(&mut s, "count reset")?;
        s.counts[channel] = 0.0;
        Ok(())
    }
}

/// ESC/PWM-driver half of the simulated rig. Register writes are
/// inverted back into throttle so the motor model can respond.
pub struct SimEsc {
    params: SimParams,
    limits: PwmLimits,
    output_hz: f64,
    state: Arc<Mutex<SimState>>,
}

impl PulseDriver for SimEsc {
    fn set_prescale(&mut self, prescale: u16) -> Result<(), HardwareError> {
        let mut s = lock(&self.state);
        take_bus_fault(&mut s, "prescale write")?;
        s.prescale = Some(prescale);
        Ok(())
    }

    fn set_channel_pulse(
        &mut self,
        channel: usize,
        on: u16,
        off: u16,
    ) -> Result<(), HardwareError> {
        if channel >= self.params.channels {
            return Err(HardwareError::BadChannel { channel });
        }
        let mut s = lock(&self.state);
        take_bus_fault(&mut s, "pulse write")?;
        advance(&mut s, &self.params);

        // Invert the register pair: counts → pulse width → throttle.
        let counts = off.saturating_sub(on) as f64;
        let pulse_width = (counts + 1.0) / (self.output_hz * 1e-6 * 4096.0);
        let l = &self.limits;
        let throttle = (pulse_width - l.min_pulse_width)
            / (l.max_pulse_width - l.min_pulse_width)
            * (l.max_throttle - l.min_throttle)
            + l.min_throttle;
        debug!("sim esc ch{channel}: {pulse_width:.1} µs -> {throttle:.2}%");
        s.throttles[channel] = throttle;
        Ok(())
    }
}
