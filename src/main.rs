//! # Closed-loop velocity servo demo
//!
//! Drives three simulated ESC/encoder channels through the full control
//! pipeline: count read → velocity estimate → per-channel PID →
//! throttle-to-register mapping → pulse dispatch, paced at 200 Hz.
//!
//! Runs until interrupted (SIGINT/SIGTERM). The interrupt path commands
//! every channel to neutral throttle before the process exits, then the
//! telemetry log and its summary are written under `logs/`.
//!
//! `RUST_LOG=debug` exposes per-tick detail through the logger.

use std::{
    fs::create_dir_all,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::{error, info, warn};
use thread_priority::ThreadPriority;

use servo_rig::{
    actuation::pwm::{PwmLimits, PwmMapper},
    control::{pid::PidConfig, trajectory::Trajectory},
    rig::{RigConfig, ServoRig},
    sensing::encoder::{VelocityEstimator, VelocityUnit},
    sim::{SimParams, SimRig},
    telemetry::TelemetryLog,
};

const CHANNELS: usize = 3;
const COUNTS_PER_REVOLUTION: f64 = 1024.0;
const PWM_FREQUENCY_HZ: f64 = 500.0;
const TICK_PERIOD: Duration = Duration::from_millis(5);

// Reference waveform: ±40 Hz sinusoid, one cycle every ~31 s, phase
// staggered across channels.
const REFERENCE_AMPLITUDE_HZ: f64 = 40.0;
const REFERENCE_ANGULAR_FREQUENCY: f64 = 0.2;

// Shared velocity-loop gains. Tt stays near 1 s: the back-calculation
// drain applies 1/Tt per tick, so a small Tt overcorrects the accumulator.
const GAIN_K: f64 = 0.8;
const INTEGRAL_TIME_S: f64 = 0.5;
const DERIVATIVE_TIME_S: f64 = 0.05;
const ANTI_WINDUP_TIME_S: f64 = 1.0;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_interrupt(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Release);
}

fn install_interrupt_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_interrupt as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_interrupt as libc::sighandler_t);
    }
}

fn main() {
    env_logger::init();
    info!("=== VELOCITY SERVO RIG START ===");
    install_interrupt_handler();

    let limits = PwmLimits {
        min_throttle: -100.0,
        max_throttle: 100.0,
        min_pulse_width: 1100.0,
        max_pulse_width: 1940.0,
    };
    let mapper = match PwmMapper::new(limits, PWM_FREQUENCY_HZ) {
        Ok(mapper) => mapper,
        Err(e) => {
            error!("PWM configuration rejected: {e}");
            return;
        }
    };

    let params = SimParams {
        channels: CHANNELS,
        counts_per_revolution: COUNTS_PER_REVOLUTION,
        ..SimParams::default()
    };
    let sim = SimRig::new(params, limits, mapper.plan().output_hz);
    let (encoders, esc) = sim.split();

    // The anti-windup model is the mapper's forward model: the ESC
    // saturates at the throttle limits.
    let (throttle_floor, throttle_ceiling) = (limits.min_throttle, limits.max_throttle);
    let controllers: Result<Vec<_>, _> = (0..CHANNELS)
        .map(|_| {
            PidConfig::new(GAIN_K)
                .with_integral_time(INTEGRAL_TIME_S)
                .with_derivative_time(DERIVATIVE_TIME_S)
                .with_anti_windup(ANTI_WINDUP_TIME_S, move |v: f64| {
                    v.clamp(throttle_floor, throttle_ceiling)
                })
                .build()
        })
        .collect();
    let controllers = match controllers {
        Ok(controllers) => controllers,
        Err(e) => {
            error!("controller configuration rejected: {e}");
            return;
        }
    };

    let estimator = VelocityEstimator::new(CHANNELS, COUNTS_PER_REVOLUTION, VelocityUnit::Hz);
    info!(
        "estimating in {} at {} counts/rev",
        estimator.unit().label(),
        COUNTS_PER_REVOLUTION
    );

    let rig = ServoRig::new(
        RigConfig {
            channels: CHANNELS,
            tick_period: TICK_PERIOD,
        },
        encoders,
        esc,
        estimator,
        controllers,
        mapper,
        Trajectory::new(REFERENCE_AMPLITUDE_HZ, REFERENCE_ANGULAR_FREQUENCY, CHANNELS),
        TelemetryLog::default(),
    );
    let mut rig = match rig {
        Ok(rig) => rig,
        Err(e) => {
            error!("rig assembly failed: {e}");
            return;
        }
    };

    if let Err(e) = thread_priority::set_current_thread_priority(ThreadPriority::Max) {
        warn!("could not raise control thread priority: {e:?}");
    }

    if let Err(e) = rig.startup() {
        error!("startup failed: {e}");
        return;
    }

    info!("loop running; interrupt to stop");
    if let Err(e) = rig.run(&RUNNING) {
        error!("control loop aborted: {e}");
    }

    save_logs(rig.into_telemetry());
    info!("=== VELOCITY SERVO RIG FINISHED ===");
}

/// Write the full telemetry log and its stats summary under `logs/`,
/// stamped with the epoch second so repeated runs never collide.
fn save_logs(telemetry: TelemetryLog) {
    let log_dir = Path::new("logs");
    if let Err(e) = create_dir_all(log_dir) {
        error!("failed to create {}: {e}", log_dir.display());
        return;
    }

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let log_path = log_dir.join(format!("closed_loop_{stamp}.csv"));
    if let Err(e) = telemetry.save(&log_path) {
        error!("failed to save telemetry: {e}");
    }

    let summary_path = log_dir.join(format!("closed_loop_{stamp}_summary.csv"));
    if let Err(e) = telemetry.save_summary(&summary_path) {
        error!("failed to save telemetry summary: {e}");
    }
}
