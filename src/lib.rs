//! # PWM velocity servo rig
//!
//! Closed-loop velocity control for a bank of ESC-driven motors: quadrature
//! encoder counts in, 12-bit PWM register commands out.
//!
//! ## Pipeline
//! - **Sensing:** cumulative encoder counts → per-channel velocity estimate
//!   (`sensing::encoder`), with counter-overflow reset handling.
//! - **Control:** one discrete-time PID controller per channel
//!   (`control::pid`), filtered derivative, back-calculation anti-windup,
//!   setpoint weighting.
//! - **Actuation:** throttle % → pulse width → on/off register counts and
//!   PWM frequency → prescale resolution (`actuation::pwm`).
//! - **Orchestration:** best-effort fixed-rate single-threaded loop
//!   (`rig`) with latency telemetry (`telemetry`) and neutral-throttle
//!   shutdown on interrupt.
//!
//! Hardware collaborators sit behind the `sensing::encoder::CountSource`
//! and `actuation::driver::PulseDriver` traits; `sim` provides the
//! simulated rig used by the demo binary and the test suite.

pub mod actuation;
pub mod control;
pub mod rig;
pub mod sensing;
pub mod sim;
pub mod telemetry;

use snafu::Snafu;

/// Errors raised by sensor or actuator collaborators. Fatal to the control
/// loop: there is no retry path for a failed bus transaction.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum HardwareError {
    /// The addressed channel does not exist on the device.
    #[snafu(display("channel {channel} is not present on the device"))]
    BadChannel { channel: usize },

    /// A bus transaction failed mid-transfer.
    #[snafu(display("bus transaction failed: {details}"))]
    Bus { details: String },
}
