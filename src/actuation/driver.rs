//! Pulse driver collaborator: the 16-channel, 12-bit PWM controller the
//! mapper's register counts are written to.

use crate::HardwareError;

/// Neutral throttle commanded during arming and shutdown.
pub const NEUTRAL_THROTTLE: f64 = 0.0;

/// Blocking writes to the PWM hardware. Both calls may fail with a bus
/// error, which is fatal to the control loop.
pub trait PulseDriver {
    /// Program the cycle-frequency divider.
    fn set_prescale(&mut self, prescale: u16) -> Result<(), HardwareError>;

    /// Set one channel's pulse window: the output goes high at count `on`
    /// and low at count `off` within the 4096-count cycle.
    fn set_channel_pulse(&mut self, channel: usize, on: u16, off: u16)
    -> Result<(), HardwareError>;
}
