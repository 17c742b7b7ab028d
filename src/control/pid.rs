//! pid.rs
//! Discrete-time SISO PID controller after Åström & Murray ("Feedback
//! Systems", ch. 10): filtered derivative, optional back-calculation
//! anti-windup, optional setpoint weighting.
//!
//! All parameter validation happens once, in [`PidConfig::build`]. A
//! controller that constructs successfully has no runtime failure mode;
//! `update` is a plain state transition.

use log::debug;
use snafu::Snafu;

/// Invalid controller parameters, raised once at construction. A failed
/// build leaves no partially-usable controller behind.
#[derive(Debug, Clone, PartialEq, Snafu)]
pub enum ConfigError {
    /// Negative proportional gain flips the feedback sign.
    #[snafu(display("proportional gain K = {value} is negative; the loop would diverge"))]
    NegativeGain { value: f64 },

    /// Ti and Tt divide coefficient terms; zero or negative values are
    /// rejected up front instead of surfacing as NaN mid-loop.
    #[snafu(display("{name} = {value} must be strictly positive"))]
    NonPositiveTimeConstant { name: &'static str, value: f64 },

    #[snafu(display("derivative time Td = {value} is negative; the loop would diverge"))]
    NegativeDerivativeTime { value: f64 },

    #[snafu(display("derivative filter factor N = {value} must be strictly positive"))]
    InvalidFilterFactor { value: f64 },

    #[snafu(display("fixed sample period h = {value} must be strictly positive"))]
    InvalidSamplePeriod { value: f64 },

    #[snafu(display("setpoint weight b = {value} is outside [0, 1]"))]
    WeightOutOfRange { value: f64 },

    /// Back-calculation drains the integral accumulator; without integral
    /// action there is nothing to drain.
    #[snafu(display("anti-windup requires integral action (set an integral time Ti)"))]
    AntiWindupWithoutIntegral,
}

/// Controller structure, fixed at construction. Which variant applies is
/// determined by which time constants were supplied; proportional action
/// is always present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PidMode {
    P,
    Pi { ti: f64 },
    Pd { td: f64, n: f64 },
    Pid { ti: f64, td: f64, n: f64 },
}

impl PidMode {
    pub fn label(&self) -> &'static str {
        match self {
            PidMode::P => "P",
            PidMode::Pi { .. } => "PI",
            PidMode::Pd { .. } => "PD",
            PidMode::Pid { .. } => "PID",
        }
    }
}

/// Sample-period resolution per tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timing {
    /// Constant h, supplied at construction.
    Fixed(f64),
    /// h = current timestamp minus previous timestamp, recomputed each
    /// tick. Clamped to a minimal positive value so a repeated timestamp
    /// cannot zero the coefficient denominators.
    Variable,
}

/// Discrete update coefficients for one sample period. Pure function of h
/// and the controller constants; precomputed once under fixed-h timing.
#[derive(Debug, Clone, Copy, Default)]
struct Coefficients {
    ad: f64,
    bd: f64,
    bi: f64,
}

/// Back-calculation anti-windup: a model of the actuator estimates the
/// achievable output u for a commanded v, and (u - v) is fed back into the
/// integral accumulator with gain 1/Tt.
pub struct AntiWindup {
    tt: f64,
    model: Box<dyn Fn(f64) -> f64 + Send>,
}

/// Builder for [`PidController`]. Proportional gain is mandatory by
/// signature; integral and derivative action are opted into per channel.
///
/// ```
/// use servo_rig::control::pid::PidConfig;
///
/// let pid = PidConfig::new(0.8)
///     .with_integral_time(0.5)
///     .with_derivative_time(0.05)
///     .with_fixed_period(0.005)
///     .build()
///     .unwrap();
/// assert_eq!(pid.mode().label(), "PID");
/// ```
pub struct PidConfig {
    k: f64,
    ti: Option<f64>,
    td: Option<f64>,
    n: f64,
    timing: Timing,
    anti_windup: Option<AntiWindup>,
    setpoint_weight: Option<f64>,
}

/// Midpoint of the 8..20 range Åström suggests for the derivative filter.
const DEFAULT_FILTER_FACTOR: f64 = 14.0;

impl PidConfig {
    pub fn new(k: f64) -> Self {
        Self {
            k,
            ti: None,
            td: None,
            n: DEFAULT_FILTER_FACTOR,
            timing: Timing::Variable,
            anti_windup: None,
            setpoint_weight: None,
        }
    }

    /// Enable integral action with time constant Ti (seconds).
    pub fn with_integral_time(mut self, ti: f64) -> Self {
        self.ti = Some(ti);
        self
    }

    /// Enable derivative action with time constant Td (seconds).
    pub fn with_derivative_time(mut self, td: f64) -> Self {
        self.td = Some(td);
        self
    }

    /// Derivative filter factor N; the filtered derivative has time
    /// constant ≈ Td/N.
    pub fn with_filter_factor(mut self, n: f64) -> Self {
        self.n = n;
        self
    }

    /// Use a constant sample period h (seconds) instead of deriving h from
    /// the measurement timestamps.
    pub fn with_fixed_period(mut self, h: f64) -> Self {
        self.timing = Timing::Fixed(h);
        self
    }

    /// Enable back-calculation anti-windup. `model` estimates the actuator
    /// output reached for a commanded value, e.g. saturation at the
    /// throttle limits. Tt is the drain time constant; sqrt(Ti·Td) is the
    /// usual starting point.
    pub fn with_anti_windup<F>(mut self, tt: f64, model: F) -> Self
    where
        F: Fn(f64) -> f64 + Send + 'static,
    {
        self.anti_windup = Some(AntiWindup {
            tt,
            model: Box::new(model),
        });
        self
    }

    /// Scale the reference by b in the proportional term only, suppressing
    /// proportional kick on reference steps. Integral action still tracks
    /// the full setpoint.
    pub fn with_setpoint_weight(mut self, b: f64) -> Self {
        self.setpoint_weight = Some(b);
        self
    }

    /// Validate all parameters and produce a running controller.
    pub fn build(self) -> Result<PidController, ConfigError> {
        if self.k < 0.0 {
            return Err(ConfigError::NegativeGain { value: self.k });
        }
        if let Some(ti) = self.ti {
            if ti <= 0.0 {
                return Err(ConfigError::NonPositiveTimeConstant {
                    name: "Ti",
                    value: ti,
                });
            }
        }
        if let Some(td) = self.td {
            if td < 0.0 {
                return Err(ConfigError::NegativeDerivativeTime { value: td });
            }
            if self.n <= 0.0 {
                return Err(ConfigError::InvalidFilterFactor { value: self.n });
            }
        }
        if let Timing::Fixed(h) = self.timing {
            if h <= 0.0 {
                return Err(ConfigError::InvalidSamplePeriod { value: h });
            }
        }
        if let Some(aw) = &self.anti_windup {
            if aw.tt <= 0.0 {
                return Err(ConfigError::NonPositiveTimeConstant {
                    name: "Tt",
                    value: aw.tt,
                });
            }
            if self.ti.is_none() {
                return Err(ConfigError::AntiWindupWithoutIntegral);
            }
        }
        let b = match self.setpoint_weight {
            Some(b) if !(0.0..=1.0).contains(&b) => {
                return Err(ConfigError::WeightOutOfRange { value: b });
            }
            Some(b) => b,
            // Unweighted controllers track the full reference.
            None => 1.0,
        };

        let mode = match (self.ti, self.td) {
            (None, None) => PidMode::P,
            (Some(ti), None) => PidMode::Pi { ti },
            (None, Some(td)) => PidMode::Pd { td, n: self.n },
            (Some(ti), Some(td)) => PidMode::Pid {
                ti,
                td,
                n: self.n,
            },
        };
        let a0 = self.anti_windup.as_ref().map_or(0.0, |aw| 1.0 / aw.tt);

        debug!(
            "PID configured: mode={}, K={}, b={}, timing={:?}, anti-windup={}",
            mode.label(),
            self.k,
            b,
            self.timing,
            self.anti_windup.is_some()
        );

        let mut controller = PidController {
            k: self.k,
            mode,
            timing: self.timing,
            b,
            a0,
            anti_windup: self.anti_windup,
            fixed: None,
            i: 0.0,
            d: 0.0,
            y_old: 0.0,
            t_old: 0.0,
        };
        if let Timing::Fixed(h) = controller.timing {
            controller.fixed = Some(controller.coefficients(h));
        }
        Ok(controller)
    }
}

/// One velocity-loop channel. State persists across ticks: integral
/// accumulator, filtered derivative, previous measurement and timestamp.
pub struct PidController {
    k: f64,
    mode: PidMode,
    timing: Timing,
    b: f64,
    a0: f64,
    anti_windup: Option<AntiWindup>,
    fixed: Option<Coefficients>,

    i: f64,
    d: f64,
    y_old: f64,
    t_old: f64,
}

impl PidController {
    pub fn mode(&self) -> &PidMode {
        &self.mode
    }

    /// Coefficients for sample period h. Each mode computes only the terms
    /// it carries; the rest stay zero and drop out of the update law.
    fn coefficients(&self, h: f64) -> Coefficients {
        match self.mode {
            PidMode::P => Coefficients::default(),
            PidMode::Pi { ti } => Coefficients {
                bi: self.k * h / ti,
                ..Coefficients::default()
            },
            PidMode::Pd { td, n } => {
                let den = td + n * h;
                Coefficients {
                    ad: td / den,
                    bd: -td * self.k * n / den,
                    bi: 0.0,
                }
            }
            PidMode::Pid { ti, td, n } => {
                let den = td + n * h;
                Coefficients {
                    ad: td / den,
                    bd: -td * self.k * n / den,
                    bi: self.k * h / ti,
                }
            }
        }
    }

    /// One control tick: reference `ysp` against the measurement `(t, y)`,
    /// returning the control effort u.
    ///
    /// Update law:
    /// - P = K·(b·ysp − y)
    /// - D ← ad·D − bd·(y − y_old), ad = Td/(Td + N·h), bd = −Td·K·N/(Td + N·h)
    /// - v = P + D + I
    /// - without anti-windup: u = v, I ← I + bi·(ysp − y_old), bi = K·h/Ti
    /// - with anti-windup: u = model(v), I ← I + bi·(ysp − y_old) + (u − v)/Tt
    ///
    /// When the actuator would saturate, v diverges from the achievable u
    /// and the (u − v)/Tt term drains the accumulator in proportion to the
    /// saturation error.
    pub fn update(&mut self, ysp: f64, measurement: (f64, f64)) -> f64 {
        let (t, y) = measurement;
        let h = match self.timing {
            Timing::Fixed(h) => h,
            Timing::Variable => (t - self.t_old).max(f64::EPSILON),
        };
        let c = match self.fixed {
            Some(c) => c,
            None => self.coefficients(h),
        };

        let p = self.k * (self.b * ysp - y);
        let d_new = c.ad * self.d - c.bd * (y - self.y_old);
        let v = p + d_new + self.i;

        let u = match &self.anti_windup {
            Some(aw) => {
                let u = (aw.model)(v);
                self.i += c.bi * (ysp - self.y_old) + self.a0 * (u - v);
                u
            }
            None => {
                self.i += c.bi * (ysp - self.y_old);
                v
            }
        };

        self.d = d_new;
        self.y_old = y;
        self.t_old = t;
        u
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() < tol, "expected {b}, got {a}");
    }

    #[test]
    fn rejects_negative_gain() {
        assert_eq!(
            PidConfig::new(-1.0).build().err(),
            Some(ConfigError::NegativeGain { value: -1.0 })
        );
    }

    #[test]
    fn rejects_non_positive_integral_time() {
        for ti in [0.0, -0.3] {
            let err = PidConfig::new(1.0).with_integral_time(ti).build().err();
            assert_eq!(
                err,
                Some(ConfigError::NonPositiveTimeConstant {
                    name: "Ti",
                    value: ti
                })
            );
        }
    }

    #[test]
    fn rejects_negative_derivative_time() {
        let err = PidConfig::new(1.0).with_derivative_time(-0.1).build().err();
        assert_eq!(err, Some(ConfigError::NegativeDerivativeTime { value: -0.1 }));
    }

    #[test]
    fn rejects_invalid_fixed_period() {
        let err = PidConfig::new(1.0).with_fixed_period(0.0).build().err();
        assert_eq!(err, Some(ConfigError::InvalidSamplePeriod { value: 0.0 }));
    }

    #[test]
    fn rejects_zero_anti_windup_time_constant() {
        let err = PidConfig::new(1.0)
            .with_integral_time(0.5)
            .with_anti_windup(0.0, |v| v)
            .build()
            .err();
        assert_eq!(
            err,
            Some(ConfigError::NonPositiveTimeConstant {
                name: "Tt",
                value: 0.0
            })
        );
    }

    #[test]
    fn rejects_anti_windup_without_integral() {
        let err = PidConfig::new(1.0).with_anti_windup(0.5, |v| v).build().err();
        assert_eq!(err, Some(ConfigError::AntiWindupWithoutIntegral));
    }

    #[test]
    fn rejects_out_of_range_setpoint_weight() {
        let err = PidConfig::new(1.0).with_setpoint_weight(1.5).build().err();
        assert_eq!(err, Some(ConfigError::WeightOutOfRange { value: 1.5 }));
    }

    #[test]
    fn mode_follows_supplied_time_constants() {
        assert_eq!(PidConfig::new(1.0).build().unwrap().mode().label(), "P");
        assert_eq!(
            PidConfig::new(1.0)
                .with_integral_time(1.0)
                .build()
                .unwrap()
                .mode()
                .label(),
            "PI"
        );
        assert_eq!(
            PidConfig::new(1.0)
                .with_derivative_time(0.1)
                .build()
                .unwrap()
                .mode()
                .label(),
            "PD"
        );
        assert_eq!(
            PidConfig::new(1.0)
                .with_integral_time(1.0)
                .with_derivative_time(0.1)
                .build()
                .unwrap()
                .mode()
                .label(),
            "PID"
        );
    }

    #[test]
    fn pure_proportional_has_no_drift() {
        let mut pid = PidConfig::new(2.5)
            .with_setpoint_weight(0.6)
            .with_fixed_period(0.01)
            .build()
            .unwrap();
        let expected = 2.5 * (0.6 * 4.0 - 1.5);
        for tick in 0..200 {
            let u = pid.update(4.0, (tick as f64 * 0.01, 1.5));
            assert_close(u, expected, 1e-12);
        }
    }

    #[test]
    fn setpoint_weight_zero_ignores_reference_in_proportional_term() {
        let mut pid = PidConfig::new(3.0)
            .with_setpoint_weight(0.0)
            .with_fixed_period(0.01)
            .build()
            .unwrap();
        let u = pid.update(100.0, (0.01, 2.0));
        assert_close(u, -3.0 * 2.0, 1e-12);
    }

    #[test]
    fn pid_matches_hand_computed_sequence() {
        // K=2, Ti=1, Td=0.5, N=10, h=0.1:
        //   ad = 0.5/1.5, bd = -0.5*2*10/1.5, bi = 0.2
        let mut pid = PidConfig::new(2.0)
            .with_integral_time(1.0)
            .with_derivative_time(0.5)
            .with_filter_factor(10.0)
            .with_fixed_period(0.1)
            .build()
            .unwrap();

        let u1 = pid.update(1.0, (0.1, 0.0));
        assert_close(u1, 2.0, 1e-12);

        // P = 2*(1-0.5) = 1, D = (10/1.5)*0.5, I = 0.2
        let u2 = pid.update(1.0, (0.2, 0.5));
        assert_close(u2, 1.0 + 0.5 * 2.0 * 10.0 / 1.5 * 0.5 + 0.2, 1e-12);
    }

    #[test]
    fn variable_timing_matches_fixed_for_uniform_timestamps() {
        let h = 0.02;
        let mut fixed = PidConfig::new(1.4)
            .with_integral_time(0.7)
            .with_fixed_period(h)
            .build()
            .unwrap();
        let mut variable = PidConfig::new(1.4).with_integral_time(0.7).build().unwrap();

        for tick in 1..300 {
            let t = tick as f64 * h;
            let y = (t * 3.0).sin();
            let uf = fixed.update(1.0, (t, y));
            let uv = variable.update(1.0, (t, y));
            assert_close(uv, uf, 1e-9);
        }
    }

    #[test]
    fn derivative_kick_decays_with_filter() {
        let mut pid = PidConfig::new(1.0)
            .with_derivative_time(0.5)
            .with_filter_factor(10.0)
            .with_fixed_period(0.1)
            .build()
            .unwrap();

        pid.update(0.0, (0.1, 0.0));
        // Step in the measurement excites the derivative term, then the
        // filter bleeds it off geometrically (ratio ad < 1).
        let kicked = pid.update(0.0, (0.2, 1.0));
        let mut last = kicked;
        for tick in 3..40 {
            let u = pid.update(0.0, (tick as f64 * 0.1, 1.0));
            assert!((u + 1.0).abs() < (last + 1.0).abs());
            last = u;
        }
        // Converges to the pure proportional value K*(0 - 1).
        assert_close(last, -1.0, 1e-3);
    }

    #[test]
    fn identity_actuator_model_makes_anti_windup_neutral() {
        let build_plain = || {
            PidConfig::new(1.2)
                .with_integral_time(0.4)
                .with_derivative_time(0.05)
                .with_fixed_period(0.01)
                .build()
                .unwrap()
        };
        let mut plain = build_plain();
        let mut wrapped = PidConfig::new(1.2)
            .with_integral_time(0.4)
            .with_derivative_time(0.05)
            .with_fixed_period(0.01)
            .with_anti_windup(0.2, |v| v)
            .build()
            .unwrap();

        for tick in 1..500 {
            let t = tick as f64 * 0.01;
            let ysp = if tick < 250 { 10.0 } else { -4.0 };
            let y = (t * 2.0).cos() * 3.0;
            let a = plain.update(ysp, (t, y));
            let b = wrapped.update(ysp, (t, y));
            assert_close(b, a, 1e-9);
        }
    }

    #[test]
    fn saturating_model_drains_integral() {
        let limit = 1.0;
        let mut unguarded = PidConfig::new(1.0)
            .with_integral_time(0.1)
            .with_fixed_period(0.01)
            .build()
            .unwrap();
        let mut guarded = PidConfig::new(1.0)
            .with_integral_time(0.1)
            .with_fixed_period(0.01)
            .with_anti_windup(1.0, move |v: f64| v.clamp(-limit, limit))
            .build()
            .unwrap();

        // Long saturated stretch: the unguarded accumulator winds far past
        // anything the actuator can deliver.
        for tick in 1..=300 {
            let t = tick as f64 * 0.01;
            unguarded.update(10.0, (t, 0.0));
            guarded.update(10.0, (t, 0.0));
        }

        // After the reference collapses, the wound-up controller keeps
        // commanding hard positive for a long tail; the guarded one does not.
        let t = 3.01;
        let u_unguarded = unguarded.update(0.0, (t, 0.0));
        let mut guarded_after = guarded.update(0.0, (t, 0.0));
        guarded_after = guarded.update(0.0, (t + 0.01, 0.0));
        assert!(u_unguarded > 5.0);
        assert!(guarded_after < u_unguarded);
        assert!(guarded_after.abs() <= limit + 1e-9);
    }
}
