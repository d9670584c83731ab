//! Stepper motor event source.
//!
//! Step timing comes from David Austin's algorithm for real-time stepper
//! acceleration profiles:
//! <https://www.embedded.com/generate-stepper-motor-speed-profiles-in-real-time/>
//!
//! The controller tracks a step index `n` along the ramp and the interval
//! `c` (in ticks) to the next step. Acceleration is a cheap recurrence on
//! `c`; the target index for a requested speed falls out of the constant-
//! acceleration kinematics. Deceleration is encoded by negating `n` and
//! `target_n`, so one recurrence covers both ramps. A direction reversal
//! decelerates through zero before the opposite ramp begins.

use std::f64::consts::PI;

use smart_default::SmartDefault;

use crate::timing::{TICKS_PER_MS, TICK_HZ};
use crate::wave::{Event, Source};
use crate::Ticks;

/// Keep `a`'s magnitude, take `b`'s sign.
fn same_sign(a: f64, b: f64) -> f64 {
    if b.is_sign_negative() {
        if a.is_sign_negative() {
            a
        } else {
            -a
        }
    } else if a.is_sign_negative() {
        -a
    } else {
        a
    }
}

/// Acceleration-profile state. Speeds are magnitudes; direction lives in
/// the motor state machine, sign of `n` encodes which way the ramp runs.
#[derive(Debug)]
struct SpeedCtrl {
    alpha: f64,
    accel: f64,
    f: f64,

    n: f64,
    target_n: f64,

    c: f64,
    set_speed: f64,

    steady: bool,
}

impl SpeedCtrl {
    fn new(steps_per_rev: u32, timer_hz: f64, accel_radss: f64) -> Self {
        SpeedCtrl {
            alpha: (2.0 * PI) / f64::from(steps_per_rev),
            accel: accel_radss,
            f: timer_hz,
            n: 0.0,
            target_n: 0.0,
            c: 0.0,
            set_speed: 0.0,
            steady: false,
        }
    }

    /// Retarget the ramp. `speed` must be non-negative.
    ///
    /// The target index for `speed` is `speed² / (2·alpha·accel)`. If that
    /// is below the current index magnitude the motor must slow down, which
    /// is signalled by negating both the target and `n`.
    fn set(&mut self, speed: f64) {
        let mut target_n = (speed * speed) / (2.0 * self.alpha * self.accel);
        let mut n = self.n;
        if target_n < self.n.abs() {
            target_n = if target_n > 0.0 { -target_n } else { 0.0 };
            n = same_sign(n, -1.0);
        } else {
            n = same_sign(n, 1.0);
        }

        self.steady = false;
        self.set_speed = speed;
        self.target_n = target_n;
        self.n = n;
    }

    /// Advance one step along the profile. Returns the interval to the
    /// next step in ticks, or 0 when the motor is stopped.
    fn tick(&mut self) -> Ticks {
        if self.n == 0.0 {
            if self.target_n != 0.0 {
                // Pulling away from rest: the first interval seeds the
                // recurrence. The 0.676 factor corrects the recurrence's
                // error over the first few steps.
                self.c = 0.676 * self.f * ((2.0 * self.alpha) / self.accel).sqrt();
                self.n = 1.0;
                return self.c.round() as Ticks;
            }

            return 0;
        }

        if self.n < self.target_n - 1.0 {
            self.c -= (2.0 * self.c) / ((4.0 * self.n) + 1.0);
            self.n += 1.0;
        } else if !self.steady {
            if self.set_speed != 0.0 {
                // Snap to the exact steady interval so rounding error
                // doesn't accumulate into the speed.
                self.c = (self.alpha * self.f) / self.set_speed;
            } else {
                self.c = 0.0;
            }

            self.steady = true;
            self.n = self.target_n;
        }

        self.c.round() as Ticks
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MotorState {
    Stopped,
    Fwd,
    Rev,
}

/// GPIO assignment for one motor: step pulse, direction, active-low
/// power-down.
#[derive(Copy, Clone, Debug)]
pub struct StepperPins {
    pub step: u8,
    pub dir: u8,
    pub enable: u8,
}

#[derive(Copy, Clone, Debug, SmartDefault)]
pub struct StepperConfig {
    #[default(600)]
    pub steps_per_rev: u32,
    /// Acceleration in rad/s².
    #[default(100.0)]
    pub accel: f64,
    /// Width of the step pulse, in ticks.
    #[default(5)]
    pub pulsewidth: Ticks,
}

/// One motor: the profile controller plus the edge-level state machine
/// that turns step intervals into step/dir/enable pin events.
pub struct Stepper {
    pins: StepperPins,

    state: MotorState,
    target_rads: f64,

    /// Ticks remaining from the current step's rising edge to the next
    /// rising edge; nonzero means the falling edge of the pulse is still
    /// owed.
    gap: Ticks,
    pulsewidth: Ticks,

    steps: i32,
    dsteps: i32,

    ctrl: SpeedCtrl,
}

impl Stepper {
    pub fn new(pins: StepperPins, cfg: StepperConfig) -> Self {
        Stepper {
            pins,
            state: MotorState::Stopped,
            target_rads: 0.0,
            gap: 0,
            pulsewidth: cfg.pulsewidth,
            steps: 0,
            dsteps: 1,
            ctrl: SpeedCtrl::new(cfg.steps_per_rev, f64::from(TICK_HZ), cfg.accel),
        }
    }

    /// Command a signed angular velocity in rad/s.
    ///
    /// If the sign disagrees with the current motion the controller is
    /// aimed at zero instead; the stored target is re-applied when the
    /// ramp gets there.
    pub fn set_velocity(&mut self, rads: f64) {
        self.target_rads = rads;

        let v = if (self.state == MotorState::Fwd && rads <= 0.0)
            || (self.state == MotorState::Rev && rads >= 0.0)
        {
            // Changing direction - go through 0 first.
            0.0
        } else {
            rads
        };

        self.ctrl.set(v.abs());
    }

    /// Signed steps taken since the last call; resets the counter.
    pub fn take_steps(&mut self) -> i32 {
        std::mem::replace(&mut self.steps, 0)
    }

    pub fn state(&self) -> MotorState {
        self.state
    }

    /// Radians per step.
    pub fn alpha(&self) -> f64 {
        self.ctrl.alpha
    }

    /// The most recently commanded velocity, rad/s.
    pub fn target_velocity(&self) -> f64 {
        self.target_rads
    }

    fn gen(&mut self, ev: &mut Event, may_restart: bool) -> Ticks {
        // Fully stopped: nothing to do for a while.
        if self.state == MotorState::Stopped && self.target_rads == 0.0 {
            return 5 * TICKS_PER_MS;
        }

        // A pulse is mid-flight: finish it.
        if self.gap != 0 {
            ev.falling |= 1 << self.pins.step;

            let c = self.gap;
            self.gap = 0;
            debug_assert!(c > self.pulsewidth, "step interval shorter than pulse");
            return c - self.pulsewidth;
        }

        let c = self.ctrl.tick();
        if c != 0 {
            if self.state == MotorState::Stopped {
                // First pulse (or zero crossing): latch direction and
                // power the driver up.
                if self.target_rads > 0.0 {
                    self.state = MotorState::Fwd;
                    self.dsteps = 1;
                    ev.rising |= 1 << self.pins.dir;
                } else {
                    self.state = MotorState::Rev;
                    self.dsteps = -1;
                    ev.falling |= 1 << self.pins.dir;
                }
                ev.falling |= 1 << self.pins.enable;
            }

            ev.rising |= 1 << self.pins.step;
            self.steps += self.dsteps;

            self.gap = c;
            self.pulsewidth
        } else {
            // The ramp hit zero. Either we're really stopping, or this is
            // the bottom of a direction reversal.
            self.state = MotorState::Stopped;

            if self.target_rads == 0.0 {
                // Really stopped; power the driver down.
                ev.rising |= 1 << self.pins.enable;
            }

            // Re-applying the stored target either restarts the ramp the
            // other way or leaves us parked.
            let target = self.target_rads;
            self.set_velocity(target);

            if may_restart {
                self.gen(ev, false)
            } else {
                5 * TICKS_PER_MS
            }
        }
    }
}

impl Source for Stepper {
    fn gen_event(&mut self, ev: &mut Event) -> Ticks {
        self.gen(ev, true)
    }
}
