//! Free-running square wave on one pin. Mostly useful as a scope check
//! that the pipeline's edge placement is exact, and as the simplest
//! possible source in tests.

use crate::wave::{Event, Source};
use crate::Ticks;

pub struct SquareWave {
    pin: u8,
    half_period: Ticks,
    high: bool,
}

impl SquareWave {
    /// A square wave of `period` ticks on `pin`. `high` sets the initial
    /// phase; the first event toggles away from it.
    pub fn new(pin: u8, period: Ticks, high: bool) -> Self {
        assert!(period >= 2);
        SquareWave {
            pin,
            half_period: period / 2,
            high,
        }
    }
}

impl Source for SquareWave {
    fn gen_event(&mut self, ev: &mut Event) -> Ticks {
        if self.high {
            ev.falling |= 1 << self.pin;
        } else {
            ev.rising |= 1 << self.pin;
        }
        self.high = !self.high;
        self.half_period
    }
}
