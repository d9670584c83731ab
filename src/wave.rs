//! Event multiplexer.
//!
//! Given a set of event sources, each able to generate pin-edge events at
//! discrete intervals, merge them into a single monotonic sequence of
//! delays and events and feed it to a backend.

use arrayvec::ArrayVec;

use crate::backend::Backend;
use crate::{PinMask, Result, Ticks};

/// Maximum number of sources one context will multiplex: room for four
/// motors plus tone channels.
pub const MAX_SOURCES: usize = 8;

/// One slice of the timeline: the pins that rise and the pins that fall at
/// the same tick. The two masks are disjoint by construction at multiplex
/// time; a source asking for both on the same pin in one event would cancel
/// itself out and is a source bug.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
    pub rising: PinMask,
    pub falling: PinMask,
}

impl Event {
    /// Fold another event into this one. Masks from sources that share a
    /// tick commute, so accumulation order doesn't matter.
    pub fn merge(&mut self, other: Event) {
        self.rising |= other.rising;
        self.falling |= other.falling;
    }

    pub fn is_empty(&self) -> bool {
        self.rising == 0 && self.falling == 0
    }
}

/// An event source: something with an opinion about when the next pin
/// transition should happen.
///
/// `gen_event` receives a zero-initialised [`Event`], may set rising/falling
/// masks on it (or neither, to just sleep), and returns the number of ticks
/// until it next wants to run. The return value must be strictly positive;
/// zero would stall the timeline and is treated as a programming error by
/// the multiplexer.
pub trait Source {
    fn gen_event(&mut self, ev: &mut Event) -> Ticks;
}

/// Multiplexer state: one countdown per source, measured in ticks until
/// that source is next due. Countdowns persist across frames, so a source
/// whose next event lands beyond the end of a frame fires at the right
/// tick of a later one.
pub struct WaveCtx {
    t: ArrayVec<Ticks, MAX_SOURCES>,
}

impl WaveCtx {
    /// A context for `n_sources` sources, all initially due.
    pub fn new(n_sources: usize) -> Self {
        assert!(n_sources <= MAX_SOURCES);
        let mut t = ArrayVec::new();
        for _ in 0..n_sources {
            t.push(0);
        }
        WaveCtx { t }
    }

    /// Generate `budget` ticks of waveform from `sources` into `be`.
    ///
    /// Sources are polled in declaration order. All sources that are due at
    /// the same tick are serviced in the same outer iteration, *before* the
    /// single merged delay is emitted, so their edges coalesce into one
    /// event sharing one delay.
    pub fn generate(
        &mut self,
        be: &mut Backend,
        sources: &mut [&mut dyn Source],
        mut budget: Ticks,
    ) -> Result<()> {
        assert_eq!(sources.len(), self.t.len());

        be.start_wave();

        while budget > 0 {
            let mut min = budget;

            for (i, src) in sources.iter_mut().enumerate() {
                if self.t[i] == 0 {
                    // This source is ready to generate an event; the
                    // backend consumes it and reports when the next is due.
                    self.t[i] = be.add_event(&mut **src);
                    assert!(self.t[i] > 0, "source {} returned zero delay", i);
                }

                min = min.min(self.t[i]);
            }

            // Delay until the next event.
            be.add_delay(min)?;

            // Burn the delay off every countdown; at least one reaches
            // zero unless the frame budget ran out first.
            for t in &mut self.t {
                *t -= min;
            }

            budget -= min;
        }

        be.end_wave();
        Ok(())
    }
}
