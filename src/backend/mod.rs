//! Waveform sinks.
//!
//! A backend consumes the multiplexer's stream of events and delays. There
//! is a small closed set of them: the DMA backend drives real pins, the VCD
//! backend dumps a trace for a waveform viewer, and the capture backend
//! records everything for tests. Keeping the set closed (instead of a trait
//! object) lets the DMA-only operations -- the fence wait and the register
//! dump -- live on the same type without growing every other sink.

pub mod dma;
pub mod vcd;

pub use self::dma::DmaBackend;
pub use self::vcd::VcdBackend;

use std::thread;
use std::time::Duration;

use crate::wave::{Event, Source};
use crate::{PinMask, Result, Ticks};

pub enum Backend {
    Dma(DmaBackend),
    Vcd(VcdBackend),
    Capture(CaptureBackend),
}

impl Backend {
    /// Open a frame. Called exactly once per multiplexer invocation,
    /// before any event.
    pub fn start_wave(&mut self) {
        if let Backend::Dma(be) = self {
            be.start_wave();
        }
    }

    /// Consume one event from `src`: run its generator into a fresh
    /// [`Event`], fold the masks into the pending accumulators, and return
    /// the ticks until the source next wants to run. Emits nothing yet;
    /// edges belonging to the same tick keep accumulating until the delay
    /// that follows them.
    pub fn add_event(&mut self, src: &mut dyn Source) -> Ticks {
        let mut ev = Event::default();
        let dt = src.gen_event(&mut ev);
        debug_assert_eq!(
            ev.rising & ev.falling,
            0,
            "source raised and lowered the same pin in one event"
        );
        self.pending_mut().merge(ev);
        dt
    }

    /// Emit the accumulated edges followed by a delay of `ticks`, then
    /// clear the accumulators.
    pub fn add_delay(&mut self, ticks: Ticks) -> Result<()> {
        match self {
            Backend::Dma(be) => be.add_delay(ticks),
            Backend::Vcd(be) => {
                be.add_delay(ticks);
                Ok(())
            }
            Backend::Capture(be) => {
                be.add_delay(ticks);
                Ok(())
            }
        }
    }

    /// Close a frame. For the DMA backend this publishes the new chain to
    /// the engine; for the others it is a no-op.
    pub fn end_wave(&mut self) {
        if let Backend::Dma(be) = self {
            be.end_wave();
        }
    }

    /// Block until the engine has crossed into the chunk spliced by the
    /// last `end_wave`, making the other buffer safe to rebuild.
    ///
    /// The non-DMA sinks have no engine to race; the VCD sink sleeps a
    /// little so a demo piped to stdout doesn't spin flat out.
    pub fn wait_fence(&mut self, timeout_ms: u32, poll_ms: u32) -> Result<()> {
        match self {
            Backend::Dma(be) => be.wait_fence(timeout_ms, poll_ms),
            Backend::Vcd(_) => {
                thread::sleep(Duration::from_millis(100));
                Ok(())
            }
            Backend::Capture(_) => Ok(()),
        }
    }

    /// Diagnostic dump, for the fatal paths.
    pub fn dump(&self) {
        if let Backend::Dma(be) = self {
            be.dump();
        }
    }

    fn pending_mut(&mut self) -> &mut Event {
        match self {
            Backend::Dma(be) => be.pending_mut(),
            Backend::Vcd(be) => be.pending_mut(),
            Backend::Capture(be) => be.pending_mut(),
        }
    }
}

/// Test sink: records every `(delay, rising, falling)` triple.
#[derive(Default)]
pub struct CaptureBackend {
    pending: Event,
    records: Vec<(Ticks, PinMask, PinMask)>,
}

impl CaptureBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_delay(&mut self, ticks: Ticks) {
        self.records
            .push((ticks, self.pending.rising, self.pending.falling));
        self.pending = Event::default();
    }

    fn pending_mut(&mut self) -> &mut Event {
        &mut self.pending
    }

    pub fn records(&self) -> &[(Ticks, PinMask, PinMask)] {
        &self.records
    }

    pub fn into_records(self) -> Vec<(Ticks, PinMask, PinMask)> {
        self.records
    }
}
