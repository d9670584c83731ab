//! Hard real-time GPIO waveform generation on Raspberry Pi, from user space.
//!
//! The CPU cannot place pin edges with microsecond precision from a
//! preemptively scheduled process, so it doesn't try: it pre-builds short
//! chains of DMA control blocks and hands them to the DMA engine, which
//! executes them back-to-back, paced by a peripheral FIFO drained at a fixed
//! tick rate. While the engine replays one chain, the CPU builds the next.
//! A fence embedded in each chain tells the CPU when the engine has moved
//! on, so the just-consumed buffer can be rebuilt.
//!
//! The pipeline, bottom up:
//!
//! - [`hw`] maps the peripherals and allocates DMA-visible memory.
//! - [`source`] holds the event sources (stepper profile generator, tone
//!   queue, square wave) that decide *when* the next edge should happen.
//! - [`wave`] merges all sources into one monotonic stream of
//!   (delay, rising-mask, falling-mask) operations.
//! - [`backend`] turns that stream into DMA control blocks (or a VCD dump,
//!   or a capture buffer for tests).

pub mod backend;
pub mod comm;
pub mod dispatch;
pub mod hw;
pub mod source;
pub mod timing;
pub mod wave;

/// Pin set as a bitmask over GPIO 0..=31. Writes to the GPIO SET0/CLR0
/// registers take exactly this form.
pub type PinMask = u32;

/// A duration in pacer ticks (see [`timing::TICK_US`]).
pub type Ticks = u32;

/// Everything that can go wrong in the pipeline.
///
/// Command-channel problems recover locally; everything touching the
/// hardware chain surfaces to the top of the main loop, where it becomes a
/// controlled shutdown.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Peripheral mapping, DMA channel allocation, or physical-memory
    /// request failed at startup.
    #[error("hardware init failed: {0}")]
    Init(String),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The DMA engine did not reach the current fence in time. Either the
    /// engine is stuck or the CPU missed its deadline so badly that the
    /// engine ran off the end of the chain.
    #[error("fence not signalled within {timeout_ms} ms")]
    FenceTimeout { timeout_ms: u32 },

    /// Malformed command packet. The packet is discarded; the loop goes on.
    #[error("protocol: {0}")]
    Protocol(String),

    /// A single frame needed more control blocks than half the arena.
    #[error("control block arena overflow: needed {needed}, capacity {capacity}")]
    Overflow { needed: usize, capacity: usize },

    /// A paced delay was requested with no pacer configured, or with a
    /// duration that is not a multiple of the pacer period.
    #[error("pacer misuse: {0}")]
    PacerMisuse(String),
}

pub type Result<T> = std::result::Result<T, Error>;
