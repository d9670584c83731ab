//! Definition of the system tick and derived constants.
//!
//! Everything in the pipeline counts time in *ticks*: one word drained from
//! the pacer FIFO. The tick period is fixed at init and never changes while
//! the engine runs.

use crate::Ticks;

/// Tick period in microseconds. One paced-delay control block of `n` ticks
/// holds the chain for `n * TICK_US` µs.
pub const TICK_US: u32 = 10;

/// Tick frequency in Hz, as seen by the step profile generator.
pub const TICK_HZ: u32 = 1_000_000 / TICK_US;

/// Ticks per millisecond, for coarse sleeps inside sources.
pub const TICKS_PER_MS: Ticks = 1_000 / TICK_US;

/// Ticks handed to the multiplexer per frame: 16 ms of waveform. Two of
/// these fit in the control-block arena at once, which bounds how stale the
/// engine's copy can get.
pub const CHUNK_TICKS: Ticks = 1_600;

/// Integer microsecond → tick conversion used by the command channel.
pub fn us_to_ticks(us: u32) -> Ticks {
    us / TICK_US
}
