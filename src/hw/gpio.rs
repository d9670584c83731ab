//! GPIO block: pin-mux configuration and direct set/clear, for setting up
//! output pins before the DMA engine takes over edge generation.

use super::{Board, Mmio};
use crate::{PinMask, Result};

const GPIO_BASE_OFFSET: u32 = 0x0020_0000;
const GPIO_LEN: usize = 0x100;

const GPIO_FSEL0: usize = 0x00 / 4;
const GPIO_SET0: usize = 0x1C / 4;
const GPIO_CLR0: usize = 0x28 / 4;
const GPIO_LEV0: usize = 0x34 / 4;

/// Byte offsets of the set/clear registers within the block, for building
/// DMA destination addresses.
pub const SET0_OFFSET: u32 = 0x1C;
pub const CLR0_OFFSET: u32 = 0x28;
pub const BASE_OFFSET: u32 = GPIO_BASE_OFFSET;

/// Waveform-instrumentation pins, only driven with the `measurement`
/// feature: one marks chunk generation, one CPU-busy time, one the fence
/// wait.
pub const DBG_CHUNK_PIN: u8 = 17;
pub const DBG_CPUTIME_PIN: u8 = 18;
pub const DBG_FENCE_PIN: u8 = 22;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    Input = 0,
    Output = 1,
}

pub struct Gpio {
    regs: Mmio,
}

impl Gpio {
    pub fn new(board: &Board) -> Result<Gpio> {
        let regs = Mmio::map(board.periph_virt_base + GPIO_BASE_OFFSET, GPIO_LEN)?;
        Ok(Gpio { regs })
    }

    pub fn set_mode(&self, pin: u8, mode: Mode) {
        let reg = GPIO_FSEL0 + usize::from(pin) / 10;
        let shift = (u32::from(pin) % 10) * 3;
        self.regs.modify(reg, |fsel| {
            (fsel & !(7 << shift)) | ((mode as u32) << shift)
        });
    }

    pub fn set(&self, pins: PinMask) {
        self.regs.write(GPIO_SET0, pins);
    }

    pub fn clear(&self, pins: PinMask) {
        self.regs.write(GPIO_CLR0, pins);
    }

    pub fn level(&self) -> PinMask {
        self.regs.read(GPIO_LEV0)
    }

    #[cfg(feature = "measurement")]
    pub fn debug_set(&self, pins: PinMask) {
        self.set(pins);
    }

    #[cfg(feature = "measurement")]
    pub fn debug_clear(&self, pins: PinMask) {
        self.clear(pins);
    }

    #[cfg(not(feature = "measurement"))]
    pub fn debug_set(&self, _pins: PinMask) {}

    #[cfg(not(feature = "measurement"))]
    pub fn debug_clear(&self, _pins: PinMask) {}
}
