//! DMA channel registers, control-block encoding, and the pacer that
//! clocks paced-delay blocks.
//!
//! A control block is one element of the linked list the engine executes.
//! Three encodings matter here:
//!
//! - *edge*: a 4-byte copy from the block's own scratch word to the GPIO
//!   SET0 or CLR0 register;
//! - *paced delay*: a 2D transfer of N dummy words into the pacer FIFO,
//!   gated by the peripheral's DREQ, so the block takes exactly N ticks;
//! - *fence*: a 4-byte copy from scratch word 0 (constant 1) to scratch
//!   word 1, so the CPU can observe that the engine got this far.

use std::ptr;
use std::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use log::{error, info};

use super::clock::{ClockDev, Consumer};
use super::{gpio, usleep, Board, Mmio};
use crate::{Error, PinMask, Result};

const DMA_BASE_OFFSET: u32 = 0x0000_7000;
const DMA_CHAN_SIZE: u32 = 0x100;
const DMA_CHAN_MIN: usize = 0;
const DMA_CHAN_MAX: usize = 14;

const PWM_BASE_OFFSET: u32 = 0x0020_C000;
const PWM_LEN: usize = 0x28;
const PCM_BASE_OFFSET: u32 = 0x0020_3000;
const PCM_LEN: usize = 0x24;

const PWM_FIFO_OFFSET: u32 = 0x18;
const PCM_FIFO_OFFSET: u32 = 0x04;

// DMA channel registers, as word indices.
const DMA_CS: usize = 0x00 / 4;
const DMA_CONBLK_AD: usize = 0x04 / 4;
const DMA_DEBUG: usize = 0x20 / 4;

bitflags! {
    /// Transfer-information word of a control block.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct TransferInfo: u32 {
        const TDMODE = 1 << 1;
        const WAIT_RESP = 1 << 3;
        const DEST_DREQ = 1 << 6;
        const SRC_IGNORE = 1 << 11;
        const NO_WIDE_BURSTS = 1 << 26;
    }
}

/// Peripheral numbers for the DREQ routing field (TI bits 16:20).
const fn per_map(peripheral: u32) -> u32 {
    peripheral << 16
}

bitflags! {
    /// Channel control/status register bits.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ControlStatus: u32 {
        const ACTIVE = 1 << 0;
        const END = 1 << 1;
        const INT = 1 << 2;
        const RESET = 1 << 31;
    }
}

/// CS value that starts the channel: active, normal and panic priority 8,
/// and wait for outstanding AXI writes before signalling completion.
const DMA_CS_RUN: u32 = 0x1088_0001;

/// One hardware control block. Must be 32-byte aligned; every address
/// field is in bus address space. The two scratch words ride along in the
/// same 32-byte slot and give edge and fence blocks their payload without
/// a separate data area.
#[repr(C, align(32))]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DmaCb {
    pub info: u32,
    pub src: u32,
    pub dst: u32,
    pub length: u32,
    pub stride: u32,
    pub next: u32,
    pub scratch: [u32; 2],
}

/// Byte offset of `scratch` within a control block.
pub const CB_SCRATCH_OFFSET: u32 = 24;

/// Which peripheral FIFO paces delay blocks.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pacer {
    Pwm,
    Pcm,
}

/// The mapped peripherals the pacer setup touches. Created once at init
/// and passed by reference to the channel that needs them.
pub struct PacerHw {
    clock: ClockDev,
    pwm: Mmio,
    pcm: Mmio,
}

// PWM registers, as word indices.
const PWM_CTL: usize = 0x00 / 4;
const PWM_DMAC: usize = 0x08 / 4;
const PWM_RNG1: usize = 0x10 / 4;

const PWMCTL_PWEN1: u32 = 1 << 0;
const PWMCTL_USEF1: u32 = 1 << 5;
const PWMCTL_CLRF: u32 = 1 << 6;

const PWMDMAC_ENAB: u32 = 1 << 31;
const PWMDMAC_THRSHLD: u32 = (15 << 8) | 15;

// PCM registers, as word indices.
const PCM_CS_A: usize = 0x00 / 4;
const PCM_MODE_A: usize = 0x08 / 4;
const PCM_TXC_A: usize = 0x10 / 4;
const PCM_DREQ_A: usize = 0x14 / 4;

impl PacerHw {
    pub fn new(board: &Board) -> Result<PacerHw> {
        Ok(PacerHw {
            clock: ClockDev::new(board)?,
            pwm: Mmio::map(board.periph_virt_base + PWM_BASE_OFFSET, PWM_LEN)?,
            pcm: Mmio::map(board.periph_virt_base + PCM_BASE_OFFSET, PCM_LEN)?,
        })
    }
}

/// Pure control-block encoder: everything needed to shape a block without
/// touching hardware, so the backend (and tests) can build chains into any
/// memory.
#[derive(Copy, Clone, Debug)]
pub struct CbBuilder {
    pub periph_phys_base: u32,
    pub pacer: Pacer,
    pub pace_us: u32,
}

impl CbBuilder {
    /// Write `pins` to GPIO SET0: rising edges.
    pub fn rising_edge(&self, pins: PinMask, cb_bus: u32) -> DmaCb {
        self.edge(pins, cb_bus, gpio::SET0_OFFSET)
    }

    /// Write `pins` to GPIO CLR0: falling edges.
    pub fn falling_edge(&self, pins: PinMask, cb_bus: u32) -> DmaCb {
        self.edge(pins, cb_bus, gpio::CLR0_OFFSET)
    }

    fn edge(&self, pins: PinMask, cb_bus: u32, reg_offset: u32) -> DmaCb {
        DmaCb {
            info: (TransferInfo::NO_WIDE_BURSTS | TransferInfo::WAIT_RESP).bits(),
            src: cb_bus + CB_SCRATCH_OFFSET,
            dst: self.periph_phys_base + gpio::BASE_OFFSET + reg_offset,
            length: 4,
            stride: 0,
            next: 0,
            scratch: [pins, 0],
        }
    }

    /// Hold the chain for `delay_us` by stuffing the pacer FIFO, which
    /// drains one word per tick. The duration must be a whole number of
    /// ticks.
    pub fn paced_delay(&self, delay_us: u32, cb_bus: u32) -> Result<DmaCb> {
        if self.pace_us == 0 {
            return Err(Error::PacerMisuse("no pacer configured".into()));
        }
        if delay_us % self.pace_us != 0 {
            return Err(Error::PacerMisuse(format!(
                "{} us is not a multiple of the {} us pacer period",
                delay_us, self.pace_us
            )));
        }

        let (fifo, dreq) = match self.pacer {
            Pacer::Pwm => (PWM_BASE_OFFSET + PWM_FIFO_OFFSET, per_map(5)),
            Pacer::Pcm => (PCM_BASE_OFFSET + PCM_FIFO_OFFSET, per_map(2)),
        };

        let count = delay_us / self.pace_us;
        Ok(DmaCb {
            info: (TransferInfo::NO_WIDE_BURSTS
                | TransferInfo::WAIT_RESP
                | TransferInfo::DEST_DREQ
                | TransferInfo::SRC_IGNORE
                | TransferInfo::TDMODE)
                .bits()
                | dreq,
            src: cb_bus + CB_SCRATCH_OFFSET,
            dst: self.periph_phys_base + fifo,
            // 2D mode: count transfers of 4 bytes each.
            length: ((count - 1) << 16) | 4,
            stride: 0,
            next: 0,
            scratch: [0, 0],
        })
    }

    /// A block that copies `val` from its own scratch word 0 into scratch
    /// word 1. Once word 1 reads back nonzero, the engine has provably
    /// executed past this point.
    pub fn fence(val: u32, cb_bus: u32) -> DmaCb {
        DmaCb {
            info: (TransferInfo::NO_WIDE_BURSTS | TransferInfo::WAIT_RESP).bits(),
            src: cb_bus + CB_SCRATCH_OFFSET,
            dst: cb_bus + CB_SCRATCH_OFFSET + 4,
            length: 4,
            stride: 0,
            next: 0,
            scratch: [val, 0],
        }
    }
}

/// Has the engine reached this fence block yet?
///
/// Scratch word 1 is written by the DMA engine and read here; the volatile
/// load plus acquire fence makes everything the engine did before the
/// fence visible to us after it.
pub fn fence_signaled(cb: *const DmaCb) -> bool {
    // Safety: caller guarantees `cb` points at a live control block.
    let signalled = unsafe { ptr::read_volatile(ptr::addr_of!((*cb).scratch[1])) };
    fence(Ordering::Acquire);
    signalled != 0
}

/// One of the fifteen DMA channels, mapped and owned for the process
/// lifetime. Resetting the channel and quiescing the pacer on drop matters:
/// a DMA engine left running after process death keeps scribbling on pins.
pub struct DmaChannel {
    /// Mapping of the DMA block up to and including our channel; the
    /// channel window itself isn't page-aligned, so we map from the block
    /// base and index in.
    regs: Mmio,
    /// Word index of our channel's first register within `regs`.
    reg0: usize,
    pacer: Option<(Pacer, u32)>,
    periph_phys_base: u32,
}

impl DmaChannel {
    pub fn new(board: &Board, channel: usize) -> Result<DmaChannel> {
        if !(DMA_CHAN_MIN..=DMA_CHAN_MAX).contains(&channel) {
            return Err(Error::Init(format!("DMA channel {} out of range", channel)));
        }

        let maplen = (DMA_CHAN_SIZE as usize) * (channel + 1);
        let regs = Mmio::map(board.periph_virt_base + DMA_BASE_OFFSET, maplen)?;
        info!("DMA channel {} mapped", channel);

        Ok(DmaChannel {
            regs,
            reg0: (DMA_CHAN_SIZE as usize * channel) / 4,
            pacer: None,
            periph_phys_base: board.periph_phys_base,
        })
    }

    fn read_reg(&self, reg: usize) -> u32 {
        self.regs.read(self.reg0 + reg)
    }

    fn write_reg(&self, reg: usize, val: u32) {
        self.regs.write(self.reg0 + reg, val)
    }

    /// An encoder matching this channel's pacer configuration.
    pub fn cb_builder(&self) -> Result<CbBuilder> {
        let (pacer, pace_us) = self
            .pacer
            .ok_or_else(|| Error::PacerMisuse("no pacer configured".into()))?;
        Ok(CbBuilder {
            periph_phys_base: self.periph_phys_base,
            pacer,
            pace_us,
        })
    }

    /// Configure the chosen pacer to drain one FIFO word every `pace_us`
    /// microseconds: clock at 1 MHz, range/frame length of `pace_us`.
    pub fn setup_pacer(&mut self, hw: &PacerHw, pacer: Pacer, pace_us: u32) -> Result<()> {
        match pacer {
            Pacer::Pwm => {
                hw.pwm.write(PWM_CTL, 0);
                usleep(10);
                hw.clock.set_rate(Consumer::Pwm, 1_000_000)?;
                hw.pwm.write(PWM_RNG1, pace_us);
                usleep(10);
                hw.pwm.write(PWM_DMAC, PWMDMAC_ENAB | PWMDMAC_THRSHLD);
                usleep(10);
                hw.pwm.write(PWM_CTL, PWMCTL_CLRF);
                usleep(10);
                hw.pwm.write(PWM_CTL, PWMCTL_USEF1 | PWMCTL_PWEN1);
                usleep(10);
            }
            Pacer::Pcm => {
                // Enable the block with Rx/Tx off.
                hw.pcm.write(PCM_CS_A, 1);
                usleep(100);
                hw.clock.set_rate(Consumer::Pcm, 1_000_000)?;
                // One channel, 8 bits.
                hw.pcm.write(PCM_TXC_A, 1 << 30);
                usleep(100);
                hw.pcm.write(PCM_MODE_A, (pace_us - 1) << 10);
                usleep(100);
                // Clear FIFOs.
                hw.pcm.modify(PCM_CS_A, |cs| cs | (1 << 4) | (1 << 3));
                usleep(100);
                hw.pcm.write(PCM_DREQ_A, (64 << 24) | (64 << 8));
                usleep(100);
                // Enable DMA requests.
                hw.pcm.modify(PCM_CS_A, |cs| cs | (1 << 9));
                usleep(100);
            }
        }

        self.pacer = Some((pacer, pace_us));
        Ok(())
    }

    pub fn disable_pacer(&mut self, hw: &PacerHw) {
        match self.pacer.take() {
            Some((Pacer::Pwm, _)) => {
                hw.pwm.write(PWM_CTL, 0);
                usleep(10);
                hw.pwm.write(PWM_DMAC, 0);
            }
            Some((Pacer::Pcm, _)) => {
                hw.pcm.write(PCM_CS_A, 1);
                usleep(100);
                hw.pcm.modify(PCM_CS_A, |cs| cs & !(1 << 9));
            }
            None => {}
        }
    }

    /// Point the channel at `cb_bus` and set it running.
    pub fn run(&self, hw: &PacerHw, cb_bus: u32) {
        self.write_reg(DMA_CS, ControlStatus::RESET.bits());
        usleep(10);
        self.write_reg(DMA_CS, (ControlStatus::INT | ControlStatus::END).bits());
        self.write_reg(DMA_CONBLK_AD, cb_bus);
        // Clear read-error/FIFO-error/read-last-not-set flags.
        self.write_reg(DMA_DEBUG, 7);
        self.write_reg(DMA_CS, DMA_CS_RUN);

        if let Some((Pacer::Pcm, _)) = self.pacer {
            // Tx on, now that the DMA side can feed it.
            hw.pcm.modify(PCM_CS_A, |cs| cs | (1 << 2));
        }
    }

    pub fn reset(&self) {
        self.write_reg(DMA_CS, ControlStatus::RESET.bits());
        usleep(10);
    }

    /// Bus address the engine is currently executing, for the isolation
    /// checks and diagnostics.
    pub fn current_cb(&self) -> u32 {
        self.read_reg(DMA_CONBLK_AD)
    }

    pub fn dump(&self) {
        for (name, reg) in [
            ("CS", 0usize),
            ("CONBLK_AD", 1),
            ("TI", 2),
            ("SOURCE_AD", 3),
            ("DEST_AD", 4),
            ("TXFR_LEN", 5),
            ("STRIDE", 6),
            ("NEXTCONBK", 7),
            ("DEBUG", 8),
        ] {
            error!("{:>10}: {:08x}", name, self.read_reg(reg));
        }
    }
}

impl Drop for DmaChannel {
    fn drop(&mut self) {
        self.reset();
    }
}
