//! Clock manager: sources the PWM or PCM peripheral clock from PLLD and
//! sets its divisor, so the pacer FIFO drains at exactly the tick rate.

use super::{usleep, Board, Mmio};
use crate::{Error, Result};

const CLK_BASE_OFFSET: u32 = 0x0010_1000;
const CLK_LEN: usize = 0xA8;

/// Control/divisor register pairs for the two pacer candidates.
const PCMCLK_CNTL: usize = 38;
const PWMCLK_CNTL: usize = 40;

/// Every write must carry the clock-manager password in the top byte.
const CLK_PASSWD: u32 = 0x5A00_0000;
/// Source 6 = PLLD, a stable 500 MHz.
const CLK_SRC_PLLD: u32 = 0x6;
const CLK_ENAB: u32 = 1 << 4;
const PLLD_HZ: f64 = 500_000_000.0;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Consumer {
    Pwm,
    Pcm,
}

pub struct ClockDev {
    regs: Mmio,
}

impl ClockDev {
    pub fn new(board: &Board) -> Result<ClockDev> {
        let regs = Mmio::map(board.periph_virt_base + CLK_BASE_OFFSET, CLK_LEN)?;
        Ok(ClockDev { regs })
    }

    /// Program `consumer`'s clock to `rate` Hz off PLLD. The divisor is
    /// 12.12 fixed point and tops out at 8192.
    pub fn set_rate(&self, consumer: Consumer, rate: u64) -> Result<()> {
        let cntl = match consumer {
            Consumer::Pwm => PWMCLK_CNTL,
            Consumer::Pcm => PCMCLK_CNTL,
        };

        let divisor = PLLD_HZ / rate as f64;
        if divisor >= 8192.0 {
            return Err(Error::Init(format!(
                "clock divisor {} out of range for {} Hz",
                divisor, rate
            )));
        }
        let integer = divisor as u32;
        let frac = ((divisor - f64::from(integer)) * f64::from(1 << 12)) as u32;

        // Stop the clock, load the divisor, then start it. Each write
        // needs a settle delay before the next.
        self.regs.write(cntl, CLK_PASSWD | CLK_SRC_PLLD);
        usleep(100);
        self.regs
            .write(cntl + 1, CLK_PASSWD | (integer << 12) | frac);
        usleep(100);
        self.regs.write(cntl, CLK_PASSWD | CLK_ENAB | CLK_SRC_PLLD);
        usleep(100);

        Ok(())
    }
}
