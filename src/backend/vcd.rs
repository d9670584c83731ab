//! VCD dump sink: renders the event stream as a Value Change Dump for a
//! waveform viewer, one wire per pin of interest.

use std::io::Write;

use crate::timing::TICK_US;
use crate::wave::Event;
use crate::{PinMask, Ticks};

pub struct VcdBackend {
    out: Box<dyn Write + Send>,

    /// VCD identifier for each pin, for pins named at creation.
    ids: [Option<char>; 32],

    time: u64,
    pending: Event,
}

impl VcdBackend {
    /// A dump of the pins in `pins`, written to `out`. The header goes
    /// out immediately.
    pub fn new(pins: PinMask, mut out: Box<dyn Write + Send>) -> Self {
        let mut ids = [None; 32];

        let _ = writeln!(out, "$timescale {} us $end", TICK_US);
        let mut n = 0u8;
        for pin in 0..32 {
            if pins & (1 << pin) != 0 {
                let id = (b'!' + n) as char;
                ids[pin as usize] = Some(id);
                let _ = writeln!(out, "$var wire 1 {} pin{} $end", id, pin);
                n += 1;
            }
        }
        let _ = writeln!(out, "$enddefinitions $end");

        VcdBackend {
            out,
            ids,
            time: 0,
            pending: Event::default(),
        }
    }

    pub fn stdout(pins: PinMask) -> Self {
        Self::new(pins, Box::new(std::io::stdout()))
    }

    pub(crate) fn pending_mut(&mut self) -> &mut Event {
        &mut self.pending
    }

    pub(crate) fn add_delay(&mut self, ticks: Ticks) {
        if !self.pending.is_empty() {
            let mut line = format!("#{}", self.time);
            for pin in 0..32 {
                if let Some(id) = self.ids[pin] {
                    if self.pending.rising & (1 << pin) != 0 {
                        line.push_str(&format!(" 1{}", id));
                    }
                    if self.pending.falling & (1 << pin) != 0 {
                        line.push_str(&format!(" 0{}", id));
                    }
                }
            }
            let _ = writeln!(self.out, "{}", line);
        }

        self.pending = Event::default();
        self.time += u64::from(ticks);
    }
}
