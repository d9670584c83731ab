//! Demo: two stepper ramps and a tone channel, dumped as VCD on stdout.
//!
//! Pipe the output into a waveform viewer to inspect edge placement
//! without hardware:
//!
//! ```text
//! stepper_vcd > waves.vcd && gtkwave waves.vcd
//! ```

use piwave::backend::{Backend, VcdBackend};
use piwave::source::{Stepper, StepperConfig, StepperPins, Tone};
use piwave::timing::CHUNK_TICKS;
use piwave::wave::{Source, WaveCtx};

fn main() {
    env_logger::init();

    let m0 = StepperPins { step: 4, dir: 5, enable: 6 };
    let m1 = StepperPins { step: 7, dir: 8, enable: 9 };
    const TONE_PIN: u8 = 16;

    let mut pins = 1u32 << TONE_PIN;
    for m in &[m0, m1] {
        pins |= (1 << m.step) | (1 << m.dir) | (1 << m.enable);
    }

    let mut backend = Backend::Vcd(VcdBackend::stdout(pins));

    let mut a = Stepper::new(m0, StepperConfig::default());
    let mut b = Stepper::new(m1, StepperConfig::default());
    let mut tone = Tone::new(TONE_PIN);

    a.set_velocity(24.0);
    b.set_velocity(7.0);
    // A beep while the motors ramp: 100 ms in, for 250 ms.
    tone.add_note(10_000, 69, 25_000);

    let mut ctx = WaveCtx::new(3);
    for _ in 0..60 {
        backend.wait_fence(0, 0).unwrap();

        let mut sources: [&mut dyn Source; 3] = [&mut a, &mut b, &mut tone];
        ctx.generate(&mut backend, &mut sources, CHUNK_TICKS)
            .unwrap();
    }
}
