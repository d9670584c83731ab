//! Waveform daemon: four stepper motors and a tone channel driven through
//! the DMA backend, commanded over a local socket.
//!
//! # Theory of operation
//!
//! The main loop is the producer half of the ping-pong: wait until the DMA
//! engine has crossed into the chunk we spliced last time around, apply
//! any pending commands to the motors, build the next 16 ms of waveform,
//! and splice it. All the hard timing lives in the engine; the CPU only
//! has to finish each chunk before the engine drains the previous one.
//!
//! Any catchable signal sets an exit flag checked at the top of the loop;
//! teardown then resets the DMA channel, quiesces the pacer, and returns
//! the control-block memory, because an engine left running after process
//! death keeps driving the pins.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info, warn};
use scopeguard::defer;

use piwave::backend::{Backend, DmaBackend};
use piwave::comm::Comm;
use piwave::dispatch::{self, Dispatcher};
use piwave::hw::dma::Pacer;
use piwave::hw::gpio::{self, Gpio, Mode};
use piwave::hw::Board;
use piwave::source::{Stepper, StepperConfig, StepperPins, Tone};
use piwave::timing::CHUNK_TICKS;
use piwave::wave::{Source, WaveCtx};

const SOCKET_PATH: &str = "/tmp/sock";
const DMA_CHANNEL: usize = 6;

const FENCE_TIMEOUT_MS: u32 = 1_000;
const FENCE_POLL_MS: u32 = 4;

const MOTORS: [StepperPins; 4] = [
    StepperPins { step: 4, dir: 5, enable: 6 },
    StepperPins { step: 7, dir: 8, enable: 9 },
    StepperPins { step: 10, dir: 11, enable: 12 },
    StepperPins { step: 19, dir: 20, enable: 21 },
];

const TONE_PINS: [u8; 1] = [16];

static EXITING: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    EXITING.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    for sig in 1..libc::SIGSYS + 1 {
        if sig == libc::SIGKILL || sig == libc::SIGSTOP {
            continue;
        }
        // Safety: the handler only stores to an atomic flag.
        unsafe {
            libc::signal(sig, handle_signal as libc::sighandler_t);
        }
    }
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        error!("{}", e);
        process::exit(1);
    }
}

fn run() -> piwave::Result<()> {
    install_signal_handlers();

    let board = Board::detect()?;
    let gpio = Gpio::new(&board)?;

    let mut pins = 0u32;
    for m in &MOTORS {
        pins |= (1 << m.step) | (1 << m.dir) | (1 << m.enable);
    }
    for &pin in &TONE_PINS {
        pins |= 1 << pin;
    }
    for pin in 0..32 {
        if pins & (1 << pin) != 0 {
            gpio.set_mode(pin, Mode::Output);
            gpio.clear(1 << pin);
        }
    }

    #[cfg(feature = "measurement")]
    for &pin in &[gpio::DBG_CHUNK_PIN, gpio::DBG_CPUTIME_PIN, gpio::DBG_FENCE_PIN] {
        gpio.set_mode(pin, Mode::Output);
        gpio.clear(1 << pin);
    }

    let mut backend = Backend::Dma(DmaBackend::new(&board, DMA_CHANNEL, Pacer::Pwm)?);

    let mut comm = Comm::bind(SOCKET_PATH)?;
    defer! {
        let _ = std::fs::remove_file(SOCKET_PATH);
    }

    let mut steppers: Vec<Stepper> = MOTORS
        .iter()
        .map(|&p| Stepper::new(p, StepperConfig::default()))
        .collect();
    let mut tones: Vec<Tone> = TONE_PINS.iter().map(|&p| Tone::new(p)).collect();
    let mut dispatcher = Dispatcher::new(steppers.len());
    let mut ctx = WaveCtx::new(steppers.len() + tones.len());

    info!(
        "driving {} motors and {} tone channels, {} ticks per chunk",
        steppers.len(),
        tones.len(),
        CHUNK_TICKS
    );

    while !EXITING.load(Ordering::Relaxed) {
        // Block until the engine has left the buffer we're about to
        // rebuild. A timeout here means the engine is stuck or we missed
        // our deadline badly enough that it halted; either way the chain
        // is dead.
        gpio.debug_set(1 << gpio::DBG_FENCE_PIN);
        let waited = backend.wait_fence(FENCE_TIMEOUT_MS, FENCE_POLL_MS);
        gpio.debug_clear(1 << gpio::DBG_FENCE_PIN);
        if let Err(e) = waited {
            backend.dump();
            return Err(e);
        }

        gpio.debug_set(1 << gpio::DBG_CPUTIME_PIN);

        for pkt in comm.poll()? {
            if let Err(e) = dispatcher.dispatch(&pkt, &mut steppers, &mut tones) {
                warn!("{}", e);
            }
        }

        gpio.debug_set(1 << gpio::DBG_CHUNK_PIN);
        {
            let mut sources: Vec<&mut dyn Source> = steppers
                .iter_mut()
                .map(|s| s as &mut dyn Source)
                .chain(tones.iter_mut().map(|t| t as &mut dyn Source))
                .collect();
            ctx.generate(&mut backend, &mut sources, CHUNK_TICKS)?;
        }
        gpio.debug_clear(1 << gpio::DBG_CHUNK_PIN);

        for (i, stepper) in steppers.iter_mut().enumerate() {
            let delta = stepper.take_steps();
            dispatcher.note_steps(i, delta, stepper);

            let status = dispatch::motor_status(stepper.state());
            if delta != 0 || status != 0 {
                comm.send(
                    dispatch::REPORT_MOTOR,
                    &dispatch::encode_report(i as u32, delta, status),
                );
            }
        }

        gpio.debug_clear(1 << gpio::DBG_CPUTIME_PIN);
    }

    info!("exiting on signal");
    Ok(())
}
