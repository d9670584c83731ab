//! Tone event source: a queue of timestamped notes played as a 50%-duty
//! square wave on one pin.
//!
//! The channel keeps its own monotonic tick counter. Idle time (no note
//! playing, or waiting for a note's start time) is spent advancing that
//! counter without touching the pin, so enqueued notes land at the right
//! absolute tick no matter how long the queue sat empty.

use std::collections::VecDeque;

use crate::timing::TICKS_PER_MS;
use crate::wave::{Event, Source};
use crate::Ticks;

// TODO: derive the period from the note number instead of hard-coding 1 kHz.
const LAMBDA: Ticks = 100;

#[derive(Debug)]
struct Note {
    /// Absolute channel tick at which the note begins.
    timestamp: Ticks,
    /// Full period in ticks; edges come every `lambda / 2`.
    lambda: Ticks,
    /// Ticks of playback remaining.
    duration: Ticks,
}

pub struct Tone {
    pin: u8,

    timestamp: Ticks,
    high: bool,
    playing: bool,

    current: Option<Note>,
    notes: VecDeque<Note>,
}

impl Tone {
    pub fn new(pin: u8) -> Self {
        Tone {
            pin,
            timestamp: 0,
            high: false,
            playing: true,
            current: None,
            notes: VecDeque::new(),
        }
    }

    /// Queue a note starting at channel tick `timestamp` for `duration`
    /// ticks. `_note` is the note number; see the TODO above.
    pub fn add_note(&mut self, timestamp: Ticks, _note: u32, duration: Ticks) {
        self.notes.push_back(Note {
            timestamp,
            lambda: LAMBDA,
            duration,
        });
    }

    /// Pause (`false`) or resume (`true`) playback. While paused the
    /// channel just keeps time.
    pub fn play_pause(&mut self, play: bool) {
        self.playing = play;
    }

    /// Drop the current note and everything queued behind it.
    pub fn clear(&mut self) {
        self.current = None;
        self.notes.clear();
    }

    pub fn timestamp(&self) -> Ticks {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: Ticks) {
        self.timestamp = timestamp;
    }

    fn advance(&mut self, amount: Ticks) -> Ticks {
        self.timestamp = self.timestamp.wrapping_add(amount);
        amount
    }
}

impl Source for Tone {
    fn gen_event(&mut self, ev: &mut Event) -> Ticks {
        if !self.playing {
            return self.advance(TICKS_PER_MS);
        }

        if self.current.is_none() {
            match self.notes.pop_front() {
                Some(n) => self.current = Some(n),
                None => return self.advance(TICKS_PER_MS),
            }
        }

        let note = self.current.as_mut().unwrap();

        if self.timestamp < note.timestamp {
            let wait = note.timestamp - self.timestamp;
            return self.advance(wait);
        }

        if self.high {
            ev.falling |= 1 << self.pin;
            self.high = false;
            if note.duration < note.lambda {
                // Not enough left for another full cycle - make sure we
                // finish low.
                note.duration = 0;
            }
        } else {
            ev.rising |= 1 << self.pin;
            self.high = true;
        }

        let delay = note.lambda / 2;

        if note.duration < delay {
            self.current = None;
        } else {
            note.duration -= delay;
        }

        self.advance(delay)
    }
}
