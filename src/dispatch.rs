//! Command decode and dispatch: turns records from the command channel
//! into source mutations, and encodes the per-motor report packets going
//! the other way.

use log::debug;

use crate::comm::Packet;
use crate::source::stepper::MotorState;
use crate::source::{Stepper, Tone};
use crate::timing::us_to_ticks;
use crate::{Error, Result};

pub const CMD_SET_VELOCITY: u32 = 1;
pub const CMD_CONTROLLED_MOVE: u32 = 2;
pub const CMD_NOTE: u32 = 3;

pub const REPORT_MOTOR: u32 = 0x12;

/// A distance-bounded move in progress on one motor: run until the step
/// budget is spent, then stop.
struct MoveJob {
    remaining: i64,
    dir: i64,
}

#[derive(Default)]
pub struct Dispatcher {
    moves: Vec<Option<MoveJob>>,
}

impl Dispatcher {
    pub fn new(n_motors: usize) -> Self {
        let mut moves = Vec::new();
        moves.resize_with(n_motors, || None);
        Dispatcher { moves }
    }

    /// Apply one record to the sources. Malformed records return
    /// [`Error::Protocol`]; the caller logs and carries on.
    pub fn dispatch(
        &mut self,
        pkt: &Packet,
        steppers: &mut [Stepper],
        tones: &mut [Tone],
    ) -> Result<()> {
        match pkt.kind {
            CMD_SET_VELOCITY => {
                // { motor: u8, pad: [u8; 3], speed: s15.16 }
                let data = fixed_len(pkt, 8)?;
                let motor = usize::from(data[0]);
                let speed = i32::from_ne_bytes([data[4], data[5], data[6], data[7]]);
                let rads = f64::from(speed) / 65536.0;

                let stepper = steppers
                    .get_mut(motor)
                    .ok_or_else(|| Error::Protocol(format!("no motor {}", motor)))?;
                debug!("motor {} -> {} rad/s", motor, rads);
                self.cancel_move(motor);
                stepper.set_velocity(rads);
                Ok(())
            }
            CMD_CONTROLLED_MOVE => {
                // { dist_a, spd_a, dist_b, spd_b } as f64, applied to the
                // motor pairs (0, 2) and (1, 3).
                let data = fixed_len(pkt, 32)?;
                let dist_a = f64_at(data, 0);
                let spd_a = f64_at(data, 8);
                let dist_b = f64_at(data, 16);
                let spd_b = f64_at(data, 24);

                for &motor in &[0usize, 2] {
                    self.start_move(motor, dist_a, spd_a, steppers)?;
                }
                for &motor in &[1usize, 3] {
                    self.start_move(motor, dist_b, spd_b, steppers)?;
                }
                Ok(())
            }
            CMD_NOTE => {
                // { channel, timestamp_us, note, duration_us } as u32.
                let data = fixed_len(pkt, 16)?;
                let channel = u32_at(data, 0) as usize;
                let timestamp = us_to_ticks(u32_at(data, 4));
                let note = u32_at(data, 8);
                let duration = us_to_ticks(u32_at(data, 12));

                let tone = tones
                    .get_mut(channel)
                    .ok_or_else(|| Error::Protocol(format!("no tone channel {}", channel)))?;
                debug!(
                    "channel {}: note {} at {} for {} ticks",
                    channel, note, timestamp, duration
                );
                tone.add_note(timestamp, note, duration);
                Ok(())
            }
            other => Err(Error::Protocol(format!("unknown record type {}", other))),
        }
    }

    fn start_move(
        &mut self,
        motor: usize,
        dist: f64,
        spd: f64,
        steppers: &mut [Stepper],
    ) -> Result<()> {
        let stepper = steppers
            .get_mut(motor)
            .ok_or_else(|| Error::Protocol(format!("no motor {}", motor)))?;

        if dist == 0.0 || spd == 0.0 {
            self.cancel_move(motor);
            stepper.set_velocity(0.0);
            return Ok(());
        }

        let steps = (dist.abs() / stepper.alpha()).round() as i64;
        let dir = if dist > 0.0 { 1 } else { -1 };
        debug!("motor {}: move {} steps at {} rad/s", motor, dir * steps, spd);

        if let Some(slot) = self.moves.get_mut(motor) {
            *slot = Some(MoveJob { remaining: dir * steps, dir });
        }
        stepper.set_velocity(spd.abs() * dist.signum());
        Ok(())
    }

    fn cancel_move(&mut self, motor: usize) {
        if let Some(slot) = self.moves.get_mut(motor) {
            *slot = None;
        }
    }

    /// Burn this iteration's step delta against any move in progress on
    /// `motor`, stopping the motor once the budget is spent.
    pub fn note_steps(&mut self, motor: usize, delta: i32, stepper: &mut Stepper) {
        let slot = match self.moves.get_mut(motor) {
            Some(s) => s,
            None => return,
        };
        if let Some(job) = slot {
            job.remaining -= i64::from(delta);
            if job.remaining * job.dir <= 0 {
                debug!("motor {}: move complete", motor);
                stepper.set_velocity(0.0);
                *slot = None;
            }
        }
    }
}

/// `{ motor, steps_delta, status }` payload for [`REPORT_MOTOR`].
pub fn encode_report(motor: u32, steps_delta: i32, status: i32) -> [u8; 12] {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&motor.to_ne_bytes());
    buf[4..8].copy_from_slice(&steps_delta.to_ne_bytes());
    buf[8..12].copy_from_slice(&status.to_ne_bytes());
    buf
}

pub fn motor_status(state: MotorState) -> i32 {
    match state {
        MotorState::Stopped => 0,
        MotorState::Fwd => 1,
        MotorState::Rev => 2,
    }
}

fn fixed_len(pkt: &Packet, len: usize) -> Result<&[u8]> {
    if pkt.data.len() != len {
        return Err(Error::Protocol(format!(
            "record type {} carries {} bytes, expected {}",
            pkt.kind,
            pkt.data.len(),
            len
        )));
    }
    Ok(&pkt.data)
}

fn u32_at(data: &[u8], off: usize) -> u32 {
    u32::from_ne_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn f64_at(data: &[u8], off: usize) -> f64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[off..off + 8]);
    f64::from_ne_bytes(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{StepperConfig, StepperPins};

    fn motors(n: usize) -> Vec<Stepper> {
        (0..n)
            .map(|i| {
                let base = (i * 3) as u8;
                Stepper::new(
                    StepperPins { step: base, dir: base + 1, enable: base + 2 },
                    StepperConfig::default(),
                )
            })
            .collect()
    }

    fn velocity_packet(motor: u8, rads: f64) -> Packet {
        let mut data = vec![motor, 0, 0, 0];
        data.extend_from_slice(&(((rads * 65536.0) as i32).to_ne_bytes()));
        Packet { kind: CMD_SET_VELOCITY, data }
    }

    #[test]
    fn set_velocity_reaches_the_right_motor() {
        let mut steppers = motors(4);
        let mut disp = Dispatcher::new(4);

        disp.dispatch(&velocity_packet(1, 25.0), &mut steppers, &mut [])
            .unwrap();
        assert_eq!(steppers[1].target_velocity(), 25.0);
        assert_eq!(steppers[0].target_velocity(), 0.0);

        disp.dispatch(&velocity_packet(1, -2.5), &mut steppers, &mut [])
            .unwrap();
        assert_eq!(steppers[1].target_velocity(), -2.5);
    }

    #[test]
    fn malformed_records_are_rejected() {
        let mut steppers = motors(4);
        let mut disp = Dispatcher::new(4);

        let short = Packet { kind: CMD_SET_VELOCITY, data: vec![0; 4] };
        assert!(matches!(
            disp.dispatch(&short, &mut steppers, &mut []),
            Err(Error::Protocol(_))
        ));

        let unknown = Packet { kind: 99, data: vec![] };
        assert!(matches!(
            disp.dispatch(&unknown, &mut steppers, &mut []),
            Err(Error::Protocol(_))
        ));

        assert!(matches!(
            disp.dispatch(&velocity_packet(7, 1.0), &mut steppers, &mut []),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn note_lands_on_the_channel_in_ticks() {
        let mut tones = vec![Tone::new(0), Tone::new(1)];
        let mut disp = Dispatcher::new(0);

        let mut data = Vec::new();
        for v in [1u32, 12_340, 69, 500_000] {
            data.extend_from_slice(&v.to_ne_bytes());
        }
        disp.dispatch(
            &Packet { kind: CMD_NOTE, data },
            &mut [],
            &mut tones,
        )
        .unwrap();

        // 12.34 ms start converts to 1234 ticks; the idle channel 0 stays
        // quiet while channel 1 rises once its start time passes.
        use crate::wave::{Event, Source};
        let mut seen_rise_at = None;
        let mut now = 0u32;
        while now < 3000 {
            let mut ev = Event::default();
            let dt = tones[1].gen_event(&mut ev);
            if ev.rising != 0 {
                seen_rise_at = Some(now);
                break;
            }
            now += dt;
        }
        assert_eq!(seen_rise_at, Some(1234));

        let bad_channel = {
            let mut data = Vec::new();
            for v in [9u32, 0, 0, 0] {
                data.extend_from_slice(&v.to_ne_bytes());
            }
            Packet { kind: CMD_NOTE, data }
        };
        assert!(matches!(
            disp.dispatch(&bad_channel, &mut [], &mut tones),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn controlled_move_runs_until_the_distance_is_spent() {
        let mut steppers = motors(4);
        let mut disp = Dispatcher::new(4);

        let mut data = Vec::new();
        for v in [6.28, 10.0, -3.14, 5.0] {
            data.extend_from_slice(&f64::to_ne_bytes(v));
        }
        disp.dispatch(
            &Packet { kind: CMD_CONTROLLED_MOVE, data },
            &mut steppers,
            &mut [],
        )
        .unwrap();

        // Group A forward, group B reverse.
        assert_eq!(steppers[0].target_velocity(), 10.0);
        assert_eq!(steppers[2].target_velocity(), 10.0);
        assert_eq!(steppers[1].target_velocity(), -5.0);
        assert_eq!(steppers[3].target_velocity(), -5.0);

        // 6.28 rad at 600 steps/rev is 600 steps (alpha = 2pi/600).
        disp.note_steps(0, 599, &mut steppers[0]);
        assert_eq!(steppers[0].target_velocity(), 10.0);
        disp.note_steps(0, 1, &mut steppers[0]);
        assert_eq!(steppers[0].target_velocity(), 0.0);

        // Reverse group counts the other way.
        disp.note_steps(1, -300, &mut steppers[1]);
        assert_eq!(steppers[1].target_velocity(), 0.0);
    }
}
