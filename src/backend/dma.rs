//! DMA backend: encodes the multiplexer's stream as a linked list of
//! hardware control blocks and races the engine with a two-buffer
//! ping-pong.
//!
//! The arena of control blocks is split in half. While the engine executes
//! a chain in one half, the CPU builds the next frame's chain in the other;
//! the sides swap every frame. Publication is a single store to the live
//! chain's terminator `next` pointer, release-ordered so the engine never
//! observes a half-written chain. The fence at the head of each chain
//! tells the CPU when the engine has crossed over, which is what makes the
//! just-vacated half safe to rebuild.
//!
//! If the CPU misses its deadline the engine runs off the terminator
//! (whose `next` is still null) and halts; that surfaces as a fence
//! timeout, never as the engine chasing a torn pointer.

use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{fence as memory_fence, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::hw::dma::{self, CbBuilder, DmaCb, DmaChannel, Pacer, PacerHw};
use crate::hw::mbox::PhysRegion;
use crate::hw::Board;
use crate::timing::TICK_US;
use crate::wave::Event;
use crate::{Error, Result, Ticks};

/// Control blocks in the arena; each ping-pong side gets half.
const N_CBS: usize = 4096;

/// Length of the bootstrap idle loop, in ticks.
const BOOTSTRAP_TICKS: u32 = 8_000;

/// The memory the chains live in: mailbox-allocated DMA memory on
/// hardware, a plain boxed slice under test (where a simulated engine
/// walks the list).
enum Arena {
    Phys(PhysRegion),
    #[cfg(test)]
    Heap {
        cbs: Box<[std::cell::UnsafeCell<DmaCb>]>,
        bus_base: u32,
    },
}

impl Arena {
    fn n_cbs(&self) -> usize {
        match self {
            Arena::Phys(p) => p.size() / size_of::<DmaCb>(),
            #[cfg(test)]
            Arena::Heap { cbs, .. } => cbs.len(),
        }
    }

    fn cb_ptr(&self, idx: usize) -> *mut DmaCb {
        debug_assert!(idx < self.n_cbs());
        match self {
            // Safety: in-bounds offset within the mapped region.
            Arena::Phys(p) => unsafe { (p.virt() as *mut DmaCb).add(idx) },
            #[cfg(test)]
            Arena::Heap { cbs, .. } => cbs[idx].get(),
        }
    }

    /// Bus address of slot `idx`, as the engine must see it.
    fn bus(&self, idx: usize) -> u32 {
        match self {
            Arena::Phys(p) => p.bus_addr(idx * size_of::<DmaCb>()),
            #[cfg(test)]
            Arena::Heap { bus_base, .. } => bus_base + (idx * size_of::<DmaCb>()) as u32,
        }
    }

    #[cfg(test)]
    fn index_of_bus(&self, bus: u32) -> Option<usize> {
        let base = self.bus(0);
        if bus < base {
            return None;
        }
        let idx = (bus - base) as usize / size_of::<DmaCb>();
        (idx < self.n_cbs()).then(|| idx)
    }
}

struct ChannelHw {
    chan: DmaChannel,
    pacers: PacerHw,
}

pub struct DmaBackend {
    arena: Arena,
    builder: CbBuilder,
    hw: Option<ChannelHw>,

    pending: Event,

    /// Side currently being (or about to be) built. The other side is the
    /// engine's.
    wave_idx: usize,
    /// Next free slot while a frame is open.
    cursor: usize,
    /// Terminator of the live chain; its `next` is the publication point.
    tail: usize,
    /// Fence at the head of the most recently published chain.
    fence: usize,

    /// Delay triples dropped from the current frame because the side
    /// filled up; reported once when the frame closes.
    dropped: usize,
}

impl DmaBackend {
    /// Bring up the real thing: allocate the arena, map the channel,
    /// configure the pacer, and start the engine on the bootstrap loop.
    pub fn new(board: &Board, channel: usize, pacer: Pacer) -> Result<DmaBackend> {
        let phys = PhysRegion::alloc(board, N_CBS * size_of::<DmaCb>())?;
        let pacers = PacerHw::new(board)?;
        let mut chan = DmaChannel::new(board, channel)?;
        chan.setup_pacer(&pacers, pacer, TICK_US)?;
        let builder = chan.cb_builder()?;

        let mut be = DmaBackend {
            arena: Arena::Phys(phys),
            builder,
            hw: Some(ChannelHw { chan, pacers }),
            pending: Event::default(),
            wave_idx: 0,
            cursor: 0,
            tail: 0,
            fence: 0,
            dropped: 0,
        };
        be.bootstrap()?;
        Ok(be)
    }

    /// Install a self-looping fence + idle delay in the current side and
    /// set the engine loose on it. The first real frame splices into this
    /// loop through `tail`.
    fn bootstrap(&mut self) -> Result<()> {
        let base = self.half_base(self.wave_idx);

        let mut head = CbBuilder::fence(1, self.bus(base));
        head.next = self.bus(base + 1);
        self.write_cb(base, head);
        self.fence = base;

        let mut idle = self
            .builder
            .paced_delay(BOOTSTRAP_TICKS * TICK_US, self.bus(base + 1))?;
        idle.next = self.bus(base);
        self.write_cb(base + 1, idle);
        self.tail = base + 1;

        self.wave_idx ^= 1;

        if let Some(hw) = &self.hw {
            hw.chan.run(&hw.pacers, self.bus(base));
        }
        debug!(
            "bootstrap loop running: {} CBs per side, {} tick idle",
            self.half_len(),
            BOOTSTRAP_TICKS
        );
        Ok(())
    }

    fn half_len(&self) -> usize {
        self.arena.n_cbs() / 2
    }

    fn half_base(&self, idx: usize) -> usize {
        idx * self.half_len()
    }

    fn bus(&self, idx: usize) -> u32 {
        self.arena.bus(idx)
    }

    fn write_cb(&mut self, idx: usize, cb: DmaCb) {
        // Safety: in-bounds slot, and the ping-pong discipline guarantees
        // the engine is not executing this side.
        unsafe { ptr::write_volatile(self.arena.cb_ptr(idx), cb) };
    }

    pub(crate) fn pending_mut(&mut self) -> &mut Event {
        &mut self.pending
    }

    /// Open a frame in the build side: reset the cursor and lay down this
    /// chain's fence.
    pub(crate) fn start_wave(&mut self) {
        let base = self.half_base(self.wave_idx);
        self.dropped = 0;

        let mut cb = CbBuilder::fence(1, self.bus(base));
        cb.next = self.bus(base + 1);
        self.write_cb(base, cb);
        self.fence = base;
        self.cursor = base + 1;
    }

    /// Emit the pending edges and a paced delay of `ticks`: three blocks,
    /// each linked to the next slot.
    pub(crate) fn add_delay(&mut self, ticks: Ticks) -> Result<()> {
        // Three blocks now, and the terminator still has to fit. A frame
        // that doesn't fit is truncated, not aborted: the dropped tail of
        // the frame is lost, but the chain stays well-formed.
        let limit = self.half_base(self.wave_idx) + self.half_len();
        if self.cursor + 4 > limit {
            self.dropped += 1;
            self.pending = Event::default();
            return Ok(());
        }

        let rising = self.builder.rising_edge(self.pending.rising, self.bus(self.cursor));
        self.link(rising);

        let falling = self
            .builder
            .falling_edge(self.pending.falling, self.bus(self.cursor));
        self.link(falling);

        let delay = self
            .builder
            .paced_delay(ticks * TICK_US, self.bus(self.cursor))?;
        self.link(delay);

        self.pending = Event::default();
        Ok(())
    }

    fn link(&mut self, mut cb: DmaCb) {
        cb.next = self.bus(self.cursor + 1);
        self.write_cb(self.cursor, cb);
        self.cursor += 1;
    }

    /// Close the frame and publish it to the engine.
    pub(crate) fn end_wave(&mut self) {
        if self.dropped > 0 {
            error!(
                "{}",
                Error::Overflow {
                    needed: self.half_len() + 3 * self.dropped,
                    capacity: self.half_len(),
                }
            );
        }

        // Terminating dummy block: if the last real element is a long
        // paced delay, the engine may have prefetched it and latched its
        // `next` pointer; the dummy gives the *following* frame a
        // quiescent block whose `next` is still safely mutable.
        let cb = CbBuilder::fence(1, self.bus(self.cursor));
        self.write_cb(self.cursor, cb); // next stays null

        // Publish. Everything written into this side must be visible
        // before the engine can chase the new head pointer.
        let head = self.bus(self.half_base(self.wave_idx));
        memory_fence(Ordering::Release);
        // Safety: `tail` is a valid slot; only its `next` field is
        // touched, and the engine only reads it once it reaches the
        // terminator.
        unsafe {
            ptr::write_volatile(ptr::addr_of_mut!((*self.arena.cb_ptr(self.tail)).next), head)
        };

        // Only now does `tail` move: if the engine already ran off the old
        // terminator, it halted there and the fence wait will notice.
        self.tail = self.cursor;
        self.wave_idx ^= 1;
    }

    /// Poll the current fence until the engine signals it, sleeping
    /// `poll_ms` between polls.
    pub(crate) fn wait_fence(&self, timeout_ms: u32, poll_ms: u32) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));

        loop {
            if dma::fence_signaled(self.arena.cb_ptr(self.fence)) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::FenceTimeout { timeout_ms });
            }
            if poll_ms > 0 {
                thread::sleep(Duration::from_millis(u64::from(poll_ms)));
            } else {
                thread::yield_now();
            }
        }
    }

    pub(crate) fn dump(&self) {
        error!(
            "backend: wave_idx {} cursor {} tail {} fence {}",
            self.wave_idx, self.cursor, self.tail, self.fence
        );
        // Safety: fence is a valid slot.
        let fence_cb = unsafe { ptr::read_volatile(self.arena.cb_ptr(self.fence)) };
        error!("fence cb: {:08x?}", fence_cb);
        if let Some(hw) = &self.hw {
            hw.chan.dump();
        }
    }
}

impl Drop for DmaBackend {
    fn drop(&mut self) {
        if let Some(hw) = &mut self.hw {
            hw.chan.reset();
            hw.chan.disable_pacer(&hw.pacers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::source::SquareWave;
    use crate::wave::WaveCtx;

    const TEST_BUS_BASE: u32 = 0x4000_0000;

    fn test_backend(n_cbs: usize) -> DmaBackend {
        let cbs: Vec<std::cell::UnsafeCell<DmaCb>> = (0..n_cbs)
            .map(|_| std::cell::UnsafeCell::new(DmaCb::default()))
            .collect();
        let mut be = DmaBackend {
            arena: Arena::Heap {
                cbs: cbs.into_boxed_slice(),
                bus_base: TEST_BUS_BASE,
            },
            builder: CbBuilder {
                periph_phys_base: 0x7E00_0000,
                pacer: Pacer::Pwm,
                pace_us: TICK_US,
            },
            hw: None,
            pending: Event::default(),
            wave_idx: 0,
            cursor: 0,
            tail: 0,
            fence: 0,
            dropped: 0,
        };
        be.bootstrap().unwrap();
        be
    }

    /// Software model of the engine: walks the chain from a bus address,
    /// counting paced ticks, executing fences, and recording edges, until
    /// it hits a null `next` (halt) or runs out of its block allowance.
    struct SimEngine {
        current: u32,
    }

    #[derive(Default, Debug)]
    struct SimRun {
        ticks: u64,
        fences_fired: usize,
        edges: Vec<(u64, u32, u32)>, // (tick, set-mask, clear-mask)
        halted: bool,
    }

    impl SimEngine {
        fn new(start: u32) -> Self {
            SimEngine { current: start }
        }

        fn run(&mut self, be: &DmaBackend, max_cbs: usize) -> SimRun {
            let mut out = SimRun::default();
            let mut set: u32 = 0;
            let mut clear: u32 = 0;

            for _ in 0..max_cbs {
                let idx = match be.arena.index_of_bus(self.current) {
                    Some(i) => i,
                    None => panic!("engine fetched outside arena: {:08x}", self.current),
                };
                // Safety: idx validated above.
                let cb = unsafe { ptr::read_volatile(be.arena.cb_ptr(idx)) };

                if cb.info & (1 << 1) != 0 && cb.info & (1 << 6) != 0 {
                    // Paced delay: 2D transfer count from the length field.
                    let count = (cb.length >> 16) + 1;
                    out.ticks += u64::from(count);
                    if set != 0 || clear != 0 {
                        out.edges.push((out.ticks - u64::from(count), set, clear));
                        set = 0;
                        clear = 0;
                    }
                } else if cb.dst == self.current + dma::CB_SCRATCH_OFFSET + 4 {
                    // Fence: copies scratch[0] over scratch[1].
                    // Safety: in-arena write, modelling the engine.
                    unsafe {
                        let p = be.arena.cb_ptr(idx);
                        let val = ptr::read_volatile(ptr::addr_of!((*p).scratch[0]));
                        ptr::write_volatile(ptr::addr_of_mut!((*p).scratch[1]), val);
                    }
                    out.fences_fired += 1;
                } else if cb.dst == 0x7E20_001C {
                    set |= cb.scratch[0];
                } else if cb.dst == 0x7E20_0028 {
                    clear |= cb.scratch[0];
                }

                if cb.next == 0 {
                    out.halted = true;
                    return out;
                }
                self.current = cb.next;
            }
            out
        }
    }

    fn one_frame(be: &mut Backend, budget: Ticks) {
        let mut ctx = WaveCtx::new(1);
        let mut sq = SquareWave::new(16, 100, false);
        ctx.generate(be, &mut [&mut sq], budget).unwrap();
    }

    #[test]
    fn bootstrap_loops_until_spliced() {
        let be = test_backend(64);
        let mut engine = SimEngine::new(be.bus(0));

        // Two trips around the idle loop: fence, delay, fence, delay.
        let run = engine.run(&be, 4);
        assert!(!run.halted);
        assert_eq!(run.fences_fired, 2);
        assert_eq!(run.ticks, 2 * u64::from(BOOTSTRAP_TICKS));

        // The loop's own fence is already signalled, so the first frame
        // never blocks.
        be.wait_fence(10, 0).unwrap();
    }

    #[test]
    fn spliced_chunk_drains_and_signals_once() {
        let mut backend = Backend::Dma(test_backend(256));
        one_frame(&mut backend, 1600);

        let be = match &backend {
            Backend::Dma(be) => be,
            _ => unreachable!(),
        };

        // Before the engine reaches the new chain, its fence reads unarmed
        // and the wait times out.
        assert!(!dma::fence_signaled(be.arena.cb_ptr(be.fence)));
        assert!(matches!(
            be.wait_fence(1, 0),
            Err(Error::FenceTimeout { .. })
        ));

        // The engine finishes its pass over the bootstrap loop, follows
        // the spliced pointer, and enters the new chain.
        let mut engine = SimEngine::new(be.bus(0));
        let run = engine.run(be, 512);

        // It halts at the new terminator with the whole 16 ms drained:
        // one pass of the idle loop, then exactly the frame budget.
        assert!(run.halted);
        // Old loop fence + new chain head fence + dummy terminator.
        assert_eq!(run.fences_fired, 3);
        assert_eq!(
            run.ticks,
            u64::from(BOOTSTRAP_TICKS) + 1600,
            "chunk must hold exactly its budget"
        );
        be.wait_fence(10, 0).unwrap();
    }

    #[test]
    fn sides_alternate_between_frames() {
        let mut backend = Backend::Dma(test_backend(256));

        for frame in 0..4 {
            // The bootstrap loop owns side 0, so the first frame builds
            // into side 1.
            let expect_side = 1 - frame % 2;
            one_frame(&mut backend, 100);
            let be = match &backend {
                Backend::Dma(be) => be,
                _ => unreachable!(),
            };
            let half = be.half_len();
            assert_eq!(be.fence, expect_side * half, "frame {}", frame);
            // Everything written this frame stayed inside its own side.
            assert!(be.tail >= expect_side * half);
            assert!(be.tail < (expect_side + 1) * half);
        }
    }

    #[test]
    fn engine_never_sees_the_side_being_built() {
        let mut backend = Backend::Dma(test_backend(256));
        one_frame(&mut backend, 1600);

        // Engine executes chunk 0 (side 1); meanwhile the CPU builds
        // chunk 1 into side 0. Walk the engine one block at a time and
        // check it never strays into the build side.
        {
            let be = match &backend {
                Backend::Dma(be) => be,
                _ => unreachable!(),
            };
            let mut engine = SimEngine::new(be.bus(be.half_base(1)));
            let build_side = be.wave_idx; // 0 after the first end_wave
            let half = be.half_len();
            loop {
                let idx = be.arena.index_of_bus(engine.current).unwrap();
                assert!(
                    idx < build_side * half || idx >= (build_side + 1) * half,
                    "engine entered the build side at slot {}",
                    idx
                );
                let run = engine.run(be, 1);
                if run.halted {
                    break;
                }
            }
        }

        // And after the next frame the roles swap cleanly.
        one_frame(&mut backend, 100);
        let be = match &backend {
            Backend::Dma(be) => be,
            _ => unreachable!(),
        };
        assert_eq!(be.wave_idx, 1);
    }

    #[test]
    fn overflow_truncates_but_still_terminates() {
        // 16 slots => 8 per side => fence + 1 triple fits, a 2nd triple
        // fits exactly, a 3rd must be dropped.
        let mut backend = Backend::Dma(test_backend(16));
        // Square wave with period 20 in a 100-tick budget wants 10 delays.
        let mut ctx = WaveCtx::new(1);
        let mut sq = SquareWave::new(3, 20, false);
        ctx.generate(&mut backend, &mut [&mut sq], 100).unwrap();

        let be = match &backend {
            Backend::Dma(be) => be,
            _ => unreachable!(),
        };
        assert_eq!(be.dropped, 8);

        // The truncated chain still ends in a terminator inside its side.
        let mut engine = SimEngine::new(be.bus(be.half_base(1)));
        let run = engine.run(be, 64);
        assert!(run.halted);
        // Two triples of the ten made it in.
        assert_eq!(run.ticks, 10 + 10);
    }

    #[test]
    fn edges_land_at_their_ticks() {
        let mut backend = Backend::Dma(test_backend(256));
        one_frame(&mut backend, 200); // square period 100 on pin 16

        let be = match &backend {
            Backend::Dma(be) => be,
            _ => unreachable!(),
        };
        let mut engine = SimEngine::new(be.bus(0));
        let run = engine.run(be, 512);

        // Edge ticks are relative to the start of the bootstrap pass the
        // engine was on when the chunk was spliced.
        let base = u64::from(BOOTSTRAP_TICKS);
        assert_eq!(
            run.edges,
            vec![
                (base, 1 << 16, 0),
                (base + 50, 0, 1 << 16),
                (base + 100, 1 << 16, 0),
                (base + 150, 0, 1 << 16),
            ]
        );
    }
}
