//! VideoCore mailbox property interface, used to allocate the physically
//! contiguous, DMA-visible memory the control-block arena lives in.
//!
//! Documentation:
//!
//! * [Mailbox property interface](https://github.com/raspberrypi/firmware/wiki/Mailbox-property-interface)
//!
//! Every call is a property message over the `/dev/vcio` ioctl: a length-
//! prefixed word buffer holding one tag, sent synchronously to the
//! firmware, which rewrites it in place with the response.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::ptr;

use log::warn;

use super::{bus_to_phys, Board};
use crate::{Error, Result};

const TAG_ALLOCATE_MEMORY: u32 = 0x3000C;
const TAG_LOCK_MEMORY: u32 = 0x3000D;
const TAG_UNLOCK_MEMORY: u32 = 0x3000E;
const TAG_RELEASE_MEMORY: u32 = 0x3000F;

const REQUEST_CODE: u32 = 0;
const SUCCESS_CODE: u32 = 0x8000_0000;
const END_TAG: u32 = 0;

/// `_IOWR(100, 0, char *)`, assembled by hand; the size field depends on
/// the pointer width of the userland we're built for.
fn mbox_property_request() -> libc::c_ulong {
    let size = std::mem::size_of::<*mut libc::c_void>() as libc::c_ulong;
    (3 << 30) | (size << 16) | (100 << 8)
}

struct Mailbox {
    vcio: File,
}

impl Mailbox {
    fn open() -> Result<Mailbox> {
        let vcio = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/vcio")
            .map_err(|e| Error::Init(format!("open /dev/vcio: {}", e)))?;
        Ok(Mailbox { vcio })
    }

    /// Run one property tag with `args` request words; returns the first
    /// response word.
    fn property(&self, tag: u32, args: &[u32]) -> Result<u32> {
        let buf_words = args.len() as u32;

        let mut msg = Vec::with_capacity(6 + args.len());
        msg.push(0); // total size, patched below
        msg.push(REQUEST_CODE);
        msg.push(tag);
        msg.push(buf_words * 4);
        msg.push(0); // request indicator / response length
        msg.extend_from_slice(args);
        msg.push(END_TAG);
        msg[0] = (msg.len() * 4) as u32;

        // Safety: the buffer outlives the synchronous ioctl, which
        // rewrites it in place.
        let ret = unsafe {
            libc::ioctl(
                self.vcio.as_raw_fd(),
                mbox_property_request(),
                msg.as_mut_ptr(),
            )
        };
        if ret < 0 {
            return Err(Error::Init(format!(
                "mailbox property {:#x}: {}",
                tag,
                std::io::Error::last_os_error()
            )));
        }
        if msg[1] != SUCCESS_CODE {
            return Err(Error::Init(format!(
                "mailbox property {:#x}: firmware error {:#x}",
                tag, msg[1]
            )));
        }

        Ok(msg[5])
    }
}

/// A contiguous region of DMA-visible memory: firmware-allocated, locked
/// to a bus address, and mapped into our address space for the region's
/// lifetime.
pub struct PhysRegion {
    mbox: Mailbox,
    mem_ref: u32,
    bus: u32,
    size: usize,
    virt: *mut u8,
}

// Owned mapping; access is raw-pointer based and externally synchronized
// by the ping-pong discipline.
unsafe impl Send for PhysRegion {}

impl PhysRegion {
    /// Allocate at least `len` bytes (page-rounded) with the board's
    /// memory flag, lock it, and map the CPU alias.
    pub fn alloc(board: &Board, len: usize) -> Result<PhysRegion> {
        let size = (len + 4095) & !4095;
        let mbox = Mailbox::open()?;

        let mem_ref =
            mbox.property(TAG_ALLOCATE_MEMORY, &[size as u32, 4096, board.mem_flag])?;
        if mem_ref == 0 {
            return Err(Error::Init("VideoCore memory allocation failed".into()));
        }

        let bus = match mbox.property(TAG_LOCK_MEMORY, &[mem_ref]) {
            Ok(b) if b != 0 && b != u32::MAX => b,
            other => {
                let _ = mbox.property(TAG_RELEASE_MEMORY, &[mem_ref]);
                return match other {
                    Ok(b) => Err(Error::Init(format!(
                        "VideoCore memory lock returned {:#x}",
                        b
                    ))),
                    Err(e) => Err(e),
                };
            }
        };

        let mem = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/mem")
            .map_err(|e| Error::Init(format!("open /dev/mem: {}", e)))?;

        // Safety: mapping the locked region's physical alias; the firmware
        // guarantees it stays put until unlocked.
        let virt = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                mem.as_raw_fd(),
                bus_to_phys(bus) as libc::off_t,
            )
        };
        if virt == libc::MAP_FAILED {
            let _ = mbox.property(TAG_UNLOCK_MEMORY, &[mem_ref]);
            let _ = mbox.property(TAG_RELEASE_MEMORY, &[mem_ref]);
            return Err(Error::Init(format!(
                "map DMA memory: {}",
                std::io::Error::last_os_error()
            )));
        }

        // Safety: freshly mapped, in-bounds.
        unsafe { ptr::write_bytes(virt as *mut u8, 0, size) };

        Ok(PhysRegion {
            mbox,
            mem_ref,
            bus,
            size,
            virt: virt as *mut u8,
        })
    }

    pub fn virt(&self) -> *mut u8 {
        self.virt
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bus address of the byte at `offset`, as the DMA engine must see it.
    pub fn bus_addr(&self, offset: usize) -> u32 {
        debug_assert!(offset < self.size);
        self.bus + offset as u32
    }
}

impl Drop for PhysRegion {
    fn drop(&mut self) {
        // Safety: unmapping exactly what alloc() mapped.
        unsafe {
            libc::munmap(self.virt as *mut libc::c_void, self.size);
        }
        if let Err(e) = self.mbox.property(TAG_UNLOCK_MEMORY, &[self.mem_ref]) {
            warn!("mailbox unlock failed: {}", e);
        }
        if let Err(e) = self.mbox.property(TAG_RELEASE_MEMORY, &[self.mem_ref]) {
            warn!("mailbox release failed: {}", e);
        }
    }
}
