//! Shared-Memory Stream Ring
//!
//! Client and engine exchange audio through a memfd-backed segment:
//!
//! ```text
//! Header { used_size, frame_bytes, read_offset, write_offset,
//!          write_ts, read_ts, callback_pending }  ||  buffer[used_size * 2]
//! ```
//!
//! `used_size` is the byte size of one half-buffer; the data area is a
//! double ring of `used_size * 2` bytes. `read_offset`/`write_offset` are
//! free-running frame counters compared with wrapping arithmetic; the byte
//! index of a frame is `(offset % total_frames) * frame_bytes`. The writer
//! may run at most one half-buffer (`capacity_frames`) ahead of the reader,
//! so the two sides never touch the same bytes. A transfer that crosses the
//! end of the data area is a split copy; stream creation bounds one period
//! to `used_size / 2`, so at most one split per transfer.
//!
//! Offset loads are acquire and offset stores are release: the producer's
//! buffer writes happen-before the consumer observes the bumped offset.

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use memmap2::MmapMut;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::time::{clock_gettime, ClockId};

use crate::error::{EngineError, EngineResult};

/// Bytes reserved for the header at the front of the segment
pub const SHM_HEADER_BYTES: usize = 64;

#[repr(C)]
struct RingHeader {
    used_size: AtomicU32,
    frame_bytes: AtomicU32,
    read_offset: AtomicU32,
    write_offset: AtomicU32,
    write_ts_sec: AtomicU32,
    write_ts_nsec: AtomicU32,
    read_ts_sec: AtomicU32,
    read_ts_nsec: AtomicU32,
    callback_pending: AtomicU8,
}

fn now_ts() -> (u32, u32) {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u32, ts.tv_nsec() as u32),
        Err(_) => (0, 0),
    }
}

/// One mapped stream segment.
///
/// Both sides of the protocol use this type; which methods they call is a
/// matter of role (the playback client writes, the engine reads, and
/// vice versa for capture).
pub struct AudioShm {
    map: MmapMut,
    file: File,
    capacity_frames: u32,
    frame_bytes: u32,
}

impl AudioShm {
    /// Create a fresh segment sized for `buffer_frames` frames per
    /// half-buffer.
    ///
    /// Rejects geometry the ring discipline cannot support: zero sizes and
    /// an odd `used_size`.
    pub fn create(frame_bytes: u32, buffer_frames: u32) -> EngineResult<Self> {
        if frame_bytes == 0 || buffer_frames == 0 {
            return Err(EngineError::Shm("zero-sized ring".into()));
        }
        let used_size = frame_bytes
            .checked_mul(buffer_frames)
            .ok_or_else(|| EngineError::Shm("ring size overflow".into()))?;
        if used_size % 2 != 0 {
            return Err(EngineError::Shm(format!("used_size {used_size} is odd")));
        }

        let total = SHM_HEADER_BYTES + used_size as usize * 2;
        let fd = memfd_create(c"tern-stream", MemFdCreateFlag::MFD_CLOEXEC)?;
        let file = File::from(fd);
        file.set_len(total as u64)?;

        let map = unsafe { MmapMut::map_mut(&file)? };
        let shm = Self {
            map,
            file,
            capacity_frames: buffer_frames,
            frame_bytes,
        };
        shm.header().used_size.store(used_size, Ordering::Relaxed);
        shm.header().frame_bytes.store(frame_bytes, Ordering::Relaxed);
        Ok(shm)
    }

    /// Map an existing segment received over the control socket
    pub fn from_file(file: File) -> EngineResult<Self> {
        let map = unsafe { MmapMut::map_mut(&file)? };
        if map.len() < SHM_HEADER_BYTES {
            return Err(EngineError::Shm("segment smaller than header".into()));
        }
        let header = unsafe { &*(map.as_ptr() as *const RingHeader) };
        let used_size = header.used_size.load(Ordering::Relaxed);
        let frame_bytes = header.frame_bytes.load(Ordering::Relaxed);
        if frame_bytes == 0 || used_size == 0 || used_size % frame_bytes != 0 {
            return Err(EngineError::Shm("corrupt ring header".into()));
        }
        if map.len() < SHM_HEADER_BYTES + used_size as usize * 2 {
            return Err(EngineError::Shm("segment truncated".into()));
        }
        Ok(Self {
            capacity_frames: used_size / frame_bytes,
            frame_bytes,
            map,
            file,
        })
    }

    /// The fd to hand to the other side
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    /// Duplicate the backing file, e.g. to send over a socket
    pub fn dup_file(&self) -> EngineResult<File> {
        Ok(self.file.try_clone()?)
    }

    fn header(&self) -> &RingHeader {
        // The mapping outlives self and is page-aligned, so the header view
        // is always valid; all header fields are atomics.
        unsafe { &*(self.map.as_ptr() as *const RingHeader) }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes as usize
    }

    /// Frames per half-buffer (the writer's maximum lead)
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames as usize
    }

    fn total_frames(&self) -> u32 {
        self.capacity_frames * 2
    }

    /// Frames currently readable: `write_offset - read_offset`
    pub fn readable_frames(&self) -> usize {
        let w = self.header().write_offset.load(Ordering::Acquire);
        let r = self.header().read_offset.load(Ordering::Acquire);
        let level = w.wrapping_sub(r);
        // A misbehaving peer can publish an offset outside the window;
        // clamp rather than index out of bounds.
        level.min(self.capacity_frames) as usize
    }

    /// Frames the writer may still produce
    pub fn writable_frames(&self) -> usize {
        self.capacity_frames as usize - self.readable_frames()
    }

    fn data(&mut self) -> &mut [u8] {
        &mut self.map[SHM_HEADER_BYTES..]
    }

    fn split_window(&mut self, offset: u32, frames: u32) -> (&mut [u8], &mut [u8]) {
        let fb = self.frame_bytes as usize;
        let total = self.total_frames();
        let start = (offset % total) as usize * fb;
        let len = frames as usize * fb;
        let total_bytes = total as usize * fb;

        let data = self.data();
        if start + len <= total_bytes {
            let (_, high) = data.split_at_mut(start);
            let (first, _) = high.split_at_mut(len);
            (first, &mut [])
        } else {
            let first_len = total_bytes - start;
            let (low, high) = data.split_at_mut(start);
            let (second, _) = low.split_at_mut(len - first_len);
            (high, second)
        }
    }

    /// Copy whole frames from `bytes` into the ring. Returns frames
    /// written (bounded by free space) and advances the write offset.
    pub fn write_frames(&mut self, bytes: &[u8]) -> usize {
        let fb = self.frame_bytes as usize;
        let frames = (bytes.len() / fb).min(self.writable_frames());
        if frames == 0 {
            return 0;
        }
        let w = self.header().write_offset.load(Ordering::Relaxed);
        let (first, second) = self.split_window(w, frames as u32);
        let first_len = first.len();
        first.copy_from_slice(&bytes[..first_len]);
        if !second.is_empty() {
            let second_len = second.len();
            second.copy_from_slice(&bytes[first_len..first_len + second_len]);
        }
        self.commit_write(frames);
        frames
    }

    /// Borrow the writable region (up to `max_frames`) without committing
    pub fn write_window(&mut self, max_frames: usize) -> (&mut [u8], &mut [u8]) {
        let frames = max_frames.min(self.writable_frames());
        let w = self.header().write_offset.load(Ordering::Relaxed);
        self.split_window(w, frames as u32)
    }

    /// Publish `frames` frames written through [`write_window`](Self::write_window)
    pub fn commit_write(&mut self, frames: usize) {
        let header = self.header();
        let w = header.write_offset.load(Ordering::Relaxed);
        let (sec, nsec) = now_ts();
        header.write_ts_sec.store(sec, Ordering::Relaxed);
        header.write_ts_nsec.store(nsec, Ordering::Relaxed);
        header
            .write_offset
            .store(w.wrapping_add(frames as u32), Ordering::Release);
    }

    /// Copy up to `out.len()` bytes of whole frames out of the ring,
    /// advancing the read offset. Returns frames read.
    pub fn read_frames(&mut self, out: &mut [u8]) -> usize {
        let fb = self.frame_bytes as usize;
        let frames = (out.len() / fb).min(self.readable_frames());
        if frames == 0 {
            return 0;
        }
        let r = self.header().read_offset.load(Ordering::Relaxed);
        let (first, second) = self.split_window(r, frames as u32);
        let first_len = first.len();
        out[..first_len].copy_from_slice(first);
        if !second.is_empty() {
            let second_len = second.len();
            out[first_len..first_len + second_len].copy_from_slice(second);
        }
        self.commit_read(frames);
        frames
    }

    /// Borrow the readable region (up to `max_frames`) without committing
    pub fn read_window(&mut self, max_frames: usize) -> (&[u8], &[u8]) {
        let frames = max_frames.min(self.readable_frames());
        let r = self.header().read_offset.load(Ordering::Relaxed);
        let (first, second) = self.split_window(r, frames as u32);
        (&*first, &*second)
    }

    /// Consume `frames` frames observed through [`read_window`](Self::read_window)
    pub fn commit_read(&mut self, frames: usize) {
        let header = self.header();
        let r = header.read_offset.load(Ordering::Relaxed);
        let (sec, nsec) = now_ts();
        header.read_ts_sec.store(sec, Ordering::Relaxed);
        header.read_ts_nsec.store(nsec, Ordering::Relaxed);
        header
            .read_offset
            .store(r.wrapping_add(frames as u32), Ordering::Release);
    }

    pub fn set_callback_pending(&self, pending: bool) {
        self.header()
            .callback_pending
            .store(pending as u8, Ordering::Release);
    }

    pub fn callback_pending(&self) -> bool {
        self.header().callback_pending.load(Ordering::Acquire) != 0
    }

    /// Last producer commit time, seconds/nanoseconds
    pub fn write_ts(&self) -> (u32, u32) {
        let h = self.header();
        (
            h.write_ts_sec.load(Ordering::Relaxed),
            h.write_ts_nsec.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for AudioShm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioShm")
            .field("capacity_frames", &self.capacity_frames)
            .field("frame_bytes", &self.frame_bytes)
            .field("readable", &self.readable_frames())
            .finish()
    }
}
