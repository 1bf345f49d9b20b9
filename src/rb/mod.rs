// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// Single-producer/single-consumer shared-memory ring buffer.
//
// Two backing files under /dev/shm (falling back to /var/run): a header
// file holding the shared control block and a data file mapped twice at
// back-to-back virtual addresses, so a chunk is always a flat slice no
// matter where it starts.
//
// A chunk is one 32-bit length word (payload bytes) followed by the
// payload padded to a word boundary. A zero length word is the wrap
// marker: the reader skips to offset 0 and re-reads. Cursors are
// free-running u32 word offsets interpreted modulo the capacity;
// `write_pt - read_pt` in wrapping arithmetic never exceeds capacity.

mod sync;

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::sys;

pub(crate) use sync::SharedSync;

/// Fixed path capacity in the shared header, independent of the
/// platform's own PATH_MAX so the layout never varies.
const HDR_PATH_MAX: usize = 4096;

/// Ring creation/attach flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags(u32);

impl Flags {
    /// Create the backing files and initialise header, lock, semaphore.
    pub const CREATE: Flags = Flags(1);
    /// Use process-shared primitives; without it the lock and semaphore
    /// are no-ops and the ring is only safe within one process.
    pub const SHARED_PROCESS: Flags = Flags(2);

    pub const fn empty() -> Flags {
        Flags(0)
    }

    pub const fn contains(self, other: Flags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for Flags {
    type Output = Flags;
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Shared control block at the start of the header file.
#[repr(C)]
struct Shared {
    write_pt: AtomicU32,
    read_pt: AtomicU32,
    word_size: u32,
    count: AtomicU32,
    ref_count: AtomicI32,
    hdr_path: [u8; HDR_PATH_MAX],
    data_path: [u8; HDR_PATH_MAX],
    sync: SharedSync,
}

/// Words needed to hold `bytes` payload bytes.
#[inline]
const fn payload_words(bytes: usize) -> usize {
    bytes.div_ceil(4)
}

/// Outstanding `chunk_alloc` reservation.
struct Reserved {
    /// Cursor value of the reservation's length word (skip applied).
    base_pt: u32,
    /// Words reserved for the payload.
    payload_words: u32,
}

pub struct RingBuffer {
    name: String,
    flags: Flags,
    shared: *mut Shared,
    hdr_bytes: usize,
    data: *mut u8,
    data_bytes: usize,
    sync: sync::RbSync,
    reserved: Option<Reserved>,
    /// Words (length word included) to step over on the next reclaim.
    peeked: Option<u32>,
}

unsafe impl Send for RingBuffer {}

impl RingBuffer {
    /// Create a ring of at least `size` data bytes (rounded up to a
    /// whole number of pages). Fails with `Exists` if either backing
    /// file is already present.
    pub fn create(name: &str, size: usize, flags: Flags) -> Result<RingBuffer> {
        if name.is_empty() || size == 0 {
            return Err(Error::Invalid);
        }
        let flags = flags | Flags::CREATE;
        let data_bytes = sys::round_to_page(size);
        let word_size = (data_bytes / 4) as u32;
        let hdr_bytes = sys::round_to_page(std::mem::size_of::<Shared>());

        let create = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;
        let (hdr_fd, hdr_path) = sys::mmap_file_open(&format!("{name}-header"), hdr_bytes, create)?;
        let (data_fd, data_path) =
            match sys::mmap_file_open(&format!("{name}-data"), data_bytes, create) {
                Ok(v) => v,
                Err(e) => {
                    unsafe { libc::close(hdr_fd) };
                    sys::unlink_path(&hdr_path);
                    return Err(e);
                }
            };

        if hdr_path.len() >= HDR_PATH_MAX || data_path.len() >= HDR_PATH_MAX {
            unsafe {
                libc::close(hdr_fd);
                libc::close(data_fd);
            }
            sys::unlink_path(&hdr_path);
            sys::unlink_path(&data_path);
            return Err(Error::Invalid);
        }

        let shared = sys::shared_mmap(hdr_fd, hdr_bytes)? as *mut Shared;
        let data = match sys::circular_mmap(data_fd, data_bytes) {
            Ok(p) => p,
            Err(e) => {
                unsafe { libc::munmap(shared as *mut libc::c_void, hdr_bytes) };
                sys::unlink_path(&hdr_path);
                sys::unlink_path(&data_path);
                return Err(e);
            }
        };

        // Fresh ftruncate'd file: everything is already zero.
        unsafe {
            std::ptr::addr_of_mut!((*shared).word_size).write(word_size);
            copy_path(std::ptr::addr_of_mut!((*shared).hdr_path), &hdr_path);
            copy_path(std::ptr::addr_of_mut!((*shared).data_path), &data_path);
        }

        let sync = sync::RbSync::new(
            unsafe { std::ptr::addr_of_mut!((*shared).sync) },
            &hdr_path,
            word_size,
            flags,
        )?;

        let rb = RingBuffer {
            name: name.to_string(),
            flags,
            shared,
            hdr_bytes,
            data,
            data_bytes,
            sync,
            reserved: None,
            peeked: None,
        };
        rb.sync.lock()?;
        rb.hdr().ref_count.fetch_add(1, Ordering::AcqRel);
        rb.sync.unlock()?;
        log::debug!("created ring {name}: {data_bytes} bytes at {data_path}");
        Ok(rb)
    }

    /// Attach to an existing ring created by a peer process.
    pub fn open(name: &str, flags: Flags) -> Result<RingBuffer> {
        if name.is_empty() {
            return Err(Error::Invalid);
        }
        let hdr_bytes = sys::round_to_page(std::mem::size_of::<Shared>());
        let (hdr_fd, hdr_path) =
            sys::mmap_file_open(&format!("{name}-header"), hdr_bytes, libc::O_RDWR)?;
        let shared = sys::shared_mmap(hdr_fd, hdr_bytes)? as *mut Shared;

        let word_size = unsafe { std::ptr::addr_of!((*shared).word_size).read() };
        if word_size == 0 {
            unsafe { libc::munmap(shared as *mut libc::c_void, hdr_bytes) };
            return Err(Error::Invalid);
        }
        let data_bytes = word_size as usize * 4;
        let data_path = unsafe { read_path(std::ptr::addr_of!((*shared).data_path)) };

        let (data_fd, _) = sys::mmap_file_open(&data_path, data_bytes, libc::O_RDWR)?;
        let data = match sys::circular_mmap(data_fd, data_bytes) {
            Ok(p) => p,
            Err(e) => {
                unsafe { libc::munmap(shared as *mut libc::c_void, hdr_bytes) };
                return Err(e);
            }
        };

        let sync = sync::RbSync::new(
            unsafe { std::ptr::addr_of_mut!((*shared).sync) },
            &hdr_path,
            word_size,
            flags,
        )?;

        let rb = RingBuffer {
            name: name.to_string(),
            flags,
            shared,
            hdr_bytes,
            data,
            data_bytes,
            sync,
            reserved: None,
            peeked: None,
        };
        rb.sync.lock()?;
        rb.hdr().ref_count.fetch_add(1, Ordering::AcqRel);
        rb.sync.unlock()?;
        Ok(rb)
    }

    fn hdr(&self) -> &Shared {
        unsafe { &*self.shared }
    }

    #[inline]
    fn word_size(&self) -> u32 {
        self.hdr().word_size
    }

    #[inline]
    unsafe fn word_ptr(&self, idx: u32) -> *mut u32 {
        (self.data as *mut u32).add(idx as usize)
    }

    /// Capacity of the data region in bytes.
    pub fn size(&self) -> usize {
        self.data_bytes
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free space in bytes.
    pub fn space_free(&self) -> usize {
        let h = self.hdr();
        let used = h
            .write_pt
            .load(Ordering::Acquire)
            .wrapping_sub(h.read_pt.load(Ordering::Acquire));
        (self.word_size() - used) as usize * 4
    }

    /// Occupied space in bytes (committed chunks plus wrap padding).
    pub fn space_used(&self) -> usize {
        self.data_bytes - self.space_free()
    }

    /// Committed chunks not yet reclaimed.
    pub fn chunks_used(&self) -> u32 {
        self.hdr().count.load(Ordering::Acquire)
    }

    /// Producers plus consumers currently attached.
    pub fn refcount(&self) -> i32 {
        self.hdr().ref_count.load(Ordering::Acquire)
    }

    /// Write cursor position in bytes from the start of the data region.
    pub fn write_offset(&self) -> usize {
        (self.hdr().write_pt.load(Ordering::Acquire) % self.word_size()) as usize * 4
    }

    /// Read cursor position in bytes from the start of the data region.
    pub fn read_offset(&self) -> usize {
        (self.hdr().read_pt.load(Ordering::Acquire) % self.word_size()) as usize * 4
    }

    /// Reserve a contiguous writable slice of `len` bytes.
    ///
    /// Never blocks: fails with `NoSpace` when no contiguous run of
    /// `len` plus the length word exists. The reservation is published
    /// by [`chunk_commit`]; dropping it without committing only wastes
    /// any wrap padding written on its behalf.
    ///
    /// [`chunk_commit`]: RingBuffer::chunk_commit
    pub fn chunk_alloc(&mut self, len: usize) -> Result<&mut [u8]> {
        if len == 0 {
            return Err(Error::Invalid);
        }
        if self.reserved.is_some() {
            return Err(Error::Invalid);
        }
        let words = self.word_size();
        let needed = 1 + payload_words(len) as u32;
        if needed > words {
            return Err(Error::NoSpace);
        }

        self.sync.lock()?;
        let h = self.hdr();
        let w = h.write_pt.load(Ordering::Acquire);
        let r = h.read_pt.load(Ordering::Acquire);
        let free = words - w.wrapping_sub(r);
        let off = w % words;

        // A chunk never straddles the logical end: pad with a wrap
        // marker and restart at offset 0 when the tail is too short.
        let skip = if off + needed <= words { 0 } else { words - off };
        if skip + needed > free {
            self.sync.unlock()?;
            return Err(Error::NoSpace);
        }
        if skip > 0 {
            unsafe { self.word_ptr(off).write(0) };
        }
        self.sync.unlock()?;

        let base_pt = w.wrapping_add(skip);
        self.reserved = Some(Reserved {
            base_pt,
            payload_words: needed - 1,
        });
        let data_off = ((base_pt % words) as usize + 1) * 4;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.data.add(data_off), len) })
    }

    /// Publish the chunk reserved by [`chunk_alloc`] with its final
    /// payload length, bump the chunk count and post the semaphore.
    ///
    /// [`chunk_alloc`]: RingBuffer::chunk_alloc
    pub fn chunk_commit(&mut self, len: usize) -> Result<()> {
        let res = self.reserved.take().ok_or(Error::Invalid)?;
        if len == 0 || payload_words(len) as u32 > res.payload_words {
            return Err(Error::Invalid);
        }
        let words = self.word_size();

        self.sync.lock()?;
        let h = self.hdr();
        unsafe { self.word_ptr(res.base_pt % words).write(len as u32) };
        let next = res.base_pt.wrapping_add(1 + payload_words(len) as u32);
        h.write_pt.store(next, Ordering::Release);
        h.count.fetch_add(1, Ordering::AcqRel);
        self.sync.unlock()?;

        self.sync.post()
    }

    /// Convenience: alloc + copy + commit in one call.
    pub fn chunk_write(&mut self, data: &[u8]) -> Result<usize> {
        let dst = self.chunk_alloc(data.len())?;
        dst.copy_from_slice(data);
        self.chunk_commit(data.len())?;
        Ok(data.len())
    }

    /// Borrow the next chunk without advancing the read cursor.
    ///
    /// Blocks on the embedded semaphore for up to `timeout_ms`
    /// milliseconds (negative = forever, zero = poll). Fails with
    /// `TimedOut` on expiry, or `ShutDown` when the peer has detached
    /// and nothing is left to read.
    pub fn chunk_peek(&mut self, timeout_ms: i32) -> Result<&[u8]> {
        if self.peeked.is_none() {
            match self.sync.timed_wait(timeout_ms) {
                Ok(()) => {}
                Err(Error::TimedOut) => return Err(self.starved()),
                Err(e) => return Err(e),
            }
            if self.chunks_used() == 0 {
                // Either a non-shared ring with nothing queued, or the
                // count was consumed by an earlier aborted read.
                return Err(self.starved());
            }
        }

        let words = self.word_size();
        let h = self.hdr();
        let mut r = h.read_pt.load(Ordering::Acquire);
        let mut off = r % words;
        let mut len = unsafe { self.word_ptr(off).read() };
        if len == 0 {
            // Wrap marker: step to the next capacity boundary.
            self.sync.lock()?;
            r = r.wrapping_add(words - off);
            h.read_pt.store(r, Ordering::Release);
            self.sync.unlock()?;
            off = 0;
            len = unsafe { self.word_ptr(0).read() };
        }
        if len == 0 || payload_words(len as usize) as u32 >= words {
            return Err(Error::Invalid);
        }

        self.peeked = Some(1 + payload_words(len as usize) as u32);
        let data_off = (off as usize + 1) * 4;
        Ok(unsafe { std::slice::from_raw_parts(self.data.add(data_off), len as usize) })
    }

    /// Step past the chunk returned by the last [`chunk_peek`].
    ///
    /// [`chunk_peek`]: RingBuffer::chunk_peek
    pub fn chunk_reclaim(&mut self) -> Result<()> {
        let words = self.peeked.take().ok_or(Error::Invalid)?;
        self.sync.lock()?;
        let h = self.hdr();
        let r = h.read_pt.load(Ordering::Acquire);
        h.read_pt.store(r.wrapping_add(words), Ordering::Release);
        h.count.fetch_sub(1, Ordering::AcqRel);
        self.sync.unlock()?;
        Ok(())
    }

    /// Copy the next chunk into `buf` and reclaim it.
    ///
    /// Fails with `NoBufs` (and leaves the chunk in place) when `buf`
    /// is too small for the chunk.
    pub fn chunk_read(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        let chunk = self.chunk_peek(timeout_ms)?;
        let len = chunk.len();
        if len > buf.len() {
            // Hand the consumed semaphore count back so the chunk can
            // be retried with a larger buffer.
            self.peeked = None;
            self.sync.post()?;
            return Err(Error::NoBufs);
        }
        buf[..len].copy_from_slice(chunk);
        self.chunk_reclaim()?;
        Ok(len)
    }

    /// `TimedOut`, or `ShutDown` when no peer remains attached.
    fn starved(&self) -> Error {
        if self.flags.contains(Flags::SHARED_PROCESS) && self.refcount() < 2 {
            Error::ShutDown
        } else {
            Error::TimedOut
        }
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        let last = {
            let _ = self.sync.lock();
            let left = self.hdr().ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
            let _ = self.sync.unlock();
            left <= 0
        };
        let (hdr_path, data_path) = unsafe {
            (
                read_path(std::ptr::addr_of!((*self.shared).hdr_path)),
                read_path(std::ptr::addr_of!((*self.shared).data_path)),
            )
        };
        if last {
            self.sync.destroy();
        }
        unsafe {
            libc::munmap(self.data as *mut libc::c_void, self.data_bytes << 1);
            libc::munmap(self.shared as *mut libc::c_void, self.hdr_bytes);
        }
        if last {
            sys::unlink_path(&hdr_path);
            sys::unlink_path(&data_path);
            log::debug!("ring {} torn down", self.name);
        }
    }
}

unsafe fn copy_path(dst: *mut [u8; HDR_PATH_MAX], src: &str) {
    let dst = dst as *mut u8;
    std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
    // The header file starts zeroed, so the terminator is in place.
}

unsafe fn read_path(src: *const [u8; HDR_PATH_MAX]) -> String {
    let bytes = &*src;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(0);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_word_rounding() {
        assert_eq!(payload_words(1), 1);
        assert_eq!(payload_words(4), 1);
        assert_eq!(payload_words(5), 2);
        assert_eq!(payload_words(300), 75);
    }

    #[test]
    fn flags_compose() {
        let f = Flags::CREATE | Flags::SHARED_PROCESS;
        assert!(f.contains(Flags::CREATE));
        assert!(f.contains(Flags::SHARED_PROCESS));
        assert!(!Flags::empty().contains(Flags::CREATE));
    }
}
