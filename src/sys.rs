// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// Low-level file and mapping helpers shared by the ring buffer and the
// stream endpoints: backing-file creation with the /dev/shm fallback,
// the circular double-mapping, and fd flag twiddling.

use std::ffi::CString;
use std::ptr;

use crate::error::{Error, Result};

/// Primary directory for ring buffer backing files.
pub const SHM_DIR: &str = "/dev/shm";
/// Fallback when the primary is unavailable (non-Linux, odd mounts).
pub const RUN_DIR: &str = "/var/run";

/// Some arches require fixed shared mappings to be 16k-aligned; making
/// the reservation itself MAP_SHARED yields a suitably aligned address.
const FORCE_SHM_ALIGN: bool = cfg!(any(target_arch = "sparc64", target_arch = "powerpc64"));

/// FNV-1a 64-bit hash, used to derive System V IPC keys from names.
pub(crate) fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in data {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub(crate) fn page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n <= 0 {
        4096
    } else {
        n as usize
    }
}

pub(crate) fn round_to_page(bytes: usize) -> usize {
    let p = page_size();
    bytes.div_ceil(p) * p
}

fn open_at(path: &str, flags: i32) -> Result<i32> {
    let c = CString::new(path).map_err(|_| Error::Invalid)?;
    let fd = unsafe { libc::open(c.as_ptr(), flags, 0o600 as libc::c_uint) };
    if fd < 0 {
        return Err(Error::last_os());
    }
    Ok(fd)
}

/// Open (or create) a mapping backing file of `bytes` bytes.
///
/// Relative names land under [`SHM_DIR`], falling back to [`RUN_DIR`]
/// when that fails; absolute names are used as-is. Returns the fd and
/// the path actually used so it can be stored in the shared header for
/// later attachers.
pub(crate) fn mmap_file_open(file: &str, bytes: usize, flags: i32) -> Result<(i32, String)> {
    let absolute = file.starts_with('/');
    let (fd, path) = if absolute {
        (open_at(file, flags)?, file.to_string())
    } else {
        let primary = format!("{SHM_DIR}/{file}");
        match open_at(&primary, flags) {
            Ok(fd) => (fd, primary),
            Err(e) => {
                if matches!(e, Error::Exists) {
                    return Err(e);
                }
                log::error!("couldn't open file {primary}: {e}");
                let fallback = format!("{RUN_DIR}/{file}");
                match open_at(&fallback, flags) {
                    Ok(fd) => (fd, fallback),
                    Err(e2) => {
                        log::error!("couldn't open file {fallback}: {e2}");
                        return Err(e2);
                    }
                }
            }
        }
    };

    if unsafe { libc::ftruncate(fd, bytes as libc::off_t) } == -1 {
        let e = Error::last_os();
        log::error!("couldn't truncate file {path}: {e}");
        unsafe { libc::close(fd) };
        unlink_path(&path);
        return Err(e);
    }
    Ok((fd, path))
}

/// Map a plain shared region of `bytes` bytes over `fd`.
/// Closes `fd` in all cases.
pub(crate) fn shared_mmap(fd: i32, bytes: usize) -> Result<*mut u8> {
    let mem = unsafe {
        libc::mmap(
            ptr::null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    unsafe { libc::close(fd) };
    if mem == libc::MAP_FAILED {
        return Err(Error::last_os());
    }
    Ok(mem as *mut u8)
}

/// Map `fd` twice at back-to-back virtual addresses so that any offset
/// in `[0, bytes)` can be read `bytes` further without wrap handling.
///
/// Reserves `2*bytes` of address space with an anonymous PROT_NONE
/// mapping, then overlays two MAP_FIXED shared mappings of the file.
/// Closes `fd` in all cases.
pub(crate) fn circular_mmap(fd: i32, bytes: usize) -> Result<*mut u8> {
    let reserve_flags = libc::MAP_ANONYMOUS
        | if FORCE_SHM_ALIGN {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };

    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            bytes << 1,
            libc::PROT_NONE,
            reserve_flags,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        unsafe { libc::close(fd) };
        return Err(Error::last_os());
    }

    let fail = |e: Error| -> Error {
        unsafe {
            libc::munmap(base, bytes << 1);
            libc::close(fd);
        }
        e
    };

    let first = unsafe {
        libc::mmap(
            base,
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_FIXED | libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if first != base {
        return Err(fail(Error::last_os()));
    }

    let second_at = unsafe { (base as *mut u8).add(bytes) };
    let second = unsafe {
        libc::mmap(
            second_at as *mut libc::c_void,
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_FIXED | libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if second != second_at as *mut libc::c_void {
        return Err(fail(Error::last_os()));
    }

    unsafe { libc::close(fd) };
    Ok(base as *mut u8)
}

pub(crate) fn unlink_path(path: &str) {
    if let Ok(c) = CString::new(path) {
        unsafe { libc::unlink(c.as_ptr()) };
    }
}

/// Mark `fd` close-on-exec and non-blocking.
pub(crate) fn fd_nonblock_cloexec(fd: i32) -> Result<()> {
    let mut old = unsafe { libc::fcntl(fd, libc::F_GETFD, 0) };
    if old < 0 {
        old = 0;
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, old | libc::FD_CLOEXEC) } == -1 {
        let e = Error::last_os();
        log::error!("could not set close-on-exec on fd:{fd}: {e}");
        return Err(e);
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) } == -1 {
        let e = Error::last_os();
        log::error!("could not set non-blocking on fd:{fd}: {e}");
        return Err(e);
    }
    Ok(())
}

/// Absolute CLOCK_REALTIME deadline `ms` milliseconds from now.
pub(crate) fn abs_timeout(ms: i32) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
    let ns = ts.tv_nsec as u64 + (ms as u64 % 1000) * 1_000_000;
    ts.tv_sec += (ms as i64 / 1000) as libc::time_t + (ns / 1_000_000_000) as libc::time_t;
    ts.tv_nsec = (ns % 1_000_000_000) as _;
    ts
}
