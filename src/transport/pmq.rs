// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// POSIX message queue transport (Linux). One queue per half-channel;
// the kernel's msgsize_max usually caps frame sizes well below the shm
// transport's, so creation can fail for large negotiations unless the
// system limits are raised.

use std::ffi::CString;

use crate::error::{Error, Result};
use crate::sys;

const MQ_DEPTH: i64 = 10;

pub(crate) struct PmqChannel {
    mq: libc::mqd_t,
    name: CString,
    owner: bool,
    max_msg_size: usize,
}

impl PmqChannel {
    fn mq_name(name: &str) -> Result<CString> {
        CString::new(format!("/{name}")).map_err(|_| Error::Invalid)
    }

    pub(crate) fn create(name: &str, max_msg_size: usize) -> Result<PmqChannel> {
        let c_name = Self::mq_name(name)?;
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_flags = 0;
        attr.mq_maxmsg = MQ_DEPTH;
        attr.mq_msgsize = max_msg_size as i64;
        attr.mq_curmsgs = 0;

        let mq = unsafe {
            libc::mq_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                &mut attr as *mut libc::mq_attr,
            )
        };
        if mq == -1 {
            let e = Error::last_os();
            log::error!("couldn't create mq /{name}: {e}");
            return Err(e);
        }
        Ok(PmqChannel {
            mq,
            name: c_name,
            owner: true,
            max_msg_size,
        })
    }

    pub(crate) fn open(name: &str, max_msg_size: usize) -> Result<PmqChannel> {
        let c_name = Self::mq_name(name)?;
        let mq = unsafe { libc::mq_open(c_name.as_ptr(), libc::O_RDWR) };
        if mq == -1 {
            return Err(Error::last_os());
        }
        Ok(PmqChannel {
            mq,
            name: c_name,
            owner: false,
            max_msg_size,
        })
    }

    pub(crate) fn send(&mut self, data: &[u8]) -> Result<usize> {
        // Bounded wait so a stuffed queue reads as flow control rather
        // than wedging the sender.
        let ts = sys::abs_timeout(0);
        let res = unsafe {
            libc::mq_timedsend(self.mq, data.as_ptr().cast(), data.len(), 0, &ts)
        };
        if res == -1 {
            return match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::ETIMEDOUT) | Some(libc::EAGAIN) => Err(Error::Again),
                Some(libc::EMSGSIZE) => Err(Error::NoSpace),
                Some(libc::EINTR) => Err(Error::Again),
                _ => Err(Error::last_os()),
            };
        }
        Ok(data.len())
    }

    pub(crate) fn sendv(&mut self, iov: &[&[u8]], total: usize) -> Result<usize> {
        let mut frame = Vec::with_capacity(total);
        for seg in iov {
            frame.extend_from_slice(seg);
        }
        self.send(&frame)
    }

    pub(crate) fn recv(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        // mq_receive insists the buffer covers mq_msgsize.
        let mut scratch;
        let (dst, dst_len) = if buf.len() >= self.max_msg_size {
            (buf.as_mut_ptr(), buf.len())
        } else {
            scratch = vec![0u8; self.max_msg_size];
            (scratch.as_mut_ptr(), self.max_msg_size)
        };

        loop {
            let res = if timeout_ms < 0 {
                unsafe { libc::mq_receive(self.mq, dst.cast(), dst_len, std::ptr::null_mut()) }
            } else {
                let ts = sys::abs_timeout(timeout_ms);
                unsafe {
                    libc::mq_timedreceive(self.mq, dst.cast(), dst_len, std::ptr::null_mut(), &ts)
                }
            };
            if res >= 0 {
                let n = res as usize;
                if dst != buf.as_mut_ptr() {
                    if n > buf.len() {
                        return Err(Error::NoBufs);
                    }
                    let src = unsafe { std::slice::from_raw_parts(dst, n) };
                    buf[..n].copy_from_slice(src);
                }
                return Ok(n);
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ETIMEDOUT) => return Err(Error::TimedOut),
                _ => return Err(Error::last_os()),
            }
        }
    }

    pub(crate) fn q_len(&self) -> Result<u32> {
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        if unsafe { libc::mq_getattr(self.mq, &mut attr) } == -1 {
            return Err(Error::last_os());
        }
        Ok(attr.mq_curmsgs as u32)
    }
}

impl Drop for PmqChannel {
    fn drop(&mut self) {
        unsafe { libc::mq_close(self.mq) };
        if self.owner {
            unsafe { libc::mq_unlink(self.name.as_ptr()) };
        }
    }
}
