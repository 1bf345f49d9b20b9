// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// System V message queue transport. Queues are keyed by an FNV-1a hash
// of the artifact name so both sides derive the same key without a
// filesystem rendezvous. SysV queues have no timed receive; waits are
// IPC_NOWAIT polls with adaptive backoff.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::sys;
use crate::transport::adaptive_yield;

const MTYPE_BYTES: usize = std::mem::size_of::<libc::c_long>();
const FRAME_MTYPE: libc::c_long = 1;

pub(crate) struct SmqChannel {
    id: i32,
    owner: bool,
    max_msg_size: usize,
    /// mtype-prefixed scratch for msgrcv.
    scratch: Vec<u8>,
}

fn key_of(name: &str) -> libc::key_t {
    let h = (sys::fnv1a_64(name.as_bytes()) & 0x7fff_ffff) as i32;
    // ftok never yields 0; neither do we.
    if h == 0 {
        1
    } else {
        h as libc::key_t
    }
}

impl SmqChannel {
    pub(crate) fn create(name: &str, max_msg_size: usize) -> Result<SmqChannel> {
        let key = key_of(name);
        let id = unsafe { libc::msgget(key, libc::IPC_CREAT | libc::IPC_EXCL | 0o600) };
        if id == -1 {
            let e = Error::last_os();
            log::error!("couldn't create sysv mq for {name}: {e}");
            return Err(e);
        }

        // Default msg_qbytes may undershoot the negotiated frame size;
        // raising it needs privilege and is best-effort.
        unsafe {
            let mut ds: libc::msqid_ds = std::mem::zeroed();
            if libc::msgctl(id, libc::IPC_STAT, &mut ds) == 0
                && (ds.msg_qbytes as usize) < max_msg_size
            {
                ds.msg_qbytes = max_msg_size as _;
                if libc::msgctl(id, libc::IPC_SET, &mut ds) != 0 {
                    log::info!(
                        "couldn't raise msg_qbytes for {name}: {}",
                        std::io::Error::last_os_error()
                    );
                }
            }
        }

        Ok(SmqChannel {
            id,
            owner: true,
            max_msg_size,
            scratch: vec![0u8; MTYPE_BYTES + max_msg_size],
        })
    }

    pub(crate) fn open(name: &str, max_msg_size: usize) -> Result<SmqChannel> {
        let key = key_of(name);
        let id = unsafe { libc::msgget(key, 0o600) };
        if id == -1 {
            let e = Error::last_os();
            log::error!("couldn't open sysv mq for {name}: {e}");
            return Err(e);
        }
        Ok(SmqChannel {
            id,
            owner: false,
            max_msg_size,
            scratch: vec![0u8; MTYPE_BYTES + max_msg_size],
        })
    }

    pub(crate) fn send(&mut self, data: &[u8]) -> Result<usize> {
        let mut frame = Vec::with_capacity(MTYPE_BYTES + data.len());
        frame.extend_from_slice(&FRAME_MTYPE.to_ne_bytes());
        frame.extend_from_slice(data);

        loop {
            let res = unsafe {
                libc::msgsnd(
                    self.id,
                    frame.as_ptr().cast(),
                    data.len(),
                    libc::IPC_NOWAIT,
                )
            };
            if res == 0 {
                return Ok(data.len());
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) => return Err(Error::Again),
                Some(libc::EIDRM) | Some(libc::EINVAL) => return Err(Error::ShutDown),
                _ => return Err(Error::last_os()),
            }
        }
    }

    pub(crate) fn sendv(&mut self, iov: &[&[u8]], total: usize) -> Result<usize> {
        let mut frame = Vec::with_capacity(total);
        for seg in iov {
            frame.extend_from_slice(seg);
        }
        self.send(&frame)
    }

    pub(crate) fn recv(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        let deadline = if timeout_ms < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
        };
        let mut k = 0u32;
        loop {
            let res = unsafe {
                libc::msgrcv(
                    self.id,
                    self.scratch.as_mut_ptr().cast(),
                    self.max_msg_size,
                    0,
                    libc::IPC_NOWAIT,
                )
            };
            if res >= 0 {
                let n = res as usize;
                if n > buf.len() {
                    return Err(Error::NoBufs);
                }
                buf[..n].copy_from_slice(&self.scratch[MTYPE_BYTES..MTYPE_BYTES + n]);
                return Ok(n);
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ENOMSG) => {
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            return Err(Error::TimedOut);
                        }
                    }
                    adaptive_yield(&mut k);
                }
                Some(libc::E2BIG) => return Err(Error::NoBufs),
                Some(libc::EIDRM) | Some(libc::EINVAL) => return Err(Error::ShutDown),
                _ => return Err(Error::last_os()),
            }
        }
    }

    pub(crate) fn q_len(&self) -> Result<u32> {
        let mut ds: libc::msqid_ds = unsafe { std::mem::zeroed() };
        if unsafe { libc::msgctl(self.id, libc::IPC_STAT, &mut ds) } == -1 {
            return Err(Error::last_os());
        }
        Ok(ds.msg_qnum as u32)
    }
}

impl Drop for SmqChannel {
    fn drop(&mut self) {
        if self.owner {
            unsafe { libc::msgctl(self.id, libc::IPC_RMID, std::ptr::null_mut()) };
        }
    }
}
