// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// One-way half-channels. A connection owns three (request, response,
// event), each bound to one of four transports behind the same
// contract: send/sendv, timed recv, optional zero-copy peek/reclaim,
// queue-depth introspection.

mod shm;

#[cfg(target_os = "linux")]
mod pmq;
mod smq;

use crate::error::{Error, Result};
use crate::sock;

pub(crate) use shm::ShmChannel;

#[cfg(target_os = "linux")]
pub(crate) use pmq::PmqChannel;
pub(crate) use smq::SmqChannel;

/// Transport carrying a connection's half-channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcKind {
    /// The setup stream doubles as the data channel.
    Socket,
    /// Shared-memory ring buffer per half-channel.
    Shm,
    /// POSIX message queue per half-channel.
    PosixMq,
    /// System V message queue per half-channel.
    SysvMq,
}

impl IpcKind {
    pub(crate) fn as_u32(self) -> u32 {
        match self {
            IpcKind::Socket => 0,
            IpcKind::Shm => 1,
            IpcKind::PosixMq => 2,
            IpcKind::SysvMq => 3,
        }
    }

    pub(crate) fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(IpcKind::Socket),
            1 => Ok(IpcKind::Shm),
            2 => Ok(IpcKind::PosixMq),
            3 => Ok(IpcKind::SysvMq),
            _ => Err(Error::Invalid),
        }
    }

    /// Whether readiness must be signalled over the paired stream
    /// because the transport is not (portably) pollable.
    pub(crate) fn needs_sock_for_poll(self) -> bool {
        !matches!(self, IpcKind::Socket)
    }
}

/// Adaptive backoff for lock-free retry loops:
/// busy spin, then CPU pause, then yield, then 1 ms sleeps.
#[inline]
pub(crate) fn adaptive_yield(k: &mut u32) {
    if *k < 4 {
        // busy spin
    } else if *k < 16 {
        std::hint::spin_loop();
    } else if *k < 32 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(std::time::Duration::from_millis(1));
        return;
    }
    *k += 1;
}

/// Name of a per-connection transport artifact; both sides derive it
/// from the service name and the handle issued in the handshake.
pub(crate) fn artifact_name(service: &str, half: &str, token: u64) -> String {
    format!("{service}-{half}-{token:x}")
}

/// A single one-way byte channel with its own ordering and
/// flow-control domain.
pub(crate) struct OneWay {
    pub(crate) max_msg_size: usize,
    ch: Channel,
}

enum Channel {
    /// Borrowed stream fd; lifetime owned by the connection.
    Socket(i32),
    Shm(ShmChannel),
    #[cfg(target_os = "linux")]
    PosixMq(PmqChannel),
    SysvMq(SmqChannel),
}

impl OneWay {
    pub(crate) fn socket(fd: i32, max_msg_size: usize) -> OneWay {
        OneWay {
            max_msg_size,
            ch: Channel::Socket(fd),
        }
    }

    /// Server side: create the artifact for one half-channel.
    pub(crate) fn server_create(
        kind: IpcKind,
        service: &str,
        half: &str,
        token: u64,
        max_msg_size: usize,
    ) -> Result<OneWay> {
        let name = artifact_name(service, half, token);
        let ch = match kind {
            IpcKind::Socket => return Err(Error::Invalid),
            IpcKind::Shm => Channel::Shm(ShmChannel::create(&name, max_msg_size)?),
            #[cfg(target_os = "linux")]
            IpcKind::PosixMq => Channel::PosixMq(PmqChannel::create(&name, max_msg_size)?),
            #[cfg(not(target_os = "linux"))]
            IpcKind::PosixMq => return Err(Error::NotSupported),
            IpcKind::SysvMq => Channel::SysvMq(SmqChannel::create(&name, max_msg_size)?),
        };
        Ok(OneWay { max_msg_size, ch })
    }

    /// Client side: attach to an artifact the server created.
    pub(crate) fn client_attach(
        kind: IpcKind,
        service: &str,
        half: &str,
        token: u64,
        max_msg_size: usize,
    ) -> Result<OneWay> {
        let name = artifact_name(service, half, token);
        let ch = match kind {
            IpcKind::Socket => return Err(Error::Invalid),
            IpcKind::Shm => Channel::Shm(ShmChannel::open(&name, max_msg_size)?),
            #[cfg(target_os = "linux")]
            IpcKind::PosixMq => Channel::PosixMq(PmqChannel::open(&name, max_msg_size)?),
            #[cfg(not(target_os = "linux"))]
            IpcKind::PosixMq => return Err(Error::NotSupported),
            IpcKind::SysvMq => Channel::SysvMq(SmqChannel::open(&name, max_msg_size)?),
        };
        Ok(OneWay { max_msg_size, ch })
    }

    /// Enqueue one frame. A full ring or queue surfaces as `Again` so
    /// flow-controlled producers can retry.
    pub(crate) fn send(&mut self, data: &[u8]) -> Result<usize> {
        if data.len() > self.max_msg_size {
            return Err(Error::NoSpace);
        }
        match &mut self.ch {
            Channel::Socket(fd) => sock::send_all(*fd, data),
            Channel::Shm(c) => c.send(data),
            #[cfg(target_os = "linux")]
            Channel::PosixMq(c) => c.send(data),
            Channel::SysvMq(c) => c.send(data),
        }
    }

    /// Gathering send; the segments form one frame.
    pub(crate) fn sendv(&mut self, iov: &[&[u8]]) -> Result<usize> {
        let total: usize = iov.iter().map(|s| s.len()).sum();
        if total > self.max_msg_size {
            return Err(Error::NoSpace);
        }
        match &mut self.ch {
            Channel::Socket(fd) => sock::sendv_all(*fd, iov),
            Channel::Shm(c) => c.sendv(iov, total),
            #[cfg(target_os = "linux")]
            Channel::PosixMq(c) => c.sendv(iov, total),
            Channel::SysvMq(c) => c.sendv(iov, total),
        }
    }

    /// Dequeue one frame into `buf`, waiting up to `timeout_ms`.
    pub(crate) fn recv(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        match &mut self.ch {
            Channel::Socket(fd) => sock::recv_frame(*fd, buf, timeout_ms),
            Channel::Shm(c) => c.recv(buf, timeout_ms),
            #[cfg(target_os = "linux")]
            Channel::PosixMq(c) => c.recv(buf, timeout_ms),
            Channel::SysvMq(c) => c.recv(buf, timeout_ms),
        }
    }

    /// Zero-copy borrow of the next frame (ring transport only).
    pub(crate) fn peek(&mut self, timeout_ms: i32) -> Result<&[u8]> {
        match &mut self.ch {
            Channel::Shm(c) => c.peek(timeout_ms),
            _ => Err(Error::NotSupported),
        }
    }

    /// Step past the last peeked frame (ring transport only).
    pub(crate) fn reclaim(&mut self) -> Result<()> {
        match &mut self.ch {
            Channel::Shm(c) => c.reclaim(),
            _ => Err(Error::NotSupported),
        }
    }

    pub(crate) fn has_peek(&self) -> bool {
        matches!(self.ch, Channel::Shm(_))
    }

    /// Frames currently queued, where the transport can tell.
    pub(crate) fn q_len(&self) -> Result<u32> {
        match &self.ch {
            Channel::Socket(_) => Err(Error::NotSupported),
            Channel::Shm(c) => Ok(c.q_len()),
            #[cfg(target_os = "linux")]
            Channel::PosixMq(c) => c.q_len(),
            Channel::SysvMq(c) => c.q_len(),
        }
    }
}
