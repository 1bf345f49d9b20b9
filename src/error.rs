// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// Error taxonomy for the IPC engine. Every variant maps to a negative
// errno so response frames can carry it on the wire and peers written
// in any language can interpret it.

use std::io;

use thiserror::Error;

/// Errors reported by ring buffers, transports and connections.
#[derive(Debug, Error)]
pub enum Error {
    /// Peer credentials were rejected; the connection was refused.
    #[error("permission denied")]
    Acces,

    /// Malformed frame: header size mismatch or unknown message id.
    #[error("invalid message")]
    Invalid,

    /// Allocation failure.
    #[error("out of memory")]
    NoMem,

    /// Ring buffer or transport queue is full.
    #[error("no space left in buffer")]
    NoSpace,

    /// Flow-controlled; the caller should retry.
    #[error("resource temporarily unavailable")]
    Again,

    /// A bounded wait expired.
    #[error("timed out")]
    TimedOut,

    /// Peer closed or the service was withdrawn mid-operation.
    #[error("connection shut down")]
    ShutDown,

    /// The application handler signalled backpressure.
    #[error("no buffer space available")]
    NoBufs,

    /// An artifact with the same name already exists.
    #[error("already exists")]
    Exists,

    /// The operation is not available on this transport or platform.
    #[error("not supported")]
    NotSupported,

    /// Unclassified OS error bubbling up from a syscall.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Build an `Error` from the current `errno`.
    pub(crate) fn last_os() -> Self {
        Self::from_errno(-io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }

    /// Map a negative errno-style integer back into an `Error`.
    /// Non-negative values are a caller bug and map to `Invalid`.
    pub fn from_errno(e: i32) -> Self {
        match -e {
            libc::EACCES => Error::Acces,
            libc::EINVAL | libc::EBADMSG => Error::Invalid,
            libc::ENOMEM => Error::NoMem,
            libc::ENOSPC | libc::EMSGSIZE => Error::NoSpace,
            libc::EAGAIN => Error::Again,
            libc::ETIMEDOUT => Error::TimedOut,
            libc::ESHUTDOWN | libc::EPIPE | libc::ECONNRESET | libc::ENOTCONN => Error::ShutDown,
            libc::ENOBUFS => Error::NoBufs,
            libc::EEXIST => Error::Exists,
            libc::ENOTSUP => Error::NotSupported,
            n if n > 0 => Error::Io(io::Error::from_raw_os_error(n)),
            _ => Error::Invalid,
        }
    }

    /// The negative errno carried in response frames for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Acces => -libc::EACCES,
            Error::Invalid => -libc::EINVAL,
            Error::NoMem => -libc::ENOMEM,
            Error::NoSpace => -libc::ENOSPC,
            Error::Again => -libc::EAGAIN,
            Error::TimedOut => -libc::ETIMEDOUT,
            Error::ShutDown => -libc::ESHUTDOWN,
            Error::NoBufs => -libc::ENOBUFS,
            Error::Exists => -libc::EEXIST,
            Error::NotSupported => -libc::ENOTSUP,
            Error::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether a retry may succeed without any other action.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Again | Error::TimedOut | Error::NoSpace)
    }

    /// Whether the connection is permanently unusable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::ShutDown | Error::Acces)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
