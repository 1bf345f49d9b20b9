// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// Ring-buffer transport: one shared-memory ring per half-channel.
// The only transport with a zero-copy receive path.

use crate::error::{Error, Result};
use crate::rb::{Flags, RingBuffer};
use crate::sys;

pub(crate) struct ShmChannel {
    rb: RingBuffer,
}

impl ShmChannel {
    /// The ring must always admit one maximum-size frame plus its
    /// length word, whatever the page rounding does.
    fn ring_bytes(max_msg_size: usize) -> usize {
        sys::round_to_page(max_msg_size + 8)
    }

    pub(crate) fn create(name: &str, max_msg_size: usize) -> Result<ShmChannel> {
        let rb = RingBuffer::create(
            name,
            Self::ring_bytes(max_msg_size),
            Flags::CREATE | Flags::SHARED_PROCESS,
        )?;
        Ok(ShmChannel { rb })
    }

    pub(crate) fn open(name: &str, _max_msg_size: usize) -> Result<ShmChannel> {
        let rb = RingBuffer::open(name, Flags::SHARED_PROCESS)?;
        Ok(ShmChannel { rb })
    }

    pub(crate) fn send(&mut self, data: &[u8]) -> Result<usize> {
        match self.rb.chunk_write(data) {
            Ok(n) => Ok(n),
            // Full ring means the consumer is behind: flow control.
            Err(Error::NoSpace) => Err(Error::Again),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn sendv(&mut self, iov: &[&[u8]], total: usize) -> Result<usize> {
        let dst = match self.rb.chunk_alloc(total) {
            Ok(d) => d,
            Err(Error::NoSpace) => return Err(Error::Again),
            Err(e) => return Err(e),
        };
        let mut at = 0usize;
        for seg in iov {
            dst[at..at + seg.len()].copy_from_slice(seg);
            at += seg.len();
        }
        self.rb.chunk_commit(total)?;
        Ok(total)
    }

    pub(crate) fn recv(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        self.rb.chunk_read(buf, timeout_ms)
    }

    pub(crate) fn peek(&mut self, timeout_ms: i32) -> Result<&[u8]> {
        self.rb.chunk_peek(timeout_ms)
    }

    pub(crate) fn reclaim(&mut self) -> Result<()> {
        self.rb.chunk_reclaim()
    }

    pub(crate) fn q_len(&self) -> u32 {
        self.rb.chunks_used()
    }
}
