// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// Local (same-host) request/response + event IPC across trust
// boundaries. A credential-authenticated handshake over a stream
// endpoint sets up three one-way half-channels per connection
// (request, response, event) over one of four transports: the stream
// itself, shared-memory ring buffers, POSIX message queues, or
// System V message queues.
//
// The server side is driven by an injected poll loop; the ring buffer
// is also usable on its own as an SPSC byte queue between two
// processes.

#![cfg(unix)]

mod client;
mod error;
mod poll;
mod proto;
mod rb;
mod server;
mod sock;
mod sys;
mod transport;

pub use client::IpcClient;
pub use error::{Error, Result};
pub use poll::{DispatchFn, PollHandlers, Priority, POLL_EVENTS_IN};
pub use proto::{
    ConnectionRequest, ConnectionResponse, EventConnectionRequest, RequestHeader, ResponseHeader,
    MSG_AUTHENTICATE, MSG_DISCONNECT, MSG_NEW_EVENT_SOCK, MSG_USER_START, REQ_HEADER_SIZE,
    RES_HEADER_SIZE,
};
pub use rb::{Flags as RbFlags, RingBuffer};
pub use server::{Conn, IpcServer, RateLimit, ServerControl, ServiceHandlers};
pub use transport::IpcKind;
