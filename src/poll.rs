// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// The poll-handler interface a server is driven by. The event loop
// itself lives with the caller; the server only registers descriptors
// and hands over dispatch callbacks.

use crate::error::Result;

/// Dispatch priority requested for a descriptor. Loops that support
/// priorities should drain `High` registrations more eagerly; `High`
/// also switches the server into burst-draining dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Med,
    High,
}

/// Poll events of interest when registering a descriptor.
pub const POLL_EVENTS_IN: i16 = libc::POLLIN | libc::POLLPRI | libc::POLLNVAL;

/// Callback invoked by the loop on descriptor readiness with the fd
/// and the pending `revents`. A negative return (an errno) asks the
/// loop to drop the registration; `-ESHUTDOWN` additionally means the
/// descriptor is dead.
pub type DispatchFn = Box<dyn FnMut(i32, i16) -> i32>;

/// Poll registration callbacks injected into a server.
///
/// Implementations must tolerate `dispatch_mod`/`dispatch_del` being
/// called from inside a running dispatch callback.
pub trait PollHandlers {
    /// Register `fd` at priority `p`; `f` fires on readiness.
    fn dispatch_add(&mut self, p: Priority, fd: i32, events: i16, f: DispatchFn) -> Result<()>;

    /// Change the priority/event mask of an existing registration.
    /// The callback originally registered stays in place.
    fn dispatch_mod(&mut self, p: Priority, fd: i32, events: i16) -> Result<()>;

    /// Remove the registration for `fd`.
    fn dispatch_del(&mut self, fd: i32) -> Result<()>;
}
