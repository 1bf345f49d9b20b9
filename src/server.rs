// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// The listening side: service entity, credential handshake, connection
// arena, request dispatch and flow control.
//
// A service is a single-threaded cooperative object driven by the
// caller's poll loop. Dispatch callbacks registered with the loop
// capture only a Weak service reference plus the connection's stable
// handle; connections live in a slab keyed by handles that are never
// reused, so nothing holds a back-pointer and teardown order is free.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use slab::Slab;

use crate::error::{Error, Result};
use crate::poll::{DispatchFn, PollHandlers, Priority, POLL_EVENTS_IN};
use crate::proto::{
    self, ConnectionRequest, ConnectionResponse, EventConnectionRequest, RequestHeader,
    ResponseHeader,
};
use crate::sock::{self, PeerCreds};
use crate::transport::{IpcKind, OneWay};

/// Peek/recv timeout for one dispatch pass.
const IPC_REQUEST_TIMEOUT_MS: i32 = 10;
/// Frames drained per wakeup when the service runs at High priority.
const MAX_BURST: u32 = 5;
/// Retries for a flow-controlled event send before giving up.
const EVENT_SEND_TRIES: u32 = 20;
/// How long the acceptor waits for the first frame on a new stream.
const SETUP_RECV_TIMEOUT_MS: i32 = 5000;

/// Request-channel scheduling, applied to every live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimit {
    Fast,
    Normal,
    Slow,
    /// Remove request descriptors from the poll set entirely until the
    /// next non-Off rate change re-adds them.
    Off,
}

/// Service callbacks supplied at creation.
pub trait ServiceHandlers {
    /// Admission control, called before any resources are allocated.
    /// Returning an error refuses the connection and sends the errno
    /// to the client.
    fn connection_accept(&mut self, _uid: u32, _gid: u32) -> Result<()> {
        Ok(())
    }

    /// The connection is fully set up and registered.
    fn connection_created(&mut self, _conn: &mut Conn<'_>) {}

    /// One inbound request frame. Return 0 on success; a negative
    /// return signals backpressure and is reported as `NoBufs`.
    fn msg_process(&mut self, conn: &mut Conn<'_>, data: &[u8]) -> i32;

    /// The last reference was dropped; resources go away after this.
    fn connection_destroyed(&mut self, _conn: &mut Conn<'_>) {}
}

/// Cheap, clonable control handle usable from inside callbacks.
#[derive(Clone)]
pub struct ServerControl {
    inner: Weak<RefCell<Inner>>,
}

impl ServerControl {
    /// See [`IpcServer::request_rate_limit`]. Safe to call from inside
    /// `msg_process`; the change is applied when the dispatch pass
    /// finishes.
    pub fn request_rate_limit(&self, rate: RateLimit) {
        if let Some(rc) = self.inner.upgrade() {
            rate_limit(&rc, rate);
        }
    }

    pub fn service_id(&self) -> i32 {
        self.inner
            .upgrade()
            .map(|rc| rc.borrow().service_id)
            .unwrap_or(-1)
    }
}

/// Borrowed view of one connection handed to service callbacks.
pub struct Conn<'a> {
    handle: u64,
    service_id: i32,
    kind: IpcKind,
    creds: PeerCreds,
    response: &'a mut OneWay,
    event: &'a mut OneWay,
    event_sock: i32,
    refcount: &'a Cell<u32>,
    context: &'a mut Option<Rc<dyn Any>>,
    control: ServerControl,
}

impl Conn<'_> {
    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn service_id(&self) -> i32 {
        self.service_id
    }

    pub fn pid(&self) -> i32 {
        self.creds.pid as i32
    }

    pub fn uid(&self) -> u32 {
        self.creds.uid as u32
    }

    pub fn gid(&self) -> u32 {
        self.creds.gid as u32
    }

    /// Send one frame on the response channel.
    pub fn response_send(&mut self, data: &[u8]) -> Result<usize> {
        self.refcount.set(self.refcount.get() + 1);
        let res = self.response.send(data);
        self.refcount.set(self.refcount.get() - 1);
        res
    }

    pub fn response_sendv(&mut self, iov: &[&[u8]]) -> Result<usize> {
        self.refcount.set(self.refcount.get() + 1);
        let res = self.response.sendv(iov);
        self.refcount.set(self.refcount.get() - 1);
        res
    }

    /// Send one unsolicited frame on the event channel, waking the
    /// client through its paired stream.
    pub fn event_send(&mut self, data: &[u8]) -> Result<usize> {
        self.refcount.set(self.refcount.get() + 1);
        let res = event_send_raw(self.event, self.event_sock, self.kind, &[data]);
        self.refcount.set(self.refcount.get() - 1);
        res
    }

    pub fn event_sendv(&mut self, iov: &[&[u8]]) -> Result<usize> {
        self.refcount.set(self.refcount.get() + 1);
        let res = event_send_raw(self.event, self.event_sock, self.kind, iov);
        self.refcount.set(self.refcount.get() - 1);
        res
    }

    /// Attach an opaque per-connection context.
    pub fn context_set(&mut self, ctx: Rc<dyn Any>) {
        *self.context = Some(ctx);
    }

    pub fn context(&self) -> Option<Rc<dyn Any>> {
        self.context.clone()
    }

    /// Keep the connection alive past the current callback. Pair with
    /// [`IpcServer::connection_ref_dec`].
    pub fn ref_inc(&self) {
        self.refcount.set(self.refcount.get() + 1);
    }

    pub fn control(&self) -> ServerControl {
        self.control.clone()
    }

    pub fn request_rate_limit(&self, rate: RateLimit) {
        self.control.request_rate_limit(rate);
    }
}

struct Connection {
    handle: u64,
    kind: IpcKind,
    creds: PeerCreds,
    /// Setup stream: wakeup bytes, HUP detection, socket transport.
    setup_sock: i32,
    /// Second stream bound by NEW_EVENT_SOCK (-1 until then).
    event_sock: i32,
    request: OneWay,
    response: OneWay,
    event: OneWay,
    receive_buf: Vec<u8>,
    refcount: Cell<u32>,
    context: Option<Rc<dyn Any>>,
    /// Request descriptor removed from the poll set (rate Off).
    paused: bool,
    /// The list reference has been dropped (disconnect under way).
    dead: bool,
}

struct Inner {
    name: String,
    service_id: i32,
    kind: IpcKind,
    server_sock: i32,
    poll_priority: Priority,
    next_handle: u64,
    conns: Slab<Rc<RefCell<Connection>>>,
    by_handle: HashMap<u64, usize>,
    handlers: Option<Box<dyn ServiceHandlers>>,
    poll: Option<Box<dyn PollHandlers>>,
    /// A dispatch pass is on the stack; rate changes are deferred.
    in_dispatch: bool,
    pending_rate: Option<RateLimit>,
}

/// A published IPC service.
pub struct IpcServer {
    inner: Rc<RefCell<Inner>>,
}

impl IpcServer {
    /// Create a service. It owns no descriptors until [`run`] is
    /// called with poll handlers in place.
    ///
    /// [`run`]: IpcServer::run
    pub fn new(
        name: &str,
        service_id: i32,
        kind: IpcKind,
        handlers: Box<dyn ServiceHandlers>,
    ) -> Result<IpcServer> {
        if name.is_empty() {
            return Err(Error::Invalid);
        }
        #[cfg(not(target_os = "linux"))]
        if kind == IpcKind::PosixMq {
            return Err(Error::NotSupported);
        }
        Ok(IpcServer {
            inner: Rc::new(RefCell::new(Inner {
                name: name.to_string(),
                service_id,
                kind,
                server_sock: -1,
                poll_priority: Priority::Med,
                next_handle: 1,
                conns: Slab::new(),
                by_handle: HashMap::new(),
                handlers: Some(handlers),
                poll: None,
                in_dispatch: false,
                pending_rate: None,
            })),
        })
    }

    /// Inject the caller's poll loop.
    pub fn poll_handlers_set(&self, poll: Box<dyn PollHandlers>) {
        self.inner.borrow_mut().poll = Some(poll);
    }

    pub fn control(&self) -> ServerControl {
        ServerControl {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn service_id(&self) -> i32 {
        self.inner.borrow().service_id
    }

    /// Live connections (diagnostic).
    pub fn connection_count(&self) -> usize {
        self.inner.borrow().conns.len()
    }

    /// Publish the listening endpoint and register the acceptor with
    /// the poll loop.
    pub fn run(&self) -> Result<()> {
        let weak = Rc::downgrade(&self.inner);
        let mut inner = self.inner.borrow_mut();
        if inner.poll.is_none() {
            return Err(Error::Invalid);
        }
        let fd = sock::sock_listen(&inner.name)?;
        inner.server_sock = fd;
        let f: DispatchFn = Box::new(move |fd, revents| acceptor_dispatch(&weak, fd, revents));
        let p = inner.poll_priority;
        if let Err(e) = inner
            .poll
            .as_mut()
            .ok_or(Error::Invalid)?
            .dispatch_add(p, fd, POLL_EVENTS_IN, f)
        {
            sock::sock_close(fd);
            inner.server_sock = -1;
            return Err(e);
        }
        Ok(())
    }

    /// Release every live connection, then withdraw the listener.
    pub fn destroy(&self) {
        let conns: Vec<Rc<RefCell<Connection>>> = self
            .inner
            .borrow()
            .conns
            .iter()
            .map(|(_, c)| Rc::clone(c))
            .collect();
        for conn in conns {
            let fresh = {
                let mut c = conn.borrow_mut();
                if c.dead {
                    false
                } else {
                    c.dead = true;
                    true
                }
            };
            if fresh {
                connection_ref_dec(&self.inner, &conn);
            }
        }

        log::info!("withdrawing server sockets");
        let mut inner = self.inner.borrow_mut();
        let fd = inner.server_sock;
        if fd >= 0 {
            if let Some(poll) = inner.poll.as_mut() {
                let _ = poll.dispatch_del(fd);
            }
            sock::sock_close(fd);
            inner.server_sock = -1;
        }
    }

    /// Adjust the poll priority of every request descriptor:
    /// Fast maps to High, Normal to Med, Slow to Low, Off pauses.
    pub fn request_rate_limit(&self, rate: RateLimit) {
        rate_limit(&self.inner, rate);
    }

    pub fn response_send(&self, handle: u64, data: &[u8]) -> Result<usize> {
        let conn = self.conn_by_handle(handle)?;
        let res = {
            let mut c = conn.borrow_mut();
            c.refcount.set(c.refcount.get() + 1);
            c.response.send(data)
        };
        connection_ref_dec(&self.inner, &conn);
        res
    }

    pub fn event_send(&self, handle: u64, data: &[u8]) -> Result<usize> {
        self.event_sendv(handle, &[data])
    }

    pub fn event_sendv(&self, handle: u64, iov: &[&[u8]]) -> Result<usize> {
        let conn = self.conn_by_handle(handle)?;
        let res = {
            let mut c = conn.borrow_mut();
            c.refcount.set(c.refcount.get() + 1);
            let c = &mut *c;
            event_send_raw(&mut c.event, c.event_sock, c.kind, iov)
        };
        connection_ref_dec(&self.inner, &conn);
        res
    }

    pub fn connection_ref_inc(&self, handle: u64) -> Result<()> {
        let conn = self.conn_by_handle(handle)?;
        let c = conn.borrow();
        c.refcount.set(c.refcount.get() + 1);
        Ok(())
    }

    pub fn connection_ref_dec(&self, handle: u64) -> Result<()> {
        let conn = self.conn_by_handle(handle)?;
        connection_ref_dec(&self.inner, &conn);
        Ok(())
    }

    pub fn context_set(&self, handle: u64, ctx: Rc<dyn Any>) -> Result<()> {
        let conn = self.conn_by_handle(handle)?;
        conn.borrow_mut().context = Some(ctx);
        Ok(())
    }

    pub fn context_get(&self, handle: u64) -> Result<Option<Rc<dyn Any>>> {
        let conn = self.conn_by_handle(handle)?;
        let ctx = conn.borrow().context.clone();
        Ok(ctx)
    }

    fn conn_by_handle(&self, handle: u64) -> Result<Rc<RefCell<Connection>>> {
        let inner = self.inner.borrow();
        let key = *inner.by_handle.get(&handle).ok_or(Error::Invalid)?;
        Ok(Rc::clone(&inner.conns[key]))
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ---------------------------------------------------------------------------
// Event send plumbing
// ---------------------------------------------------------------------------

/// Push one event frame, retrying while flow-controlled, then wake the
/// client with a single byte on its event stream. Stream transports
/// need no wakeup byte: the frame itself makes the fd readable.
fn event_send_raw(event: &mut OneWay, event_sock: i32, kind: IpcKind, iov: &[&[u8]]) -> Result<usize> {
    let mut tries = 0;
    let res = loop {
        match event.sendv(iov) {
            Err(Error::Again) if tries < EVENT_SEND_TRIES => {
                tries += 1;
                continue;
            }
            other => break other,
        }
    };
    match res {
        Ok(n) => {
            if kind.needs_sock_for_poll() && event_sock >= 0 {
                let _ = sock::wakeup_send(event_sock);
            }
            Ok(n)
        }
        Err(e) => {
            log::error!("failed to send event: {e}");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

fn rate_limit(inner_rc: &Rc<RefCell<Inner>>, rate: RateLimit) {
    {
        let mut inner = inner_rc.borrow_mut();
        if inner.in_dispatch {
            inner.pending_rate = Some(rate);
            return;
        }
    }
    apply_rate(inner_rc, rate);
}

fn apply_rate(inner_rc: &Rc<RefCell<Inner>>, rate: RateLimit) {
    let weak = Rc::downgrade(inner_rc);
    let mut inner = inner_rc.borrow_mut();
    let inner = &mut *inner;
    let Some(poll) = inner.poll.as_mut() else {
        return;
    };

    match rate {
        RateLimit::Off => {
            for (_, conn_rc) in inner.conns.iter() {
                let mut c = conn_rc.borrow_mut();
                if !c.paused {
                    log::debug!(
                        "pausing connection {:x} ({} requests queued)",
                        c.handle,
                        c.request.q_len().unwrap_or(0)
                    );
                    let _ = poll.dispatch_del(c.setup_sock);
                    c.paused = true;
                }
            }
        }
        _ => {
            let p = match rate {
                RateLimit::Fast => Priority::High,
                RateLimit::Slow => Priority::Low,
                _ => Priority::Med,
            };
            inner.poll_priority = p;
            for (_, conn_rc) in inner.conns.iter() {
                let mut c = conn_rc.borrow_mut();
                let fd = c.setup_sock;
                if c.paused {
                    let handle = c.handle;
                    let w = weak.clone();
                    let f: DispatchFn =
                        Box::new(move |fd, revents| request_dispatch(&w, handle, fd, revents));
                    if poll.dispatch_add(p, fd, POLL_EVENTS_IN, f).is_ok() {
                        c.paused = false;
                    }
                } else {
                    let _ = poll.dispatch_mod(p, fd, POLL_EVENTS_IN);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Accept path
// ---------------------------------------------------------------------------

fn acceptor_dispatch(weak: &Weak<RefCell<Inner>>, listen_fd: i32, _revents: i16) -> i32 {
    let Some(inner_rc) = weak.upgrade() else {
        return -libc::ESHUTDOWN;
    };

    let new_fd = match sock::sock_accept(listen_fd) {
        Ok(fd) => fd,
        Err(Error::Io(e)) if e.raw_os_error() == Some(libc::EBADF) => {
            log::error!("could not accept connection (fd: {listen_fd}): {e}");
            return -libc::EBADF;
        }
        Err(e) => {
            // An error, but yielding the acceptor would kill the service.
            log::error!("could not accept connection: {e}");
            return 0;
        }
    };

    let (frame, creds) = match sock::recv_setup_frame(new_fd, SETUP_RECV_TIMEOUT_MS) {
        Ok(v) => v,
        Err(e) => {
            log::error!("could not receive setup message: {e}");
            sock::sock_close(new_fd);
            return 0;
        }
    };

    let hdr = match RequestHeader::from_bytes(&frame) {
        Ok(h) => h,
        Err(_) => {
            sock::sock_close(new_fd);
            return 0;
        }
    };

    match hdr.id {
        proto::MSG_AUTHENTICATE => handle_new_connection(&inner_rc, new_fd, &frame, creds),
        proto::MSG_NEW_EVENT_SOCK => handle_event_sock(&inner_rc, new_fd, &frame),
        _ => sock::sock_close(new_fd),
    }
    0
}

fn refuse(sock: i32, err: &Error) {
    let response = ConnectionResponse {
        hdr: ResponseHeader {
            size: std::mem::size_of::<ConnectionResponse>() as i32,
            id: proto::MSG_AUTHENTICATE,
            error: err.errno(),
        },
        connection: 0,
        connection_type: 0,
        max_msg_size: 0,
    };
    let _ = sock::send_all(sock, response.as_bytes());
    sock::sock_close(sock);
}

fn handle_new_connection(
    inner_rc: &Rc<RefCell<Inner>>,
    sock: i32,
    frame: &[u8],
    creds: PeerCreds,
) {
    let req = match ConnectionRequest::from_bytes(frame) {
        Ok(r) => r,
        Err(e) => {
            refuse(sock, &e);
            return;
        }
    };

    // Admission control before anything is allocated.
    let mut handlers = match inner_rc.borrow_mut().handlers.take() {
        Some(h) => h,
        None => {
            refuse(sock, &Error::ShutDown);
            return;
        }
    };
    let admitted = handlers.connection_accept(creds.uid as u32, creds.gid as u32);
    inner_rc.borrow_mut().handlers = Some(handlers);
    if let Err(e) = admitted {
        if matches!(e, Error::Acces) {
            log::error!("Invalid IPC credentials.");
        } else {
            log::error!("error in connection setup: {e}");
        }
        refuse(sock, &e);
        return;
    }
    log::info!("IPC credentials authenticated");

    let max_msg_size = (req.max_msg_size as usize).max(proto::RES_HEADER_SIZE);
    let (kind, name, handle) = {
        let mut inner = inner_rc.borrow_mut();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        (inner.kind, inner.name.clone(), handle)
    };

    // Per-transport artifacts, named by the handle so the client can
    // derive the same names from the response.
    let (request, response, event) = if kind == IpcKind::Socket {
        (
            OneWay::socket(sock, max_msg_size),
            OneWay::socket(sock, max_msg_size),
            OneWay::socket(-1, max_msg_size),
        )
    } else {
        let make = |half: &str| OneWay::server_create(kind, &name, half, handle, max_msg_size);
        let request = match make("request") {
            Ok(o) => o,
            Err(e) => {
                log::error!("error in connection setup: {e}");
                refuse(sock, &e);
                return;
            }
        };
        let response = match make("response") {
            Ok(o) => o,
            Err(e) => {
                log::error!("error in connection setup: {e}");
                refuse(sock, &e);
                return;
            }
        };
        let event = match make("event") {
            Ok(o) => o,
            Err(e) => {
                log::error!("error in connection setup: {e}");
                refuse(sock, &e);
                return;
            }
        };
        (request, response, event)
    };

    let conn = Connection {
        handle,
        kind,
        creds,
        setup_sock: sock,
        event_sock: -1,
        request,
        response,
        event,
        receive_buf: vec![0u8; max_msg_size.max(proto::REQ_HEADER_SIZE)],
        refcount: Cell::new(1),
        context: None,
        paused: false,
        dead: false,
    };
    let conn_rc = Rc::new(RefCell::new(conn));
    {
        let mut inner = inner_rc.borrow_mut();
        let key = inner.conns.insert(Rc::clone(&conn_rc));
        inner.by_handle.insert(handle, key);
    }

    let response_frame = ConnectionResponse {
        hdr: ResponseHeader {
            size: std::mem::size_of::<ConnectionResponse>() as i32,
            id: proto::MSG_AUTHENTICATE,
            error: 0,
        },
        connection: handle,
        connection_type: kind.as_u32(),
        max_msg_size: max_msg_size as u32,
    };
    if let Err(e) = sock::send_all(sock, response_frame.as_bytes()) {
        log::error!("error in connection setup: {e}");
        let fresh = {
            let mut c = conn_rc.borrow_mut();
            c.dead = true;
            true
        };
        if fresh {
            connection_ref_dec(inner_rc, &conn_rc);
        }
        return;
    }

    // Register request readiness with the caller's poll loop.
    {
        let weak = Rc::downgrade(inner_rc);
        let mut inner = inner_rc.borrow_mut();
        let p = inner.poll_priority;
        if let Some(poll) = inner.poll.as_mut() {
            let f: DispatchFn =
                Box::new(move |fd, revents| request_dispatch(&weak, handle, fd, revents));
            let _ = poll.dispatch_add(p, sock, POLL_EVENTS_IN, f);
        }
    }

    with_handlers_and_conn(inner_rc, &conn_rc, |handlers, conn| {
        handlers.connection_created(conn);
    });
}

fn handle_event_sock(inner_rc: &Rc<RefCell<Inner>>, sock: i32, frame: &[u8]) {
    let req = match EventConnectionRequest::from_bytes(frame) {
        Ok(r) => r,
        Err(_) => {
            sock::sock_close(sock);
            return;
        }
    };
    let conn_rc = {
        let inner = inner_rc.borrow();
        inner
            .by_handle
            .get(&req.connection)
            .map(|&key| Rc::clone(&inner.conns[key]))
    };
    let Some(conn_rc) = conn_rc else {
        log::error!("event stream for unknown connection {:x}", req.connection);
        sock::sock_close(sock);
        return;
    };
    let mut c = conn_rc.borrow_mut();
    c.event_sock = sock;
    if c.kind == IpcKind::Socket {
        let max = c.event.max_msg_size;
        c.event = OneWay::socket(sock, max);
    }
}

// ---------------------------------------------------------------------------
// Dispatch path
// ---------------------------------------------------------------------------

/// Run `f` with the service handlers temporarily taken out and a
/// [`Conn`] view of `conn_rc`. Keeps the service borrow released while
/// user code runs.
fn with_handlers_and_conn<R>(
    inner_rc: &Rc<RefCell<Inner>>,
    conn_rc: &Rc<RefCell<Connection>>,
    f: impl FnOnce(&mut dyn ServiceHandlers, &mut Conn<'_>) -> R,
) -> Option<R> {
    let (mut handlers, service_id, was_dispatching) = {
        let mut inner = inner_rc.borrow_mut();
        let h = inner.handlers.take()?;
        let was = inner.in_dispatch;
        inner.in_dispatch = true;
        (h, inner.service_id, was)
    };
    let control = ServerControl {
        inner: Rc::downgrade(inner_rc),
    };
    let res = {
        let mut c = conn_rc.borrow_mut();
        let c = &mut *c;
        let mut view = Conn {
            handle: c.handle,
            service_id,
            kind: c.kind,
            creds: c.creds,
            response: &mut c.response,
            event: &mut c.event,
            event_sock: c.event_sock,
            refcount: &c.refcount,
            context: &mut c.context,
            control,
        };
        f(handlers.as_mut(), &mut view)
    };
    {
        let mut inner = inner_rc.borrow_mut();
        inner.handlers = Some(handlers);
        inner.in_dispatch = was_dispatching;
    }
    if !was_dispatching {
        finish_pending_rate(inner_rc);
    }
    Some(res)
}

fn finish_pending_rate(inner_rc: &Rc<RefCell<Inner>>) {
    let pending = inner_rc.borrow_mut().pending_rate.take();
    if let Some(rate) = pending {
        apply_rate(inner_rc, rate);
    }
}

/// One frame: peek (ring transport) or copy into the scratch buffer,
/// validate, hand to `msg_process`, reclaim.
fn process_request(
    inner_rc: &Rc<RefCell<Inner>>,
    conn_rc: &Rc<RefCell<Connection>>,
    timeout_ms: i32,
) -> Result<usize> {
    {
        let c = conn_rc.borrow();
        c.refcount.set(c.refcount.get() + 1);
    }
    let res = process_request_inner(inner_rc, conn_rc, timeout_ms);
    connection_ref_dec(inner_rc, conn_rc);
    res
}

fn process_request_inner(
    inner_rc: &Rc<RefCell<Inner>>,
    conn_rc: &Rc<RefCell<Connection>>,
    timeout_ms: i32,
) -> Result<usize> {
    let (mut handlers, service_id) = {
        let mut inner = inner_rc.borrow_mut();
        let h = inner.handlers.take().ok_or(Error::ShutDown)?;
        (h, inner.service_id)
    };
    let control = ServerControl {
        inner: Rc::downgrade(inner_rc),
    };

    let result = {
        let mut c = conn_rc.borrow_mut();
        let c = &mut *c;
        let Connection {
            handle,
            kind,
            creds,
            event_sock,
            request,
            response,
            event,
            receive_buf,
            refcount,
            context,
            ..
        } = c;

        let use_peek = request.has_peek();
        let frame_res: Result<&[u8]> = if use_peek {
            request.peek(timeout_ms)
        } else {
            match request.recv(receive_buf, timeout_ms) {
                Ok(n) => Ok(&receive_buf[..n]),
                Err(e) => Err(e),
            }
        };

        match frame_res {
            Err(e) => {
                if !matches!(e, Error::Again | Error::TimedOut) {
                    log::error!("failed to receive request: {e}");
                }
                Err(e)
            }
            Ok(frame) => {
                let size = frame.len();
                let hdr = RequestHeader::from_bytes(frame);
                let outcome = match hdr {
                    Err(e) => Err(e),
                    Ok(hdr) if hdr.size as usize != size => Err(Error::Invalid),
                    Ok(hdr) if hdr.id == proto::MSG_DISCONNECT => {
                        log::debug!("disconnect request on connection {handle:x}");
                        Err(Error::ShutDown)
                    }
                    Ok(_) => {
                        let mut view = Conn {
                            handle: *handle,
                            service_id,
                            kind: *kind,
                            creds: *creds,
                            response,
                            event,
                            event_sock: *event_sock,
                            refcount,
                            context,
                            control,
                        };
                        let rc = handlers.msg_process(&mut view, frame);
                        if rc < 0 {
                            Err(Error::NoBufs)
                        } else {
                            Ok(size)
                        }
                    }
                };
                if use_peek {
                    let _ = request.reclaim();
                }
                outcome
            }
        }
    };

    inner_rc.borrow_mut().handlers = Some(handlers);

    if matches!(result, Err(Error::ShutDown)) {
        // Disconnect frame: drop the list reference exactly once.
        let fresh = {
            let mut c = conn_rc.borrow_mut();
            if c.dead {
                false
            } else {
                c.dead = true;
                true
            }
        };
        if fresh {
            connection_ref_dec(inner_rc, conn_rc);
        }
    }
    result
}

fn request_dispatch(weak: &Weak<RefCell<Inner>>, handle: u64, fd: i32, revents: i16) -> i32 {
    let Some(inner_rc) = weak.upgrade() else {
        return -libc::ESHUTDOWN;
    };
    let conn_rc = {
        let inner = inner_rc.borrow();
        match inner.by_handle.get(&handle) {
            Some(&key) => Rc::clone(&inner.conns[key]),
            None => return -libc::ESHUTDOWN,
        }
    };

    // Hold a dispatch reference for the whole pass.
    {
        let c = conn_rc.borrow();
        c.refcount.set(c.refcount.get() + 1);
    }
    let priority = {
        let mut inner = inner_rc.borrow_mut();
        inner.in_dispatch = true;
        inner.poll_priority
    };

    let mut recvd: u32 = 0;
    let mut try_count: u32 = 0;
    let mut shutdown = false;
    loop {
        let res = process_request(&inner_rc, &conn_rc, IPC_REQUEST_TIMEOUT_MS);
        try_count += 1;
        let mut progress = false;
        match res {
            Ok(_) | Err(Error::NoBufs) | Err(Error::Invalid) => {
                recvd += 1;
                progress = matches!(res, Ok(_));
            }
            Err(Error::ShutDown) => {
                shutdown = true;
            }
            Err(_) => {}
        }
        // Burst-drain at High priority only.
        if !(priority == Priority::High && progress && try_count < MAX_BURST) {
            break;
        }
    }

    // One wakeup byte per processed frame.
    let needs_sock = {
        let c = conn_rc.borrow();
        c.kind.needs_sock_for_poll()
    };
    if needs_sock && recvd > 0 {
        sock::wakeup_drain(fd, recvd as usize);
    }

    // HUP tears the connection down once nothing more is readable.
    let hup = revents & (libc::POLLHUP | libc::POLLERR) != 0;
    if (hup && recvd == 0) || shutdown {
        if hup && !shutdown {
            log::debug!("connection {handle:x} HUP");
        }
        let fresh = {
            let mut c = conn_rc.borrow_mut();
            if c.dead {
                false
            } else {
                c.dead = true;
                true
            }
        };
        if fresh {
            connection_ref_dec(&inner_rc, &conn_rc);
        }
        finish_dispatch(&inner_rc);
        connection_ref_dec(&inner_rc, &conn_rc);
        return -libc::ESHUTDOWN;
    }

    finish_dispatch(&inner_rc);
    connection_ref_dec(&inner_rc, &conn_rc);
    0
}

fn finish_dispatch(inner_rc: &Rc<RefCell<Inner>>) {
    let pending = {
        let mut inner = inner_rc.borrow_mut();
        inner.in_dispatch = false;
        inner.pending_rate.take()
    };
    if let Some(rate) = pending {
        apply_rate(inner_rc, rate);
    }
}

// ---------------------------------------------------------------------------
// Reference counting and teardown
// ---------------------------------------------------------------------------

fn connection_ref_dec(inner_rc: &Rc<RefCell<Inner>>, conn_rc: &Rc<RefCell<Connection>>) {
    let left = {
        let c = conn_rc.borrow();
        let n = c.refcount.get().saturating_sub(1);
        c.refcount.set(n);
        n
    };
    if left == 0 {
        destroy_connection(inner_rc, conn_rc);
    }
}

fn destroy_connection(inner_rc: &Rc<RefCell<Inner>>, conn_rc: &Rc<RefCell<Connection>>) {
    // Unregister and unlink from the arena first so no new dispatch
    // can find the connection.
    {
        let mut inner = inner_rc.borrow_mut();
        let inner = &mut *inner;
        let c = conn_rc.borrow();
        if let Some(poll) = inner.poll.as_mut() {
            if !c.paused {
                let _ = poll.dispatch_del(c.setup_sock);
            }
        }
        if let Some(key) = inner.by_handle.remove(&c.handle) {
            inner.conns.remove(key);
        }
    }

    with_handlers_and_conn(inner_rc, conn_rc, |handlers, conn| {
        handlers.connection_destroyed(conn);
    });

    let mut c = conn_rc.borrow_mut();
    log::debug!("connection {:x} destroyed", c.handle);
    sock::sock_close(c.setup_sock);
    if c.event_sock >= 0 && c.event_sock != c.setup_sock {
        sock::sock_close(c.event_sock);
    }
    c.setup_sock = -1;
    c.event_sock = -1;
    c.receive_buf = Vec::new();
    // Transport artifacts are torn down when the connection drops.
}
