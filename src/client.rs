// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// The connecting side. A client owns two streams (setup + event) and
// three half-channels attached to whatever transport the server chose.
// The setup stream stays around for request wakeup bytes and
// disconnect detection; the event stream delivers event wakeups and is
// what external poll loops watch via fd_get().

use crate::error::{Error, Result};
use crate::proto::{
    self, ConnectionRequest, ConnectionResponse, EventConnectionRequest, RequestHeader,
};
use crate::sock;
use crate::transport::{IpcKind, OneWay};

/// Bound on the handshake round-trip.
const CONNECT_TIMEOUT_MS: i32 = 5000;
/// Indefinite waits are chunked so a vanished server is noticed.
const HUP_PROBE_INTERVAL_MS: i32 = 1000;

pub struct IpcClient {
    name: String,
    kind: IpcKind,
    connection: u64,
    max_msg_size: usize,
    setup_sock: i32,
    event_sock: i32,
    request: OneWay,
    response: OneWay,
    event: OneWay,
}

impl IpcClient {
    /// Connect to the service published under `name` and negotiate
    /// `max_msg_size`. Performs the whole handshake: AUTHENTICATE on a
    /// fresh stream, transport attach, then NEW_EVENT_SOCK on a second
    /// stream bound to the same connection.
    pub fn connect(name: &str, max_msg_size: usize) -> Result<IpcClient> {
        let setup_sock = sock::sock_connect(name)?;
        let close_setup = |e: Error| -> Error {
            sock::sock_close(setup_sock);
            e
        };

        let req = ConnectionRequest::new(max_msg_size as u32);
        sock::send_all(setup_sock, req.as_bytes()).map_err(close_setup)?;

        let mut buf = [0u8; std::mem::size_of::<ConnectionResponse>()];
        sock::recv_all(setup_sock, &mut buf, CONNECT_TIMEOUT_MS).map_err(close_setup)?;
        let resp = ConnectionResponse::from_bytes(&buf).map_err(close_setup)?;
        if resp.hdr.error != 0 {
            sock::sock_close(setup_sock);
            return Err(Error::from_errno(resp.hdr.error));
        }

        let kind = IpcKind::from_u32(resp.connection_type).map_err(close_setup)?;
        let negotiated = resp.max_msg_size as usize;
        let connection = resp.connection;

        let (request, response, event) = if kind == IpcKind::Socket {
            (
                OneWay::socket(setup_sock, negotiated),
                OneWay::socket(setup_sock, negotiated),
                OneWay::socket(-1, negotiated),
            )
        } else {
            let attach = |half: &str| OneWay::client_attach(kind, name, half, connection, negotiated);
            (
                attach("request").map_err(close_setup)?,
                attach("response").map_err(close_setup)?,
                attach("event").map_err(close_setup)?,
            )
        };

        // Second stream, tagged with the handle so the server binds it
        // to this connection's event side.
        let event_sock = sock::sock_connect(name).map_err(close_setup)?;
        let ereq = EventConnectionRequest::new(connection);
        if let Err(e) = sock::send_all(event_sock, ereq.as_bytes()) {
            sock::sock_close(event_sock);
            return Err(close_setup(e));
        }

        let event = if kind == IpcKind::Socket {
            OneWay::socket(event_sock, negotiated)
        } else {
            event
        };

        Ok(IpcClient {
            name: name.to_string(),
            kind,
            connection,
            max_msg_size: negotiated,
            setup_sock,
            event_sock,
            request,
            response,
            event,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptor for external poll loops; readable when an event (or
    /// its wakeup byte) has arrived.
    pub fn fd_get(&self) -> i32 {
        self.event_sock
    }

    /// The negotiated per-frame ceiling.
    pub fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }

    /// Send one request frame. `Again` means flow-controlled: the
    /// server has paused or fallen behind, retry later.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        let n = self.request.send(data)?;
        if self.kind.needs_sock_for_poll() {
            sock::wakeup_send(self.setup_sock)?;
        }
        Ok(n)
    }

    /// Gathering variant of [`send`]; the segments form one frame.
    ///
    /// [`send`]: IpcClient::send
    pub fn sendv(&mut self, iov: &[&[u8]]) -> Result<usize> {
        let n = self.request.sendv(iov)?;
        if self.kind.needs_sock_for_poll() {
            sock::wakeup_send(self.setup_sock)?;
        }
        Ok(n)
    }

    /// Receive one frame from the response channel.
    pub fn recv(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        let setup = self.setup_sock;
        Self::recv_with_hup_probe(&mut self.response, setup, buf, timeout_ms)
    }

    /// Receive one frame from the event channel and consume its wakeup
    /// byte.
    pub fn event_recv(&mut self, buf: &mut [u8], timeout_ms: i32) -> Result<usize> {
        let setup = self.setup_sock;
        let n = Self::recv_with_hup_probe(&mut self.event, setup, buf, timeout_ms)?;
        if self.kind.needs_sock_for_poll() {
            sock::wakeup_drain(self.event_sock, 1);
        }
        Ok(n)
    }

    /// A dead server must not wedge an indefinite wait: chunk the wait
    /// and probe the setup stream for HUP in between.
    fn recv_with_hup_probe(
        one_way: &mut OneWay,
        setup_sock: i32,
        buf: &mut [u8],
        timeout_ms: i32,
    ) -> Result<usize> {
        if timeout_ms >= 0 {
            return match one_way.recv(buf, timeout_ms) {
                Err(Error::TimedOut) | Err(Error::Again) if sock::hup_seen(setup_sock) => {
                    Err(Error::ShutDown)
                }
                other => other,
            };
        }
        loop {
            match one_way.recv(buf, HUP_PROBE_INTERVAL_MS) {
                Err(Error::TimedOut) | Err(Error::Again) => {
                    if sock::hup_seen(setup_sock) {
                        return Err(Error::ShutDown);
                    }
                }
                other => return other,
            }
        }
    }

    /// Clean close: tell the server, then drop every artifact.
    pub fn disconnect(mut self) {
        let bye = RequestHeader {
            size: proto::REQ_HEADER_SIZE as i32,
            id: proto::MSG_DISCONNECT,
        };
        if self.request.send(bye.as_bytes()).is_ok() && self.kind.needs_sock_for_poll() {
            let _ = sock::wakeup_send(self.setup_sock);
        }
        // Drop handles the descriptors and transport detach.
    }

    /// Server-issued connection handle (names the transport artifacts).
    pub fn connection_handle(&self) -> u64 {
        self.connection
    }
}

impl Drop for IpcClient {
    fn drop(&mut self) {
        sock::sock_close(self.setup_sock);
        if self.event_sock >= 0 && self.event_sock != self.setup_sock {
            sock::sock_close(self.event_sock);
        }
        self.setup_sock = -1;
        self.event_sock = -1;
    }
}
