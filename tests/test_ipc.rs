// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// End-to-end client/server scenarios over the real transports:
// request/response ladders, flow control, the event side-channel,
// credential rejection and disconnect handling.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{start_server, unique_name};
use ringbus::{
    Conn, Error, IpcClient, IpcKind, RateLimit, RequestHeader, ResponseHeader, ServiceHandlers,
    MSG_USER_START, REQ_HEADER_SIZE,
};

const REQ_TX_RX: i32 = MSG_USER_START + 3;
const RES_TX_RX: i32 = 13;
const REQ_DISPATCH: i32 = MSG_USER_START + 4;
const RES_DISPATCH: i32 = 14;
const REQ_BURST: i32 = MSG_USER_START + 5;
const REQ_COUNT: i32 = MSG_USER_START + 6;

const MAX_MSG_SIZE: usize = 131072;

fn request_frame(id: i32, total: usize) -> Vec<u8> {
    assert!(total >= REQ_HEADER_SIZE);
    let hdr = RequestHeader {
        size: total as i32,
        id,
    };
    let mut frame = vec![0u8; total];
    frame[..REQ_HEADER_SIZE].copy_from_slice(hdr.as_bytes());
    for (i, b) in frame[REQ_HEADER_SIZE..].iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    frame
}

fn response_of(id: i32) -> ResponseHeader {
    ResponseHeader {
        size: std::mem::size_of::<ResponseHeader>() as i32,
        id,
        error: 0,
    }
}

#[derive(Default)]
struct Counters {
    created: AtomicUsize,
    processed: AtomicUsize,
    destroyed: AtomicUsize,
}

struct EchoService {
    counters: Arc<Counters>,
    fc_after_first: bool,
}

impl EchoService {
    fn new(counters: Arc<Counters>) -> EchoService {
        EchoService {
            counters,
            fc_after_first: false,
        }
    }
}

impl ServiceHandlers for EchoService {
    fn connection_created(&mut self, _conn: &mut Conn<'_>) {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
    }

    fn msg_process(&mut self, conn: &mut Conn<'_>, data: &[u8]) -> i32 {
        self.counters.processed.fetch_add(1, Ordering::SeqCst);
        let hdr = match RequestHeader::from_bytes(data) {
            Ok(h) => h,
            Err(_) => return -1,
        };
        match hdr.id {
            REQ_TX_RX => {
                conn.response_send(response_of(RES_TX_RX).as_bytes())
                    .expect("response_send");
                if self.fc_after_first {
                    self.fc_after_first = false;
                    conn.request_rate_limit(RateLimit::Off);
                }
            }
            REQ_DISPATCH => {
                conn.event_send(response_of(RES_DISPATCH).as_bytes())
                    .expect("event_send");
            }
            REQ_BURST => {
                for i in 0..3 {
                    conn.event_send(response_of(100 + i).as_bytes())
                        .expect("event_send");
                }
                for i in 0..2 {
                    conn.response_send(response_of(200 + i).as_bytes())
                        .expect("response_send");
                }
            }
            REQ_COUNT => {}
            _ => return -1,
        }
        0
    }

    fn connection_destroyed(&mut self, _conn: &mut Conn<'_>) {
        self.counters.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

fn connect_with_retry(name: &str, max_msg_size: usize) -> Result<IpcClient, Error> {
    let mut last = Error::Again;
    for _ in 0..50 {
        match IpcClient::connect(name, max_msg_size) {
            Ok(c) => return Ok(c),
            Err(e) if e.is_terminal() => return Err(e),
            Err(e) => last = e,
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    Err(last)
}

fn recv_response(client: &mut IpcClient) -> ResponseHeader {
    let mut buf = [0u8; 64];
    let n = client.recv(&mut buf, 5000).expect("recv response");
    assert_eq!(n, std::mem::size_of::<ResponseHeader>());
    ResponseHeader::from_bytes(&buf).expect("parse response")
}

fn send_and_check(client: &mut IpcClient, payload: usize) -> Result<(), Error> {
    let frame = request_frame(REQ_TX_RX, REQ_HEADER_SIZE + payload);
    let mut tries = 0;
    loop {
        match client.send(&frame) {
            Ok(_) => break,
            Err(Error::Again) if tries < 10 => {
                tries += 1;
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e),
        }
    }
    let res = recv_response(client);
    assert_eq!(res.id, RES_TX_RX);
    assert_eq!(res.size as usize, std::mem::size_of::<ResponseHeader>());
    assert_eq!(res.error, 0);
    Ok(())
}

fn wait_for(pred: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    pred()
}

fn txrx_ladder(kind: IpcKind, max_msg_size: usize) {
    let name = unique_name("ipc_txrx");
    let counters = Arc::new(Counters::default());
    let c2 = Arc::clone(&counters);
    let _guard = start_server(&name, kind, move || EchoService::new(c2));

    let mut client = connect_with_retry(&name, max_msg_size).expect("connect");
    assert_eq!(client.max_msg_size(), max_msg_size);

    // 17 frames walking the size ladder up to the largest that fits.
    let mut size = 64usize;
    let mut sent = 0;
    while sent < 17 {
        send_and_check(&mut client, size).expect("txrx");
        sent += 1;
        if size * 2 + REQ_HEADER_SIZE <= max_msg_size {
            size *= 2;
        }
    }
    assert_eq!(counters.processed.load(Ordering::SeqCst), 17);

    client.disconnect();
    assert!(wait_for(
        || counters.destroyed.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));
}

#[test]
fn txrx_shm() {
    txrx_ladder(IpcKind::Shm, MAX_MSG_SIZE);
}

#[test]
fn txrx_socket() {
    txrx_ladder(IpcKind::Socket, MAX_MSG_SIZE);
}

#[test]
fn txrx_sysv_mq() {
    // SysV queue capacity is limited; keep frames small.
    let name = unique_name("ipc_txrx_smq");
    let counters = Arc::new(Counters::default());
    let c2 = Arc::clone(&counters);
    let _guard = start_server(&name, IpcKind::SysvMq, move || EchoService::new(c2));

    let mut client = connect_with_retry(&name, 4096).expect("connect");
    for payload in [64usize, 128, 1024] {
        send_and_check(&mut client, payload).expect("txrx");
    }
    assert_eq!(counters.processed.load(Ordering::SeqCst), 3);
    client.disconnect();
    assert!(wait_for(
        || counters.destroyed.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));
}

#[cfg(target_os = "linux")]
#[test]
fn txrx_posix_mq() {
    // Default kernel limits cap mq_msgsize well below the shm ladder.
    let name = unique_name("ipc_txrx_pmq");
    let counters = Arc::new(Counters::default());
    let c2 = Arc::clone(&counters);
    let _guard = start_server(&name, IpcKind::PosixMq, move || EchoService::new(c2));

    let mut client = match connect_with_retry(&name, 4096) {
        Ok(c) => c,
        // Hosts with mqueue disabled or exhausted refuse at setup.
        Err(_) => return,
    };
    for payload in [64usize, 512, 2048] {
        send_and_check(&mut client, payload).expect("txrx");
    }
    client.disconnect();
    assert!(wait_for(
        || counters.destroyed.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));
}

#[test]
fn flow_control_pauses_requests() {
    let name = unique_name("ipc_fc");
    let counters = Arc::new(Counters::default());
    let c2 = Arc::clone(&counters);
    let _guard = start_server(&name, IpcKind::Shm, move || {
        let mut s = EchoService::new(c2);
        s.fc_after_first = true;
        s
    });

    let mut client = connect_with_retry(&name, MAX_MSG_SIZE).expect("connect");

    // First exchange succeeds and flips the service to RATE_OFF.
    send_and_check(&mut client, 64).expect("first txrx");

    // With the request descriptor paused the ring fills and sends
    // start failing with Again within a bounded number of retries.
    let frame = request_frame(REQ_TX_RX, REQ_HEADER_SIZE + 8192);
    let mut fc_enabled = false;
    'outer: for _ in 0..60 {
        let mut tries = 0;
        loop {
            match client.send(&frame) {
                Ok(_) => break,
                Err(Error::Again) => {
                    tries += 1;
                    if tries >= 10 {
                        fc_enabled = true;
                        break 'outer;
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("send failed: {e}"),
            }
        }
    }
    assert!(fc_enabled);
    assert_eq!(counters.processed.load(Ordering::SeqCst), 1);
}

#[test]
fn dispatch_reply_arrives_on_event_channel() {
    let name = unique_name("ipc_disp");
    let counters = Arc::new(Counters::default());
    let c2 = Arc::clone(&counters);
    let _guard = start_server(&name, IpcKind::Shm, move || EchoService::new(c2));

    let mut client = connect_with_retry(&name, MAX_MSG_SIZE).expect("connect");
    client
        .send(&request_frame(REQ_DISPATCH, REQ_HEADER_SIZE))
        .expect("send dispatch");

    let mut buf = [0u8; 64];
    let n = client.event_recv(&mut buf, 5000).expect("event_recv");
    assert_eq!(n, std::mem::size_of::<ResponseHeader>());
    let res = ResponseHeader::from_bytes(&buf).expect("parse");
    assert_eq!(res.id, RES_DISPATCH);
    assert_eq!(res.error, 0);

    // Exactly once: the channel is empty afterwards.
    assert!(matches!(
        client.event_recv(&mut buf, 200),
        Err(Error::TimedOut) | Err(Error::Again)
    ));
    client.disconnect();
}

#[test]
fn event_and_response_channels_are_independent() {
    let name = unique_name("ipc_both");
    let counters = Arc::new(Counters::default());
    let c2 = Arc::clone(&counters);
    let _guard = start_server(&name, IpcKind::Shm, move || EchoService::new(c2));

    let mut client = connect_with_retry(&name, MAX_MSG_SIZE).expect("connect");
    client
        .send(&request_frame(REQ_BURST, REQ_HEADER_SIZE))
        .expect("send burst");

    // Three events in their own FIFO order.
    let mut buf = [0u8; 64];
    for i in 0..3 {
        client.event_recv(&mut buf, 5000).expect("event_recv");
        let res = ResponseHeader::from_bytes(&buf).expect("parse");
        assert_eq!(res.id, 100 + i);
    }
    // Two responses in their own FIFO order.
    for i in 0..2 {
        let res = recv_response(&mut client);
        assert_eq!(res.id, 200 + i);
    }
    client.disconnect();
}

struct RejectingService {
    counters: Arc<Counters>,
}

impl ServiceHandlers for RejectingService {
    fn connection_accept(&mut self, _uid: u32, _gid: u32) -> ringbus::Result<()> {
        Err(Error::Acces)
    }

    fn connection_created(&mut self, _conn: &mut Conn<'_>) {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
    }

    fn msg_process(&mut self, _conn: &mut Conn<'_>, _data: &[u8]) -> i32 {
        0
    }
}

#[test]
fn rejected_credentials_refuse_the_connection() {
    let name = unique_name("ipc_auth");
    let counters = Arc::new(Counters::default());
    let c2 = Arc::clone(&counters);
    let _guard = start_server(&name, IpcKind::Shm, move || RejectingService {
        counters: c2,
    });

    match IpcClient::connect(&name, MAX_MSG_SIZE) {
        Err(Error::Acces) => {}
        other => panic!("expected Acces, got {other:?}", other = other.map(|_| ())),
    }
    // No connection was ever created.
    assert_eq!(counters.created.load(Ordering::SeqCst), 0);
}

#[test]
fn disconnect_mid_queue_drains_then_destroys_once() {
    let name = unique_name("ipc_hup");
    let counters = Arc::new(Counters::default());
    let c2 = Arc::clone(&counters);
    let _guard = start_server(&name, IpcKind::Shm, move || EchoService::new(c2));

    let mut client = connect_with_retry(&name, MAX_MSG_SIZE).expect("connect");
    const QUEUED: usize = 5;
    for _ in 0..QUEUED {
        client
            .send(&request_frame(REQ_COUNT, REQ_HEADER_SIZE + 128))
            .expect("send");
    }
    // Drop without a clean disconnect: the server must still drain the
    // queued requests, observe the hangup, and destroy exactly once.
    drop(client);

    assert!(wait_for(
        || counters.processed.load(Ordering::SeqCst) == QUEUED,
        Duration::from_secs(5)
    ));
    assert!(wait_for(
        || counters.destroyed.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn clean_disconnect_destroys_once() {
    let name = unique_name("ipc_bye");
    let counters = Arc::new(Counters::default());
    let c2 = Arc::clone(&counters);
    let _guard = start_server(&name, IpcKind::Shm, move || EchoService::new(c2));

    let client = connect_with_retry(&name, MAX_MSG_SIZE).expect("connect");
    assert!(wait_for(
        || counters.created.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));
    client.disconnect();

    assert!(wait_for(
        || counters.destroyed.load(Ordering::SeqCst) == 1,
        Duration::from_secs(5)
    ));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(counters.destroyed.load(Ordering::SeqCst), 1);
}
