// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// Test scaffolding: a minimal poll(2)-based dispatch loop implementing
// the injected poll-handler interface, plus a helper that runs a
// service on its own thread until the test is done with it.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use ringbus::{DispatchFn, IpcKind, IpcServer, PollHandlers, Priority, Result, ServiceHandlers};

static NAME_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Service names unique across tests and test binaries.
pub fn unique_name(prefix: &str) -> String {
    let n = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    format!("{prefix}_{pid}_{n}")
}

struct Entry {
    fd: i32,
    events: Cell<i16>,
    _priority: Cell<Priority>,
    dead: Cell<bool>,
    f: RefCell<Option<DispatchFn>>,
}

/// Single-threaded poll loop. Registrations may be modified or removed
/// from inside a running dispatch callback (entries are tombstoned and
/// compacted between passes).
#[derive(Clone, Default)]
pub struct TestLoop {
    entries: Rc<RefCell<Vec<Rc<Entry>>>>,
}

impl TestLoop {
    pub fn new() -> TestLoop {
        TestLoop::default()
    }

    /// One poll pass. Returns the number of callbacks dispatched.
    pub fn run_once(&self, timeout_ms: i32) -> usize {
        self.entries.borrow_mut().retain(|e| !e.dead.get());
        let live: Vec<Rc<Entry>> = self.entries.borrow().clone();
        if live.is_empty() {
            std::thread::sleep(std::time::Duration::from_millis(timeout_ms.max(0) as u64));
            return 0;
        }

        let mut pfds: Vec<libc::pollfd> = live
            .iter()
            .map(|e| libc::pollfd {
                fd: e.fd,
                events: e.events.get(),
                revents: 0,
            })
            .collect();
        let n = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
        if n <= 0 {
            return 0;
        }

        let mut dispatched = 0;
        for (entry, pfd) in live.iter().zip(pfds.iter()) {
            if entry.dead.get() || pfd.revents == 0 {
                continue;
            }
            if pfd.revents & libc::POLLNVAL != 0 {
                entry.dead.set(true);
                continue;
            }
            let taken = entry.f.borrow_mut().take();
            if let Some(mut f) = taken {
                let rc = f(entry.fd, pfd.revents);
                if entry.f.borrow().is_none() {
                    *entry.f.borrow_mut() = Some(f);
                }
                if rc < 0 {
                    entry.dead.set(true);
                }
                dispatched += 1;
            }
        }
        dispatched
    }
}

impl PollHandlers for TestLoop {
    fn dispatch_add(&mut self, p: Priority, fd: i32, events: i16, f: DispatchFn) -> Result<()> {
        self.entries.borrow_mut().push(Rc::new(Entry {
            fd,
            events: Cell::new(events),
            _priority: Cell::new(p),
            dead: Cell::new(false),
            f: RefCell::new(Some(f)),
        }));
        Ok(())
    }

    fn dispatch_mod(&mut self, p: Priority, fd: i32, events: i16) -> Result<()> {
        for e in self.entries.borrow().iter() {
            if !e.dead.get() && e.fd == fd {
                e._priority.set(p);
                e.events.set(events);
            }
        }
        Ok(())
    }

    fn dispatch_del(&mut self, fd: i32) -> Result<()> {
        for e in self.entries.borrow().iter() {
            if e.fd == fd {
                e.dead.set(true);
            }
        }
        Ok(())
    }
}

/// A service running on its own thread, torn down on drop.
pub struct ServerGuard {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ServerGuard {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn a service named `name` with handlers built by `make` and
/// drive it with a [`TestLoop`] until the guard is dropped.
pub fn start_server<H, F>(name: &str, kind: IpcKind, make: F) -> ServerGuard
where
    H: ServiceHandlers + 'static,
    F: FnOnce() -> H + Send + 'static,
{
    let _ = env_logger::builder().is_test(true).try_init();
    let name = name.to_string();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_seen = Arc::clone(&stop);
    let (ready_tx, ready_rx) = mpsc::channel();

    let thread = std::thread::spawn(move || {
        let lp = TestLoop::new();
        let server = IpcServer::new(&name, 4, kind, Box::new(make())).expect("create service");
        server.poll_handlers_set(Box::new(lp.clone()));
        server.run().expect("run service");
        ready_tx.send(()).expect("signal ready");
        while !stop_seen.load(Ordering::Acquire) {
            lp.run_once(20);
        }
        server.destroy();
    });

    ready_rx.recv().expect("server thread died during setup");
    ServerGuard {
        stop,
        thread: Some(thread),
    }
}
