// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 ringbus contributors
//
// The ring buffer's embedded synchronisation: a lock guarding multi-word
// header mutations and a counting semaphore the reader blocks on.
//
// Where the platform offers process-shared POSIX primitives (Linux) both
// live inside the shared header: a pthread spinlock and an unnamed sem_t.
// Elsewhere both fall back to System V semaphores keyed off the header
// file path, with the lock realised as a wait-for-zero mutex.

use crate::error::{Error, Result};
use crate::rb::Flags;

#[cfg(target_os = "linux")]
#[repr(C)]
pub(crate) struct SharedSync {
    sem: libc::sem_t,
    lock: libc::pthread_spinlock_t,
}

#[cfg(not(target_os = "linux"))]
#[repr(C)]
pub(crate) struct SharedSync {
    // SysV ids are process-local; nothing lives in the shared header.
    _unused: [u8; 8],
}

pub(crate) struct RbSync {
    shared: *mut SharedSync,
    process_shared: bool,
    #[cfg(not(target_os = "linux"))]
    sem_id: i32,
    #[cfg(not(target_os = "linux"))]
    lock_id: i32,
}

// The shared header is mapped process-shared by construction.
unsafe impl Send for RbSync {}

impl RbSync {
    /// Initialise (CREATE) or attach to the primitives embedded at
    /// `shared`. `hdr_path` and `word_size` seed the SysV keys on
    /// platforms without process-shared POSIX primitives.
    pub(crate) fn new(
        shared: *mut SharedSync,
        hdr_path: &str,
        word_size: u32,
        flags: Flags,
    ) -> Result<Self> {
        let process_shared = flags.contains(Flags::SHARED_PROCESS);

        #[cfg(target_os = "linux")]
        {
            let _ = (hdr_path, word_size);
            let me = Self {
                shared,
                process_shared,
            };
            if process_shared && flags.contains(Flags::CREATE) {
                let pshared = 1;
                if unsafe { libc::sem_init(std::ptr::addr_of_mut!((*shared).sem), pshared, 0) } != 0 {
                    return Err(Error::last_os());
                }
                let eno = unsafe {
                    libc::pthread_spin_init(std::ptr::addr_of_mut!((*shared).lock), libc::PTHREAD_PROCESS_SHARED)
                };
                if eno != 0 {
                    return Err(std::io::Error::from_raw_os_error(eno).into());
                }
            }
            Ok(me)
        }

        #[cfg(not(target_os = "linux"))]
        {
            if !process_shared {
                return Ok(Self {
                    shared,
                    process_shared,
                    sem_id: -1,
                    lock_id: -1,
                });
            }
            let lock_id = sysv_sem(hdr_path, word_size as i32, flags)?;
            let sem_id = sysv_sem(hdr_path, word_size as i32 + 1, flags)?;
            Ok(Self {
                shared,
                process_shared,
                sem_id,
                lock_id,
            })
        }
    }

    pub(crate) fn lock(&self) -> Result<()> {
        if !self.process_shared {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        {
            let eno = unsafe { libc::pthread_spin_lock(std::ptr::addr_of_mut!((*self.shared).lock)) };
            if eno != 0 {
                return Err(std::io::Error::from_raw_os_error(eno).into());
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            // Atomically wait for zero then increment.
            let mut sops = [
                libc::sembuf {
                    sem_num: 0,
                    sem_op: 0,
                    sem_flg: 0,
                },
                libc::sembuf {
                    sem_num: 0,
                    sem_op: 1,
                    sem_flg: 0,
                },
            ];
            loop {
                if unsafe { libc::semop(self.lock_id, sops.as_mut_ptr(), 2) } == 0 {
                    return Ok(());
                }
                let e = Error::last_os();
                if !matches!(&e, Error::Io(io) if io.raw_os_error() == Some(libc::EINTR)) {
                    log::error!("could not lock ring: {e}");
                    return Err(e);
                }
            }
        }
    }

    pub(crate) fn unlock(&self) -> Result<()> {
        if !self.process_shared {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        {
            let eno = unsafe { libc::pthread_spin_unlock(std::ptr::addr_of_mut!((*self.shared).lock)) };
            if eno != 0 {
                return Err(std::io::Error::from_raw_os_error(eno).into());
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let mut sop = libc::sembuf {
                sem_num: 0,
                sem_op: -1,
                sem_flg: libc::IPC_NOWAIT as libc::c_short,
            };
            loop {
                if unsafe { libc::semop(self.lock_id, &mut sop, 1) } == 0 {
                    return Ok(());
                }
                let e = Error::last_os();
                if !matches!(&e, Error::Io(io) if io.raw_os_error() == Some(libc::EINTR)) {
                    log::error!("could not unlock ring: {e}");
                    return Err(e);
                }
            }
        }
    }

    /// One count per committed chunk.
    pub(crate) fn post(&self) -> Result<()> {
        if !self.process_shared {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        {
            if unsafe { libc::sem_post(std::ptr::addr_of_mut!((*self.shared).sem)) } != 0 {
                return Err(Error::last_os());
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let mut sop = libc::sembuf {
                sem_num: 0,
                sem_op: 1,
                sem_flg: 0,
            };
            loop {
                if unsafe { libc::semop(self.sem_id, &mut sop, 1) } == 0 {
                    return Ok(());
                }
                let e = Error::last_os();
                if !matches!(&e, Error::Io(io) if io.raw_os_error() == Some(libc::EINTR)) {
                    log::error!("could not increment semaphore: {e}");
                    return Err(e);
                }
            }
        }
    }

    /// Wait for one count. `ms` follows the engine-wide convention:
    /// negative waits forever, zero polls, positive bounds the wait.
    /// Returns `TimedOut` when the bound expires.
    pub(crate) fn timed_wait(&self, ms: i32) -> Result<()> {
        if !self.process_shared {
            return Ok(());
        }
        #[cfg(target_os = "linux")]
        {
            let sem = unsafe { std::ptr::addr_of_mut!((*self.shared).sem) };
            loop {
                let res = if ms < 0 {
                    unsafe { libc::sem_wait(sem) }
                } else {
                    let ts = crate::sys::abs_timeout(ms);
                    unsafe { libc::sem_timedwait(sem, &ts) }
                };
                if res == 0 {
                    return Ok(());
                }
                match std::io::Error::last_os_error().raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::ETIMEDOUT) => return Err(Error::TimedOut),
                    _ => return Err(Error::last_os()),
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            // No semtimedop here: poll with IPC_NOWAIT and back off.
            let deadline = if ms < 0 {
                None
            } else {
                Some(std::time::Instant::now() + std::time::Duration::from_millis(ms as u64))
            };
            let mut sop = libc::sembuf {
                sem_num: 0,
                sem_op: -1,
                sem_flg: libc::IPC_NOWAIT as libc::c_short,
            };
            let mut k = 0u32;
            loop {
                if unsafe { libc::semop(self.sem_id, &mut sop, 1) } == 0 {
                    return Ok(());
                }
                match std::io::Error::last_os_error().raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => {
                        if let Some(d) = deadline {
                            if std::time::Instant::now() >= d {
                                return Err(Error::TimedOut);
                            }
                        }
                        crate::transport::adaptive_yield(&mut k);
                    }
                    _ => return Err(Error::last_os()),
                }
            }
        }
    }

    /// Tear down the primitives. Only the last detacher calls this.
    pub(crate) fn destroy(&self) {
        if !self.process_shared {
            return;
        }
        #[cfg(target_os = "linux")]
        unsafe {
            libc::sem_destroy(std::ptr::addr_of_mut!((*self.shared).sem));
            libc::pthread_spin_destroy(std::ptr::addr_of_mut!((*self.shared).lock));
        }
        #[cfg(not(target_os = "linux"))]
        unsafe {
            libc::semctl(self.sem_id, 0, libc::IPC_RMID);
            libc::semctl(self.lock_id, 0, libc::IPC_RMID);
        }
    }
}

/// Get (open) or create a single SysV semaphore keyed off the header
/// file path and a small per-primitive discriminator.
#[cfg(not(target_os = "linux"))]
fn sysv_sem(hdr_path: &str, proj: i32, flags: Flags) -> Result<i32> {
    let c = std::ffi::CString::new(hdr_path).map_err(|_| Error::Invalid)?;
    let key = unsafe { libc::ftok(c.as_ptr(), proj) };
    if key == -1 {
        let e = Error::last_os();
        log::error!("couldn't derive a semaphore key from {hdr_path}: {e}");
        return Err(e);
    }
    if flags.contains(Flags::CREATE) {
        let id = unsafe { libc::semget(key, 1, libc::IPC_CREAT | libc::IPC_EXCL | 0o600) };
        if id == -1 {
            let e = Error::last_os();
            log::error!("couldn't create a semaphore: {e}");
            return Err(e);
        }
        if unsafe { libc::semctl(id, 0, libc::SETVAL, 0) } == -1 {
            return Err(Error::last_os());
        }
        Ok(id)
    } else {
        let id = unsafe { libc::semget(key, 0, 0o600) };
        if id == -1 {
            let e = Error::last_os();
            log::error!("couldn't get a semaphore id: {e}");
            return Err(e);
        }
        Ok(id)
    }
}
