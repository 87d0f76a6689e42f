// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! macOS/BSD kqueue backend.
//!
//! Same shape as the epoll backend: fd map under a read-write lock,
//! callbacks collected under the read lock and dispatched outside it,
//! wake pipe watched for dispatch-less wakeups. Read and write interest
//! are separate kqueue filters, so registration installs up to two
//! kevents per fd.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::wake::WakePipe;
use crate::{Events, IoCallback, PollError, Poller, MAX_FD};

struct Registration {
    events: Events,
    cb: IoCallback,
}

/// Kqueue-backed poller.
pub struct KqueuePoller {
    kq: RawFd,
    wake: WakePipe,
    fds: RwLock<HashMap<RawFd, Registration>>,
    closed: AtomicBool,
}

impl KqueuePoller {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake = match WakePipe::new() {
            Ok(w) => w,
            Err(e) => {
                unsafe { libc::close(kq) };
                return Err(e);
            }
        };

        let poller = Self {
            kq,
            wake,
            fds: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        };

        poller
            .apply(poller.wake.read_fd(), libc::EVFILT_READ, libc::EV_ADD)
            .map_err(|e| match e {
                PollError::Os(err) => err,
                other => io::Error::new(io::ErrorKind::Other, other.to_string()),
            })?;

        Ok(poller)
    }

    fn apply(&self, fd: RawFd, filter: i16, flags: u16) -> Result<(), PollError> {
        let change = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        let ret = unsafe { libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null()) };
        if ret < 0 {
            return Err(PollError::Os(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn apply_mask(&self, fd: RawFd, events: Events) -> Result<(), PollError> {
        if events.contains(Events::READABLE) {
            self.apply(fd, libc::EVFILT_READ, libc::EV_ADD)?;
        } else {
            // Deleting an absent filter is fine.
            let _ = self.apply(fd, libc::EVFILT_READ, libc::EV_DELETE);
        }
        if events.contains(Events::WRITABLE) {
            self.apply(fd, libc::EVFILT_WRITE, libc::EV_ADD)?;
        } else {
            let _ = self.apply(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        }
        Ok(())
    }

    fn check_open(&self) -> Result<(), PollError> {
        if self.closed.load(Ordering::Acquire) {
            Err(PollError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Poller for KqueuePoller {
    fn register_fd(&self, fd: RawFd, events: Events, cb: IoCallback) -> Result<(), PollError> {
        self.check_open()?;
        if !(0..MAX_FD).contains(&fd) {
            return Err(PollError::FdOutOfRange(fd));
        }

        let mut fds = self.fds.write().unwrap();
        if fds.contains_key(&fd) {
            return Err(PollError::AlreadyRegistered(fd));
        }

        self.apply_mask(fd, events)?;
        fds.insert(fd, Registration { events, cb });
        Ok(())
    }

    fn unregister_fd(&self, fd: RawFd) -> Result<(), PollError> {
        let mut fds = self.fds.write().unwrap();
        if fds.remove(&fd).is_none() {
            return Err(PollError::NotRegistered(fd));
        }
        // Filter removal failures are expected when the fd was closed.
        let _ = self.apply(fd, libc::EVFILT_READ, libc::EV_DELETE);
        let _ = self.apply(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        Ok(())
    }

    fn modify_fd(&self, fd: RawFd, events: Events) -> Result<(), PollError> {
        self.check_open()?;

        let mut fds = self.fds.write().unwrap();
        let reg = fds.get_mut(&fd).ok_or(PollError::NotRegistered(fd))?;
        self.apply_mask(fd, events)?;
        reg.events = events;
        Ok(())
    }

    fn poll_io(&self, timeout_ms: i32) -> Result<usize, PollError> {
        self.check_open()?;

        const MAX_EVENTS: usize = 64;
        let mut events: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };

        let ts;
        let timeout = if timeout_ms < 0 {
            ptr::null()
        } else {
            ts = libc::timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };
            &ts as *const libc::timespec
        };

        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(PollError::Os(err));
        }

        let mut ready: Vec<(IoCallback, Events)> = Vec::new();

        {
            let fds = self.fds.read().unwrap();
            for event in events.iter().take(n as usize) {
                let fd = event.ident as RawFd;
                if fd == self.wake.read_fd() {
                    self.wake.drain();
                    continue;
                }
                let Some(reg) = fds.get(&fd) else { continue };

                let mut revents = Events::NONE;
                if event.filter == libc::EVFILT_READ {
                    revents |= Events::READABLE;
                }
                if event.filter == libc::EVFILT_WRITE {
                    revents |= Events::WRITABLE;
                }
                if event.flags & libc::EV_EOF != 0 {
                    revents |= Events::HUP;
                }
                if event.flags & libc::EV_ERROR != 0 {
                    revents |= Events::ERROR;
                }
                ready.push((reg.cb.clone(), revents));
            }
        }

        let dispatched = ready.len();
        for (cb, revents) in ready {
            cb(revents);
        }

        Ok(dispatched)
    }

    fn wakeup(&self) {
        self.wake.notify();
    }

    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.wake.notify();
        }
    }

    fn registered_count(&self) -> usize {
        self.fds.read().unwrap().len()
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
