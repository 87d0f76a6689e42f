// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Linux epoll backend.
//!
//! Level-triggered epoll. Registered fds map to callbacks; the wake
//! pipe's read end is watched alongside them and produces a
//! dispatch-less return from `poll_io`.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::wake::WakePipe;
use crate::{Events, IoCallback, PollError, Poller, MAX_FD};

fn to_epoll(events: Events) -> u32 {
    let mut mask = 0u32;
    if events.contains(Events::READABLE) {
        mask |= libc::EPOLLIN as u32;
    }
    if events.contains(Events::WRITABLE) {
        mask |= libc::EPOLLOUT as u32;
    }
    mask
}

fn from_epoll(mask: u32) -> Events {
    let mut events = Events::NONE;
    if mask & libc::EPOLLIN as u32 != 0 {
        events |= Events::READABLE;
    }
    if mask & libc::EPOLLOUT as u32 != 0 {
        events |= Events::WRITABLE;
    }
    if mask & libc::EPOLLERR as u32 != 0 {
        events |= Events::ERROR;
    }
    if mask & libc::EPOLLHUP as u32 != 0 {
        events |= Events::HUP;
    }
    events
}

struct Registration {
    events: Events,
    cb: IoCallback,
}

/// Epoll-backed poller.
pub struct EpollPoller {
    epoll_fd: RawFd,
    wake: WakePipe,
    /// fd → registration. Read-locked during dispatch collection so
    /// registration from other threads stays cheap.
    fds: RwLock<HashMap<RawFd, Registration>>,
    closed: AtomicBool,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake = match WakePipe::new() {
            Ok(w) => w,
            Err(e) => {
                unsafe { libc::close(epoll_fd) };
                return Err(e);
            }
        };

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake.read_fd() as u64,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake.read_fd(), &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        Ok(Self {
            epoll_fd,
            wake,
            fds: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<(), PollError> {
        if self.closed.load(Ordering::Acquire) {
            Err(PollError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Poller for EpollPoller {
    fn register_fd(&self, fd: RawFd, events: Events, cb: IoCallback) -> Result<(), PollError> {
        self.check_open()?;
        if !(0..MAX_FD).contains(&fd) {
            return Err(PollError::FdOutOfRange(fd));
        }

        let mut fds = self.fds.write().unwrap();
        if fds.contains_key(&fd) {
            return Err(PollError::AlreadyRegistered(fd));
        }

        let mut ev = libc::epoll_event {
            events: to_epoll(events),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Err(PollError::Os(io::Error::last_os_error()));
        }

        fds.insert(fd, Registration { events, cb });
        Ok(())
    }

    fn unregister_fd(&self, fd: RawFd) -> Result<(), PollError> {
        let mut fds = self.fds.write().unwrap();
        if fds.remove(&fd).is_none() {
            return Err(PollError::NotRegistered(fd));
        }

        let ret =
            unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // ENOENT / EBADF are expected if the fd was already closed.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) {
                return Err(PollError::Os(err));
            }
        }
        Ok(())
    }

    fn modify_fd(&self, fd: RawFd, events: Events) -> Result<(), PollError> {
        self.check_open()?;

        let mut fds = self.fds.write().unwrap();
        let reg = fds.get_mut(&fd).ok_or(PollError::NotRegistered(fd))?;

        let mut ev = libc::epoll_event {
            events: to_epoll(events),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
        if ret < 0 {
            return Err(PollError::Os(io::Error::last_os_error()));
        }

        reg.events = events;
        Ok(())
    }

    fn poll_io(&self, timeout_ms: i32) -> Result<usize, PollError> {
        self.check_open()?;

        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(PollError::Os(err));
        }

        // Collect callbacks under the read lock, dispatch after releasing
        // it. A callback may re-enter register/unregister; holding the
        // lock across dispatch would deadlock.
        let mut ready: Vec<(IoCallback, Events)> = Vec::new();

        {
            let fds = self.fds.read().unwrap();
            for event in events.iter().take(n as usize) {
                let fd = event.u64 as RawFd;
                if fd == self.wake.read_fd() {
                    self.wake.drain();
                    continue;
                }
                if let Some(reg) = fds.get(&fd) {
                    ready.push((reg.cb.clone(), from_epoll(event.events)));
                }
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
            // Release a poll that is currently blocked; it will observe
            // the closed flag on its next entry.
            self.wake.notify();
        }
    }

    fn registered_count(&self) -> usize {
        self.fds.read().unwrap().len()
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        let fds = self.fds.read().unwrap();
        for &fd in fds.keys() {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
        drop(fds);

        unsafe {
            libc::close(self.epoll_fd);
        }
        // The wake pipe closes its own fds on drop.
    }
}
