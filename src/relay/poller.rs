// src/relay/poller.rs - IO multiplexer
//
// Provides a unified readiness abstraction over:
// - Linux: epoll
// - macOS/BSD: kqueue
//
// Design principles:
// - Level-triggered on every platform: a descriptor with unread data is
//   reported again on the next poll, so callbacks may stop early
// - EINTR auto-retry
// - Tokens are opaque u64 values chosen by the caller

use std::io;
use std::time::Duration;

const MAX_EVENTS: usize = 256;

/// Event interest flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };

    #[cfg(test)]
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub fn add_writable(self) -> Interest {
        Interest {
            writable: true,
            ..self
        }
    }
}

/// IO event
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn is_hangup(&self) -> bool {
        self.hangup
    }
}

fn timeout_ms(timeout: Option<Duration>) -> i32 {
    timeout
        .map(|d| d.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1)
}

// ============================================================================
// Platform-specific implementations
// ============================================================================

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::os::unix::io::RawFd;

    pub struct Poller {
        epfd: RawFd,
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            // SAFETY: epoll_create1 takes no pointers; the result is checked
            // before use.
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Poller { epfd })
        }

        fn ctl(&mut self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            let mut event = libc::epoll_event {
                events: interest_to_epoll(interest),
                u64: token,
            };
            // SAFETY: self.epfd is owned by self, `event` is a valid stack value
            // and the caller guarantees `fd` is open.
            let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut event) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
        }

        pub fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
        }

        pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
            // SAFETY: a null event is accepted for EPOLL_CTL_DEL since 2.6.9
            let ret = unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timeout_ms = timeout_ms(timeout);
            let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

            loop {
                // SAFETY: `events` is writable for MAX_EVENTS entries and
                // self.epfd is owned by self.
                let ret = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
                };

                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }

                let ready = &events[..ret as usize];
                return Ok(ready
                    .iter()
                    .map(|ev| {
                        let flags = ev.events as libc::c_int;
                        Event {
                            token: ev.u64,
                            readable: flags & libc::EPOLLIN != 0,
                            writable: flags & libc::EPOLLOUT != 0,
                            error: flags & libc::EPOLLERR != 0,
                            hangup: flags & libc::EPOLLHUP != 0,
                        }
                    })
                    .collect());
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            // SAFETY: self.epfd is owned exclusively by self and closed only here
            unsafe { libc::close(self.epfd) };
        }
    }

    fn interest_to_epoll(interest: Interest) -> u32 {
        let mut events = 0;
        if interest.readable {
            events |= libc::EPOLLIN;
        }
        if interest.writable {
            events |= libc::EPOLLOUT;
        }
        events as u32
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod bsd {
    use super::*;
    use std::collections::HashMap;
    use std::os::unix::io::RawFd;

    pub struct Poller {
        kq: RawFd,
    }

    fn change(fd: RawFd, filter: i16, flags: u16, token: u64) -> libc::kevent {
        // SAFETY: kevent is plain data; all-zero is a valid empty change
        let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
        ev.ident = fd as libc::uintptr_t;
        ev.filter = filter;
        ev.flags = flags;
        ev.udata = token as usize as *mut libc::c_void;
        ev
    }

    impl Poller {
        pub fn new() -> io::Result<Self> {
            // SAFETY: kqueue takes no arguments; the result is checked before use
            let kq = unsafe { libc::kqueue() };
            if kq < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Poller { kq })
        }

        fn submit(&mut self, changes: &[libc::kevent]) -> io::Result<()> {
            // SAFETY: `changes` is a valid array of its length; no event list
            // and no timeout are passed, so this only applies changes.
            let ret = unsafe {
                libc::kevent(
                    self.kq,
                    changes.as_ptr(),
                    changes.len() as libc::c_int,
                    std::ptr::null_mut(),
                    0,
                    std::ptr::null(),
                )
            };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Both filters always exist; unwanted ones are kept disabled.
        fn apply(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            let toggle = |wanted: bool| {
                if wanted {
                    libc::EV_ADD | libc::EV_ENABLE
                } else {
                    libc::EV_ADD | libc::EV_DISABLE
                }
            };
            let changes = [
                change(fd, libc::EVFILT_READ, toggle(interest.readable), token),
                change(fd, libc::EVFILT_WRITE, toggle(interest.writable), token),
            ];
            self.submit(&changes)
        }

        pub fn register(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            self.apply(fd, token, interest)
        }

        pub fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
            self.apply(fd, token, interest)
        }

        pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
            let changes = [
                change(fd, libc::EVFILT_READ, libc::EV_DELETE, 0),
                change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0),
            ];
            self.submit(&changes)
        }

        pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Event>> {
            let timespec = timeout.map(|d| libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            });
            let timeout_ptr = timespec
                .as_ref()
                .map(|t| t as *const libc::timespec)
                .unwrap_or(std::ptr::null());

            // SAFETY: kevent is plain data; the array is overwritten by kevent()
            let mut events: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };

            loop {
                // SAFETY: `events` is writable for MAX_EVENTS entries and
                // timeout_ptr is either null or points at `timespec`.
                let ret = unsafe {
                    libc::kevent(
                        self.kq,
                        std::ptr::null(),
                        0,
                        events.as_mut_ptr(),
                        MAX_EVENTS as libc::c_int,
                        timeout_ptr,
                    )
                };

                if ret < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }

                // kqueue reports read and write separately; merge them per token
                let mut merged: HashMap<u64, Event> = HashMap::new();
                for ev in &events[..ret as usize] {
                    let token = ev.udata as usize as u64;
                    let entry = merged.entry(token).or_insert(Event {
                        token,
                        readable: false,
                        writable: false,
                        error: false,
                        hangup: false,
                    });
                    if ev.filter == libc::EVFILT_READ {
                        entry.readable = true;
                    } else if ev.filter == libc::EVFILT_WRITE {
                        entry.writable = true;
                    }
                    if ev.flags & libc::EV_ERROR != 0 {
                        entry.error = true;
                    }
                    if ev.flags & libc::EV_EOF != 0 {
                        entry.hangup = true;
                    }
                }
                return Ok(merged.into_values().collect());
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            // SAFETY: self.kq is owned exclusively by self and closed only here
            unsafe { libc::close(self.kq) };
        }
    }
}

// ============================================================================
// Re-export platform-specific implementation
// ============================================================================

#[cfg(target_os = "linux")]
pub use linux::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use bsd::Poller;

// ============================================================================
// Tests
// ============================================================================
