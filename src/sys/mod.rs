//! Thin wrappers over the raw OS surface: selector, wake primitive and
//! socket syscalls. Everything above this module works with typed
//! [`crate::poller`] values, never with `libc` directly.

use std::io;

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)? )) => {{
        let res = unsafe { libc::$fn($($arg),*) };
        if res < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

mod fd;
pub(crate) mod socket;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
mod eventfd;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;

pub(crate) use fd::FileDesc;

#[cfg(target_os = "linux")]
pub(crate) use epoll::{Events as SysEvents, Selector};
#[cfg(target_os = "linux")]
pub(crate) use eventfd::WakeFd;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) use kqueue::{Events as SysEvents, Selector, WakeFd};

/// Retries `f` while it fails with `EINTR`.
pub(crate) fn retry_intr<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
