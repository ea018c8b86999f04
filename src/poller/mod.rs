//! Backend-neutral polling: an edge-triggered selector (`epoll` on
//! Linux, `kqueue` on the BSDs) plus a cross-thread [`Waker`].
//!
//! Edge semantics put one obligation on the caller: after a readiness
//! event, keep reading or writing until `WouldBlock`, or the edge is
//! lost until the peer produces another transition.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crate::sys;

pub use self::event::{Event, Events};
pub use self::ready::Ready;

mod event;
mod ready;

/// Token reserved for the poller's own wake fd; never assigned to a
/// connection.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Identifies which descriptor an event belongs to.
///
/// The reactor registers every socket under its own fd index, so the
/// connection table resolves a token with an array lookup (and the
/// slot's generation check, not the token, decides which logical
/// connection it is). The one value that is not an fd is
/// [`WAKE_TOKEN`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub usize);

impl Token {
    pub fn from_fd(fd: RawFd) -> Token {
        Token(fd as usize)
    }

    /// The fd this token was registered under; meaningless for
    /// [`WAKE_TOKEN`].
    pub fn fd(self) -> RawFd {
        self.0 as RawFd
    }
}

/// One poller per process. Each worker owns its own instance; the
/// supervisor rebuilds it in the child after every fork.
pub struct Poller {
    sel: sys::Selector,
    wake: Arc<sys::WakeFd>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let sel = sys::Selector::new()?;
        let wake = Arc::new(sys::WakeFd::new()?);
        sel.add(wake.as_raw_fd(), WAKE_TOKEN, Ready::readable())?;

        Ok(Poller { sel, wake })
    }

    /// Registers `fd` for the given interest, edge-triggered.
    pub fn add(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.sel.add(fd, token, interest)
    }

    pub fn modify(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        self.sel.modify(fd, token, interest)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.sel.delete(fd)
    }

    /// Blocks until at least one event arrives, the timeout elapses or a
    /// signal interrupts the wait (reported as `Ok(0)`).
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        match self.sel.wait(&mut events.inner, timeout) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// A cheap cloneable handle that makes a blocked [`wait`](Self::wait)
    /// return.
    pub fn waker(&self) -> Waker {
        Waker {
            inner: self.wake.clone(),
        }
    }

    /// Resets the wake fd after a [`WAKE_TOKEN`] event.
    pub fn drain_wake(&self) {
        self.wake.drain();
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.sel.as_raw_fd()
    }
}

#[derive(Clone)]
pub struct Waker {
    inner: Arc<sys::WakeFd>,
}

impl Waker {
    pub fn wake(&self) -> io::Result<()> {
        self.inner.notify()
    }
}

#[cfg(test)]
mod tests {
    use super::{Events, Poller, WAKE_TOKEN};
    use std::time::Duration;

    #[test]
    fn waker_interrupts_wait() {
        let poller = Poller::new().unwrap();
        let waker = poller.waker();
        let mut events = Events::with_capacity(8);

        waker.wake().unwrap();

        let n = poller.wait(&mut events, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events.get(0).unwrap().token(), WAKE_TOKEN);

        poller.drain_wake();
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
    }
}
