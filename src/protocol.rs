use std::io;
use std::os::unix::io::RawFd;

use crate::conn::ConnId;
use crate::reactor::Reactor;
use crate::sys::socket;

/// The capability set bound to a connection.
///
/// Callbacks for one connection never run concurrently: the reactor
/// holds that connection's task slot for the duration of a callback and
/// reschedules anything that arrives in the meantime, so an
/// implementation can be written as if it were single-threaded. It may
/// still run on a different thread from one callback to the next, hence
/// `Send`.
///
/// Inside a callback, [`Reactor`] methods never block; long work should
/// be moved off with [`Reactor::defer`] so the connection's other events
/// can proceed.
pub trait Protocol: Send {
    /// Tag reported in logs and introspection (for example `"http1"`).
    fn service(&self) -> &'static str {
        "raw"
    }

    /// Data is waiting on the socket. Edge-triggered delivery: read via
    /// [`Reactor::read`] until it reports `WouldBlock`, or the event is
    /// not re-delivered until more bytes arrive.
    fn on_data(&mut self, r: &Reactor, conn: ConnId);

    /// The outgoing queue just drained after having been non-empty.
    fn on_ready(&mut self, _r: &Reactor, _conn: ConnId) {}

    /// The connection has been idle past its timeout. The default
    /// closes; override to send a keep-alive probe instead. Doing
    /// nothing re-arms the timeout for another round.
    fn ping(&mut self, r: &Reactor, conn: ConnId) {
        r.close(conn);
    }

    /// The process is shutting down gracefully; the connection will be
    /// flushed and closed right after this returns.
    fn on_shutdown(&mut self, _r: &Reactor, _conn: ConnId) {}

    /// The connection is gone. Runs exactly once, after the last other
    /// callback for this connection; the fd is already released.
    fn on_close(&mut self, _conn: ConnId) {}
}

/// Transport hook replacing the raw `read(2)`/`write(2)` pair on one
/// connection, letting a TLS session or a transform sit between the
/// protocol and the socket without the write scheduler knowing.
///
/// Hooks see the same non-blocking discipline as the defaults: return
/// `WouldBlock` to pause, a fatal error to have the connection torn
/// down. Cleanup belongs in `Drop`.
pub trait RwHook: Send {
    fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        socket::read(fd, buf)
    }

    fn write(&mut self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        socket::write(fd, buf)
    }

    /// Pushes out any bytes the hook itself buffers. Returns the number
    /// still pending inside the hook.
    fn flush(&mut self, _fd: RawFd) -> io::Result<usize> {
        Ok(0)
    }
}
