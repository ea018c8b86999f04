use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::sys::fd::FileDesc;
use crate::sys::syscall;

/// Cross-thread wake primitive backed by an `eventfd`.
///
/// `notify` is cheap and safe from any thread; `drain` resets the counter
/// so the next poll blocks again.
#[derive(Debug)]
pub(crate) struct WakeFd {
    inner: FileDesc,
}

impl WakeFd {
    pub(crate) fn new() -> io::Result<WakeFd> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let fd = syscall!(eventfd(0, flags))?;
        Ok(WakeFd {
            inner: unsafe { FileDesc::new(fd) },
        })
    }

    pub(crate) fn notify(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.inner).write(&buf) {
            Ok(_) => Ok(()),
            // counter saturated: a wake is already pending
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 8];
        let _ = (&self.inner).read(&mut buf);
    }
}

impl AsRawFd for WakeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}

#[cfg(test)]
mod tests {
    use super::WakeFd;

    #[test]
    fn notify_and_drain() {
        let wake = WakeFd::new().unwrap();
        wake.notify().unwrap();
        wake.notify().unwrap();
        wake.drain();
        // drained: another drain is a no-op rather than an error
        wake.drain();
    }
}
