use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, mem, ptr};

use libc::{self, c_void};

use crate::poller::{Event, Ready, Token};
use crate::sys::fd::FileDesc;
use crate::sys::syscall;

/// Edge-style kqueue selector (`EV_CLEAR`), the BSD twin of the epoll
/// backend. Read and write interest map to separate kevent filters.
pub(crate) struct Selector {
    kq: RawFd,
}

impl Selector {
    pub(crate) fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    pub(crate) fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let ts = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: to.subsec_nanos() as _,
        });
        let ts_ptr = ts
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        let cnt = syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            evts.events.as_mut_ptr(),
            evts.events.capacity() as _,
            ts_ptr
        ))?;

        unsafe { evts.events.set_len(cnt as usize) };

        Ok(cnt as usize)
    }

    pub(crate) fn add(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        let mut changes: [libc::kevent; 2] = unsafe { mem::zeroed() };
        let mut n = 0;

        if interest.is_readable() {
            changes[n] = change(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR, token);
            n += 1;
        }

        if interest.is_writable() {
            changes[n] = change(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_CLEAR, token);
            n += 1;
        }

        syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            n as _,
            ptr::null_mut(),
            0,
            ptr::null()
        ))?;

        Ok(())
    }

    pub(crate) fn modify(&self, fd: RawFd, token: Token, interest: Ready) -> io::Result<()> {
        // EV_ADD on a present filter updates it in place
        self.add(fd, token, interest)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        for filter in [libc::EVFILT_READ, libc::EVFILT_WRITE] {
            let ch = change(fd, filter, libc::EV_DELETE, Token(0));
            match syscall!(kevent(self.kq, &ch, 1, ptr::null_mut(), 0, ptr::null())) {
                Ok(_) => {}
                Err(ref e) if e.raw_os_error() == Some(libc::ENOENT) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

fn change(fd: RawFd, filter: i16, flags: u16, token: Token) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.udata = token.0 as *mut c_void as _;
    ev
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.kq);
        }
    }
}

pub(crate) struct Events {
    events: Vec<libc::kevent>,
}

impl Events {
    pub(crate) fn with_capacity(u: usize) -> Events {
        Events {
            events: Vec::with_capacity(u),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub(crate) fn get(&self, idx: usize) -> Option<Event> {
        self.events.get(idx).map(|ev| {
            let mut kind = Ready::empty();

            if ev.filter == libc::EVFILT_READ {
                kind = kind | Ready::readable();
            }

            if ev.filter == libc::EVFILT_WRITE {
                kind = kind | Ready::writable();
            }

            if ev.flags & libc::EV_EOF != 0 {
                kind = kind | Ready::hup();
            }

            if ev.flags & libc::EV_ERROR != 0 {
                kind = kind | Ready::error();
            }

            Event::new(kind, Token(ev.udata as usize))
        })
    }
}

/// Cross-thread wake primitive backed by a non-blocking pipe.
#[derive(Debug)]
pub(crate) struct WakeFd {
    reader: FileDesc,
    writer: FileDesc,
}

impl WakeFd {
    pub(crate) fn new() -> io::Result<WakeFd> {
        let mut fds = [0; 2];
        syscall!(pipe(fds.as_mut_ptr()))?;
        for fd in fds {
            syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
            syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
        }
        Ok(WakeFd {
            reader: unsafe { FileDesc::new(fds[0]) },
            writer: unsafe { FileDesc::new(fds[1]) },
        })
    }

    pub(crate) fn notify(&self) -> io::Result<()> {
        match (&self.writer).write(&[1]) {
            Ok(_) => Ok(()),
            // pipe full: a wake is already pending
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 128];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(n) if n > 0 => {}
                _ => return,
            }
        }
    }
}

impl AsRawFd for WakeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.raw()
    }
}
