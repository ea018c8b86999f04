use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use libc::{self, c_int, c_void, socklen_t};

use crate::sys::{retry_intr, syscall};

pub(crate) fn setsockopt<T>(fd: RawFd, opt: c_int, val: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        fd,
        opt,
        val,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

pub(crate) fn getsockopt<T: Copy>(fd: RawFd, opt: c_int, val: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        fd,
        opt,
        val,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    Ok(slot)
}

fn addr_to_storage(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe {
                &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in)
            };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from_ne_bytes(a.ip().octets()),
            };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe {
                &mut *(&mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6)
            };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

pub(crate) fn storage_to_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
            };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe {
                &*(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
            };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "not an inet address")),
    }
}

fn new_stream_socket(fam: c_int) -> io::Result<RawFd> {
    #[cfg(target_os = "linux")]
    {
        syscall!(socket(
            fam,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0
        ))
    }
    #[cfg(not(target_os = "linux"))]
    {
        let fd = syscall!(socket(fam, libc::SOCK_STREAM, 0))?;
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
        Ok(fd)
    }
}

/// A connected `AF_UNIX` stream pair, both ends close-on-exec.
pub(crate) fn pair() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0, 0];
    #[cfg(target_os = "linux")]
    syscall!(socketpair(
        libc::AF_UNIX,
        libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
        0,
        fds.as_mut_ptr()
    ))?;
    #[cfg(not(target_os = "linux"))]
    {
        syscall!(socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()))?;
        for fd in fds {
            syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        }
    }
    Ok((fds[0], fds[1]))
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let mut nonblocking = nonblocking as c_int;
    syscall!(ioctl(fd, libc::FIONBIO, &mut nonblocking)).map(|_| ())
}

/// Accepts one pending connection; the new socket is non-blocking and
/// close-on-exec. The peer address is `None` for non-inet families.
pub(crate) fn accept(listener: RawFd) -> io::Result<(RawFd, Option<SocketAddr>)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;

    #[cfg(target_os = "linux")]
    let fd = retry_intr(|| {
        syscall!(accept4(
            listener,
            &mut storage as *mut _ as *mut _,
            &mut len,
            libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK
        ))
    })?;

    #[cfg(not(target_os = "linux"))]
    let fd = {
        let fd = retry_intr(|| {
            syscall!(accept(listener, &mut storage as *mut _ as *mut _, &mut len))
        })?;
        syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
        syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))?;
        fd
    };

    Ok((fd, storage_to_addr(&storage).ok()))
}

/// Starts a non-blocking TCP connect; completion is reported by the
/// poller as write readiness (check [`take_error`]).
pub(crate) fn connect_stream(addr: &SocketAddr) -> io::Result<RawFd> {
    let fam = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };
    let fd = new_stream_socket(fam)?;
    let (storage, len) = addr_to_storage(addr);
    match syscall!(connect(fd, &storage as *const _ as *const _, len)) {
        Ok(_) => Ok(fd),
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(fd),
        Err(e) => {
            let _ = syscall!(close(fd));
            Err(e)
        }
    }
}

fn unix_sockaddr(path: &Path) -> io::Result<(libc::sockaddr_un, socklen_t)> {
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(Error::new(ErrorKind::InvalidInput, "socket path too long"));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as _;
    }
    Ok((addr, mem::size_of::<libc::sockaddr_un>() as socklen_t))
}

pub(crate) fn connect_unix(path: &Path) -> io::Result<RawFd> {
    let fd = new_stream_socket(libc::AF_UNIX)?;
    let (addr, len) = unix_sockaddr(path)?;
    match syscall!(connect(fd, &addr as *const _ as *const _, len)) {
        Ok(_) => Ok(fd),
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(fd),
        Err(e) => {
            let _ = syscall!(close(fd));
            Err(e)
        }
    }
}

pub(crate) fn bind_listen_tcp(addr: &SocketAddr) -> io::Result<RawFd> {
    let fam = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };
    let fd = new_stream_socket(fam)?;
    let bound: io::Result<()> = (|| {
        setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1 as c_int)?;
        let (storage, len) = addr_to_storage(addr);
        syscall!(bind(fd, &storage as *const _ as *const _, len))?;
        syscall!(listen(fd, libc::SOMAXCONN))?;
        Ok(())
    })();
    match bound {
        Ok(()) => Ok(fd),
        Err(e) => {
            let _ = syscall!(close(fd));
            Err(e)
        }
    }
}

pub(crate) fn bind_listen_unix(path: &Path) -> io::Result<RawFd> {
    // a stale socket file would make bind fail with EADDRINUSE
    let _ = std::fs::remove_file(path);
    let fd = new_stream_socket(libc::AF_UNIX)?;
    let bound: io::Result<()> = (|| {
        let (addr, len) = unix_sockaddr(path)?;
        syscall!(bind(fd, &addr as *const _ as *const _, len))?;
        syscall!(listen(fd, libc::SOMAXCONN))?;
        Ok(())
    })();
    match bound {
        Ok(()) => Ok(fd),
        Err(e) => {
            let _ = syscall!(close(fd));
            Err(e)
        }
    }
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    syscall!(getsockname(fd, &mut storage as *mut _ as *mut _, &mut len))?;
    storage_to_addr(&storage)
}

/// Reads the pending `SO_ERROR`, if any (used to finalize a non-blocking
/// connect).
pub(crate) fn take_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let raw: c_int = getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if raw == 0 {
        Ok(None)
    } else {
        Ok(Some(Error::from_raw_os_error(raw)))
    }
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = retry_intr(|| syscall!(read(fd, buf.as_mut_ptr() as *mut c_void, buf.len())))?;
    Ok(n as usize)
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = retry_intr(|| syscall!(write(fd, buf.as_ptr() as *const c_void, buf.len())))?;
    Ok(n as usize)
}

pub(crate) fn pread(fd: RawFd, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let n = retry_intr(|| {
        syscall!(pread(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            offset as libc::off_t
        ))
    })?;
    Ok(n as usize)
}

/// Zero-copy file-to-socket transfer. Falls back to a bounce buffer on
/// platforms without a compatible `sendfile(2)`.
#[cfg(target_os = "linux")]
pub(crate) fn sendfile(out: RawFd, file: RawFd, offset: u64, count: usize) -> io::Result<usize> {
    let mut off = offset as libc::off_t;
    let n = retry_intr(|| syscall!(sendfile(out, file, &mut off, count)))?;
    Ok(n as usize)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn sendfile(out: RawFd, file: RawFd, offset: u64, count: usize) -> io::Result<usize> {
    let mut buf = [0u8; 16 * 1024];
    let want = count.min(buf.len());
    let got = pread(file, &mut buf[..want], offset)?;
    if got == 0 {
        return Ok(0);
    }
    write(out, &buf[..got])
}

pub(crate) fn close(fd: RawFd) {
    let _ = syscall!(close(fd));
}
