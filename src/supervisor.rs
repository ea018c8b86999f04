//! Process supervision plumbing: async-signal-safe flags, fork/reap
//! helpers and the lifecycle stages the reactor announces.
//!
//! Signal handlers only flip process-global atomics; the reactor thread
//! notices them on its next tick. `SIGINT`/`SIGTERM` request a graceful
//! stop, `SIGCHLD` triggers a reap-and-respawn pass in the master, and
//! `SIGPIPE` is ignored so a dead peer surfaces as a write error.

use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use libc::{self, c_int, pid_t};

use crate::sys::syscall;

/// Points in the process lifecycle where user callbacks can run; see
/// [`Reactor::on_state`](crate::Reactor::on_state).
///
/// Order for a forking run: `BeforeFork` (master), `AfterFork` (all),
/// `InChild` (workers), `OnStart` (all), then per-tick `OnIdle`,
/// `OnShutdown` when draining begins and `OnFinish` last. Timers and
/// deferred tasks never cross the fork; anything a worker needs must be
/// scheduled in one of the child-side stages.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum When {
    BeforeFork,
    AfterFork,
    InChild,
    OnStart,
    OnIdle,
    OnShutdown,
    OnFinish,
}

static STOP_SIGNAL: AtomicBool = AtomicBool::new(false);
static CHILD_SIGNAL: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop(_sig: c_int) {
    STOP_SIGNAL.store(true, Ordering::Relaxed);
}

extern "C" fn handle_child(_sig: c_int) {
    CHILD_SIGNAL.store(true, Ordering::Relaxed);
}

fn install(sig: c_int, handler: extern "C" fn(c_int)) -> io::Result<()> {
    unsafe {
        let mut act: libc::sigaction = mem::zeroed();
        act.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut act.sa_mask);
        // no SA_RESTART: a pending flag must interrupt the poll wait
        act.sa_flags = 0;
        if libc::sigaction(sig, &act, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn install_signal_handlers() -> io::Result<()> {
    install(libc::SIGINT, handle_stop)?;
    install(libc::SIGTERM, handle_stop)?;
    install(libc::SIGCHLD, handle_child)?;
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
    Ok(())
}

pub(crate) fn stop_flag_raised() -> bool {
    STOP_SIGNAL.load(Ordering::Relaxed)
}

/// Consumes a pending `SIGCHLD` notification.
pub(crate) fn take_child_signal() -> bool {
    CHILD_SIGNAL.swap(false, Ordering::Relaxed)
}

/// A freshly forked child starts with clean flags, whatever was pending
/// in the parent.
pub(crate) fn clear_signal_flags() {
    STOP_SIGNAL.store(false, Ordering::Relaxed);
    CHILD_SIGNAL.store(false, Ordering::Relaxed);
}

pub(crate) enum Forked {
    Parent(pid_t),
    Child,
}

pub(crate) fn fork() -> io::Result<Forked> {
    match syscall!(fork())? {
        0 => Ok(Forked::Child),
        pid => Ok(Forked::Parent(pid)),
    }
}

/// Collects every child that exited since the last call.
pub(crate) fn reap_children() -> Vec<pid_t> {
    let mut reaped = Vec::new();
    loop {
        let mut status: c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        reaped.push(pid);
    }
    reaped
}

pub(crate) fn terminate(pid: pid_t) {
    unsafe {
        let _ = libc::kill(pid, libc::SIGTERM);
    }
}

/// Blocks until `pid` exits; `EINTR` retries, other errors give up
/// (the child is already gone).
pub(crate) fn join(pid: pid_t) {
    loop {
        let mut status: c_int = 0;
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret == pid {
            return;
        }
        if ret < 0 && io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
            return;
        }
    }
}

/// Resolves a thread/worker count: positive is literal, zero is the
/// caller's default, negative is a fraction of the CPU count (`-2` is
/// half the cores).
pub(crate) fn resolve_count(n: i32, default: usize) -> usize {
    let cores = thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1);
    match n {
        0 => default,
        n if n > 0 => n as usize,
        n => (cores / n.unsigned_abs() as usize).max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::resolve_count;

    #[test]
    fn counts_resolve() {
        assert_eq!(resolve_count(4, 1), 4);
        assert_eq!(resolve_count(0, 3), 3);
        // a fraction of the cores, never less than one
        assert!(resolve_count(-1, 1) >= 1);
        assert!(resolve_count(-1000, 1) == 1);
    }
}
