use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::packet::OutQueue;
use crate::protocol::{Protocol, RwHook};
use crate::pubsub::Subscription;
use crate::reactor::Reactor;
use std::sync::Weak;

/// Opaque connection handle: the fd index in the low half, a slot
/// generation in the high half. Operations on a handle whose generation
/// no longer matches its slot fail with
/// [`Error::Closed`](crate::Error::Closed) instead of touching whatever
/// connection reuses the fd.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub(crate) fn new(fd: RawFd, generation: u32) -> ConnId {
        ConnId(((generation as u64) << 32) | fd as u32 as u64)
    }

    pub(crate) fn fd(self) -> RawFd {
        self.0 as u32 as RawFd
    }

    pub(crate) fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The raw 64-bit value, stable for the life of the connection.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnId({}:{})", self.generation(), self.fd())
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.generation(), self.fd())
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub(crate) enum State {
    Free = 0,
    Open = 1,
    /// No new reads or writes; pending packets still flush out.
    Draining = 2,
    Closing = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            1 => State::Open,
            2 => State::Draining,
            3 => State::Closing,
            _ => State::Free,
        }
    }
}

/// Non-reentrant try-lock used for the per-connection task slot. A
/// failed acquisition means "somebody else is delivering a callback";
/// the caller re-queues its task instead of waiting.
pub(crate) struct Flag(AtomicBool);

impl Flag {
    pub(crate) fn new() -> Flag {
        Flag(AtomicBool::new(false))
    }

    pub(crate) fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Protocol storage for one connection. `Borrowed` marks the window
/// where a callback is running with the protocol taken out of the cell;
/// an `attach` during that window installs the replacement and the
/// runner retires the old protocol when it returns.
pub(crate) enum ProtoCell {
    Empty,
    Installed(Box<dyn Protocol>),
    Borrowed,
}

/// Deferred completion for an in-flight `connect`.
pub(crate) struct PendingOpen {
    pub(crate) on_open: Box<dyn FnOnce(&Reactor, ConnId) + Send>,
    pub(crate) on_fail: Option<Box<dyn FnOnce(Error) + Send>>,
}

/// The mutable I/O half of a connection, guarded by the slot's `io`
/// mutex (the "write lock"; held only across non-blocking calls).
pub(crate) struct ConnIo {
    pub(crate) fd: RawFd,
    pub(crate) peer: Option<SocketAddr>,
    pub(crate) queue: OutQueue,
    pub(crate) hook: Option<Box<dyn RwHook>>,
    pub(crate) pending_open: Option<PendingOpen>,
    pub(crate) subs: Vec<Weak<Subscription>>,
}

impl ConnIo {
    pub(crate) fn new(fd: RawFd, peer: Option<SocketAddr>) -> ConnIo {
        ConnIo {
            fd,
            peer,
            queue: OutQueue::new(),
            hook: None,
            pending_open: None,
            subs: Vec::new(),
        }
    }
}

pub(crate) struct Slot {
    generation: AtomicU32,
    state: AtomicU8,
    pub(crate) task_lock: Flag,
    pub(crate) close_started: AtomicBool,
    pub(crate) pending: AtomicUsize,
    pub(crate) touched_ms: AtomicU64,
    pub(crate) timeout_ms: AtomicU64,
    pub(crate) io: Mutex<Option<ConnIo>>,
    pub(crate) proto: Mutex<ProtoCell>,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            generation: AtomicU32::new(0),
            state: AtomicU8::new(State::Free as u8),
            task_lock: Flag::new(),
            close_started: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            touched_ms: AtomicU64::new(0),
            timeout_ms: AtomicU64::new(0),
            io: Mutex::new(None),
            proto: Mutex::new(ProtoCell::Empty),
        }
    }

    pub(crate) fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// `Open -> Draining`; already-draining/closing is fine, a free slot
    /// is not.
    pub(crate) fn begin_drain(&self) -> bool {
        self.state
            .compare_exchange(
                State::Open as u8,
                State::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| true)
            .unwrap_or_else(|cur| State::from_u8(cur) != State::Free)
    }
}

/// Fixed-size connection registry indexed by fd, sized to the process
/// fd limit at startup. Reads are lock-free (generation + state
/// atomics); only the per-slot mutexes serialize the heavier state.
pub(crate) struct ConnTable {
    slots: Box<[Slot]>,
    base: Instant,
}

const TABLE_MAX: usize = 65_536;
const TABLE_MIN: usize = 1_024;

fn fd_limit() -> usize {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) };
    if ret != 0 {
        return TABLE_MIN;
    }
    (rl.rlim_cur as usize).clamp(TABLE_MIN, TABLE_MAX)
}

impl ConnTable {
    pub(crate) fn new() -> ConnTable {
        let capacity = fd_limit();
        let slots = (0..capacity).map(|_| Slot::new()).collect::<Vec<_>>();
        ConnTable {
            slots: slots.into_boxed_slice(),
            base: Instant::now(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Milliseconds on the table's monotonic clock; the unit used by
    /// slot timestamps.
    pub(crate) fn now_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }

    /// Installs a freshly opened fd and returns its handle. The slot's
    /// generation advances so handles to any previous tenant go stale.
    pub(crate) fn claim(&self, io: ConnIo) -> Result<ConnId> {
        let fd = io.fd;
        let slot = self
            .slots
            .get(fd as usize)
            .ok_or(Error::Capacity(fd))?;

        let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *slot.io.lock().unwrap() = Some(io);
        *slot.proto.lock().unwrap() = ProtoCell::Empty;
        slot.close_started.store(false, Ordering::Release);
        slot.pending.store(0, Ordering::Release);
        slot.touched_ms.store(self.now_ms(), Ordering::Release);
        slot.timeout_ms.store(0, Ordering::Release);
        slot.set_state(State::Open);

        Ok(ConnId::new(fd, generation))
    }

    /// Resolves a handle, failing when the generation is stale or the
    /// slot is free. This check guards every public API against writes
    /// to a recycled fd.
    pub(crate) fn get(&self, id: ConnId) -> Result<&Slot> {
        let slot = self
            .slots
            .get(id.fd() as usize)
            .ok_or(Error::Closed)?;
        if slot.state() == State::Free
            || slot.generation.load(Ordering::Acquire) != id.generation()
        {
            return Err(Error::Closed);
        }
        Ok(slot)
    }

    /// The live handle currently occupying `fd`, if any; used to map
    /// poller tokens back to connections.
    pub(crate) fn resolve_fd(&self, fd: RawFd) -> Option<(ConnId, &Slot)> {
        let slot = self.slots.get(fd as usize)?;
        if slot.state() == State::Free {
            return None;
        }
        let generation = slot.generation.load(Ordering::Acquire);
        Some((ConnId::new(fd, generation), slot))
    }

    /// Frees the slot and hands the io half back to the caller, which
    /// owns the actual `close(2)`. The slot is reusable the moment this
    /// returns, so callers must only close the fd afterwards.
    pub(crate) fn release(&self, id: ConnId) -> Option<ConnIo> {
        let slot = self.slots.get(id.fd() as usize)?;
        if slot.generation.load(Ordering::Acquire) != id.generation() {
            return None;
        }
        let io = slot.io.lock().unwrap().take();
        let proto = mem::replace(&mut *slot.proto.lock().unwrap(), ProtoCell::Empty);
        drop(proto);
        slot.pending.store(0, Ordering::Release);
        slot.set_state(State::Free);
        io
    }

    /// Every live handle, for sweeps and shutdown fan-out.
    pub(crate) fn each_open(&self, mut f: impl FnMut(ConnId, &Slot)) {
        for (fd, slot) in self.slots.iter().enumerate() {
            if slot.state() == State::Free {
                continue;
            }
            let generation = slot.generation.load(Ordering::Acquire);
            f(ConnId::new(fd as RawFd, generation), slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnIo, ConnTable, State};

    #[test]
    fn conn_id_packs_fd_and_generation() {
        let id = super::ConnId::new(42, 7);
        assert_eq!(id.fd(), 42);
        assert_eq!(id.generation(), 7);
        assert_ne!(super::ConnId::new(42, 8), id);
    }

    #[test]
    fn claim_and_resolve() {
        let table = ConnTable::new();
        let id = table.claim(ConnIo::new(5, None)).unwrap();
        assert_eq!(id.fd(), 5);

        let slot = table.get(id).unwrap();
        assert_eq!(slot.state(), State::Open);

        let (resolved, _) = table.resolve_fd(5).unwrap();
        assert_eq!(resolved, id);
    }

    #[test]
    fn stale_generation_is_rejected() {
        let table = ConnTable::new();
        let first = table.claim(ConnIo::new(5, None)).unwrap();
        table.release(first).unwrap();

        // fd 5 comes back for a new connection
        let second = table.claim(ConnIo::new(5, None)).unwrap();
        assert_ne!(first, second);

        assert!(table.get(first).is_err());
        assert!(table.get(second).is_ok());
    }

    #[test]
    fn release_frees_the_slot() {
        let table = ConnTable::new();
        let id = table.claim(ConnIo::new(9, None)).unwrap();
        let io = table.release(id).unwrap();
        assert_eq!(io.fd, 9);
        assert!(table.get(id).is_err());
        assert!(table.resolve_fd(9).is_none());
    }

    #[test]
    fn fd_beyond_capacity_fails() {
        let table = ConnTable::new();
        let fd = table.capacity() as i32;
        assert!(table.claim(ConnIo::new(fd, None)).is_err());
    }

    #[test]
    fn each_open_sees_only_live_slots() {
        let table = ConnTable::new();
        let a = table.claim(ConnIo::new(3, None)).unwrap();
        let b = table.claim(ConnIo::new(4, None)).unwrap();
        table.release(a);

        let mut seen = Vec::new();
        table.each_open(|id, _| seen.push(id));
        assert_eq!(seen, vec![b]);
    }

    #[test]
    fn drain_transition() {
        let table = ConnTable::new();
        let id = table.claim(ConnIo::new(6, None)).unwrap();
        let slot = table.get(id).unwrap();
        assert!(slot.begin_drain());
        assert_eq!(slot.state(), State::Draining);
        // idempotent while the connection is live
        assert!(slot.begin_drain());
    }
}
