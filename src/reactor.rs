//! The reactor: connection registry, write scheduling, deferred tasks,
//! timers, pub/sub and process supervision behind one context value.
//!
//! A [`Reactor`] is a cheap cloneable handle; every protocol callback
//! receives one. Nothing here blocks inside a callback: reads and
//! writes are non-blocking, closes flush first, and long work belongs
//! in [`Reactor::defer`].

use std::fs::File;
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::RawFd;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use libc::pid_t;

use crate::cluster::{self, ClusterBus, Envelope, HubLink, WorkerLink};
use crate::conn::{ConnId, ConnIo, ConnTable, PendingOpen, ProtoCell, State};
use crate::defer::{Task, TaskQueue};
use crate::error::{Error, Result};
use crate::packet::{Flushed, Packet};
use crate::poller::{Event, Events, Poller, Ready, Token, WAKE_TOKEN};
use crate::protocol::{Protocol, RwHook};
use crate::pubsub::{Engine, Message, PubSub, Publish, SubHandle, Subscribe, Subscription};
use crate::supervisor::{self, Forked, When};
use crate::sys::socket;
use crate::timers::{Every, TimerEntry, Timers};
use crate::url::Addr;

/// How long a stopping process keeps servicing I/O before force-closing
/// what remains.
const DRAIN_WINDOW: Duration = Duration::from_secs(8);
/// Ceiling on one reactor tick.
const TICK_CEILING: Duration = Duration::from_millis(500);

type OnOpen = Arc<dyn Fn(&Reactor, ConnId) + Send + Sync>;
type OnFinish = Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>;

/// Builder for a listening socket; see [`Reactor::listen`].
///
/// ```no_run
/// use hive_io::{Listen, Reactor};
/// # use hive_io::Protocol;
/// # struct Echo;
/// # impl Protocol for Echo {
/// #     fn on_data(&mut self, _r: &Reactor, _c: hive_io::ConnId) {}
/// # }
///
/// let r = Reactor::new().unwrap();
/// r.listen(
///     Listen::new("tcp://0.0.0.0:3000")
///         .timeout(std::time::Duration::from_secs(5))
///         .on_open(|r, conn| {
///             r.attach(conn, Echo).unwrap();
///         }),
/// )
/// .unwrap();
/// ```
pub struct Listen {
    url: Option<String>,
    on_open: Option<Box<dyn Fn(&Reactor, ConnId) + Send + Sync>>,
    on_finish: Option<Box<dyn FnOnce() + Send>>,
    timeout: Option<Duration>,
}

impl Listen {
    pub fn new(url: impl Into<String>) -> Listen {
        Listen {
            url: Some(url.into()),
            on_open: None,
            on_finish: None,
            timeout: None,
        }
    }

    /// Listen address from the `PORT`/`ADDRESS` environment variables.
    pub fn from_env() -> Listen {
        Listen {
            url: None,
            on_open: None,
            on_finish: None,
            timeout: None,
        }
    }

    /// Runs for every accepted connection; it should attach a protocol.
    pub fn on_open(mut self, f: impl Fn(&Reactor, ConnId) + Send + Sync + 'static) -> Listen {
        self.on_open = Some(Box::new(f));
        self
    }

    /// Runs when the listener itself closes (at shutdown).
    pub fn on_finish(mut self, f: impl FnOnce() + Send + 'static) -> Listen {
        self.on_finish = Some(Box::new(f));
        self
    }

    /// Idle timeout applied to accepted connections.
    pub fn timeout(mut self, timeout: Duration) -> Listen {
        self.timeout = Some(timeout);
        self
    }
}

/// Where a listener actually bound; `addr` carries the resolved port
/// when the URL asked for port `0`.
#[derive(Debug, Clone)]
pub struct Bound {
    pub url: String,
    pub addr: Option<SocketAddr>,
}

/// Builder for an outgoing connection; see [`Reactor::connect`].
pub struct Connect {
    url: String,
    on_open: Option<Box<dyn FnOnce(&Reactor, ConnId) + Send>>,
    on_fail: Option<Box<dyn FnOnce(Error) + Send>>,
    timeout: Option<Duration>,
}

impl Connect {
    pub fn new(url: impl Into<String>) -> Connect {
        Connect {
            url: url.into(),
            on_open: None,
            on_fail: None,
            timeout: None,
        }
    }

    /// Runs once the connection is established; it should attach a
    /// protocol.
    pub fn on_open(mut self, f: impl FnOnce(&Reactor, ConnId) + Send + 'static) -> Connect {
        self.on_open = Some(Box::new(f));
        self
    }

    /// Runs when the attempt fails (refused, unreachable, timed out).
    pub fn on_fail(mut self, f: impl FnOnce(Error) + Send + 'static) -> Connect {
        self.on_fail = Some(Box::new(f));
        self
    }

    /// Abandons the attempt if it has not completed in time.
    pub fn timeout(mut self, timeout: Duration) -> Connect {
        self.timeout = Some(timeout);
        self
    }
}

/// Run options: worker-thread and worker-process counts. Negative
/// values are a fraction of the CPU count (`-2` is half the cores);
/// zero workers means a single process.
#[derive(Copy, Clone, Debug, Default)]
pub struct Run {
    threads: i32,
    workers: i32,
}

impl Run {
    pub fn new() -> Run {
        Run::default()
    }

    pub fn threads(mut self, threads: i32) -> Run {
        self.threads = threads;
        self
    }

    pub fn workers(mut self, workers: i32) -> Run {
        self.workers = workers;
        self
    }
}

#[derive(Copy, Clone, Debug)]
enum Cb {
    Data,
    Ready,
    Ping,
    Shutdown,
}

struct ListenerCfg {
    fd: RawFd,
    url: String,
    on_open: OnOpen,
    on_finish: OnFinish,
    timeout: Option<Duration>,
}

pub(crate) struct Inner {
    poller: RwLock<Poller>,
    table: ConnTable,
    tasks: TaskQueue,
    timers: Timers,
    pubsub: PubSub,
    bus: ClusterBus,
    listeners: Mutex<Vec<ListenerCfg>>,
    active_listeners: Mutex<Vec<ConnId>>,
    hooks: Mutex<Vec<(When, Arc<dyn Fn(&Reactor) + Send + Sync>)>>,
    workers: Mutex<Vec<pid_t>>,
    threads: AtomicUsize,
    stopping: AtomicBool,
    running: AtomicBool,
    is_worker: AtomicBool,
}

/// The framework context. Clone freely; all clones share one state.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        Ok(Reactor {
            inner: Arc::new(Inner {
                poller: RwLock::new(Poller::new()?),
                table: ConnTable::new(),
                tasks: TaskQueue::new(),
                timers: Timers::new(),
                pubsub: PubSub::new(),
                bus: ClusterBus::new(),
                listeners: Mutex::new(Vec::new()),
                active_listeners: Mutex::new(Vec::new()),
                hooks: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                threads: AtomicUsize::new(1),
                stopping: AtomicBool::new(false),
                running: AtomicBool::new(false),
                is_worker: AtomicBool::new(false),
            }),
        })
    }

    // ----- introspection -------------------------------------------------

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }

    pub fn is_worker(&self) -> bool {
        self.inner.is_worker.load(Ordering::Acquire)
    }

    pub fn is_master(&self) -> bool {
        !self.is_worker()
    }

    pub fn is_open(&self, conn: ConnId) -> bool {
        self.inner
            .table
            .get(conn)
            .map(|s| s.state() == State::Open)
            .unwrap_or(false)
    }

    /// Bytes queued but not yet on the wire; the back-pressure signal.
    pub fn pending(&self, conn: ConnId) -> Result<usize> {
        Ok(self.inner.table.get(conn)?.pending.load(Ordering::Acquire))
    }

    pub fn peer_addr(&self, conn: ConnId) -> Result<Option<SocketAddr>> {
        let slot = self.inner.table.get(conn)?;
        let guard = slot.io.lock().unwrap();
        Ok(guard.as_ref().and_then(|io| io.peer))
    }

    /// The underlying descriptor, for hooks that need it. The fd stays
    /// owned by the reactor.
    pub fn raw_fd(&self, conn: ConnId) -> Result<RawFd> {
        let slot = self.inner.table.get(conn)?;
        let guard = slot.io.lock().unwrap();
        guard.as_ref().map(|io| io.fd).ok_or(Error::Closed)
    }

    // ----- timeouts ------------------------------------------------------

    /// Idle timeout; the sweep fires `ping` when it elapses without
    /// activity. `None` disables.
    pub fn set_timeout(&self, conn: ConnId, timeout: Option<Duration>) -> Result<()> {
        let slot = self.inner.table.get(conn)?;
        let ms = timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
        slot.timeout_ms.store(ms, Ordering::Release);
        slot.touched_ms
            .store(self.inner.table.now_ms(), Ordering::Release);
        Ok(())
    }

    /// Marks the connection active, pushing its timeout out.
    pub fn touch(&self, conn: ConnId) -> Result<()> {
        let slot = self.inner.table.get(conn)?;
        slot.touched_ms
            .store(self.inner.table.now_ms(), Ordering::Release);
        Ok(())
    }

    // ----- protocol attachment ------------------------------------------

    /// Binds `protocol` to the connection, replacing any previous one;
    /// the replaced protocol's `on_close` is scheduled. Attaching to a
    /// dead handle retires the new protocol the same way and reports
    /// `Closed`.
    pub fn attach(&self, conn: ConnId, protocol: impl Protocol + 'static) -> Result<()> {
        self.attach_boxed(conn, Box::new(protocol))
    }

    pub(crate) fn attach_boxed(&self, conn: ConnId, protocol: Box<dyn Protocol>) -> Result<()> {
        let slot = match self.inner.table.get(conn) {
            Ok(slot) if slot.state() == State::Open => slot,
            _ => {
                let mut protocol = protocol;
                self.defer_task(Box::new(move |_| protocol.on_close(conn)));
                return Err(Error::Closed);
            }
        };

        log::debug!("conn {}: protocol `{}` attached", conn, protocol.service());
        let old = {
            let mut cell = slot.proto.lock().unwrap();
            match mem::replace(&mut *cell, ProtoCell::Installed(protocol)) {
                ProtoCell::Installed(old) => Some(old),
                // a callback is running on the old protocol; the runner
                // retires it when it returns
                ProtoCell::Borrowed | ProtoCell::Empty => None,
            }
        };
        if let Some(mut old) = old {
            self.defer_task(Box::new(move |_| old.on_close(conn)));
        }
        Ok(())
    }

    /// Installs a transport hook (TLS, transforms) on the connection.
    pub fn set_rw_hook(&self, conn: ConnId, hook: impl RwHook + 'static) -> Result<()> {
        let slot = self.inner.table.get(conn)?;
        let mut guard = slot.io.lock().unwrap();
        let io = guard.as_mut().ok_or(Error::Closed)?;
        io.hook = Some(Box::new(hook));
        Ok(())
    }

    // ----- reading -------------------------------------------------------

    /// Non-blocking read. `Ok(0)` means the peer finished; the
    /// connection is then closed (pending writes still flush). A
    /// `WouldBlock` error ends a drain loop; any other error is fatal
    /// for the connection.
    pub fn read(&self, conn: ConnId, buf: &mut [u8]) -> Result<usize> {
        let slot = self.inner.table.get(conn)?;
        if slot.state() != State::Open {
            return Err(Error::Closed);
        }

        let res = {
            let mut guard = slot.io.lock().unwrap();
            let io = guard.as_mut().ok_or(Error::Closed)?;
            match io.hook.as_mut() {
                Some(hook) => hook.read(io.fd, buf),
                None => socket::read(io.fd, buf),
            }
        };

        match res {
            Ok(0) => {
                self.close(conn);
                Ok(0)
            }
            Ok(n) => {
                let _ = self.touch(conn);
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(Error::Io(e)),
            Err(e) => {
                self.conn_error(conn);
                Err(Error::Io(e))
            }
        }
    }

    // ----- writing -------------------------------------------------------

    /// Queues bytes (or a file region) and flushes opportunistically.
    /// Packets from one task go out in order.
    pub fn write(&self, conn: ConnId, data: impl Into<Packet>) -> Result<()> {
        self.enqueue(conn, data.into(), false)
    }

    /// Copying variant for borrowed buffers.
    pub fn write_copy(&self, conn: ConnId, data: &[u8]) -> Result<()> {
        self.enqueue(conn, Packet::Owned(data.to_vec()), false)
    }

    /// Queue-jumps everything not yet on the wire; never splits a
    /// packet that started transmitting.
    pub fn write_urgent(&self, conn: ConnId, data: impl Into<Packet>) -> Result<()> {
        self.enqueue(conn, data.into(), true)
    }

    /// Streams `len` bytes of `file` starting at `offset`, zero-copy
    /// when the transport allows it.
    pub fn sendfile(&self, conn: ConnId, file: File, offset: u64, len: u64) -> Result<()> {
        self.enqueue(conn, Packet::File { file, offset, len }, false)
    }

    fn enqueue(&self, conn: ConnId, packet: Packet, urgent: bool) -> Result<()> {
        let slot = self.inner.table.get(conn)?;
        if slot.state() != State::Open {
            return Err(Error::Closed);
        }
        {
            let mut guard = slot.io.lock().unwrap();
            let io = guard.as_mut().ok_or(Error::Closed)?;
            if io.queue.close_after_flush {
                return Err(Error::Closed);
            }
            if urgent {
                io.queue.push_urgent(packet);
            } else {
                io.queue.push(packet);
            }
            slot.pending.store(io.queue.pending(), Ordering::Release);
        }
        self.try_flush(conn);
        Ok(())
    }

    fn try_flush(&self, conn: ConnId) {
        let slot = match self.inner.table.get(conn) {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if slot.state() == State::Closing {
            return;
        }

        let (outcome, close_after, had_backlog) = {
            let mut guard = slot.io.lock().unwrap();
            let io = match guard.as_mut() {
                Some(io) => io,
                None => return,
            };
            let had_backlog = !io.queue.is_empty();
            let ConnIo { fd, queue, hook, .. } = &mut *io;
            let outcome = queue.flush(*fd, hook.as_mut());
            let close_after = queue.close_after_flush;
            slot.pending.store(queue.pending(), Ordering::Release);
            (outcome, close_after, had_backlog)
        };

        match outcome {
            Flushed::Empty { wrote } => {
                if wrote > 0 {
                    let _ = self.touch(conn);
                }
                if close_after {
                    self.finalize_close(conn);
                } else if had_backlog && wrote > 0 {
                    self.defer_task(Box::new(move |r| r.dispatch_callback(conn, Cb::Ready)));
                }
            }
            Flushed::Pending { wrote } => {
                if wrote > 0 {
                    let _ = self.touch(conn);
                }
                // edge-triggered write readiness resumes the flush
            }
            Flushed::Fatal(e) => {
                log::debug!("conn {}: write failed: {}", conn, e);
                self.conn_error(conn);
            }
        }
    }

    // ----- closing -------------------------------------------------------

    /// Cooperative close: stops reads and new writes, flushes what is
    /// queued, then runs `on_close` exactly once.
    pub fn close(&self, conn: ConnId) {
        let slot = match self.inner.table.get(conn) {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if !slot.begin_drain() {
            return;
        }
        let empty = {
            let mut guard = slot.io.lock().unwrap();
            match guard.as_mut() {
                Some(io) => {
                    io.queue.close_after_flush = true;
                    io.queue.is_empty()
                }
                None => true,
            }
        };
        if empty {
            self.finalize_close(conn);
        } else {
            self.try_flush(conn);
        }
    }

    /// Immediate close: pending packets are dropped (their resources
    /// release) and `on_close` runs.
    pub fn close_now(&self, conn: ConnId) {
        let slot = match self.inner.table.get(conn) {
            Ok(slot) => slot,
            Err(_) => return,
        };
        slot.begin_drain();
        {
            let mut guard = slot.io.lock().unwrap();
            if let Some(io) = guard.as_mut() {
                io.queue.clear();
            }
            slot.pending.store(0, Ordering::Release);
        }
        self.finalize_close(conn);
    }

    /// Fatal-error path: like `close_now`, with the connection already
    /// known to be beyond use.
    fn conn_error(&self, conn: ConnId) {
        self.close_now(conn);
    }

    fn finalize_close(&self, conn: ConnId) {
        let slot = match self.inner.table.get(conn) {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if slot.close_started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.defer_task(Box::new(move |r| r.close_task(conn)));
    }

    /// The close body runs as a task so it owns the connection's task
    /// slot like any other callback: at most one `on_close`, never
    /// concurrent with `on_data`.
    fn close_task(&self, conn: ConnId) {
        let slot = match self.inner.table.get(conn) {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if !slot.task_lock.try_lock() {
            self.defer_task(Box::new(move |r| r.close_task(conn)));
            return;
        }
        slot.set_state(State::Closing);

        let protocol = {
            let mut cell = slot.proto.lock().unwrap();
            match mem::replace(&mut *cell, ProtoCell::Empty) {
                ProtoCell::Installed(p) => Some(p),
                _ => None,
            }
        };

        let io = self.inner.table.release(conn);
        if let Some(mut io) = io {
            {
                let poller = self.inner.poller.read().unwrap();
                let _ = poller.remove(io.fd);
            }

            // a connect that never completed fails instead of closing
            if let Some(pending) = io.pending_open.take() {
                if let Some(on_fail) = pending.on_fail {
                    on_fail(Error::Closed);
                }
            }

            // the connection owns its subscriptions
            for weak in io.subs.drain(..) {
                if let Some(sub) = weak.upgrade() {
                    self.release_subscription(&sub);
                }
            }

            if let Some(mut p) = protocol {
                p.on_close(conn);
            }

            // dropping the queue releases every undelivered packet
            io.queue.clear();

            if self.inner.bus.is_worker_link(conn) && !self.is_stopping() {
                log::error!("lost the master link, shutting down this worker");
                self.stop();
            }
            self.inner.bus.link_conn_closed(conn);

            // the fd closes only after the slot is reusable-safe
            socket::close(io.fd);
        } else if let Some(mut p) = protocol {
            p.on_close(conn);
        }

        slot.task_lock.unlock();
    }

    // ----- callback dispatch --------------------------------------------

    fn dispatch_callback(&self, conn: ConnId, kind: Cb) {
        let slot = match self.inner.table.get(conn) {
            Ok(slot) => slot,
            Err(_) => return,
        };
        if slot.state() != State::Open {
            return;
        }
        if !slot.task_lock.try_lock() {
            // busy with another callback: run again later, never drop
            self.defer_task(Box::new(move |r| r.dispatch_callback(conn, kind)));
            return;
        }

        let taken = {
            let mut cell = slot.proto.lock().unwrap();
            match mem::replace(&mut *cell, ProtoCell::Borrowed) {
                ProtoCell::Installed(p) => Some(p),
                other => {
                    *cell = other;
                    None
                }
            }
        };

        let mut protocol = match taken {
            Some(p) => p,
            None => {
                slot.task_lock.unlock();
                if matches!(kind, Cb::Ping) {
                    // idle timeout on a connection nobody claimed
                    // (a connect attempt that never completed)
                    self.close(conn);
                }
                return;
            }
        };

        match kind {
            Cb::Data => protocol.on_data(self, conn),
            Cb::Ready => protocol.on_ready(self, conn),
            Cb::Ping => protocol.ping(self, conn),
            Cb::Shutdown => protocol.on_shutdown(self, conn),
        }

        let replaced = {
            let mut cell = slot.proto.lock().unwrap();
            match &*cell {
                ProtoCell::Borrowed => {
                    *cell = ProtoCell::Installed(protocol);
                    None
                }
                // attach() swapped protocols mid-callback
                _ => Some(protocol),
            }
        };
        slot.task_lock.unlock();

        if let Some(mut old) = replaced {
            self.defer_task(Box::new(move |_| old.on_close(conn)));
        }
    }

    // ----- deferred tasks and timers ------------------------------------

    /// Runs `f` on the task engine, off the current callback.
    pub fn defer(&self, f: impl FnOnce(&Reactor) + Send + 'static) {
        self.defer_task(Box::new(f));
    }

    fn defer_task(&self, task: Task) {
        self.inner.tasks.push(task);
        self.wake();
    }

    fn defer_urgent(&self, task: Task) {
        self.inner.tasks.push_urgent(task);
        self.wake();
    }

    fn wake(&self) {
        let poller = self.inner.poller.read().unwrap();
        let _ = poller.waker().wake();
    }

    /// One-shot timer.
    pub fn run_after(&self, delay: Duration, f: impl FnOnce(&Reactor) + Send + 'static) {
        let mut f = Some(f);
        self.inner.timers.schedule(TimerEntry {
            deadline: Instant::now() + delay,
            interval: None,
            reps: 1,
            task: Box::new(move |r| {
                if let Some(f) = f.take() {
                    f(r);
                }
            }),
            on_finish: None,
        });
        self.wake();
    }

    /// Repeating timer; see [`Every`].
    pub fn run_every(&self, every: Every, f: impl FnMut(&Reactor) + Send + 'static) {
        self.inner.timers.schedule(TimerEntry {
            deadline: Instant::now() + every.interval,
            interval: Some(every.interval),
            reps: every.reps,
            task: Box::new(f),
            on_finish: every.on_finish,
        });
        self.wake();
    }

    /// Registers a lifecycle callback; see [`When`] for the order.
    pub fn on_state(&self, when: When, f: impl Fn(&Reactor) + Send + Sync + 'static) {
        self.inner.hooks.lock().unwrap().push((when, Arc::new(f)));
    }

    fn fire_hooks(&self, when: When) {
        let hooks: Vec<_> = self
            .inner
            .hooks
            .lock()
            .unwrap()
            .iter()
            .filter(|(w, _)| *w == when)
            .map(|(_, f)| f.clone())
            .collect();
        for hook in hooks {
            hook(self);
        }
    }

    // ----- pub/sub -------------------------------------------------------

    /// Registers a subscription; see [`Subscribe`]. Conn-bound
    /// subscriptions die with their connection.
    pub fn subscribe(&self, args: Subscribe) -> Result<SubHandle> {
        if args.on_message.is_none() {
            return Err(Error::Misuse("subscribe requires on_message"));
        }
        if let Some(conn) = args.conn {
            self.inner.table.get(conn)?;
        }
        let conn = args.conn;

        let subscribed = match self.inner.pubsub.subscribe(args) {
            Some(s) => s,
            None => return Err(Error::Misuse("subscribe requires on_message")),
        };
        let sub = subscribed.sub;

        if subscribed.first_on_channel {
            for engine in self.inner.pubsub.engines() {
                engine.on_subscribe(self, sub.filter(), sub.channel(), sub.is_pattern());
            }
        }

        if let Some(conn) = conn {
            let registered = self
                .inner
                .table
                .get(conn)
                .ok()
                .and_then(|slot| {
                    let mut guard = slot.io.lock().unwrap();
                    guard.as_mut().map(|io| io.subs.push(Arc::downgrade(&sub)))
                })
                .is_some();
            if !registered {
                // the connection closed mid-subscribe
                self.release_subscription(&sub);
                return Err(Error::Closed);
            }
        }

        Ok(SubHandle(Arc::downgrade(&sub)))
    }

    /// Drops one subscription reference; unknown or stale handles are a
    /// silent no-op.
    pub fn unsubscribe(&self, handle: &SubHandle) {
        if let Some(sub) = handle.0.upgrade() {
            if let Some(last) = self.inner.pubsub.unsubscribe(&sub, false) {
                if !sub.is_active() {
                    self.inner.pubsub.run_cleanup(self, &sub);
                }
                if last {
                    for engine in self.inner.pubsub.engines() {
                        engine.on_unsubscribe(self, sub.filter(), sub.channel(), sub.is_pattern());
                    }
                }
            }
        }
    }

    fn release_subscription(&self, sub: &Arc<Subscription>) {
        if let Some(last) = self.inner.pubsub.unsubscribe(sub, true) {
            self.inner.pubsub.run_cleanup(self, sub);
            if last {
                for engine in self.inner.pubsub.engines() {
                    engine.on_unsubscribe(self, sub.filter(), sub.channel(), sub.is_pattern());
                }
            }
        }
    }

    /// Publishes a message; see [`Publish`]. Local subscribers get it
    /// through the task engine; with `to_cluster` (the default) every
    /// worker's subscribers do too.
    pub fn publish(&self, args: Publish) -> Result<()> {
        let msg = Message::new(args.filter, &args.channel, &args.data);
        if let Some(engine) = args.engine {
            return engine.publish(self, &msg, args.to_cluster);
        }
        self.publish_message(msg, args.to_cluster)
    }

    /// Injects a message into the local fan-out only. External engine
    /// bridges use this to hand broker traffic to subscribers without
    /// echoing it back through the bus.
    pub fn publish_local(&self, filter: i32, channel: &[u8], data: &[u8]) {
        let msg = Message::new(filter, channel, data);
        self.fanout_local(&msg);
    }

    pub(crate) fn publish_message(&self, msg: Arc<Message>, to_cluster: bool) -> Result<()> {
        self.fanout_local(&msg);

        if to_cluster && self.inner.bus.is_active() {
            let frame = cluster::encode_message(&msg);
            let filtered = msg.filter() != 0;
            let staged = if self.is_worker() {
                self.inner.bus.stage_to_master(frame, filtered)
            } else {
                self.inner.bus.stage_broadcast(None, &frame, filtered)
            };
            if let Err(e) = staged {
                // a filtered envelope could not be staged: reliability
                // for control traffic beats keeping this worker alive
                log::error!("cluster backlog overflow on control traffic");
                if self.is_worker() {
                    self.stop();
                }
                return Err(e);
            }
            self.pump_cluster();
        }
        Ok(())
    }

    fn fanout_local(&self, msg: &Arc<Message>) {
        let targets = self
            .inner
            .pubsub
            .collect_targets(msg.filter(), msg.channel());
        for sub in targets {
            let msg = msg.clone();
            self.defer_task(Box::new(move |r| r.deliver_task(sub, msg)));
        }
    }

    /// Delivery trampoline: conn-bound handlers run under the same
    /// exclusion as `on_data`; a closed connection drops the message.
    fn deliver_task(&self, sub: Arc<Subscription>, msg: Arc<Message>) {
        if !sub.is_active() {
            return;
        }
        match sub.conn() {
            None => sub.invoke(self, &msg),
            Some(conn) => {
                let slot = match self.inner.table.get(conn) {
                    Ok(slot) => slot,
                    Err(_) => return,
                };
                if slot.state() != State::Open {
                    return;
                }
                if !slot.task_lock.try_lock() {
                    self.defer_task(Box::new(move |r| r.deliver_task(sub, msg)));
                    return;
                }
                sub.invoke(self, &msg);
                slot.task_lock.unlock();
            }
        }
    }

    /// Attaches an external pub/sub engine, replaying the channels that
    /// already have subscribers so the engine can mirror them.
    pub fn attach_engine(&self, engine: Arc<dyn Engine>) {
        let existing = self.inner.pubsub.attach_engine(engine.clone());
        for (filter, channel, pattern) in existing {
            engine.on_subscribe(self, filter, &channel, pattern);
        }
    }

    pub fn detach_engine(&self, engine: &Arc<dyn Engine>) {
        self.inner.pubsub.detach_engine(engine);
    }

    // ----- cluster plumbing (called by the link protocols) ---------------

    pub(crate) fn deliver_envelope(&self, env: Envelope) {
        let msg = Message::new(env.filter, &env.channel, &env.data);
        self.fanout_local(&msg);
    }

    pub(crate) fn hub_rebroadcast(&self, from: ConnId, env: &Envelope) {
        let frame = cluster::encode(env.filter, &env.channel, &env.data);
        if self
            .inner
            .bus
            .stage_broadcast(Some(from), &frame, env.filter != 0)
            .is_err()
        {
            log::error!("cluster hub backlog overflow on control traffic");
        }
        self.pump_cluster();
    }

    pub(crate) fn pump_cluster(&self) {
        let batch = self
            .inner
            .bus
            .take_ready(|conn| self.pending(conn).unwrap_or(usize::MAX));
        for (conn, frame) in batch {
            // a failed write means the link is on its way out; frames
            // die with it
            let _ = self.enqueue(conn, Packet::Owned(frame), false);
        }
    }

    // ----- listen / connect ----------------------------------------------

    /// Binds a listening socket now; accepting starts with
    /// [`run`](Reactor::run) (in every worker, when forking).
    pub fn listen(&self, args: Listen) -> Result<Bound> {
        let on_open = args.on_open.ok_or(Error::Misuse("listen requires on_open"))?;

        let addr = match &args.url {
            Some(url) => Addr::parse(url)?,
            None => Addr::from_env(),
        };
        let fd = match &addr {
            Addr::Tcp { host, port } => {
                let host = host.as_deref().unwrap_or("0.0.0.0");
                let sock_addr = (host, *port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| Error::InvalidUrl {
                        url: addr.to_string(),
                        reason: "host did not resolve".into(),
                    })?;
                socket::bind_listen_tcp(&sock_addr)?
            }
            Addr::Unix { path } => socket::bind_listen_unix(path)?,
        };

        let bound_addr = match &addr {
            Addr::Tcp { .. } => socket::local_addr(fd).ok(),
            Addr::Unix { .. } => None,
        };
        let url = match bound_addr {
            Some(a) => format!("tcp://{}", a),
            None => addr.to_string(),
        };

        let cfg = ListenerCfg {
            fd,
            url: url.clone(),
            on_open: Arc::from(on_open),
            on_finish: Arc::new(Mutex::new(args.on_finish)),
            timeout: args.timeout,
        };

        if self.inner.running.load(Ordering::Acquire) {
            self.install_listener(&cfg)?;
        }
        self.inner.listeners.lock().unwrap().push(cfg);

        Ok(Bound {
            url,
            addr: bound_addr,
        })
    }

    fn install_listener(&self, cfg: &ListenerCfg) -> Result<()> {
        let conn = self.inner.table.claim(ConnIo::new(cfg.fd, None))?;
        self.attach_boxed(
            conn,
            Box::new(ListenerProtocol {
                on_open: cfg.on_open.clone(),
                on_finish: cfg.on_finish.clone(),
                timeout: cfg.timeout,
                url: cfg.url.clone(),
            }),
        )?;
        {
            let poller = self.inner.poller.read().unwrap();
            poller.add(cfg.fd, Token::from_fd(cfg.fd), Ready::readable())?;
        }
        self.inner.active_listeners.lock().unwrap().push(conn);
        log::info!("listening on {}", cfg.url);
        Ok(())
    }

    fn install_all_listeners(&self) {
        let cfgs: Vec<_> = {
            let listeners = self.inner.listeners.lock().unwrap();
            listeners
                .iter()
                .map(|c| ListenerCfg {
                    fd: c.fd,
                    url: c.url.clone(),
                    on_open: c.on_open.clone(),
                    on_finish: c.on_finish.clone(),
                    timeout: c.timeout,
                })
                .collect()
        };
        for cfg in cfgs {
            if let Err(e) = self.install_listener(&cfg) {
                log::error!("cannot install listener {}: {}", cfg.url, e);
            }
        }
    }

    /// Opens an outgoing connection; `on_open` runs once established.
    pub fn connect(&self, args: Connect) -> Result<ConnId> {
        let on_open = args
            .on_open
            .ok_or(Error::Misuse("connect requires on_open"))?;

        let addr = Addr::parse(&args.url)?;
        let (fd, peer) = match &addr {
            Addr::Tcp { host, port } => {
                let host = host.as_deref().unwrap_or("127.0.0.1");
                let sock_addr = (host, *port)
                    .to_socket_addrs()?
                    .next()
                    .ok_or_else(|| Error::InvalidUrl {
                        url: addr.to_string(),
                        reason: "host did not resolve".into(),
                    })?;
                (socket::connect_stream(&sock_addr)?, Some(sock_addr))
            }
            Addr::Unix { path } => (socket::connect_unix(path)?, None),
        };

        let mut io = ConnIo::new(fd, peer);
        io.pending_open = Some(PendingOpen {
            on_open,
            on_fail: args.on_fail,
        });

        let conn = match self.inner.table.claim(io) {
            Ok(conn) => conn,
            Err(e) => {
                socket::close(fd);
                return Err(e);
            }
        };
        if let Some(t) = args.timeout {
            let _ = self.set_timeout(conn, Some(t));
        }
        {
            let poller = self.inner.poller.read().unwrap();
            if let Err(e) = poller.add(fd, Token::from_fd(fd), Ready::readable() | Ready::writable())
            {
                self.close_now(conn);
                return Err(Error::Io(e));
            }
        }
        Ok(conn)
    }

    /// Adopts an accepted fd into the table and schedules its `on_open`.
    fn adopt_incoming(
        &self,
        fd: RawFd,
        peer: Option<SocketAddr>,
        on_open: OnOpen,
        timeout: Option<Duration>,
    ) {
        let conn = match self.inner.table.claim(ConnIo::new(fd, peer)) {
            Ok(conn) => conn,
            Err(e) => {
                log::warn!("rejecting connection: {}", e);
                socket::close(fd);
                return;
            }
        };
        if let Some(t) = timeout {
            let _ = self.set_timeout(conn, Some(t));
        }

        // on_open runs (and attaches a protocol) before the fd can
        // produce events, so the first on_data always finds one
        self.defer_task(Box::new(move |r| {
            on_open(r, conn);
            if !r.is_open(conn) {
                return;
            }
            let added = {
                let poller = r.inner.poller.read().unwrap();
                poller.add(fd, Token::from_fd(fd), Ready::readable() | Ready::writable())
            };
            if added.is_err() {
                r.close_now(conn);
                return;
            }
            // bytes may have arrived before registration; the edge for
            // them has already fired
            r.dispatch_callback(conn, Cb::Data);
        }));
    }

    // ----- event handling ------------------------------------------------

    fn handle_event(&self, ev: Event) {
        if ev.token() == WAKE_TOKEN {
            let poller = self.inner.poller.read().unwrap();
            poller.drain_wake();
            return;
        }

        let fd = ev.token().fd();
        let (conn, _slot) = match self.inner.table.resolve_fd(fd) {
            Some(found) => found,
            None => return,
        };
        let ready = ev.readiness();

        if ready.is_readable() {
            self.defer_urgent(Box::new(move |r| r.dispatch_callback(conn, Cb::Data)));
        }
        if ready.is_writable() {
            self.defer_urgent(Box::new(move |r| r.writable_task(conn)));
        }
        if ready.is_error() && !ready.is_writable() && !ready.is_readable() {
            self.defer_urgent(Box::new(move |r| r.conn_error(conn)));
        } else if ready.is_hup() && !ready.is_readable() {
            self.defer_urgent(Box::new(move |r| r.close(conn)));
        }
    }

    /// Write readiness: completes a pending connect, then flushes.
    fn writable_task(&self, conn: ConnId) {
        let slot = match self.inner.table.get(conn) {
            Ok(slot) => slot,
            Err(_) => return,
        };

        let pending = {
            let mut guard = slot.io.lock().unwrap();
            guard
                .as_mut()
                .and_then(|io| io.pending_open.take().map(|p| (p, io.fd)))
        };

        if let Some((pending, fd)) = pending {
            let failure = match socket::take_error(fd) {
                Ok(None) => None,
                Ok(Some(e)) => Some(Error::Io(e)),
                Err(e) => Some(Error::Io(e)),
            };
            match failure {
                Some(e) => {
                    if let Some(on_fail) = pending.on_fail {
                        on_fail(e);
                    }
                    self.close_now(conn);
                    return;
                }
                None => {
                    (pending.on_open)(self, conn);
                    // data may have raced the handshake completion
                    self.defer_task(Box::new(move |r| r.dispatch_callback(conn, Cb::Data)));
                }
            }
        }

        self.try_flush(conn);
    }

    fn sweep_timeouts(&self) {
        let now = self.inner.table.now_ms();
        let mut due = Vec::new();
        self.inner.table.each_open(|conn, slot| {
            if slot.state() != State::Open {
                return;
            }
            let timeout = slot.timeout_ms.load(Ordering::Acquire);
            if timeout == 0 {
                return;
            }
            if now.saturating_sub(slot.touched_ms.load(Ordering::Acquire)) >= timeout {
                // re-arm: a ping that does nothing fires again next round
                slot.touched_ms.store(now, Ordering::Release);
                due.push(conn);
            }
        });
        for conn in due {
            self.defer_task(Box::new(move |r| r.dispatch_callback(conn, Cb::Ping)));
        }
    }

    // ----- run -----------------------------------------------------------

    /// Requests a graceful stop: listeners close, every connection gets
    /// `on_shutdown` then a flushing close, and `run` returns after the
    /// drain window.
    pub fn stop(&self) {
        if !self.inner.stopping.swap(true, Ordering::AcqRel) {
            log::info!("shutdown requested");
        }
        self.wake();
    }

    /// Runs the reactor until stopped. With `workers > 0` the calling
    /// process becomes the supervising master: it forks the workers,
    /// respawns any that die, and relays published messages between
    /// them. Worker processes never return from this call.
    pub fn run(&self, opts: Run) -> Result<()> {
        supervisor::install_signal_handlers()?;
        supervisor::clear_signal_flags();
        self.inner.stopping.store(false, Ordering::Release);

        let threads = supervisor::resolve_count(opts.threads, 1);
        let workers = supervisor::resolve_count(opts.workers, 0);
        self.inner.threads.store(threads, Ordering::Release);
        self.inner.running.store(true, Ordering::Release);

        self.fire_hooks(When::BeforeFork);

        if workers > 0 {
            log::info!("spawning {} worker(s)", workers);
            self.spawn_workers(workers)?;
            self.fire_hooks(When::AfterFork);
            // the master supervises and relays; workers do the serving
        } else {
            self.fire_hooks(When::AfterFork);
            self.install_all_listeners();
        }

        let pool = self.spawn_pool(threads);
        self.fire_hooks(When::OnStart);

        self.event_loop();
        self.shutdown_sequence(pool);

        self.fire_hooks(When::OnFinish);
        self.inner.running.store(false, Ordering::Release);
        Ok(())
    }

    fn spawn_pool(&self, threads: usize) -> Vec<thread::JoinHandle<()>> {
        let mut pool = Vec::with_capacity(threads);
        for i in 0..threads {
            let r = self.clone();
            let handle = thread::Builder::new()
                .name(format!("hive-io-{}", i))
                .spawn(move || r.inner.tasks.worker_loop(&r));
            match handle {
                Ok(h) => pool.push(h),
                Err(e) => log::error!("cannot spawn worker thread: {}", e),
            }
        }
        pool
    }

    fn spawn_workers(&self, count: usize) -> Result<()> {
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            pairs.push(socket::pair()?);
        }
        self.inner.bus.set_master();

        let mut pids = Vec::with_capacity(count);
        for i in 0..count {
            match supervisor::fork()? {
                Forked::Child => {
                    // keep only this worker's end of its own pair
                    for (j, (master_end, worker_end)) in pairs.iter().enumerate() {
                        socket::close(*master_end);
                        if j != i {
                            socket::close(*worker_end);
                        }
                    }
                    self.worker_main(pairs[i].1);
                }
                Forked::Parent(pid) => pids.push(pid),
            }
        }

        // master keeps only its own ends
        for (i, (master_end, worker_end)) in pairs.iter().enumerate() {
            socket::close(*worker_end);
            self.register_worker(pids[i], *master_end);
        }
        Ok(())
    }

    fn register_worker(&self, pid: pid_t, fd: RawFd) {
        self.inner.workers.lock().unwrap().push(pid);
        if let Err(e) = self.install_hub_link(pid, fd) {
            log::error!("cannot register worker {}: {}", pid, e);
        }
    }

    fn install_hub_link(&self, pid: pid_t, fd: RawFd) -> Result<()> {
        socket::set_nonblocking(fd, true)?;
        let conn = self.inner.table.claim(ConnIo::new(fd, None))?;
        self.attach_boxed(conn, Box::new(HubLink::new()))?;
        {
            let poller = self.inner.poller.read().unwrap();
            poller.add(fd, Token::from_fd(fd), Ready::readable() | Ready::writable())?;
        }
        self.inner.bus.add_link(pid, conn);
        Ok(())
    }

    /// Worker processes run here and exit from inside; only their
    /// master returns from `run`.
    fn worker_main(&self, link_fd: RawFd) -> ! {
        self.inner.is_worker.store(true, Ordering::Release);
        supervisor::clear_signal_flags();

        if let Err(e) = self.fork_reset(link_fd) {
            log::error!("worker bring-up failed: {}", e);
            process::exit(1);
        }

        self.fire_hooks(When::AfterFork);
        self.fire_hooks(When::InChild);

        if let Err(e) = self.install_worker_link(link_fd) {
            log::error!("worker cannot reach the master: {}", e);
            process::exit(1);
        }
        self.install_all_listeners();

        let pool = self.spawn_pool(self.inner.threads.load(Ordering::Acquire));
        self.fire_hooks(When::OnStart);

        self.event_loop();
        self.shutdown_sequence(pool);
        self.fire_hooks(When::OnFinish);

        process::exit(0)
    }

    fn install_worker_link(&self, fd: RawFd) -> Result<()> {
        socket::set_nonblocking(fd, true)?;
        let conn = self.inner.table.claim(ConnIo::new(fd, None))?;
        self.attach_boxed(conn, Box::new(WorkerLink::new()))?;
        {
            let poller = self.inner.poller.read().unwrap();
            poller.add(fd, Token::from_fd(fd), Ready::readable() | Ready::writable())?;
        }
        self.inner.bus.set_worker(conn);
        Ok(())
    }

    /// Post-fork reinitialization: fresh poller, empty task rings and
    /// timer wheel, and none of the parent's connections. Listener fds
    /// (shared with every sibling) and this worker's own link survive.
    fn fork_reset(&self, keep_fd: RawFd) -> Result<()> {
        self.inner.tasks.fork_reset();
        self.inner.timers.fork_reset();
        self.inner.bus.reset();
        self.inner.workers.lock().unwrap().clear();
        self.inner.active_listeners.lock().unwrap().clear();
        self.inner.stopping.store(false, Ordering::Release);

        let shared: Vec<RawFd> = {
            let listeners = self.inner.listeners.lock().unwrap();
            listeners.iter().map(|c| c.fd).collect()
        };

        let mut inherited = Vec::new();
        self.inner.table.each_open(|conn, _| inherited.push(conn));
        for conn in inherited {
            if let Some(io) = self.inner.table.release(conn) {
                if io.fd != keep_fd && !shared.contains(&io.fd) {
                    socket::close(io.fd);
                }
            }
        }

        *self.inner.poller.write().unwrap() = Poller::new()?;
        Ok(())
    }

    fn handle_dead_children(&self) {
        for pid in supervisor::reap_children() {
            self.inner.workers.lock().unwrap().retain(|p| *p != pid);
            if let Some(conn) = self.inner.bus.drop_link_for_pid(pid) {
                self.close_now(conn);
            }
            if self.is_stopping() {
                log::info!("worker {} exited", pid);
            } else {
                log::warn!("worker {} died, respawning", pid);
                self.respawn_worker();
            }
        }
    }

    fn respawn_worker(&self) {
        let (master_end, worker_end) = match socket::pair() {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("cannot create a worker socket pair: {}", e);
                return;
            }
        };
        match supervisor::fork() {
            Ok(Forked::Child) => {
                socket::close(master_end);
                self.worker_main(worker_end);
            }
            Ok(Forked::Parent(pid)) => {
                socket::close(worker_end);
                self.register_worker(pid, master_end);
            }
            Err(e) => {
                socket::close(master_end);
                socket::close(worker_end);
                log::error!("cannot fork a replacement worker: {}", e);
            }
        }
    }

    fn event_loop(&self) {
        let mut events = Events::with_capacity(1024);
        let mut last_sweep = Instant::now();

        loop {
            if supervisor::stop_flag_raised() {
                self.stop();
            }
            if self.is_master() && supervisor::take_child_signal() {
                self.handle_dead_children();
            }
            if self.is_stopping() {
                return;
            }

            let now = Instant::now();
            for entry in self.inner.timers.take_due(now) {
                self.inner.timers.fire(self, entry);
            }
            if now.duration_since(last_sweep) >= Duration::from_secs(1) {
                last_sweep = now;
                self.sweep_timeouts();
            }

            let mut timeout = TICK_CEILING;
            if let Some(deadline) = self.inner.timers.next_deadline() {
                timeout = timeout.min(deadline.saturating_duration_since(now));
            }
            if !self.inner.tasks.is_empty() {
                timeout = Duration::ZERO;
            }

            let n = self.poll_once(&mut events, timeout);
            if n == 0 && !self.is_stopping() {
                self.fire_hooks(When::OnIdle);
            }

            self.inner.tasks.perform(self);
        }
    }

    fn poll_once(&self, events: &mut Events, timeout: Duration) -> usize {
        let n = {
            let poller = self.inner.poller.read().unwrap();
            match poller.wait(events, Some(timeout)) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("poll failed: {}", e);
                    self.stop();
                    0
                }
            }
        };
        for i in 0..n {
            if let Some(ev) = events.get(i) {
                self.handle_event(ev);
            }
        }
        n
    }

    /// Connections that still matter for the drain decision: everything
    /// but the bus links, which only close once the peers are gone.
    fn open_user_conns(&self) -> usize {
        let mut count = 0;
        self.inner.table.each_open(|conn, _| {
            if !self.inner.bus.is_link(conn) {
                count += 1;
            }
        });
        count
    }

    fn shutdown_sequence(&self, pool: Vec<thread::JoinHandle<()>>) {
        self.fire_hooks(When::OnShutdown);

        // children first, so their drains run concurrently with ours
        let children: Vec<pid_t> = self.inner.workers.lock().unwrap().clone();
        for pid in &children {
            supervisor::terminate(*pid);
        }

        // stop accepting
        let listeners: Vec<ConnId> =
            mem::take(&mut *self.inner.active_listeners.lock().unwrap());
        for conn in listeners {
            self.close_now(conn);
        }

        // every surviving connection: on_shutdown, then a flushing close
        let mut conns = Vec::new();
        self.inner.table.each_open(|conn, _| {
            if !self.inner.bus.is_link(conn) {
                conns.push(conn);
            }
        });
        for conn in conns {
            self.defer_task(Box::new(move |r| r.dispatch_callback(conn, Cb::Shutdown)));
            self.defer_task(Box::new(move |r| r.close(conn)));
        }

        // bounded drain: keep servicing I/O while connections wind down
        let deadline = Instant::now() + DRAIN_WINDOW;
        let mut events = Events::with_capacity(1024);
        loop {
            self.inner.tasks.perform(self);
            if self.is_master() && supervisor::take_child_signal() {
                self.handle_dead_children();
            }
            if self.open_user_conns() == 0 || Instant::now() >= deadline {
                break;
            }
            self.poll_once(&mut events, Duration::from_millis(50));
        }

        // whatever remains goes down hard, deallocs included
        let mut leftover = Vec::new();
        self.inner.table.each_open(|conn, _| leftover.push(conn));
        for conn in leftover {
            self.close_now(conn);
        }
        self.inner.tasks.perform(self);

        self.inner.timers.finish_all(self);

        self.inner.tasks.stop();
        for handle in pool {
            let _ = handle.join();
        }

        for pid in children {
            supervisor::join(pid);
        }
        self.inner.tasks.perform(self);
    }
}

/// Internal protocol for listening sockets: `on_data` means pending
/// connections; drain the accept queue.
struct ListenerProtocol {
    on_open: OnOpen,
    on_finish: OnFinish,
    timeout: Option<Duration>,
    url: String,
}

impl Protocol for ListenerProtocol {
    fn service(&self) -> &'static str {
        "listener"
    }

    fn on_data(&mut self, r: &Reactor, conn: ConnId) {
        let listener_fd = match r.raw_fd(conn) {
            Ok(fd) => fd,
            Err(_) => return,
        };
        loop {
            match socket::accept(listener_fd) {
                Ok((fd, peer)) => {
                    r.adopt_incoming(fd, peer, self.on_open.clone(), self.timeout);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    // fd exhaustion and transient accept failures: skip
                    // this round instead of tearing the listener down
                    log::warn!("accept on {} failed: {}", self.url, e);
                    break;
                }
            }
        }
    }

    fn ping(&mut self, _r: &Reactor, _conn: ConnId) {
        // listeners have no idle timeout
    }

    fn on_close(&mut self, _conn: ConnId) {
        if let Some(f) = self.on_finish.lock().unwrap().take() {
            f();
        }
    }
}
