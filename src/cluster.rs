//! The inter-worker message bus.
//!
//! Master and each worker share an `AF_UNIX` stream pair created before
//! the fork. Envelopes are length-prefixed datagrams in host byte
//! order (the bus never crosses hosts):
//!
//! ```text
//! u32 payload_len | u32 filter | u16 channel_len | u32 message_len
//! channel bytes   | message bytes
//! ```
//!
//! The master rebroadcasts every envelope it receives to every *other*
//! worker, and delivers it locally as well. Outgoing envelopes stage in
//! a bounded per-link buffer: when it overflows, the oldest unfiltered
//! envelopes are shed first (lossy user traffic); a filtered envelope
//! that cannot be staged is an error the caller must treat as fatal for
//! the originating worker.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use crate::conn::ConnId;
use crate::error::{Error, Result};
use crate::protocol::Protocol;
use crate::pubsub::Message;
use crate::reactor::Reactor;

pub(crate) const HEADER_LEN: usize = 14;
/// Upper bound on one message body; a frame claiming more is treated as
/// link corruption.
pub(crate) const MAX_MESSAGE: usize = 1 << 26;
/// Staged bytes allowed per link before the shed policy kicks in.
const BACKLOG_CAP: usize = 8 << 20;
/// Stop feeding a link's connection once this much is already queued on
/// it; `on_ready` pumps the rest.
const PUMP_WATERMARK: usize = 1 << 20;

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Envelope {
    pub(crate) filter: i32,
    pub(crate) channel: Vec<u8>,
    pub(crate) data: Vec<u8>,
}

pub(crate) fn encode(filter: i32, channel: &[u8], data: &[u8]) -> Vec<u8> {
    let payload = channel.len() + data.len();
    let mut frame = Vec::with_capacity(HEADER_LEN + payload);
    frame.extend_from_slice(&(payload as u32).to_ne_bytes());
    frame.extend_from_slice(&(filter as u32).to_ne_bytes());
    frame.extend_from_slice(&(channel.len() as u16).to_ne_bytes());
    frame.extend_from_slice(&(data.len() as u32).to_ne_bytes());
    frame.extend_from_slice(channel);
    frame.extend_from_slice(data);
    frame
}

pub(crate) fn encode_message(msg: &Message) -> Vec<u8> {
    encode(msg.filter(), msg.channel(), msg.data())
}

#[derive(Debug)]
pub(crate) struct FrameError(&'static str);

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Incremental envelope parser; carries the partial tail between reads.
pub(crate) struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    pub(crate) fn new() -> FrameParser {
        FrameParser { buf: Vec::new() }
    }

    pub(crate) fn feed(&mut self, bytes: &[u8]) -> std::result::Result<Vec<Envelope>, FrameError> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let payload_len = u32::from_ne_bytes(self.buf[0..4].try_into().unwrap()) as usize;
            let filter = u32::from_ne_bytes(self.buf[4..8].try_into().unwrap()) as i32;
            let channel_len = u16::from_ne_bytes(self.buf[8..10].try_into().unwrap()) as usize;
            let message_len = u32::from_ne_bytes(self.buf[10..14].try_into().unwrap()) as usize;

            if channel_len + message_len != payload_len {
                return Err(FrameError("length fields disagree"));
            }
            if message_len > MAX_MESSAGE {
                return Err(FrameError("message exceeds the frame cap"));
            }
            if self.buf.len() < HEADER_LEN + payload_len {
                break;
            }

            let channel = self.buf[HEADER_LEN..HEADER_LEN + channel_len].to_vec();
            let data =
                self.buf[HEADER_LEN + channel_len..HEADER_LEN + payload_len].to_vec();
            self.buf.drain(..HEADER_LEN + payload_len);

            out.push(Envelope {
                filter,
                channel,
                data,
            });
        }

        Ok(out)
    }
}

struct Frame {
    filtered: bool,
    data: Vec<u8>,
}

/// Bounded staging buffer for one link.
struct LinkOut {
    frames: VecDeque<Frame>,
    bytes: usize,
}

impl LinkOut {
    fn new() -> LinkOut {
        LinkOut {
            frames: VecDeque::new(),
            bytes: 0,
        }
    }

    fn push(&mut self, data: Vec<u8>, filtered: bool) -> Result<()> {
        self.bytes += data.len();
        self.frames.push_back(Frame { filtered, data });

        let mut shed = 0usize;
        while self.bytes > BACKLOG_CAP {
            match self.frames.iter().position(|f| !f.filtered) {
                Some(at) => {
                    let f = self.frames.remove(at).expect("position was just found");
                    self.bytes -= f.data.len();
                    shed += 1;
                }
                None => return Err(Error::ClusterOverflow),
            }
        }
        if shed > 0 {
            log::warn!("cluster backlog full: shed {} oldest message(s)", shed);
        }

        Ok(())
    }

    fn clear(&mut self) {
        self.frames.clear();
        self.bytes = 0;
    }
}

struct WorkerSide {
    conn: ConnId,
    out: LinkOut,
}

struct LinkSlot {
    pid: libc::pid_t,
    conn: Option<ConnId>,
    out: LinkOut,
}

enum Role {
    Inactive,
    Worker(WorkerSide),
    Master(Vec<LinkSlot>),
}

/// Process role and link bookkeeping. Single-process runs stay
/// `Inactive` and every publish is local.
pub(crate) struct ClusterBus {
    role: Mutex<Role>,
}

impl ClusterBus {
    pub(crate) fn new() -> ClusterBus {
        ClusterBus {
            role: Mutex::new(Role::Inactive),
        }
    }

    pub(crate) fn set_worker(&self, conn: ConnId) {
        *self.role.lock().unwrap() = Role::Worker(WorkerSide {
            conn,
            out: LinkOut::new(),
        });
    }

    pub(crate) fn set_master(&self) {
        *self.role.lock().unwrap() = Role::Master(Vec::new());
    }

    pub(crate) fn reset(&self) {
        *self.role.lock().unwrap() = Role::Inactive;
    }

    /// Registers a worker's link in the master; returns its index.
    pub(crate) fn add_link(&self, pid: libc::pid_t, conn: ConnId) -> usize {
        let mut role = self.role.lock().unwrap();
        let links = match &mut *role {
            Role::Master(links) => links,
            _ => {
                *role = Role::Master(Vec::new());
                match &mut *role {
                    Role::Master(links) => links,
                    _ => unreachable!(),
                }
            }
        };
        links.push(LinkSlot {
            pid,
            conn: Some(conn),
            out: LinkOut::new(),
        });
        links.len() - 1
    }

    /// Marks a dead worker's link and hands back its connection so the
    /// caller can close it. Staged frames for that worker are gone.
    pub(crate) fn drop_link_for_pid(&self, pid: libc::pid_t) -> Option<ConnId> {
        let mut role = self.role.lock().unwrap();
        if let Role::Master(links) = &mut *role {
            for slot in links.iter_mut() {
                if slot.pid == pid {
                    slot.out.clear();
                    return slot.conn.take();
                }
            }
        }
        None
    }

    pub(crate) fn link_conn_closed(&self, conn: ConnId) {
        let mut role = self.role.lock().unwrap();
        if let Role::Master(links) = &mut *role {
            for slot in links.iter_mut() {
                if slot.conn == Some(conn) {
                    slot.conn = None;
                    slot.out.clear();
                }
            }
        }
    }

    /// Whether `conn` is this worker's lifeline to the master.
    pub(crate) fn is_worker_link(&self, conn: ConnId) -> bool {
        matches!(&*self.role.lock().unwrap(), Role::Worker(w) if w.conn == conn)
    }

    /// Whether `conn` belongs to the bus on either side.
    pub(crate) fn is_link(&self, conn: ConnId) -> bool {
        match &*self.role.lock().unwrap() {
            Role::Worker(w) => w.conn == conn,
            Role::Master(links) => links.iter().any(|s| s.conn == Some(conn)),
            Role::Inactive => false,
        }
    }

    /// Worker path: stage a frame for the master.
    pub(crate) fn stage_to_master(&self, frame: Vec<u8>, filtered: bool) -> Result<()> {
        let mut role = self.role.lock().unwrap();
        match &mut *role {
            Role::Worker(w) => w.out.push(frame, filtered),
            _ => Ok(()),
        }
    }

    /// Master path: stage a frame for every live worker except the one
    /// it came from.
    pub(crate) fn stage_broadcast(
        &self,
        except: Option<ConnId>,
        frame: &[u8],
        filtered: bool,
    ) -> Result<()> {
        let mut role = self.role.lock().unwrap();
        if let Role::Master(links) = &mut *role {
            for slot in links.iter_mut() {
                match slot.conn {
                    Some(conn) if Some(conn) != except => {
                        slot.out.push(frame.to_vec(), filtered)?;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Pops frames that fit under each link's queue watermark. The
    /// caller performs the writes after this returns, so no connection
    /// lock is taken while the bus lock is held.
    pub(crate) fn take_ready(
        &self,
        mut pending_of: impl FnMut(ConnId) -> usize,
    ) -> Vec<(ConnId, Vec<u8>)> {
        let mut batch = Vec::new();
        let mut role = self.role.lock().unwrap();

        let mut drain = |conn: ConnId, out: &mut LinkOut| {
            let pending = pending_of(conn);
            if pending >= PUMP_WATERMARK {
                return;
            }
            let mut budget = PUMP_WATERMARK - pending;
            let mut took = false;
            while let Some(front) = out.frames.front() {
                // an oversized frame may go out alone on an idle link;
                // otherwise it waits for the queue to drain
                if front.data.len() > budget && (took || pending > 0) {
                    break;
                }
                let f = out.frames.pop_front().expect("front was just observed");
                budget = budget.saturating_sub(f.data.len());
                out.bytes -= f.data.len();
                batch.push((conn, f.data));
                took = true;
            }
        };

        match &mut *role {
            Role::Worker(w) => drain(w.conn, &mut w.out),
            Role::Master(links) => {
                for slot in links.iter_mut() {
                    if let Some(conn) = slot.conn {
                        drain(conn, &mut slot.out);
                    }
                }
            }
            Role::Inactive => {}
        }

        batch
    }

    pub(crate) fn is_active(&self) -> bool {
        !matches!(&*self.role.lock().unwrap(), Role::Inactive)
    }
}

/// Worker-side protocol on the socket pair: parse envelopes, deliver
/// locally. Loss of this connection means the master is gone, which the
/// reactor treats as a shutdown order.
pub(crate) struct WorkerLink {
    parser: FrameParser,
}

impl WorkerLink {
    pub(crate) fn new() -> WorkerLink {
        WorkerLink {
            parser: FrameParser::new(),
        }
    }
}

impl Protocol for WorkerLink {
    fn service(&self) -> &'static str {
        "cluster-link"
    }

    fn on_data(&mut self, r: &Reactor, conn: ConnId) {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match r.read(conn, &mut buf) {
                Ok(0) => return,
                Ok(n) => match self.parser.feed(&buf[..n]) {
                    Ok(envelopes) => {
                        for env in envelopes {
                            r.deliver_envelope(env);
                        }
                    }
                    Err(e) => {
                        log::error!("cluster link corrupted ({}), dropping it", e);
                        r.close_now(conn);
                        return;
                    }
                },
                Err(ref e) if e.is_would_block() => return,
                Err(_) => return,
            }
        }
    }

    fn on_ready(&mut self, r: &Reactor, _conn: ConnId) {
        r.pump_cluster();
    }

    fn ping(&mut self, _r: &Reactor, _conn: ConnId) {
        // the bus has no idle timeout
    }
}

/// Master-side protocol, one per worker link: parse, rebroadcast to the
/// other workers, deliver locally.
pub(crate) struct HubLink {
    parser: FrameParser,
}

impl HubLink {
    pub(crate) fn new() -> HubLink {
        HubLink {
            parser: FrameParser::new(),
        }
    }
}

impl Protocol for HubLink {
    fn service(&self) -> &'static str {
        "cluster-hub"
    }

    fn on_data(&mut self, r: &Reactor, conn: ConnId) {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match r.read(conn, &mut buf) {
                Ok(0) => return,
                Ok(n) => match self.parser.feed(&buf[..n]) {
                    Ok(envelopes) => {
                        for env in envelopes {
                            r.hub_rebroadcast(conn, &env);
                            r.deliver_envelope(env);
                        }
                    }
                    Err(e) => {
                        log::error!("worker link corrupted ({}), dropping it", e);
                        r.close_now(conn);
                        return;
                    }
                },
                Err(ref e) if e.is_would_block() => return,
                Err(_) => return,
            }
        }
    }

    fn on_ready(&mut self, r: &Reactor, _conn: ConnId) {
        r.pump_cluster();
    }

    fn ping(&mut self, _r: &Reactor, _conn: ConnId) {}
}

#[cfg(test)]
mod tests {
    use super::{encode, ClusterBus, Envelope, FrameParser, HEADER_LEN};
    use crate::conn::ConnId;

    #[test]
    fn encode_then_parse() {
        let frame = encode(7, b"news", b"hello");
        assert_eq!(frame.len(), HEADER_LEN + 4 + 5);

        let mut parser = FrameParser::new();
        let envs = parser.feed(&frame).unwrap();
        assert_eq!(
            envs,
            vec![Envelope {
                filter: 7,
                channel: b"news".to_vec(),
                data: b"hello".to_vec(),
            }]
        );
    }

    #[test]
    fn parser_handles_split_and_batched_frames() {
        let mut stream = encode(0, b"a", b"first");
        stream.extend_from_slice(&encode(0, b"b", b"second"));

        let mut parser = FrameParser::new();
        let mut got = Vec::new();
        // feed one byte at a time: worst-case splitting
        for b in &stream {
            got.extend(parser.feed(std::slice::from_ref(b)).unwrap());
        }

        assert_eq!(got.len(), 2);
        assert_eq!(got[0].data, b"first");
        assert_eq!(got[1].channel, b"b");
    }

    #[test]
    fn parser_rejects_inconsistent_lengths() {
        let mut frame = encode(0, b"chan", b"data");
        // corrupt the payload length
        frame[0] ^= 0xff;
        let mut parser = FrameParser::new();
        assert!(parser.feed(&frame).is_err());
    }

    #[test]
    fn empty_channel_and_message_round_trip() {
        let frame = encode(-3, b"", b"");
        let mut parser = FrameParser::new();
        let envs = parser.feed(&frame).unwrap();
        assert_eq!(envs[0].filter, -3);
        assert!(envs[0].channel.is_empty());
        assert!(envs[0].data.is_empty());
    }

    #[test]
    fn overflow_sheds_unfiltered_before_filtered() {
        let bus = ClusterBus::new();
        let conn = ConnId::new(3, 1);
        bus.set_worker(conn);

        // fill well past the cap with unfiltered traffic
        let big = vec![0u8; 3 << 20];
        for _ in 0..4 {
            bus.stage_to_master(big.clone(), false).unwrap();
        }
        // filtered frames still fit: older unfiltered ones were shed
        bus.stage_to_master(vec![1, 2, 3], true).unwrap();

        // repeated pumps (as on_ready would trigger) drain the backlog
        let mut frames = Vec::new();
        loop {
            let batch = bus.take_ready(|_| 0);
            if batch.is_empty() {
                break;
            }
            frames.extend(batch.into_iter().map(|(_, f)| f));
        }

        let total: usize = frames.iter().map(Vec::len).sum();
        assert!(total <= super::BACKLOG_CAP);
        assert!(frames.iter().any(|f| f.as_slice() == [1, 2, 3]));
    }

    #[test]
    fn overflow_with_only_filtered_frames_is_fatal() {
        let bus = ClusterBus::new();
        bus.set_worker(ConnId::new(3, 1));

        let big = vec![0u8; 3 << 20];
        let mut failed = false;
        for _ in 0..4 {
            if bus.stage_to_master(big.clone(), true).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed, "filtered frames must never be silently shed");
    }

    #[test]
    fn broadcast_skips_the_origin() {
        let bus = ClusterBus::new();
        bus.set_master();
        let a = ConnId::new(10, 1);
        let b = ConnId::new(11, 1);
        bus.add_link(100, a);
        bus.add_link(101, b);

        bus.stage_broadcast(Some(a), b"frame", false).unwrap();
        let batch = bus.take_ready(|_| 0);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0, b);
    }

    #[test]
    fn dead_link_gets_no_frames() {
        let bus = ClusterBus::new();
        bus.set_master();
        let a = ConnId::new(10, 1);
        bus.add_link(100, a);
        bus.link_conn_closed(a);

        bus.stage_broadcast(None, b"frame", false).unwrap();
        assert!(bus.take_ready(|_| 0).is_empty());
    }
}
