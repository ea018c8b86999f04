use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use indexmap::{IndexMap, IndexSet};
use slab::Slab;

use crate::conn::ConnId;
use crate::error::Result;
use crate::glob::glob_match;
use crate::reactor::Reactor;

/// A published payload, copied once and shared by reference with every
/// local recipient and with the cluster codec.
pub struct Message {
    filter: i32,
    channel: Box<[u8]>,
    data: Box<[u8]>,
}

impl Message {
    pub(crate) fn new(filter: i32, channel: &[u8], data: &[u8]) -> Arc<Message> {
        Arc::new(Message {
            filter,
            channel: channel.into(),
            data: data.into(),
        })
    }

    /// `0` for user traffic; anything else is a system/RPC namespace.
    pub fn filter(&self) -> i32 {
        self.filter
    }

    pub fn channel(&self) -> &[u8] {
        &self.channel
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Message")
            .field("filter", &self.filter)
            .field("channel", &String::from_utf8_lossy(&self.channel))
            .field("len", &self.data.len())
            .finish()
    }
}

pub(crate) type OnMessage = Box<dyn Fn(&Reactor, &Arc<Message>) + Send + Sync>;

/// One live subscription. Owned by the channel index; connections and
/// user code hold [`SubHandle`] weak references to it.
pub struct Subscription {
    id: usize,
    conn: Option<ConnId>,
    filter: i32,
    channel: Box<[u8]>,
    pattern: bool,
    on_message: OnMessage,
    on_unsubscribe: Mutex<Option<Box<dyn FnOnce(&Reactor) + Send>>>,
    /// Duplicate-subscribe count for the same (conn, filter, channel,
    /// pattern) key.
    refs: AtomicU32,
    active: AtomicBool,
}

impl Subscription {
    pub(crate) fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    pub(crate) fn filter(&self) -> i32 {
        self.filter
    }

    pub(crate) fn channel(&self) -> &[u8] {
        &self.channel
    }

    pub(crate) fn is_pattern(&self) -> bool {
        self.pattern
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn invoke(&self, r: &Reactor, msg: &Arc<Message>) {
        (self.on_message)(r, msg);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("conn", &self.conn)
            .field("filter", &self.filter)
            .field("channel", &String::from_utf8_lossy(&self.channel))
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Handle returned by [`Reactor::subscribe`](crate::Reactor::subscribe);
/// pass it back to [`Reactor::unsubscribe`](crate::Reactor::unsubscribe).
/// Dropping the handle does not unsubscribe.
#[derive(Clone, Debug)]
pub struct SubHandle(pub(crate) Weak<Subscription>);

/// A pluggable pub/sub backend. The built-in behavior (local fan-out
/// plus the worker bus) stands in when no engine is attached; attached
/// engines are told when a channel gains its first subscription and
/// loses its last, and may take over publishing entirely via
/// [`Publish::engine`].
pub trait Engine: Send + Sync {
    /// A channel just gained its first local subscription.
    fn on_subscribe(&self, _r: &Reactor, _filter: i32, _channel: &[u8], _pattern: bool) {}

    /// A channel just lost its last local subscription.
    fn on_unsubscribe(&self, _r: &Reactor, _filter: i32, _channel: &[u8], _pattern: bool) {}

    /// Route a publish through this engine.
    fn publish(&self, r: &Reactor, msg: &Arc<Message>, to_cluster: bool) -> Result<()>;
}

/// Builder for one subscription; see
/// [`Reactor::subscribe`](crate::Reactor::subscribe).
pub struct Subscribe {
    pub(crate) conn: Option<ConnId>,
    pub(crate) filter: i32,
    pub(crate) channel: Vec<u8>,
    pub(crate) pattern: bool,
    pub(crate) on_message: Option<OnMessage>,
    pub(crate) on_unsubscribe: Option<Box<dyn FnOnce(&Reactor) + Send>>,
}

impl Subscribe {
    /// Subscribes to an exact channel name.
    pub fn to(channel: impl Into<Vec<u8>>) -> Subscribe {
        Subscribe {
            conn: None,
            filter: 0,
            channel: channel.into(),
            pattern: false,
            on_message: None,
            on_unsubscribe: None,
        }
    }

    /// Subscribes to a glob pattern (see [`crate::glob`]).
    pub fn pattern(channel: impl Into<Vec<u8>>) -> Subscribe {
        let mut s = Subscribe::to(channel);
        s.pattern = true;
        s
    }

    /// Restricts the subscription to a numeric filter namespace.
    /// Filtered traffic never matches patterns.
    pub fn filter(mut self, filter: i32) -> Subscribe {
        self.filter = filter;
        self
    }

    /// Ties the subscription to a connection: delivery runs under that
    /// connection's task exclusion, and closing the connection
    /// unsubscribes.
    pub fn conn(mut self, conn: ConnId) -> Subscribe {
        self.conn = Some(conn);
        self
    }

    pub fn on_message(
        mut self,
        f: impl Fn(&Reactor, &Arc<Message>) + Send + Sync + 'static,
    ) -> Subscribe {
        self.on_message = Some(Box::new(f));
        self
    }

    /// Cleanup callback, run exactly once when the subscription leaves
    /// the index.
    pub fn on_unsubscribe(mut self, f: impl FnOnce(&Reactor) + Send + 'static) -> Subscribe {
        self.on_unsubscribe = Some(Box::new(f));
        self
    }
}

/// Builder for one publish; see
/// [`Reactor::publish`](crate::Reactor::publish).
pub struct Publish {
    pub(crate) filter: i32,
    pub(crate) channel: Vec<u8>,
    pub(crate) data: Vec<u8>,
    pub(crate) to_cluster: bool,
    pub(crate) engine: Option<Arc<dyn Engine>>,
}

impl Publish {
    pub fn to(channel: impl Into<Vec<u8>>) -> Publish {
        Publish {
            filter: 0,
            channel: channel.into(),
            data: Vec::new(),
            to_cluster: true,
            engine: None,
        }
    }

    pub fn message(mut self, data: impl Into<Vec<u8>>) -> Publish {
        self.data = data.into();
        self
    }

    pub fn filter(mut self, filter: i32) -> Publish {
        self.filter = filter;
        self
    }

    /// Deliver to this process only; peers never see the message.
    pub fn local_only(mut self) -> Publish {
        self.to_cluster = false;
        self
    }

    /// Route through an attached engine instead of the default fan-out.
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Publish {
        self.engine = Some(engine);
        self
    }
}

#[derive(Hash, PartialEq, Eq, Clone)]
struct ChanKey {
    filter: i32,
    name: Box<[u8]>,
}

struct Index {
    subs: Slab<Arc<Subscription>>,
    exact: IndexMap<ChanKey, IndexSet<usize>>,
    patterns: IndexMap<ChanKey, IndexSet<usize>>,
}

/// The channel/pattern subscription index. Lookups (every publish) take
/// the read lock; subscribe/unsubscribe take the write lock. The lock
/// is never held across user callbacks.
pub(crate) struct PubSub {
    index: RwLock<Index>,
    engines: Mutex<Vec<Arc<dyn Engine>>>,
}

/// Outcome of a subscribe: the subscription plus whether its channel is
/// new to the index (engines want to know).
pub(crate) struct Subscribed {
    pub(crate) sub: Arc<Subscription>,
    pub(crate) first_on_channel: bool,
}

impl PubSub {
    pub(crate) fn new() -> PubSub {
        PubSub {
            index: RwLock::new(Index {
                subs: Slab::new(),
                exact: IndexMap::new(),
                patterns: IndexMap::new(),
            }),
            engines: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self, args: Subscribe) -> Option<Subscribed> {
        let on_message = args.on_message?;
        let mut index = self.index.write().unwrap();
        let Index {
            subs,
            exact,
            patterns,
        } = &mut *index;

        let key = ChanKey {
            filter: args.filter,
            name: args.channel.clone().into_boxed_slice(),
        };
        let map = if args.pattern { patterns } else { exact };

        // duplicate subscribe on the same connection bumps a refcount
        if let (Some(conn), Some(set)) = (args.conn, map.get(&key)) {
            for id in set {
                let sub = &subs[*id];
                if sub.conn == Some(conn) {
                    sub.refs.fetch_add(1, Ordering::AcqRel);
                    return Some(Subscribed {
                        sub: sub.clone(),
                        first_on_channel: false,
                    });
                }
            }
        }

        let entry = subs.vacant_entry();
        let sub = Arc::new(Subscription {
            id: entry.key(),
            conn: args.conn,
            filter: args.filter,
            channel: args.channel.into_boxed_slice(),
            pattern: args.pattern,
            on_message,
            on_unsubscribe: Mutex::new(args.on_unsubscribe),
            refs: AtomicU32::new(1),
            active: AtomicBool::new(true),
        });
        let id = entry.key();
        entry.insert(sub.clone());

        let set = map.entry(key).or_insert_with(IndexSet::new);
        let first_on_channel = set.is_empty();
        set.insert(id);

        Some(Subscribed {
            sub,
            first_on_channel,
        })
    }

    /// Removes one reference (or all of them when `force`). Returns
    /// whether the channel lost its last subscription, or `None` if the
    /// subscription was already gone.
    pub(crate) fn unsubscribe(&self, sub: &Arc<Subscription>, force: bool) -> Option<bool> {
        let mut index = self.index.write().unwrap();

        if !sub.active.load(Ordering::Acquire) {
            return None;
        }

        if !force && sub.refs.fetch_sub(1, Ordering::AcqRel) > 1 {
            return Some(false);
        }

        sub.active.store(false, Ordering::Release);
        index.subs.try_remove(sub.id);

        let key = ChanKey {
            filter: sub.filter,
            name: sub.channel.clone(),
        };
        let map = if sub.pattern {
            &mut index.patterns
        } else {
            &mut index.exact
        };

        let mut last = false;
        if let Some(set) = map.get_mut(&key) {
            set.swap_remove(&sub.id);
            if set.is_empty() {
                map.swap_remove(&key);
                last = true;
            }
        }

        Some(last)
    }

    /// Everyone a message should reach locally, in index order. Pattern
    /// subscriptions only participate in the unfiltered namespace.
    pub(crate) fn collect_targets(&self, filter: i32, channel: &[u8]) -> Vec<Arc<Subscription>> {
        let index = self.index.read().unwrap();
        let mut targets = Vec::new();

        let key = ChanKey {
            filter,
            name: channel.into(),
        };
        if let Some(set) = index.exact.get(&key) {
            for id in set {
                if let Some(sub) = index.subs.get(*id) {
                    targets.push(sub.clone());
                }
            }
        }

        if filter == 0 {
            for (key, set) in &index.patterns {
                if key.filter == 0 && glob_match(&key.name, channel) {
                    for id in set {
                        if let Some(sub) = index.subs.get(*id) {
                            targets.push(sub.clone());
                        }
                    }
                }
            }
        }

        targets
    }

    /// Runs the subscription's cleanup callback; safe to call once the
    /// subscription left the index.
    pub(crate) fn run_cleanup(&self, r: &Reactor, sub: &Subscription) {
        let cb = sub.on_unsubscribe.lock().unwrap().take();
        if let Some(cb) = cb {
            cb(r);
        }
    }

    pub(crate) fn attach_engine(&self, e: Arc<dyn Engine>) -> Vec<(i32, Box<[u8]>, bool)> {
        self.engines.lock().unwrap().push(e);
        // existing channels, so the new engine can mirror them
        let index = self.index.read().unwrap();
        index
            .exact
            .keys()
            .map(|k| (k.filter, k.name.clone(), false))
            .chain(index.patterns.keys().map(|k| (k.filter, k.name.clone(), true)))
            .collect()
    }

    pub(crate) fn detach_engine(&self, e: &Arc<dyn Engine>) {
        self.engines
            .lock()
            .unwrap()
            .retain(|cur| !Arc::ptr_eq(cur, e));
    }

    pub(crate) fn engines(&self) -> Vec<Arc<dyn Engine>> {
        self.engines.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::{PubSub, Subscribe};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn sub_args(channel: &str) -> Subscribe {
        Subscribe::to(channel).on_message(|_, _| {})
    }

    #[test]
    fn exact_lookup_matches_channel_and_filter() {
        let ps = PubSub::new();
        ps.subscribe(sub_args("news")).unwrap();
        ps.subscribe(Subscribe::to("news").filter(9).on_message(|_, _| {}))
            .unwrap();

        assert_eq!(ps.collect_targets(0, b"news").len(), 1);
        assert_eq!(ps.collect_targets(9, b"news").len(), 1);
        assert_eq!(ps.collect_targets(0, b"sports").len(), 0);
        assert_eq!(ps.collect_targets(3, b"news").len(), 0);
    }

    #[test]
    fn patterns_match_unfiltered_traffic_only() {
        let ps = PubSub::new();
        ps.subscribe(Subscribe::pattern("news.*").on_message(|_, _| {}))
            .unwrap();
        ps.subscribe(Subscribe::pattern("news.*").filter(5).on_message(|_, _| {}))
            .unwrap();

        assert_eq!(ps.collect_targets(0, b"news.sports").len(), 1);
        // filtered publishes bypass patterns entirely
        assert_eq!(ps.collect_targets(5, b"news.sports").len(), 0);
    }

    #[test]
    fn glob_routing_scenario() {
        let ps = PubSub::new();
        let a = ps
            .subscribe(Subscribe::pattern("news.*").on_message(|_, _| {}))
            .unwrap();
        let b = ps.subscribe(sub_args("news.sports")).unwrap();
        let c = ps.subscribe(sub_args("news.tech")).unwrap();

        let hit = ps.collect_targets(0, b"news.sports");
        assert_eq!(hit.len(), 2);
        assert!(hit.iter().any(|s| Arc::ptr_eq(s, &a.sub)));
        assert!(hit.iter().any(|s| Arc::ptr_eq(s, &b.sub)));
        assert!(!hit.iter().any(|s| Arc::ptr_eq(s, &c.sub)));
    }

    #[test]
    fn first_and_last_channel_transitions() {
        let ps = PubSub::new();
        let a = ps.subscribe(sub_args("chat")).unwrap();
        assert!(a.first_on_channel);
        let b = ps.subscribe(sub_args("chat")).unwrap();
        assert!(!b.first_on_channel);

        assert_eq!(ps.unsubscribe(&a.sub, false), Some(false));
        assert_eq!(ps.unsubscribe(&b.sub, false), Some(true));
        // double unsubscribe is a silent no-op
        assert_eq!(ps.unsubscribe(&b.sub, false), None);
    }

    #[test]
    fn duplicate_conn_subscription_refcounts() {
        use crate::conn::ConnId;

        let ps = PubSub::new();
        let conn = ConnId::new(4, 1);
        let a = ps
            .subscribe(Subscribe::to("chat").conn(conn).on_message(|_, _| {}))
            .unwrap();
        let b = ps
            .subscribe(Subscribe::to("chat").conn(conn).on_message(|_, _| {}))
            .unwrap();
        assert!(Arc::ptr_eq(&a.sub, &b.sub));

        // two refs: the first unsubscribe keeps the subscription live
        assert_eq!(ps.unsubscribe(&a.sub, false), Some(false));
        assert!(a.sub.is_active());
        assert_eq!(ps.unsubscribe(&a.sub, false), Some(true));
        assert!(!a.sub.is_active());
    }

    #[test]
    fn force_release_ignores_refcount() {
        use crate::conn::ConnId;

        let ps = PubSub::new();
        let conn = ConnId::new(4, 1);
        let a = ps
            .subscribe(Subscribe::to("chat").conn(conn).on_message(|_, _| {}))
            .unwrap();
        ps.subscribe(Subscribe::to("chat").conn(conn).on_message(|_, _| {}))
            .unwrap();

        assert_eq!(ps.unsubscribe(&a.sub, true), Some(true));
        assert!(!a.sub.is_active());
    }

    #[test]
    fn subscribe_without_callback_is_rejected() {
        let ps = PubSub::new();
        assert!(ps.subscribe(Subscribe::to("chat")).is_none());
    }

    #[test]
    fn unsubscribed_target_stops_matching() {
        let _hits = AtomicUsize::new(0);
        let ps = PubSub::new();
        let s = ps.subscribe(sub_args("news")).unwrap();
        assert_eq!(ps.collect_targets(0, b"news").len(), 1);

        ps.unsubscribe(&s.sub, false);
        assert!(ps.collect_targets(0, b"news").is_empty());
    }
}
