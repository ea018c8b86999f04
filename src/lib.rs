//! An evented network framework for Rust: a non-blocking reactor with
//! pluggable per-connection protocols, write scheduling with
//! back-pressure, millisecond timers, process-local pub/sub and a
//! forked-worker cluster that fans published messages out across
//! workers.
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! hive-io = "0.1"
//! ```
//!
//! # Example
//!
//! An echo server on four worker threads:
//!
//! ```no_run
//! use hive_io::{ConnId, Listen, Protocol, Reactor, Run};
//!
//! struct Echo;
//!
//! impl Protocol for Echo {
//!     fn on_data(&mut self, r: &Reactor, conn: ConnId) {
//!         let mut buf = [0u8; 4096];
//!         // edge-triggered: drain until WouldBlock
//!         while let Ok(n) = r.read(conn, &mut buf) {
//!             if n == 0 {
//!                 return;
//!             }
//!             let _ = r.write_copy(conn, &buf[..n]);
//!         }
//!     }
//! }
//!
//! let r = Reactor::new().unwrap();
//! r.listen(Listen::new("tcp://0.0.0.0:3000").on_open(|r, conn| {
//!     r.attach(conn, Echo).unwrap();
//! }))
//! .unwrap();
//! r.run(Run::new().threads(4)).unwrap();
//! ```
//!
//! Messages published on any worker reach subscribers on every worker:
//!
//! ```no_run
//! use hive_io::{Publish, Reactor, Subscribe};
//!
//! # let r = Reactor::new().unwrap();
//! r.subscribe(Subscribe::pattern("news.*").on_message(|_r, msg| {
//!     println!("{:?}", msg);
//! }))
//! .unwrap();
//! r.publish(Publish::to("news.tech").message("hello")).unwrap();
//! ```

mod cluster;
mod conn;
mod defer;
mod error;
mod packet;
mod protocol;
mod pubsub;
mod reactor;
mod supervisor;
mod sys;
mod timers;

pub mod glob;
pub mod poller;
pub mod url;

pub use conn::ConnId;

pub use error::{Error, Result};

pub use packet::Packet;

pub use protocol::{Protocol, RwHook};

pub use pubsub::{Engine, Message, Publish, SubHandle, Subscribe, Subscription};

pub use reactor::{Bound, Connect, Listen, Reactor, Run};

pub use supervisor::When;

pub use timers::Every;

pub use url::Addr;
