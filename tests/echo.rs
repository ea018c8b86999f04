use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hive_io::{ConnId, Connect, Listen, Packet, Protocol, Reactor, Run};

struct Echo {
    closed: Arc<AtomicUsize>,
}

impl Protocol for Echo {
    fn on_data(&mut self, r: &Reactor, conn: ConnId) {
        let mut buf = [0u8; 4096];
        loop {
            match r.read(conn, &mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    r.write_copy(conn, &buf[..n]).unwrap();
                }
                Err(e) if e.is_would_block() => return,
                Err(_) => return,
            }
        }
    }

    fn on_close(&mut self, _conn: ConnId) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn echo_round_trip_and_close() {
    let _ = env_logger::builder().is_test(true).try_init();

    let r = Reactor::new().unwrap();
    let closed = Arc::new(AtomicUsize::new(0));

    let closed_cb = closed.clone();
    let bound = r
        .listen(Listen::new("tcp://127.0.0.1:0").on_open(move |r, conn| {
            r.attach(
                conn,
                Echo {
                    closed: closed_cb.clone(),
                },
            )
            .unwrap();
        }))
        .unwrap();
    let addr = bound.addr.unwrap();

    let server = {
        let r = r.clone();
        thread::spawn(move || r.run(Run::new().threads(1)).unwrap())
    };

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client.write_all(b"hello\n").unwrap();

    let mut got = Vec::new();
    let mut buf = [0u8; 64];
    while got.len() < 6 {
        let n = client.read(&mut buf).unwrap();
        assert!(n > 0, "server hung up early");
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, b"hello\n");

    drop(client);
    assert!(
        wait_until(Duration::from_secs(5), || closed.load(Ordering::SeqCst) == 1),
        "on_close did not fire after the client disconnected"
    );

    r.stop();
    server.join().unwrap();
}

struct Blaster {
    payload: Arc<[u8]>,
    closed: Arc<AtomicUsize>,
}

impl Protocol for Blaster {
    fn on_data(&mut self, r: &Reactor, conn: ConnId) {
        let mut buf = [0u8; 4096];
        while matches!(r.read(conn, &mut buf), Ok(n) if n > 0) {}
    }

    fn on_close(&mut self, _conn: ConnId) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn large_write_flushes_fully_before_close() {
    let _ = env_logger::builder().is_test(true).try_init();

    let payload: Arc<[u8]> = vec![0xa5u8; 8 * 1024 * 1024].into();
    let r = Reactor::new().unwrap();
    let closed = Arc::new(AtomicUsize::new(0));

    let p = payload.clone();
    let closed_cb = closed.clone();
    let bound = r
        .listen(Listen::new("tcp://127.0.0.1:0").on_open(move |r, conn| {
            r.attach(
                conn,
                Blaster {
                    payload: p.clone(),
                    closed: closed_cb.clone(),
                },
            )
            .unwrap();
            // queue everything at once, then a cooperative close: the
            // close must wait for the full payload to drain
            r.write(conn, Packet::Shared(p.clone())).unwrap();
            r.close(conn);
        }))
        .unwrap();
    let addr = bound.addr.unwrap();

    let server = {
        let r = r.clone();
        thread::spawn(move || r.run(Run::new().threads(1)).unwrap())
    };

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    let mut received = 0usize;
    let mut buf = [0u8; 64 * 1024];
    loop {
        match client.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                assert!(buf[..n].iter().all(|b| *b == 0xa5));
                received += n;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => continue,
            Err(e) => panic!("client read failed: {}", e),
        }
    }
    assert_eq!(received, payload.len(), "bytes lost or reordered");

    assert!(
        wait_until(Duration::from_secs(5), || closed.load(Ordering::SeqCst) == 1),
        "server side on_close missing"
    );
    // every queued packet released its bytes: only the two handles in
    // this test remain
    assert!(wait_until(Duration::from_secs(5), || {
        Arc::strong_count(&payload) == 2
    }));

    r.stop();
    server.join().unwrap();
}

struct CountedPings {
    pings: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl Protocol for CountedPings {
    fn on_data(&mut self, r: &Reactor, conn: ConnId) {
        let mut buf = [0u8; 256];
        while matches!(r.read(conn, &mut buf), Ok(n) if n > 0) {}
    }

    fn ping(&mut self, r: &Reactor, conn: ConnId) {
        if self.pings.fetch_add(1, Ordering::SeqCst) + 1 >= 3 {
            r.close(conn);
        }
    }

    fn on_close(&mut self, _conn: ConnId) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn idle_timeout_pings_then_closes() {
    let _ = env_logger::builder().is_test(true).try_init();

    let r = Reactor::new().unwrap();
    let pings = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));

    let pings_cb = pings.clone();
    let closed_cb = closed.clone();
    let bound = r
        .listen(
            Listen::new("tcp://127.0.0.1:0")
                .timeout(Duration::from_secs(1))
                .on_open(move |r, conn| {
                    r.attach(
                        conn,
                        CountedPings {
                            pings: pings_cb.clone(),
                            closed: closed_cb.clone(),
                        },
                    )
                    .unwrap();
                }),
        )
        .unwrap();
    let addr = bound.addr.unwrap();

    let server = {
        let r = r.clone();
        thread::spawn(move || r.run(Run::new().threads(1)).unwrap())
    };

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(15)))
        .unwrap();

    // an idle client: the server pings every second, closing on the
    // third strike; the client observes a clean EOF
    let mut buf = [0u8; 16];
    let n = client.read(&mut buf).unwrap();
    assert_eq!(n, 0, "expected EOF, got data");

    assert_eq!(pings.load(Ordering::SeqCst), 3);
    assert!(
        wait_until(Duration::from_secs(5), || closed.load(Ordering::SeqCst) == 1),
        "on_close must fire exactly once after the timeout close"
    );

    r.stop();
    server.join().unwrap();
}

#[test]
fn outgoing_connect_completes() {
    let _ = env_logger::builder().is_test(true).try_init();

    let r = Reactor::new().unwrap();
    let closed = Arc::new(AtomicUsize::new(0));

    let closed_cb = closed.clone();
    let bound = r
        .listen(Listen::new("tcp://127.0.0.1:0").on_open(move |r, conn| {
            r.attach(
                conn,
                Echo {
                    closed: closed_cb.clone(),
                },
            )
            .unwrap();
        }))
        .unwrap();
    let addr = bound.addr.unwrap();

    let server = {
        let r = r.clone();
        thread::spawn(move || r.run(Run::new().threads(1)).unwrap())
    };

    struct Probe {
        echoed: Arc<AtomicUsize>,
    }
    impl Protocol for Probe {
        fn on_data(&mut self, r: &Reactor, conn: ConnId) {
            let mut buf = [0u8; 64];
            while let Ok(n) = r.read(conn, &mut buf) {
                if n == 0 {
                    return;
                }
                if self.echoed.fetch_add(n, Ordering::SeqCst) + n >= 4 {
                    r.close(conn);
                }
            }
        }
    }

    let echoed = Arc::new(AtomicUsize::new(0));
    let echoed_cb = echoed.clone();
    let url = format!("tcp://{}", addr);
    // connect from inside the reactor back to its own listener
    r.defer(move |reactor| {
        reactor
            .connect(
                Connect::new(url)
                    .timeout(Duration::from_secs(5))
                    .on_open(move |r, conn| {
                        r.attach(
                            conn,
                            Probe {
                                echoed: echoed_cb.clone(),
                            },
                        )
                        .unwrap();
                        r.write_copy(conn, b"ping").unwrap();
                    }),
            )
            .unwrap();
    });

    assert!(
        wait_until(Duration::from_secs(5), || echoed.load(Ordering::SeqCst) == 4),
        "echoed bytes never came back through the outgoing connection"
    );

    r.stop();
    server.join().unwrap();
}
