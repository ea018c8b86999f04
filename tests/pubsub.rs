use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hive_io::{Every, Publish, Reactor, Run, Subscribe};

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

fn running_reactor() -> (Reactor, thread::JoinHandle<()>) {
    let r = Reactor::new().unwrap();
    let handle = {
        let r = r.clone();
        thread::spawn(move || r.run(Run::new().threads(1)).unwrap())
    };
    (r, handle)
}

#[test]
fn glob_routing_across_subscribers() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (r, handle) = running_reactor();

    let (tx, rx) = mpsc::channel::<(&'static str, Vec<u8>)>();

    let tx_a = tx.clone();
    r.subscribe(Subscribe::pattern("news.*").on_message(move |_r, msg| {
        tx_a.send(("pattern", msg.data().to_vec())).unwrap();
    }))
    .unwrap();

    let tx_b = tx.clone();
    r.subscribe(Subscribe::to("news.sports").on_message(move |_r, msg| {
        tx_b.send(("sports", msg.data().to_vec())).unwrap();
    }))
    .unwrap();

    let tx_c = tx;
    r.subscribe(Subscribe::to("news.tech").on_message(move |_r, msg| {
        tx_c.send(("tech", msg.data().to_vec())).unwrap();
    }))
    .unwrap();

    r.publish(Publish::to("news.sports").message("hi")).unwrap();

    let mut seen = Vec::new();
    for _ in 0..2 {
        let (who, data) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(data, b"hi");
        seen.push(who);
    }
    seen.sort_unstable();
    assert_eq!(seen, ["pattern", "sports"]);

    // nobody else hears anything
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    r.stop();
    handle.join().unwrap();
}

#[test]
fn filtered_publish_reaches_matching_filter_only() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (r, handle) = running_reactor();

    let plain = Arc::new(AtomicUsize::new(0));
    let filtered = Arc::new(AtomicUsize::new(0));
    let pattern = Arc::new(AtomicUsize::new(0));

    let c = plain.clone();
    r.subscribe(Subscribe::to("jobs").on_message(move |_r, _m| {
        c.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap();

    let c = filtered.clone();
    r.subscribe(Subscribe::to("jobs").filter(7).on_message(move |_r, _m| {
        c.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap();

    let c = pattern.clone();
    r.subscribe(Subscribe::pattern("job*").on_message(move |_r, _m| {
        c.fetch_add(1, Ordering::SeqCst);
    }))
    .unwrap();

    r.publish(Publish::to("jobs").filter(7).message("x")).unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        filtered.load(Ordering::SeqCst) == 1
    }));
    // filtered traffic bypasses both the unfiltered exact subscription
    // and every pattern
    thread::sleep(Duration::from_millis(200));
    assert_eq!(plain.load(Ordering::SeqCst), 0);
    assert_eq!(pattern.load(Ordering::SeqCst), 0);

    r.stop();
    handle.join().unwrap();
}

#[test]
fn unsubscribe_stops_delivery_and_runs_cleanup() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (r, handle) = running_reactor();

    let hits = Arc::new(AtomicUsize::new(0));
    let cleaned = Arc::new(AtomicUsize::new(0));

    let c = hits.clone();
    let cl = cleaned.clone();
    let sub = r
        .subscribe(
            Subscribe::to("ephemeral")
                .on_message(move |_r, _m| {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .on_unsubscribe(move |_r| {
                    cl.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();

    r.publish(Publish::to("ephemeral").message("one")).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 1
    }));

    r.unsubscribe(&sub);
    assert!(wait_until(Duration::from_secs(5), || {
        cleaned.load(Ordering::SeqCst) == 1
    }));

    r.publish(Publish::to("ephemeral").message("two")).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(hits.load(Ordering::SeqCst), 1, "message after unsubscribe");

    // double unsubscribe is silent
    r.unsubscribe(&sub);
    assert_eq!(cleaned.load(Ordering::SeqCst), 1);

    r.stop();
    handle.join().unwrap();
}

#[test]
fn every_publish_is_delivered_exactly_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (r, handle) = running_reactor();

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    r.subscribe(Subscribe::to("seq").on_message(move |_r, msg| {
        tx.send(msg.data().to_vec()).unwrap();
    }))
    .unwrap();

    r.defer(|r| {
        for i in 0u8..10 {
            r.publish(Publish::to("seq").message(vec![i])).unwrap();
        }
    });

    let mut got = Vec::new();
    for _ in 0u8..10 {
        got.push(rx.recv_timeout(Duration::from_secs(5)).unwrap()[0]);
    }
    got.sort_unstable();
    assert_eq!(got, (0..10).collect::<Vec<_>>());
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    r.stop();
    handle.join().unwrap();
}

#[test]
fn timers_fire_and_retire() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (r, handle) = running_reactor();

    let oneshot = Arc::new(AtomicUsize::new(0));
    let ticks = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));

    let c = oneshot.clone();
    r.run_after(Duration::from_millis(20), move |_r| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    let c = ticks.clone();
    let f = finished.clone();
    r.run_every(
        Every::new(Duration::from_millis(20))
            .times(3)
            .on_finish(move |_r| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
        move |_r| {
            c.fetch_add(1, Ordering::SeqCst);
        },
    );

    assert!(wait_until(Duration::from_secs(5), || {
        oneshot.load(Ordering::SeqCst) == 1
            && ticks.load(Ordering::SeqCst) == 3
            && finished.load(Ordering::SeqCst) == 1
    }));

    // a spent repeater stays spent
    thread::sleep(Duration::from_millis(100));
    assert_eq!(ticks.load(Ordering::SeqCst), 3);

    r.stop();
    handle.join().unwrap();
}
