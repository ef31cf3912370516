// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread, scheduler, and synchronization scenarios, driven end to end
//! through the public kernel interface.

use std::sync::{Arc, Mutex};

use kern::{Kernel, Options};

type Log = Arc<Mutex<Vec<String>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

fn push(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Five forked threads plus main, all at priority 0, each yielding through
/// ten loop iterations: strict FIFO makes them take turns, one full
/// round-robin block per iteration.
#[test]
fn ping_pong_round_robin() {
    let kernel = Kernel::start(Options::default());
    let log = new_log();

    let mut threads = Vec::new();
    for n in 1..=5 {
        let name = format!("t{n}");
        let tid = kernel.create_thread(&name, true, 0);
        let log = log.clone();
        let thread_name = name.clone();
        kernel.fork(tid, move |k| {
            for i in 0..10 {
                push(&log, format!("{thread_name}:{i}"));
                k.yield_now();
            }
            push(&log, format!("{thread_name}:finished"));
        });
        threads.push(tid);
    }

    for i in 0..10 {
        push(&log, format!("main:{i}"));
        kernel.yield_now();
    }
    for tid in threads {
        kernel.join(tid);
    }

    let log = entries(&log);
    let iterations: Vec<&String> = log.iter().filter(|e| !e.ends_with(":finished")).collect();
    assert_eq!(iterations.len(), 60, "6 threads x 10 iterations");

    for name in ["main", "t1", "t2", "t3", "t4", "t5"] {
        let count = iterations
            .iter()
            .filter(|e| e.starts_with(&format!("{name}:")))
            .count();
        assert_eq!(count, 10, "thread {name} must run exactly 10 iterations");
        let finished = log
            .iter()
            .filter(|e| **e == format!("{name}:finished"))
            .count();
        let expected = usize::from(name != "main");
        assert_eq!(finished, expected, "{name} finish reports");
    }

    // Every round-robin block of six holds each thread exactly once.
    for (round, chunk) in iterations.chunks(6).enumerate() {
        let mut names: Vec<&str> = chunk.iter().map(|e| e.split(':').next().unwrap()).collect();
        names.sort_unstable();
        assert_eq!(
            names,
            ["main", "t1", "t2", "t3", "t4", "t5"],
            "round {round} is not a full rotation"
        );
    }
}

/// A low-priority lock holder is donated the priority of a blocked
/// high-priority acquirer, runs ahead of the medium-priority bystander, and
/// falls back to its own priority at release.
#[test]
fn priority_inversion_resolved_by_donation() {
    let kernel = Kernel::start(Options::default());
    let log = new_log();
    let x = kernel.new_lock("X");

    let l = kernel.create_thread("L", true, 0);
    {
        let log = log.clone();
        kernel.fork(l, move |k| {
            k.acquire(x);
            push(&log, "L-acquired");
            k.yield_now();
            // H has tried to acquire by now and donated its priority.
            let donated = k.thread_priority(l).unwrap();
            push(&log, format!("L-priority-while-held:{}", donated.index()));
            k.release(x);
            let restored = k.thread_priority(l).unwrap();
            push(&log, format!("L-priority-after-release:{}", restored.index()));
            push(&log, "L-released");
        });
    }
    kernel.yield_now();
    assert_eq!(entries(&log), ["L-acquired"], "L must hold X before H runs");

    let m = kernel.create_thread("M", true, 3);
    {
        let log = log.clone();
        kernel.fork(m, move |_| push(&log, "M-ran"));
    }
    let h = kernel.create_thread("H", true, 5);
    {
        let log = log.clone();
        kernel.fork(h, move |k| {
            k.acquire(x);
            push(&log, "H-acquired");
            k.release(x);
        });
    }
    kernel.yield_now();

    kernel.join(l);
    kernel.join(h);
    kernel.join(m);

    let log = entries(&log);
    let pos = |needle: &str| {
        log.iter()
            .position(|e| e == needle)
            .unwrap_or_else(|| panic!("missing event {needle}: {log:?}"))
    };
    assert!(log.contains(&"L-priority-while-held:5".to_string()), "{log:?}");
    assert!(log.contains(&"L-priority-after-release:0".to_string()), "{log:?}");
    assert!(
        pos("L-released") < pos("H-acquired"),
        "H acquires only after L releases: {log:?}"
    );
    assert!(
        pos("H-acquired") < pos("M-ran"),
        "donated L and then H must outrun M: {log:?}"
    );
}

/// Five senders rendezvous with five receives on one port: every integer
/// arrives exactly once, in FIFO order, and no send completes before a
/// receiver has shown up for it.
#[test]
fn port_rendezvous_pairs_sends_with_receives() {
    let kernel = Kernel::start(Options::default());
    let log = new_log();
    let port = kernel.new_port("p");

    let mut senders = Vec::new();
    for n in 1..=5 {
        let tid = kernel.create_thread(&format!("s{n}"), true, 0);
        let log = log.clone();
        kernel.fork(tid, move |k| {
            k.send(port, n);
            push(&log, format!("sent-{n}"));
        });
        senders.push(tid);
    }

    let mut received = Vec::new();
    for _ in 0..5 {
        push(&log, "recv-enter");
        received.push(kernel.receive(port));
        kernel.yield_now();
    }
    for tid in senders {
        kernel.join(tid);
    }

    assert_eq!(received, [1, 2, 3, 4, 5], "messages pair FIFO with calls");

    // A send may only complete once a receive has arrived to match it.
    let (mut recvs, mut sents) = (0, 0);
    for event in entries(&log) {
        if event == "recv-enter" {
            recvs += 1;
        } else if event.starts_with("sent-") {
            sents += 1;
            assert!(
                recvs >= sents,
                "a send completed with no receive to match it"
            );
        }
    }
    assert_eq!(sents, 5);
}

/// Broadcast releases every waiter; each wakes holding the lock again, and
/// the broadcaster keeps the processor until it lets go (Mesa style).
#[test]
fn broadcast_wakes_every_waiter() {
    let kernel = Kernel::start(Options::default());
    let lock = kernel.new_lock("L");
    let cond = kernel.new_condition("C", lock);

    let waiting = Arc::new(Mutex::new(0usize));
    let done = Arc::new(Mutex::new(0usize));
    let held_at_wake = Arc::new(Mutex::new(Vec::new()));

    let mut workers = Vec::new();
    for n in 0..5 {
        let tid = kernel.create_thread(&format!("w{n}"), true, 0);
        let waiting = waiting.clone();
        let done = done.clone();
        let held_at_wake = held_at_wake.clone();
        kernel.fork(tid, move |k| {
            k.acquire(lock);
            *waiting.lock().unwrap() += 1;
            k.wait(cond);
            held_at_wake.lock().unwrap().push(k.held_by_current_thread(lock));
            k.release(lock);
            *done.lock().unwrap() += 1;
        });
        workers.push(tid);
    }

    while *waiting.lock().unwrap() < 5 {
        kernel.yield_now();
    }
    assert_eq!(*done.lock().unwrap(), 0);

    kernel.acquire(lock);
    kernel.broadcast(cond);
    // Mesa rules: the waiters are merely ready; none has run yet.
    assert_eq!(*done.lock().unwrap(), 0);
    kernel.release(lock);

    for tid in workers {
        kernel.join(tid);
    }
    assert_eq!(*done.lock().unwrap(), 5);
    assert_eq!(*held_at_wake.lock().unwrap(), vec![true; 5]);
}

/// The semaphore orderings of a producer/consumer handoff: a P with no
/// units blocks until the V, FIFO among waiters.
#[test]
fn semaphore_wakes_waiters_in_fifo_order() {
    let kernel = Kernel::start(Options::default());
    let log = new_log();
    let sem = kernel.new_semaphore("s", 0);

    let mut waiters = Vec::new();
    for n in 0..3 {
        let tid = kernel.create_thread(&format!("p{n}"), true, 0);
        let log = log.clone();
        kernel.fork(tid, move |k| {
            k.p(sem);
            push(&log, format!("woke-{n}"));
        });
        waiters.push(tid);
    }
    kernel.yield_now();
    assert!(entries(&log).is_empty(), "nobody passes a zero semaphore");

    for _ in 0..3 {
        kernel.v(sem);
    }
    for tid in waiters {
        kernel.join(tid);
    }
    assert_eq!(entries(&log), ["woke-0", "woke-1", "woke-2"]);
}
