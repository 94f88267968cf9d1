// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::envelope::StreamKey;
use crate::in_progress::{InProgressStreams, StreamToken, WaitOutcome};

fn token() -> StreamToken {
    StreamToken::new(StreamKey::new(Uuid::new_v4(), "ctx", "EVENT_LISTENER"))
}

#[test]
fn test_waiter_unblocks_only_after_last_deregistration() {
    let streams = Arc::new(InProgressStreams::new());
    let tokens: Vec<_> = (0..5).map(|_| token()).collect();
    for t in &tokens {
        streams.register(t.clone());
    }

    let returned = Arc::new(AtomicBool::new(false));
    let waiter = {
        let streams = streams.clone();
        let returned = returned.clone();
        thread::spawn(move || {
            let outcome = streams.block_until_empty(&CancellationToken::new());
            returned.store(true, Ordering::SeqCst);
            outcome
        })
    };

    for t in &tokens[..4] {
        streams.deregister(t);
        thread::sleep(Duration::from_millis(10));
        assert!(!returned.load(Ordering::SeqCst), "waiter returned early");
    }

    streams.deregister(&tokens[4]);
    assert_eq!(waiter.join().unwrap(), WaitOutcome::Drained);
    assert!(returned.load(Ordering::SeqCst));
}

#[test]
fn test_many_waiters_all_wake() {
    let streams = Arc::new(InProgressStreams::new());
    let t = token();
    streams.register(t.clone());

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let streams = streams.clone();
            thread::spawn(move || streams.block_until_empty_timeout(Duration::from_secs(5)))
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    streams.deregister(&t);

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Drained);
    }
}

#[test]
fn test_cancellation_abandons_wait_without_touching_registry() {
    let streams = Arc::new(InProgressStreams::new());
    let t = token();
    streams.register(t.clone());
    let cancel = CancellationToken::new();

    let waiter = {
        let streams = streams.clone();
        let cancel = cancel.clone();
        thread::spawn(move || streams.block_until_empty(&cancel))
    };

    thread::sleep(Duration::from_millis(20));
    cancel.cancel();

    assert_eq!(waiter.join().unwrap(), WaitOutcome::Cancelled);
    assert!(streams.contains(&t));
    assert_eq!(streams.len(), 1);
}

#[test]
fn test_barrier_rearms_after_draining() {
    let streams = Arc::new(InProgressStreams::new());

    let first = streams.enter(token());
    drop(first);
    assert_eq!(
        streams.block_until_empty_timeout(Duration::from_millis(10)),
        WaitOutcome::Drained
    );

    let second = streams.enter(token());
    assert_eq!(
        streams.block_until_empty_timeout(Duration::from_millis(10)),
        WaitOutcome::TimedOut
    );

    let waiter = {
        let streams = streams.clone();
        thread::spawn(move || streams.block_until_empty_timeout(Duration::from_secs(5)))
    };
    drop(second);
    assert_eq!(waiter.join().unwrap(), WaitOutcome::Drained);
}

#[test]
fn test_concurrent_register_deregister_ends_empty() {
    let streams = Arc::new(InProgressStreams::new());

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let streams = streams.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let _guard = streams.enter(token());
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert!(streams.is_empty());
    assert_eq!(
        streams.block_until_empty_timeout(Duration::from_millis(10)),
        WaitOutcome::Drained
    );
}
