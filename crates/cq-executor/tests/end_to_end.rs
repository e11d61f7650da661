//! End-to-end dispatch scenarios against the loopback engine.
//!
//! Each test owns its engine and pool, completes operations from the test
//! thread the way a native engine would from its own threads, and checks
//! what the pollers delivered.

use cq_core::context::BatchContext;
use cq_core::engine::NativeEngine;
use cq_core::error::CqError;
use cq_core::status::{Status, StatusCode};
use cq_core::tag::CompletionTag;
use cq_executor::{invoke_blocking, CallError, PollingThreadPool, PoolConfig, QueueState};
use cq_module::LoopbackEngine;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

fn start_pool(pool_size: usize, queue_count: usize) -> (Arc<LoopbackEngine>, PollingThreadPool) {
    let engine = Arc::new(LoopbackEngine::new());
    let config = PoolConfig::new()
        .pool_size(pool_size)
        .queue_count(queue_count);
    let pool = PollingThreadPool::new(engine.clone(), config).unwrap();
    pool.start().unwrap();
    (engine, pool)
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn decode_text(bytes: &[u8]) -> Result<String, std::string::FromUtf8Error> {
    String::from_utf8(bytes.to_vec())
}

#[test]
fn completion_fires_registered_callback_once() {
    let (engine, pool) = start_pool(2, 1);
    let cq = pool.queue().unwrap();

    let scope = cq.begin_operation().unwrap();
    let tag = cq.registry().next_tag();
    let (tx, rx) = mpsc::channel();
    cq.registry()
        .register(
            tag,
            Box::new(move |success| {
                let _scope = scope;
                tx.send(success).unwrap();
            }),
        )
        .unwrap();
    engine
        .start_batch(cq.handle(), tag, Arc::new(BatchContext::new()))
        .unwrap();
    assert!(cq.registry().contains(tag));

    engine.complete_ok(cq.handle(), tag, b"").unwrap();

    assert_eq!(rx.recv_timeout(WAIT), Ok(true));
    // Sender was dropped with the callback: nothing else will arrive.
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert!(!cq.registry().contains(tag));
    assert_eq!(cq.registry().pending(), 0);
    assert_eq!(pool.stats().dispatched, 1);

    pool.stop().unwrap();
}

#[test]
fn shutdown_waits_for_in_flight_operation() {
    let (engine, pool) = start_pool(2, 1);
    let pool = Arc::new(pool);
    let bridge = pool.bridge().unwrap();
    let cq = pool.queue().unwrap();
    let handle = cq.handle();

    // Records how many shutdown requests the engine had seen when the
    // in-flight operation's completion was processed.
    let seen_at_completion = Arc::new(AtomicUsize::new(usize::MAX));
    let (probe_engine, seen) = (engine.clone(), seen_at_completion.clone());
    let in_flight = bridge
        .submit(move |bytes| {
            seen.store(probe_engine.shutdown_requests(handle), Ordering::SeqCst);
            decode_text(bytes)
        })
        .unwrap();
    let (_, tag) = engine.wait_started(WAIT).unwrap();
    assert_eq!(tag, in_flight.tag());

    let stopper = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.stop())
    };
    assert!(wait_until(|| cq.is_closing()));

    // Shutdown has begun: new operations are refused.
    assert!(matches!(cq.begin_operation(), Err(CqError::QueueShuttingDown)));
    assert!(matches!(
        bridge.submit(decode_text),
        Err(CqError::QueueShuttingDown)
    ));
    // The in-flight operation still holds the queue open.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(engine.shutdown_requests(handle), 0);
    assert_eq!(cq.state(), QueueState::Open);

    engine.complete_ok(handle, tag, b"last").unwrap();
    assert_eq!(in_flight.wait(), Ok("last".to_string()));

    stopper.join().unwrap().unwrap();
    assert_eq!(seen_at_completion.load(Ordering::SeqCst), 0);
    assert_eq!(engine.shutdown_requests(handle), 1);
    assert_eq!(cq.state(), QueueState::Shutdown);
    assert!(engine.is_destroyed(handle));
}

#[test]
fn cancelled_completion_resolves_as_cancelled() {
    let (engine, pool) = start_pool(2, 1);
    let bridge = pool.bridge().unwrap();

    let result = bridge.submit(decode_text).unwrap();
    let (cq, tag) = engine.wait_started(WAIT).unwrap();
    engine.cancel(cq, tag).unwrap();

    match result.wait() {
        Err(CallError::Cancelled(status)) => assert_eq!(status.code, StatusCode::Cancelled),
        other => panic!("expected cancelled outcome, got {:?}", other),
    }
    pool.stop().unwrap();
}

#[test]
fn failed_completion_carries_engine_status() {
    let (engine, pool) = start_pool(2, 1);
    let bridge = pool.bridge().unwrap();

    let result = bridge.submit(decode_text).unwrap();
    let (cq, tag) = engine.wait_started(WAIT).unwrap();
    let status = Status::new(StatusCode::Unavailable, "connection reset");
    engine.complete(cq, tag, false, status.clone(), None).unwrap();

    assert_eq!(result.wait(), Err(CallError::Failed(status)));
    pool.stop().unwrap();
}

#[test]
fn poller_survives_panicking_callback() {
    // One poller, so the same thread must handle both completions.
    let (engine, pool) = start_pool(1, 1);
    let cq = pool.queue().unwrap();

    let scope = cq.begin_operation().unwrap();
    let faulty = cq.registry().next_tag();
    cq.registry()
        .register(
            faulty,
            Box::new(move |_| {
                let _scope = scope;
                panic!("callback fault");
            }),
        )
        .unwrap();
    engine
        .start_batch(cq.handle(), faulty, Arc::new(BatchContext::new()))
        .unwrap();
    engine.take_started();
    engine.complete_ok(cq.handle(), faulty, b"").unwrap();

    let bridge = pool.bridge().unwrap();
    let result = bridge.submit(decode_text).unwrap();
    let (_, tag) = engine.wait_started(WAIT).unwrap();
    engine.complete_ok(cq.handle(), tag, b"still alive").unwrap();

    assert_eq!(result.wait(), Ok("still alive".to_string()));
    let stats = pool.stats();
    assert_eq!(stats.callback_faults, 1);
    assert_eq!(stats.dispatched, 2);
    // Both scopes released, the faulty one while unwinding.
    assert!(wait_until(|| cq.refcount() == 1));

    pool.stop().unwrap();
}

#[test]
fn decode_failure_resolves_as_internal() {
    let (engine, pool) = start_pool(2, 1);
    let bridge = pool.bridge().unwrap();

    let result = bridge.submit(decode_text).unwrap();
    let (cq, tag) = engine.wait_started(WAIT).unwrap();
    engine.complete_ok(cq, tag, &[0xff, 0xfe]).unwrap();

    let err = result.wait().unwrap_err();
    assert!(!err.is_cancelled());
    assert_eq!(err.status().code, StatusCode::Internal);
    assert_eq!(pool.stats().callback_faults, 0);
    pool.stop().unwrap();
}

#[test]
fn completion_tags_match_registered_tags() {
    // Tags are unique per queue, so keep a single one.
    let (engine, pool) = start_pool(4, 1);
    let bridge = pool.bridge().unwrap();

    let results: Vec<_> = (0..32)
        .map(|_| {
            bridge
                .submit(|bytes: &[u8]| -> Result<u64, String> {
                    let raw: [u8; 8] = bytes.try_into().map_err(|_| "short payload".to_string())?;
                    Ok(u64::from_le_bytes(raw))
                })
                .unwrap()
        })
        .collect();

    let started = engine.take_started();
    let submitted: HashSet<u64> = results.iter().map(|r| r.tag().as_raw()).collect();
    let delivered: HashSet<u64> = started.iter().map(|(_, tag)| tag.as_raw()).collect();
    assert_eq!(started.len(), results.len());
    assert_eq!(submitted.len(), results.len());
    assert_eq!(submitted, delivered);

    // Each completion echoes the engine-side tag; each result must get
    // back exactly its own tag.
    for (cq, tag) in &started {
        engine.complete_ok(*cq, *tag, &tag.as_raw().to_le_bytes()).unwrap();
    }
    for result in results {
        let tag = result.tag();
        assert_eq!(result.wait(), Ok(tag.as_raw()));
    }
    pool.stop().unwrap();
}

#[test]
fn concurrent_submitters_shut_down_once_per_queue() {
    const SUBMITTERS: usize = 8;
    const PER_SUBMITTER: usize = 100;
    let (engine, pool) = start_pool(4, 2);
    let bridge = pool.bridge().unwrap();

    let completer = {
        let engine = engine.clone();
        thread::spawn(move || {
            for _ in 0..SUBMITTERS * PER_SUBMITTER {
                let (cq, tag) = engine.wait_started(WAIT).unwrap();
                engine.complete_ok(cq, tag, b"ok").unwrap();
            }
        })
    };

    let submitters: Vec<_> = (0..SUBMITTERS)
        .map(|_| {
            let bridge = bridge.clone();
            thread::spawn(move || {
                let results: Vec<_> = (0..PER_SUBMITTER)
                    .map(|_| bridge.submit(decode_text).unwrap())
                    .collect();
                for result in results {
                    assert_eq!(result.wait(), Ok("ok".to_string()));
                }
            })
        })
        .collect();
    for s in submitters {
        s.join().unwrap();
    }
    completer.join().unwrap();

    let queues = pool.queues().unwrap();
    pool.stop().unwrap();
    for cq in &queues {
        assert_eq!(engine.shutdown_requests(cq.handle()), 1);
        assert_eq!(cq.registry().pending(), 0);
        assert_eq!(cq.refcount(), 0);
    }
    assert_eq!(pool.stats().dispatched, (SUBMITTERS * PER_SUBMITTER) as u64);
    assert!(pool.contexts().reused() > 0);
}

#[test]
fn unknown_tag_is_counted_not_fatal() {
    let (engine, pool) = start_pool(1, 1);
    let cq = pool.queue().unwrap();

    engine
        .inject(cq.handle(), CompletionTag::from_raw(0xdead), true)
        .unwrap();
    assert!(wait_until(|| pool.stats().protocol_violations == 1));

    let bridge = pool.bridge().unwrap();
    let result = bridge.submit(decode_text).unwrap();
    let (_, tag) = engine.wait_started(WAIT).unwrap();
    engine.complete_ok(cq.handle(), tag, b"fine").unwrap();
    assert_eq!(result.wait(), Ok("fine".to_string()));

    pool.stop().unwrap();
}

#[test]
fn rejected_batch_releases_tag_and_scope() {
    let (engine, pool) = start_pool(2, 1);
    let bridge = pool.bridge().unwrap();
    let cq = pool.queue().unwrap();

    engine.set_reject_batches(true);
    assert!(matches!(bridge.submit(decode_text), Err(CqError::Engine(_))));
    assert_eq!(cq.registry().pending(), 0);
    assert_eq!(cq.refcount(), 1);

    engine.set_reject_batches(false);
    let result = bridge.submit(decode_text).unwrap();
    let (_, tag) = engine.wait_started(WAIT).unwrap();
    engine.complete_ok(cq.handle(), tag, b"accepted").unwrap();
    assert_eq!(result.wait(), Ok("accepted".to_string()));

    pool.stop().unwrap();
}

#[test]
fn deferred_result_can_be_awaited() {
    let (engine, pool) = start_pool(2, 1);
    let bridge = pool.bridge().unwrap();

    let result = bridge.submit(decode_text).unwrap();
    let completer = {
        let engine = engine.clone();
        thread::spawn(move || {
            let (cq, tag) = engine.wait_started(WAIT).unwrap();
            thread::sleep(Duration::from_millis(10));
            engine.complete_ok(cq, tag, b"awaited").unwrap();
        })
    };

    assert_eq!(futures::executor::block_on(result), Ok("awaited".to_string()));
    completer.join().unwrap();
    pool.stop().unwrap();
}

#[test]
fn invoke_blocking_uses_private_pluck_queue() {
    let engine = Arc::new(LoopbackEngine::new());
    let dyn_engine: Arc<dyn NativeEngine> = engine.clone();

    let completer = {
        let engine = engine.clone();
        thread::spawn(move || {
            let (cq, tag) = engine.wait_started(WAIT).unwrap();
            engine.complete_ok(cq, tag, b"sync").unwrap();
            cq
        })
    };

    let outcome = invoke_blocking(&dyn_engine, decode_text).unwrap();
    assert_eq!(outcome, Ok("sync".to_string()));

    let cq = completer.join().unwrap();
    assert_eq!(engine.shutdown_requests(cq), 1);
    assert!(engine.is_destroyed(cq));
}

#[test]
fn invoke_blocking_reports_rejection() {
    let engine = Arc::new(LoopbackEngine::new());
    let dyn_engine: Arc<dyn NativeEngine> = engine.clone();
    engine.set_reject_batches(true);

    let err = invoke_blocking(&dyn_engine, decode_text).unwrap_err();
    assert!(matches!(err, CqError::Engine(_)));
}
