//! Completion-queue dispatch smoke run
//!
//! Exercises the full stack against the loopback engine:
//!   Part A — Refcount and tag registry
//!   Part B — Completion queue lifecycle
//!   Part C — Polling pool dispatch: success, failure, cancel, faults
//!   Part D — Burst: many submitters, one completer
//!   Part E — Shutdown ordering and blocking invocation
//!
//! Run: ./target/release/cq-smoke
//! Pool shape comes from CQ_POOL_SIZE / CQ_QUEUE_COUNT; RUST_LOG or
//! CQ_LOG_LEVEL controls log output. CQ_SMOKE_QUICK=1 skips Part D.

use cq_core::context::BatchContext;
use cq_core::engine::NativeEngine;
use cq_core::env::env_get_bool;
use cq_core::error::CqError;
use cq_core::event::{QueueHandle, QueueKind};
use cq_core::refcount::AtomicRefcount;
use cq_core::status::{Status, StatusCode};
use cq_core::tag::CompletionTag;

use cq_executor::{
    invoke_blocking, logging, CallError, CompletionQueue, PollingThreadPool, PoolConfig,
    QueueState, TagRegistry,
};
use cq_module::LoopbackEngine;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

// ── Test harness ──

struct TestRunner {
    total: usize,
    passed: usize,
    failed: usize,
}

const LINE: &str = "────────────────────────────────────────────────────────────";

impl TestRunner {
    fn new() -> Self {
        Self { total: 0, passed: 0, failed: 0 }
    }

    fn section(&self, name: &str) {
        println!("\n{}", LINE);
        println!("  {}", name);
        println!("{}", LINE);
    }

    fn pass(&mut self, name: &str) {
        self.total += 1;
        self.passed += 1;
        println!("  [{:2}] {:<52} PASS", self.total, name);
    }

    fn fail(&mut self, name: &str, reason: &str) {
        self.total += 1;
        self.failed += 1;
        println!("  [{:2}] {:<52} FAIL: {}", self.total, name, reason);
    }

    fn check(&mut self, name: &str, ok: bool, reason: &str) {
        if ok { self.pass(name); } else { self.fail(name, reason); }
    }

    /// Record a failure for `name` if the engine refused the call.
    fn engine_ok(&mut self, name: &str, result: cq_core::error::Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                self.fail(name, &format!("engine: {}", e));
                false
            }
        }
    }

    fn summary(&self) {
        println!("\n{}", LINE);
        println!(
            "  Total: {}  Passed: {}  Failed: {}",
            self.total, self.passed, self.failed
        );
        println!("{}", LINE);
    }
}

fn decode_text(bytes: &[u8]) -> Result<String, std::string::FromUtf8Error> {
    String::from_utf8(bytes.to_vec())
}

/// Wait for the next accepted batch and finish it with `finish`.
///
/// Returns false (and records the reason under `name`) when no batch
/// arrived or the engine refused the completion; the caller must not wait
/// on the result then.
fn complete_started<F>(t: &mut TestRunner, engine: &LoopbackEngine, name: &str, finish: F) -> bool
where
    F: FnOnce(QueueHandle, CompletionTag) -> cq_core::error::Result<()>,
{
    match engine.wait_started(WAIT) {
        Some((cq, tag)) => t.engine_ok(name, finish(cq, tag)),
        None => {
            t.fail(name, "batch never reached the engine");
            false
        }
    }
}

// ════════════════════════════════════════════════════════════
// Part A: Refcount and registry
// ════════════════════════════════════════════════════════════

fn test_primitives(t: &mut TestRunner) {
    t.section("Part A: Refcount and tag registry");

    let rc = AtomicRefcount::new(1);
    t.check("join while nonzero", rc.increment_if_nonzero() && rc.count() == 2, "join refused");
    rc.decrement();
    rc.decrement();
    t.check("join refused at zero", !rc.increment_if_nonzero() && rc.count() == 0, "joined a dead counter");

    let registry = TagRegistry::new();
    let tag = registry.next_tag();
    let first = registry.register(tag, Box::new(|_| {}));
    let second = registry.register(tag, Box::new(|_| {}));
    t.check("register", first.is_ok(), "first register failed");
    t.check("duplicate register rejected", second.is_err(), "duplicate accepted");
    t.check("pending count", registry.pending() == 1, &format!("pending={}", registry.pending()));

    let extracted = registry.extract(tag).is_ok();
    let again = registry.extract(tag).is_err();
    t.check("extract once", extracted && again, "extract not exactly-once");
    t.check("registry empty", registry.is_empty(), "entries left behind");
}

// ════════════════════════════════════════════════════════════
// Part B: Completion queue lifecycle
// ════════════════════════════════════════════════════════════

fn test_queue(t: &mut TestRunner) {
    t.section("Part B: Completion queue lifecycle");

    let engine = Arc::new(LoopbackEngine::new());
    let cq = match CompletionQueue::create(engine.clone(), QueueKind::Next) {
        Ok(cq) => cq,
        Err(e) => {
            t.fail("create queue", &e.to_string());
            return;
        }
    };
    t.pass("create queue");

    let scope = match cq.begin_operation() {
        Ok(scope) => scope,
        Err(e) => {
            t.fail("begin operation", &e.to_string());
            return;
        }
    };
    t.check("begin operation", cq.refcount() == 2, &format!("refcount={}", cq.refcount()));

    t.check("shutdown", cq.shutdown().is_ok(), "shutdown failed");
    t.check(
        "second shutdown rejected",
        matches!(cq.shutdown(), Err(CqError::AlreadyShutdown)),
        "second shutdown accepted",
    );
    t.check(
        "begin after shutdown rejected",
        matches!(cq.begin_operation(), Err(CqError::QueueShuttingDown)),
        "operation admitted",
    );
    t.check(
        "native shutdown deferred",
        engine.shutdown_requests(cq.handle()) == 0,
        "shutdown issued with operation in flight",
    );
    t.check(
        "dispose before shutdown rejected",
        matches!(cq.dispose(), Err(CqError::DisposeBeforeShutdown)),
        "early dispose accepted",
    );

    drop(scope);
    t.check(
        "native shutdown issued once",
        engine.shutdown_requests(cq.handle()) == 1,
        &format!("requests={}", engine.shutdown_requests(cq.handle())),
    );
    let terminal = cq.next(Some(WAIT)).is_shutdown();
    t.check("terminal event", terminal && cq.state() == QueueState::Shutdown, "no terminal event");
    t.check(
        "dispose",
        cq.dispose().is_ok() && engine.is_destroyed(cq.handle()),
        "dispose failed",
    );
}

// ════════════════════════════════════════════════════════════
// Part C: Pool dispatch
// ════════════════════════════════════════════════════════════

fn test_dispatch(t: &mut TestRunner, config: &PoolConfig) {
    t.section("Part C: Polling pool dispatch");

    let engine = Arc::new(LoopbackEngine::new());
    let pool = match PollingThreadPool::new(engine.clone(), config.clone()) {
        Ok(pool) => pool,
        Err(e) => {
            t.fail("create pool", &e.to_string());
            return;
        }
    };
    if let Err(e) = pool.start() {
        t.fail("start pool", &e.to_string());
        return;
    }
    t.pass("start pool");
    t.check(
        "second start rejected",
        matches!(pool.start(), Err(CqError::AlreadyStarted)),
        "second start accepted",
    );

    let bridge = match pool.bridge() {
        Ok(bridge) => bridge,
        Err(e) => {
            t.fail("bridge", &e.to_string());
            return;
        }
    };

    // Success
    match bridge.submit(decode_text) {
        Ok(result) => {
            if complete_started(t, &engine, "success", |cq, tag| engine.complete_ok(cq, tag, b"pong")) {
                let outcome = result.wait();
                t.check("success", outcome == Ok("pong".to_string()), &format!("{:?}", outcome));
            }
        }
        Err(e) => t.fail("success", &e.to_string()),
    }

    // Engine-reported failure
    match bridge.submit(decode_text) {
        Ok(result) => {
            let name = "failure carries status";
            if complete_started(t, &engine, name, |cq, tag| {
                engine.complete(cq, tag, false, Status::new(StatusCode::Unavailable, "down"), None)
            }) {
                let outcome = result.wait();
                let ok = matches!(&outcome, Err(CallError::Failed(s)) if s.code == StatusCode::Unavailable);
                t.check(name, ok, &format!("{:?}", outcome));
            }
        }
        Err(e) => t.fail("failure carries status", &e.to_string()),
    }

    // Cancellation
    match bridge.submit(decode_text) {
        Ok(result) => {
            let name = "cancel is distinct from failure";
            if complete_started(t, &engine, name, |cq, tag| engine.cancel(cq, tag)) {
                let outcome = result.wait();
                let ok = matches!(&outcome, Err(e) if e.is_cancelled());
                t.check(name, ok, &format!("{:?}", outcome));
            }
        }
        Err(e) => t.fail("cancel is distinct from failure", &e.to_string()),
    }

    // Decode failure
    match bridge.submit(decode_text) {
        Ok(result) => {
            let name = "decode failure is internal";
            if complete_started(t, &engine, name, |cq, tag| engine.complete_ok(cq, tag, &[0xc3, 0x28])) {
                let outcome = result.wait();
                let ok = matches!(&outcome, Err(CallError::Failed(s)) if s.code == StatusCode::Internal);
                t.check(name, ok, &format!("{:?}", outcome));
            }
        }
        Err(e) => t.fail("decode failure is internal", &e.to_string()),
    }

    // Panicking callback
    if let Ok(cq) = pool.queue() {
        if let Ok(scope) = cq.begin_operation() {
            let tag = cq.registry().next_tag();
            let registered = cq.registry().register(
                tag,
                Box::new(move |_| {
                    let _scope = scope;
                    panic!("smoke: deliberate callback fault");
                }),
            );
            if registered.is_ok()
                && engine
                    .start_batch(cq.handle(), tag, Arc::new(BatchContext::new()))
                    .is_ok()
            {
                engine.take_started();
                t.engine_ok("callback fault contained", engine.complete_ok(cq.handle(), tag, b""));
            }
        }
    }
    let deadline = Instant::now() + WAIT;
    while pool.stats().callback_faults == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    t.check("callback fault contained", pool.stats().callback_faults == 1, "fault not observed");

    // Unknown tag
    if let Ok(cq) = pool.queue() {
        let injected = engine.inject(cq.handle(), CompletionTag::from_raw(0xdead_beef), true);
        t.engine_ok("unknown tag counted", injected);
    }
    let deadline = Instant::now() + WAIT;
    while pool.stats().protocol_violations == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    t.check("unknown tag counted", pool.stats().protocol_violations == 1, "violation not observed");

    // Pollers still alive after both faults
    match bridge.submit(decode_text) {
        Ok(result) => {
            let name = "pollers alive after faults";
            if complete_started(t, &engine, name, |cq, tag| engine.complete_ok(cq, tag, b"alive")) {
                let outcome = result.wait();
                t.check(name, outcome == Ok("alive".to_string()), &format!("{:?}", outcome));
            }
        }
        Err(e) => t.fail("pollers alive after faults", &e.to_string()),
    }

    drop(bridge);
    t.check("stop", pool.stop().is_ok(), "stop failed");
    t.check(
        "second stop rejected",
        matches!(pool.stop(), Err(CqError::NotRunning)),
        "second stop accepted",
    );
    println!("    stats: {:?}", pool.stats());
}

// ════════════════════════════════════════════════════════════
// Part D: Burst
// ════════════════════════════════════════════════════════════

fn test_burst(t: &mut TestRunner, config: &PoolConfig) {
    t.section("Part D: Burst");

    const SUBMITTERS: usize = 8;
    const PER_SUBMITTER: usize = 2_000;
    let total = SUBMITTERS * PER_SUBMITTER;

    let engine = Arc::new(LoopbackEngine::new());
    let pool = match PollingThreadPool::new(engine.clone(), config.clone()) {
        Ok(pool) => pool,
        Err(e) => {
            t.fail("create pool", &e.to_string());
            return;
        }
    };
    if let Err(e) = pool.start() {
        t.fail("start pool", &e.to_string());
        return;
    }
    let bridge = match pool.bridge() {
        Ok(bridge) => bridge,
        Err(e) => {
            t.fail("bridge", &e.to_string());
            return;
        }
    };

    let start = Instant::now();
    let completer = {
        let engine = engine.clone();
        thread::spawn(move || {
            let mut completed = 0;
            let mut first_error = None;
            for _ in 0..total {
                let Some((cq, tag)) = engine.wait_started(WAIT) else {
                    break;
                };
                match engine.complete_ok(cq, tag, &tag.as_raw().to_le_bytes()) {
                    Ok(()) => completed += 1,
                    Err(e) => {
                        first_error.get_or_insert_with(|| format!("{}: {}", tag, e));
                    }
                }
            }
            (completed, first_error)
        })
    };

    let submitters: Vec<_> = (0..SUBMITTERS)
        .map(|_| {
            let bridge = bridge.clone();
            thread::spawn(move || {
                let mut good = 0usize;
                let results: Vec<_> = (0..PER_SUBMITTER)
                    .filter_map(|_| {
                        bridge
                            .submit(|b: &[u8]| -> Result<u64, String> {
                                let raw: [u8; 8] = b.try_into().map_err(|_| "short".to_string())?;
                                Ok(u64::from_le_bytes(raw))
                            })
                            .ok()
                    })
                    .collect();
                for result in results {
                    let tag = result.tag();
                    if let Ok(Ok(value)) = result.wait_timeout(WAIT) {
                        if value == tag.as_raw() {
                            good += 1;
                        }
                    }
                }
                good
            })
        })
        .collect();

    let good: usize = submitters.into_iter().map(|s| s.join().unwrap_or(0)).sum();
    let (completed, completer_error) = completer
        .join()
        .unwrap_or_else(|_| (0, Some("completer panicked".to_string())));
    let elapsed = start.elapsed();

    let reason = match &completer_error {
        Some(e) => format!("{}/{}, engine: {}", completed, total, e),
        None => format!("{}/{}", completed, total),
    };
    t.check("all operations completed", completed == total, &reason);
    t.check("every result matched its tag", good == total, &format!("{}/{}", good, total));

    let queues = pool.queues().unwrap_or_default();
    drop(bridge);
    t.check("stop", pool.stop().is_ok(), "stop failed");
    let once = queues
        .iter()
        .all(|cq| engine.shutdown_requests(cq.handle()) == 1 && cq.registry().is_empty());
    t.check("one shutdown per queue, registries empty", once, "shutdown count or leftovers");

    let secs = elapsed.as_secs_f64().max(1e-9);
    println!(
        "    {} ops in {:.1} ms ({:.0} ops/s), contexts allocated={} reused={}",
        total,
        secs * 1e3,
        total as f64 / secs,
        pool.contexts().allocated(),
        pool.contexts().reused()
    );
}

// ════════════════════════════════════════════════════════════
// Part E: Shutdown ordering and blocking invocation
// ════════════════════════════════════════════════════════════

fn test_shutdown(t: &mut TestRunner, config: &PoolConfig) {
    t.section("Part E: Shutdown ordering and blocking invocation");

    let engine = Arc::new(LoopbackEngine::new());
    let pool = match PollingThreadPool::new(engine.clone(), config.clone()) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            t.fail("create pool", &e.to_string());
            return;
        }
    };
    if let Err(e) = pool.start() {
        t.fail("start pool", &e.to_string());
        return;
    }

    let (bridge, cq) = match (pool.bridge(), pool.queue()) {
        (Ok(bridge), Ok(cq)) => (bridge, cq),
        _ => {
            t.fail("bridge", "pool not running");
            return;
        }
    };
    let in_flight = match bridge.submit_on(&cq, decode_text) {
        Ok(result) => result,
        Err(e) => {
            t.fail("submit in-flight operation", &e.to_string());
            return;
        }
    };
    let started = engine.wait_started(WAIT);

    let stopper = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || pool.stop())
    };
    let deadline = Instant::now() + WAIT;
    while !cq.is_closing() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    t.check(
        "new operation refused during shutdown",
        matches!(bridge.submit_on(&cq, decode_text), Err(CqError::QueueShuttingDown)),
        "operation admitted",
    );
    t.check(
        "native shutdown waits for in-flight op",
        engine.shutdown_requests(cq.handle()) == 0,
        "shutdown issued early",
    );

    let name = "in-flight op completes";
    let completed = match started {
        Some((handle, tag)) => t.engine_ok(name, engine.complete_ok(handle, tag, b"drained")),
        None => {
            t.fail(name, "batch never reached the engine");
            false
        }
    };
    if completed {
        let outcome = in_flight.wait();
        t.check(name, outcome == Ok("drained".to_string()), &format!("{:?}", outcome));
    }
    let stopped = stopper.join().map(|r| r.is_ok()).unwrap_or(false);
    t.check("stop returns", stopped, "stop failed");
    t.check(
        "native shutdown issued once",
        engine.shutdown_requests(cq.handle()) == 1,
        &format!("requests={}", engine.shutdown_requests(cq.handle())),
    );

    let blocking_engine = Arc::new(LoopbackEngine::new());
    let dyn_engine: Arc<dyn NativeEngine> = blocking_engine.clone();
    let completer = {
        let engine = blocking_engine.clone();
        thread::spawn(move || match engine.wait_started(WAIT) {
            Some((cq, tag)) => engine.complete_ok(cq, tag, b"sync"),
            None => Err(CqError::Engine("batch never reached the engine".into())),
        })
    };
    let outcome = invoke_blocking(&dyn_engine, decode_text);
    match completer.join() {
        Ok(completed) => {
            t.engine_ok("invoke_blocking completer", completed);
        }
        Err(_) => t.fail("invoke_blocking completer", "completer panicked"),
    }
    t.check(
        "invoke_blocking",
        matches!(&outcome, Ok(Ok(s)) if s == "sync"),
        &format!("{:?}", outcome),
    );
}

fn main() {
    logging::init();
    println!("=== Completion Queue Dispatch Smoke Test ===");

    let config = PoolConfig::from_env();
    if let Err(e) = config.validate() {
        println!("\nFATAL: {}", e);
        std::process::exit(1);
    }
    println!(
        "    pool_size={} queues={} poll_timeout={:?}",
        config.pool_size, config.queue_count, config.poll_timeout
    );
    tracing::debug!(?config, "smoke configuration");

    let mut t = TestRunner::new();

    test_primitives(&mut t);
    test_queue(&mut t);
    test_dispatch(&mut t, &config);
    if env_get_bool("CQ_SMOKE_QUICK", false) {
        println!("\n--- Part D: Burst (skipped, CQ_SMOKE_QUICK) ---");
    } else {
        test_burst(&mut t, &config);
    }
    test_shutdown(&mut t, &config);

    t.summary();
    std::process::exit(if t.failed > 0 { 1 } else { 0 });
}
