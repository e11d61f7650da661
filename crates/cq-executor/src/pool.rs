//! `PollingThreadPool` — OS threads draining completion queues.
//!
//! ```text
//!   cq-poller-0 ─┐                ┌─ next() ─► OpComplete(tag, ok)
//!   cq-poller-1 ─┼─► queue[i % n] │             registry.extract(tag)
//!   cq-poller-k ─┘                │             catch_unwind(callback(ok))
//!                                 ├─ Timeout  ► keep polling
//!                                 └─ Shutdown ► exit
//! ```
//!
//! A panicking callback is logged and counted; the poller keeps draining.
//! Losing a poller would strand every operation completing after it.

use cq_core::engine::NativeEngine;
use cq_core::error::{CqError, Result};
use cq_core::event::{CompletionEvent, QueueKind};
use cq_module::ContextPool;

use crate::bridge::AsyncOperationBridge;
use crate::config::PoolConfig;
use crate::queue::{CompletionQueue, QueueState};

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Counters updated by the pollers.
#[derive(Debug, Default)]
pub struct PoolStats {
    dispatched: AtomicU64,
    callback_faults: AtomicU64,
    protocol_violations: AtomicU64,
    timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    /// Callbacks invoked, including the ones that panicked.
    pub dispatched: u64,
    pub callback_faults: u64,
    /// Completions whose tag had no registered callback.
    pub protocol_violations: u64,
    pub timeouts: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            callback_faults: self.callback_faults.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

struct Running {
    queues: Vec<Arc<CompletionQueue>>,
    handles: Vec<JoinHandle<()>>,
    bridge: AsyncOperationBridge,
}

enum Lifecycle {
    Idle,
    Running(Running),
    Stopped,
}

pub struct PollingThreadPool {
    engine: Arc<dyn NativeEngine>,
    config: PoolConfig,
    contexts: Arc<ContextPool>,
    stats: Arc<PoolStats>,
    lifecycle: Mutex<Lifecycle>,
}

impl PollingThreadPool {
    pub fn new(engine: Arc<dyn NativeEngine>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let contexts = Arc::new(ContextPool::new(config.context_pool_capacity));
        Ok(Self {
            engine,
            config,
            contexts,
            stats: Arc::new(PoolStats::default()),
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Create the queues and spawn the pollers.
    ///
    /// Fails with `AlreadyStarted` on a second call, even after `stop()`.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Idle) {
            return Err(CqError::AlreadyStarted);
        }

        let mut queues = Vec::with_capacity(self.config.queue_count);
        for _ in 0..self.config.queue_count {
            match CompletionQueue::create(Arc::clone(&self.engine), QueueKind::Next) {
                Ok(cq) => queues.push(cq),
                Err(e) => {
                    teardown(queues, Vec::new());
                    return Err(e);
                }
            }
        }

        let bridge = match AsyncOperationBridge::new(
            Arc::clone(&self.engine),
            queues.clone(),
            Arc::clone(&self.contexts),
        ) {
            Ok(bridge) => bridge,
            Err(e) => {
                teardown(queues, Vec::new());
                return Err(e);
            }
        };

        let mut handles = Vec::with_capacity(self.config.pool_size);
        for id in 0..self.config.pool_size {
            let queue = Arc::clone(&queues[id % queues.len()]);
            let stats = Arc::clone(&self.stats);
            let timeout = self.config.poll_timeout;
            let spawned = thread::Builder::new()
                .name(format!("cq-poller-{}", id))
                .spawn(move || drain_loop(id, queue, stats, timeout));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::error!(poller = id, error = %e, "failed to spawn poller");
                    teardown(queues, handles);
                    return Err(CqError::Spawn(e));
                }
            }
        }

        tracing::info!(
            pool_size = self.config.pool_size,
            queues = queues.len(),
            poll_timeout = ?self.config.poll_timeout,
            "polling thread pool started"
        );
        *lifecycle = Lifecycle::Running(Running {
            queues,
            handles,
            bridge,
        });
        Ok(())
    }

    /// Shut every queue down, join the pollers and dispose the queues.
    ///
    /// Blocks until every in-flight operation has completed: a queue only
    /// reaches its terminal event once all scopes are released. A second
    /// call (or a call before `start()`) returns `NotRunning`.
    pub fn stop(&self) -> Result<()> {
        let running = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                other => {
                    *lifecycle = other;
                    return Err(CqError::NotRunning);
                }
            }
        };
        // Lock released: callbacks running on the pollers may still call
        // `queue()` or `bridge()` and must not deadlock against us.
        let Running {
            queues,
            handles,
            bridge,
        } = running;
        drop(bridge);
        teardown(queues, handles);
        tracing::info!(stats = ?self.stats.snapshot(), "polling thread pool stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// A queue for the next submission, round-robin.
    pub fn queue(&self) -> Result<Arc<CompletionQueue>> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => Ok(Arc::clone(running.bridge.pick_queue())),
            _ => Err(CqError::NotRunning),
        }
    }

    /// Every queue, in poller-assignment order.
    pub fn queues(&self) -> Result<Vec<Arc<CompletionQueue>>> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => Ok(running.queues.clone()),
            _ => Err(CqError::NotRunning),
        }
    }

    /// Submission handle bound to this pool's queues.
    pub fn bridge(&self) -> Result<AsyncOperationBridge> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => Ok(running.bridge.clone()),
            _ => Err(CqError::NotRunning),
        }
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn contexts(&self) -> &Arc<ContextPool> {
        &self.contexts
    }
}

impl Drop for PollingThreadPool {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::debug!("polling thread pool dropped while running; stopping");
            if let Err(e) = self.stop() {
                tracing::warn!(error = %e, "stop on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for PollingThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingThreadPool")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

/// Release the queues' own holds, wait for the pollers and dispose.
fn teardown(queues: Vec<Arc<CompletionQueue>>, handles: Vec<JoinHandle<()>>) {
    for cq in &queues {
        if let Err(e) = cq.shutdown() {
            tracing::warn!(cq = cq.handle().0, error = %e, "queue shutdown");
        }
    }
    for handle in handles {
        let name = handle.thread().name().map(str::to_owned);
        if handle.join().is_err() {
            tracing::error!(poller = ?name, "poller thread panicked");
        }
    }
    for cq in &queues {
        // Queues whose pollers never started still have to reach the
        // terminal event before they can be disposed.
        if cq.state() != QueueState::Shutdown {
            while !cq.next(None).is_shutdown() {}
        }
        if let Err(e) = cq.dispose() {
            tracing::error!(cq = cq.handle().0, error = %e, "queue dispose");
        }
    }
}

fn drain_loop(
    id: usize,
    queue: Arc<CompletionQueue>,
    stats: Arc<PoolStats>,
    timeout: Option<Duration>,
) {
    tracing::debug!(poller = id, cq = queue.handle().0, "poller started");
    loop {
        match queue.next(timeout) {
            CompletionEvent::OpComplete { tag, success } => {
                let callback = match queue.registry().extract(tag) {
                    Ok(callback) => callback,
                    Err(violation) => {
                        stats.protocol_violations.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(poller = id, error = %violation, "dropping completion");
                        continue;
                    }
                };
                stats.dispatched.fetch_add(1, Ordering::Relaxed);
                if catch_unwind(AssertUnwindSafe(move || callback(success))).is_err() {
                    stats.callback_faults.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(poller = id, %tag, success, "completion callback panicked");
                }
            }
            CompletionEvent::Timeout => {
                stats.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            CompletionEvent::Shutdown => break,
        }
    }
    tracing::debug!(poller = id, cq = queue.handle().0, "poller exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_module::LoopbackEngine;

    fn pool(config: PoolConfig) -> (Arc<LoopbackEngine>, PollingThreadPool) {
        let engine = Arc::new(LoopbackEngine::new());
        let pool = PollingThreadPool::new(engine.clone(), config).unwrap();
        (engine, pool)
    }

    #[test]
    fn invalid_config_is_rejected() {
        let engine: Arc<dyn NativeEngine> = Arc::new(LoopbackEngine::new());
        let err = PollingThreadPool::new(engine, PoolConfig::new().pool_size(0)).unwrap_err();
        assert!(matches!(err, CqError::InvalidConfig(_)));
    }

    #[test]
    fn start_twice_fails() {
        let (_engine, pool) = pool(PoolConfig::new());
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(CqError::AlreadyStarted)));
        pool.stop().unwrap();
        assert!(matches!(pool.start(), Err(CqError::AlreadyStarted)));
    }

    #[test]
    fn stop_twice_fails() {
        let (_engine, pool) = pool(PoolConfig::new());
        assert!(matches!(pool.stop(), Err(CqError::NotRunning)));
        pool.start().unwrap();
        pool.stop().unwrap();
        assert!(matches!(pool.stop(), Err(CqError::NotRunning)));
        assert!(matches!(pool.queue(), Err(CqError::NotRunning)));
    }

    #[test]
    fn stop_disposes_every_queue() {
        let (engine, pool) = pool(PoolConfig::new().pool_size(4).queue_count(2));
        pool.start().unwrap();
        let queues = pool.queues().unwrap();
        assert_eq!(queues.len(), 2);
        pool.stop().unwrap();
        for cq in &queues {
            assert_eq!(cq.state(), QueueState::Shutdown);
            assert!(cq.is_disposed());
            assert!(engine.is_destroyed(cq.handle()));
            assert_eq!(engine.shutdown_requests(cq.handle()), 1);
        }
    }

    #[test]
    fn queue_is_round_robin() {
        let (_engine, pool) = pool(PoolConfig::new().pool_size(2).queue_count(2));
        pool.start().unwrap();
        let a = pool.queue().unwrap();
        let b = pool.queue().unwrap();
        let c = pool.queue().unwrap();
        assert_ne!(a.handle(), b.handle());
        assert_eq!(a.handle(), c.handle());
        pool.stop().unwrap();
    }

    #[test]
    fn timeouts_keep_pollers_alive() {
        let (_engine, pool) = pool(
            PoolConfig::new()
                .pool_size(1)
                .poll_timeout(Some(Duration::from_millis(5))),
        );
        pool.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(pool.stats().timeouts > 0);
        pool.stop().unwrap();
    }

    #[test]
    fn unbounded_poll_timeout_is_rejected() {
        let engine: Arc<dyn NativeEngine> = Arc::new(LoopbackEngine::new());
        let config = PoolConfig::new().pool_size(1).poll_timeout(Some(Duration::MAX));
        let err = PollingThreadPool::new(engine, config).unwrap_err();
        assert!(matches!(err, CqError::InvalidConfig(_)));
    }

    #[test]
    fn longest_poll_timeout_still_dispatches_and_stops() {
        let longest = Duration::from_millis(crate::config::defaults::MAX_POLL_TIMEOUT_MS);
        let (engine, pool) = pool(PoolConfig::new().pool_size(1).poll_timeout(Some(longest)));
        pool.start().unwrap();

        let result = pool
            .bridge()
            .unwrap()
            .submit(|bytes: &[u8]| Ok::<_, String>(bytes.len()))
            .unwrap();
        let (cq, tag) = engine.wait_started(Duration::from_secs(5)).unwrap();
        engine.complete_ok(cq, tag, b"abc").unwrap();
        assert_eq!(result.wait_timeout(Duration::from_secs(5)).ok(), Some(Ok(3)));

        pool.stop().unwrap();
        assert!(engine.is_destroyed(cq));
        assert_eq!(pool.stats().dispatched, 1);
    }

    #[test]
    fn drop_stops_running_pool() {
        let (engine, pool) = pool(PoolConfig::new());
        pool.start().unwrap();
        let cq = pool.queue().unwrap();
        drop(pool);
        assert!(engine.is_destroyed(cq.handle()));
    }
}
