//! Script execution pool: a bounded priority queue in front of a fixed set
//! of workers, with per-task timeouts, cancellation, counters and a periodic
//! resource monitor.
//!
//! Higher `priority` runs first; ties dispatch in submission order. The
//! concurrency semaphore is sized like the worker set, so even a blocked
//! worker cannot let extra tasks through.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::runner::{self, ProcessRequest, ProcessResult};

/// Advisory memory threshold for the resource monitor.
const MEMORY_HINT_BYTES: u64 = 1024 * 1024 * 1024;
/// Samples kept for the mean duration calculation.
const DURATION_RING: usize = 128;

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub workers: usize,
    pub max_queue: usize,
    /// Upper bound applied to every request timeout.
    pub default_timeout: Duration,
    pub monitor_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().clamp(1, 8),
            max_queue: 256,
            default_timeout: Duration::from_secs(2 * 60 * 60),
            monitor_interval: Duration::from_secs(5),
        }
    }
}

/// One unit of work for the pool.
pub struct ScriptRequest {
    pub process: ProcessRequest,
    pub priority: i32,
    /// Caller-side cancellation; the pool links its own token to it.
    pub token: CancellationToken,
}

impl ScriptRequest {
    pub fn new(process: ProcessRequest, priority: i32) -> Self {
        Self { process, priority, token: CancellationToken::new() }
    }
}

/// Point-in-time pool statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_executed: u64,
    pub failed: u64,
    pub active: usize,
    pub queued: usize,
    pub average_duration_ms: u64,
    pub sampled_memory_bytes: u64,
}

struct QueueEntry {
    id: u64,
    seq: u64,
    priority: i32,
    request: ScriptRequest,
    reply: oneshot::Sender<Result<ProcessResult>>,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for QueueEntry {}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority first, then lowest sequence (FIFO ties).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolInner {
    config: PoolConfig,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    notify: Notify,
    semaphore: Semaphore,
    /// Task id -> cancel handle for everything currently executing.
    active: DashMap<u64, CancellationToken>,
    token: CancellationToken,
    disposed: AtomicBool,
    next_seq: AtomicU64,
    total_executed: AtomicU64,
    failed: AtomicU64,
    durations_ms: Mutex<VecDeque<u64>>,
    sampled_memory: AtomicU64,
}

pub struct ScriptPool {
    inner: Arc<PoolInner>,
}

#[cfg(target_os = "linux")]
fn sample_memory_bytes() -> u64 {
    // Resident set from /proc/self/statm, second field, in pages.
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0;
    };
    statm
        .split_whitespace()
        .nth(1)
        .and_then(|pages| pages.parse::<u64>().ok())
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn sample_memory_bytes() -> u64 {
    0
}

impl ScriptPool {
    pub fn new(config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            semaphore: Semaphore::new(config.workers.max(1)),
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            active: DashMap::new(),
            token: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            total_executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            durations_ms: Mutex::new(VecDeque::with_capacity(DURATION_RING)),
            sampled_memory: AtomicU64::new(0),
            config,
        });

        for _ in 0..inner.config.workers.max(1) {
            let worker_inner = Arc::clone(&inner);
            tokio::spawn(worker_loop(worker_inner));
        }
        let monitor_inner = Arc::clone(&inner);
        tokio::spawn(monitor_loop(monitor_inner));

        Self { inner }
    }

    /// Submit a request and wait for its result. Fails synchronously with
    /// `ScriptQueueFull` when the queue is at capacity and `Canceled` after
    /// disposal.
    pub async fn execute(&self, request: ScriptRequest) -> Result<ProcessResult> {
        if self.inner.disposed.load(AtomicOrdering::SeqCst) {
            return Err(Error::Canceled);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let seq = self.inner.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        {
            let mut queue = match self.inner.queue.lock() {
                Ok(q) => q,
                Err(_) => return Err(Error::Canceled),
            };
            if queue.len() >= self.inner.config.max_queue {
                return Err(Error::ScriptQueueFull { capacity: self.inner.config.max_queue });
            }
            queue.push(QueueEntry {
                id: seq,
                seq,
                priority: request.priority,
                request,
                reply: reply_tx,
            });
        }
        self.inner.notify.notify_one();
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Canceled),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let durations = self.inner.durations_ms.lock().map(|d| d.clone()).unwrap_or_default();
        let average_duration_ms = if durations.is_empty() {
            0
        } else {
            durations.iter().sum::<u64>() / durations.len() as u64
        };
        PoolStats {
            total_executed: self.inner.total_executed.load(AtomicOrdering::SeqCst),
            failed: self.inner.failed.load(AtomicOrdering::SeqCst),
            active: self.inner.active.len(),
            queued: self.inner.queue.lock().map(|q| q.len()).unwrap_or(0),
            average_duration_ms,
            sampled_memory_bytes: self.inner.sampled_memory.load(AtomicOrdering::SeqCst),
        }
    }

    /// Cancel everything and refuse further submissions.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, AtomicOrdering::SeqCst);
        self.inner.token.cancel();
        // Dropping queued entries drops their reply channels; waiting
        // callers observe Canceled.
        if let Ok(mut queue) = self.inner.queue.lock() {
            queue.clear();
        }
        self.inner.notify.notify_waiters();
    }
}

impl Drop for ScriptPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let entry = loop {
            if inner.token.is_cancelled() {
                return;
            }
            let popped = inner.queue.lock().ok().and_then(|mut q| q.pop());
            match popped {
                Some(entry) => break entry,
                None => {
                    tokio::select! {
                        _ = inner.notify.notified() => {}
                        _ = inner.token.cancelled() => return,
                    }
                }
            }
        };

        let Ok(_permit) = inner.semaphore.acquire().await else {
            return;
        };

        // Task token: child of the caller's token, also tripped by disposal.
        let task_token = entry.request.token.child_token();
        let forward_token = task_token.clone();
        let pool_token = inner.token.clone();
        let forward = tokio::spawn(async move {
            pool_token.cancelled().await;
            forward_token.cancel();
        });

        inner.active.insert(entry.id, task_token.clone());

        let mut process = entry.request.process;
        process.timeout = Some(
            process
                .timeout
                .map(|t| t.min(inner.config.default_timeout))
                .unwrap_or(inner.config.default_timeout),
        );

        let started = std::time::Instant::now();
        let result = runner::execute(&process, &task_token).await;
        forward.abort();

        inner.active.remove(&entry.id);
        inner.total_executed.fetch_add(1, AtomicOrdering::SeqCst);
        let failed = match &result {
            Ok(r) => !r.success,
            Err(_) => true,
        };
        if failed {
            inner.failed.fetch_add(1, AtomicOrdering::SeqCst);
        }
        if let Ok(mut ring) = inner.durations_ms.lock() {
            if ring.len() == DURATION_RING {
                ring.pop_front();
            }
            ring.push_back(started.elapsed().as_millis() as u64);
        }
        let _ = entry.reply.send(result);
    }
}

async fn monitor_loop(inner: Arc<PoolInner>) {
    let mut tick = tokio::time::interval(inner.config.monitor_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => return,
            _ = tick.tick() => {}
        }
        // Drop handles whose cancellation already fired.
        inner.active.retain(|_, handle| !handle.is_cancelled());
        let memory = sample_memory_bytes();
        inner.sampled_memory.store(memory, AtomicOrdering::SeqCst);
        if memory > MEMORY_HINT_BYTES {
            crate::log::warn(&format!(
                "script pool memory sample at {} MiB; consider fewer concurrent scripts",
                memory / (1024 * 1024)
            ));
        }
    }
}
