//! Per-batch worker pool.
//!
//! A `JoinSet` gated by a semaphore. The semaphore starts with `core`
//! permits; once more than `backlog` tasks are waiting for one it grows, up
//! to `max`. Past that the submitting caller runs the work itself, which
//! slows submission down instead of queueing without bound.
//!
//! The pool lives for one batch. `join` waits for everything with a hard
//! deadline and aborts whatever is still running when it passes.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Permit bounds for one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSize {
    pub core: usize,
    pub max: usize,
}

/// `core = min(batch, 4 × parallelism, cap)`, `max = max(batch, cap)`.
/// Never below one.
pub fn pool_size(batch: usize, parallelism: usize, cap: usize) -> PoolSize {
    let core = batch.min(parallelism.saturating_mul(4)).min(cap).max(1);
    let max = batch.max(cap).max(core);
    PoolSize { core, max }
}

/// What `join` collected.
#[derive(Debug)]
pub struct PoolOutcome<T> {
    /// Finished work, by submission index, in completion order.
    pub completed: Vec<(usize, T)>,
    /// Indices that never delivered a result: aborted at the deadline or
    /// panicked.
    pub unfinished: Vec<usize>,
    pub timed_out: bool,
    /// How many tasks the caller ran itself.
    pub ran_inline: usize,
}

/// Counts a spawned task until it finishes, panics or is aborted.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct WorkerPool<T> {
    tasks: JoinSet<(usize, T)>,
    /// Spawned tasks not yet finished. `tasks.len()` also counts finished
    /// ones nobody has joined.
    in_flight: Arc<AtomicUsize>,
    permits: Arc<Semaphore>,
    granted: usize,
    size: PoolSize,
    backlog: usize,
    submitted: BTreeSet<usize>,
    inline: Vec<(usize, T)>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(size: PoolSize, backlog: usize) -> Self {
        Self {
            tasks: JoinSet::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            permits: Arc::new(Semaphore::new(size.core)),
            granted: size.core,
            size,
            backlog,
            submitted: BTreeSet::new(),
            inline: Vec::new(),
        }
    }

    pub fn size(&self) -> PoolSize {
        self.size
    }

    /// Permits currently granted.
    pub fn workers(&self) -> usize {
        self.granted
    }

    pub async fn submit<F>(&mut self, index: usize, work: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        self.submitted.insert(index);

        let waiting = (self.in_flight.load(Ordering::SeqCst) + 1).saturating_sub(self.granted);
        if waiting > self.backlog {
            if self.granted < self.size.max {
                self.permits.add_permits(1);
                self.granted += 1;
                debug!(workers = self.granted, "Worker pool grown");
            } else {
                debug!(index, "Worker pool saturated, running in caller");
                let value = work.await;
                self.inline.push((index, value));
                return;
            }
        }

        let permits = self.permits.clone();
        let in_flight = InFlight::enter(&self.in_flight);
        self.tasks.spawn(async move {
            let _in_flight = in_flight;
            // a closed semaphore only happens on teardown; run anyway
            let _permit = permits.acquire_owned().await.ok();
            (index, work.await)
        });
    }

    /// Wait for every task, at most `timeout`. Tasks still running at the
    /// deadline are aborted.
    pub async fn join(mut self, timeout: Duration) -> PoolOutcome<T> {
        let ran_inline = self.inline.len();
        let mut completed = std::mem::take(&mut self.inline);
        let mut timed_out = false;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(Ok(done))) => completed.push(done),
                Ok(Some(Err(e))) => warn!(error = %e, "Worker task failed"),
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    warn!(remaining = self.tasks.len(), timeout_secs = timeout.as_secs(), "Batch deadline passed, aborting workers");
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }
        self.permits.close();

        for (index, _) in &completed {
            self.submitted.remove(index);
        }
        PoolOutcome {
            completed,
            unfinished: self.submitted.into_iter().collect(),
            timed_out,
            ran_inline,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
