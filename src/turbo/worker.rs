//! Prefetch Worker
//!
//! A single background thread drains a de-duplicated set of pending
//! requests. It is started lazily by the first request that needs it and
//! exits on its own after sitting idle for the configured timeout; the
//! next request starts a fresh one.
//!
//! ```text
//!   Idle ──submit──▶ Running ──queue empty for idle_timeout──▶ Idle
//!                       │
//!                       └──shutdown (queue discarded)──▶ Stopped
//! ```

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, instrument, trace, warn};

use super::entry::{EntityKey, PendingRequest};
use super::metrics::TurboStatistics;
use crate::error::Error;

/// Work performed for one dequeued request
pub trait RequestHandler<K>: Send + Sync {
    /// Load and publish the value for `request`
    fn handle(&self, request: &PendingRequest<K>);
}

/// What happened to a submitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Added to the pending set
    Queued,
    /// An equal request is already pending or being processed
    Duplicate,
    /// The worker has been shut down
    Discarded,
}

struct QueueState<K> {
    pending: HashSet<PendingRequest<K>>,
    in_flight: HashSet<PendingRequest<K>>,
    running: bool,
    shutdown: bool,
}

impl<K: EntityKey> QueueState<K> {
    /// Move an arbitrary pending request to the in-flight set
    fn take_one(&mut self) -> Option<PendingRequest<K>> {
        let request = self.pending.iter().next().cloned()?;
        self.pending.remove(&request);
        self.in_flight.insert(request.clone());
        Some(request)
    }

    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }
}

struct Queue<K> {
    state: Mutex<QueueState<K>>,
    /// Signalled when a request is added or on shutdown
    ready: Condvar,
    /// Signalled when the queue becomes empty with nothing in flight
    drained: Condvar,
}

/// Lazily started single-thread loader
pub struct PrefetchWorker<K> {
    queue: Arc<Queue<K>>,
    idle_timeout: Duration,
    thread_name: String,
    stats: Arc<dyn TurboStatistics>,
}

impl<K: EntityKey> PrefetchWorker<K> {
    /// Create an idle worker
    pub fn new(
        idle_timeout: Duration,
        thread_name: impl Into<String>,
        stats: Arc<dyn TurboStatistics>,
    ) -> Self {
        Self {
            queue: Arc::new(Queue {
                state: Mutex::new(QueueState {
                    pending: HashSet::new(),
                    in_flight: HashSet::new(),
                    running: false,
                    shutdown: false,
                }),
                ready: Condvar::new(),
                drained: Condvar::new(),
            }),
            idle_timeout,
            thread_name: thread_name.into(),
            stats,
        }
    }

    /// Queue a request, starting the worker thread if none is running
    pub fn submit(
        &self,
        request: PendingRequest<K>,
        handler: Arc<dyn RequestHandler<K>>,
    ) -> Submission {
        let mut state = self.queue.state.lock();
        if state.shutdown {
            return Submission::Discarded;
        }
        if state.in_flight.contains(&request) || state.pending.contains(&request) {
            self.stats.duplicate_request();
            trace!(request = %request, "Duplicate prefetch request");
            return Submission::Duplicate;
        }

        trace!(request = %request, "Prefetch request queued");
        state.pending.insert(request);
        self.stats.queue_size_observed(state.pending.len());

        if state.running {
            self.queue.ready.notify_one();
        } else {
            match self.spawn(handler) {
                Ok(()) => {
                    state.running = true;
                    self.stats.background_thread_started();
                }
                Err(e) => {
                    // Left queued; the next submit retries the spawn
                    warn!("{}", e);
                }
            }
        }
        Submission::Queued
    }

    /// Stop the worker and discard everything still pending
    pub fn shutdown(&self) {
        let mut state = self.queue.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        let discarded = state.pending.len();
        state.pending.clear();
        self.queue.ready.notify_all();
        self.queue.drained.notify_all();
        debug!(discarded, "Prefetch worker shut down");
    }

    /// Returns true while a worker thread is alive
    pub fn is_running(&self) -> bool {
        self.queue.state.lock().running
    }

    /// Number of requests waiting or being processed
    pub fn pending_len(&self) -> usize {
        let state = self.queue.state.lock();
        state.pending.len() + state.in_flight.len()
    }

    /// Block until every queued request has been processed.
    /// Returns false if `timeout` elapsed first.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        // A timeout too large to represent waits without a deadline
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.queue.state.lock();
        while !state.is_drained() && !state.shutdown {
            match deadline {
                Some(deadline) => {
                    if self
                        .queue
                        .drained
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return state.is_drained();
                    }
                }
                None => self.queue.drained.wait(&mut state),
            }
        }
        true
    }

    fn spawn(&self, handler: Arc<dyn RequestHandler<K>>) -> crate::error::Result<()> {
        let queue = Arc::clone(&self.queue);
        let idle_timeout = self.idle_timeout;
        thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run(queue, handler, idle_timeout))
            .map(|_| ())
            .map_err(|source| Error::WorkerSpawn {
                name: self.thread_name.clone(),
                source,
            })
    }
}

#[instrument(skip_all)]
fn run<K: EntityKey>(queue: Arc<Queue<K>>, handler: Arc<dyn RequestHandler<K>>, idle_timeout: Duration) {
    debug!("Prefetch worker started");
    loop {
        let request = {
            let mut state = queue.state.lock();
            loop {
                if state.shutdown {
                    state.running = false;
                    state.in_flight.clear();
                    debug!("Prefetch worker interrupted");
                    return;
                }
                if let Some(request) = state.take_one() {
                    break request;
                }
                let result = queue.ready.wait_for(&mut state, idle_timeout);
                if result.timed_out() && state.pending.is_empty() && !state.shutdown {
                    state.running = false;
                    debug!(?idle_timeout, "Prefetch worker idle, exiting");
                    return;
                }
            }
        };

        if catch_unwind(AssertUnwindSafe(|| handler.handle(&request))).is_err() {
            error!(request = %request, "Prefetch request panicked");
        }

        let mut state = queue.state.lock();
        state.in_flight.remove(&request);
        if state.is_drained() {
            queue.drained.notify_all();
        }
    }
}

impl<K> fmt::Debug for PrefetchWorker<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.queue.state.lock();
        f.debug_struct("PrefetchWorker")
            .field("running", &state.running)
            .field("pending", &state.pending.len())
            .field("in_flight", &state.in_flight.len())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
