//! Worker-pool submission endpoint with cookie-routed completions.
//!
//! Submissions carry a caller-chosen cookie; when the operation finishes,
//! the continuation registered under that cookie runs on the worker that
//! executed it. A bounded pool of I/O control blocks back-pressures
//! submitters once too many requests are in flight.

use crate::{IoCompletion, IoEngine, IoOp};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use strata_error::{Result, StrataError};
use tracing::{debug, trace, warn};

/// Continuation invoked with the completed operation's outcome.
pub type Continuation = Box<dyn FnOnce(IoCompletion) + Send>;

/// Maps in-flight cookies to their continuations.
#[derive(Default)]
pub struct CompletionRouter {
    next_cookie: AtomicU64,
    pending: Mutex<HashMap<u64, Continuation>>,
}

impl CompletionRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a continuation; the returned cookie identifies it.
    pub fn register(&self, cont: Continuation) -> u64 {
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().insert(cookie, cont);
        cookie
    }

    /// Route a completion to its continuation.
    ///
    /// Unknown cookies are logged and dropped: the caller-side handle was
    /// dropped or already completed; the I/O result is discarded.
    pub fn complete(&self, cookie: u64, comp: IoCompletion) {
        let cont = self.pending.lock().remove(&cookie);
        match cont {
            Some(cont) => cont(comp),
            None => warn!(
                target: "strata::io",
                event = "orphan_completion",
                cookie
            ),
        }
    }

    /// Fail every outstanding continuation with `ShutdownInProgress`.
    pub fn fail_pending(&self) {
        let drained: Vec<Continuation> = {
            let mut pending = self.pending.lock();
            pending.drain().map(|(_, cont)| cont).collect()
        };
        for cont in drained {
            cont(IoCompletion::Error(StrataError::ShutdownInProgress));
        }
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl std::fmt::Debug for CompletionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionRouter")
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

/// Endpoint sizing knobs.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Worker threads draining the submission queue.
    pub workers: usize,
    /// I/O control blocks; bounds the number of in-flight submissions.
    pub iocb_pool: usize,
    /// Maximum completions drained by a worker per wakeup.
    pub max_completions: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(2)
            .clamp(1, 16);
        Self {
            workers,
            iocb_pool: 200,
            max_completions: 32,
        }
    }
}

enum Submission {
    Op {
        engine: Arc<dyn IoEngine>,
        op: IoOp,
        cookie: u64,
    },
    /// An arbitrary unit of storage work executed on a worker thread;
    /// completes as a transfer of the returned length.
    Job {
        run: Box<dyn FnOnce() -> Result<usize> + Send>,
        cookie: u64,
    },
}

struct QueueState {
    queue: VecDeque<Submission>,
    free_iocbs: usize,
}

struct Shared {
    state: Mutex<QueueState>,
    work_cond: Condvar,
    slot_cond: Condvar,
    shutdown: AtomicBool,
    router: Arc<CompletionRouter>,
    max_completions: usize,
}

/// Submission endpoint: worker pool plus bounded in-flight window.
pub struct IoEndpoint {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl IoEndpoint {
    /// Spawn the worker pool.
    #[must_use]
    pub fn start(cfg: &EndpointConfig, router: Arc<CompletionRouter>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                free_iocbs: cfg.iocb_pool.max(1),
            }),
            work_cond: Condvar::new(),
            slot_cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            router,
            max_completions: cfg.max_completions.max(1),
        });

        let mut workers = Vec::with_capacity(cfg.workers);
        for idx in 0..cfg.workers.max(1) {
            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("strata-io-{idx}"))
                .spawn(move || worker_loop(&shared))
                .expect("spawn io worker");
            workers.push(handle);
        }
        debug!(
            target: "strata::io",
            event = "endpoint_started",
            workers = workers.len()
        );

        Self {
            shared,
            workers: Mutex::new(workers),
            stopped: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn router(&self) -> &Arc<CompletionRouter> {
        &self.shared.router
    }

    /// Submit one device operation completing under `cookie`.
    pub fn submit_op(&self, engine: Arc<dyn IoEngine>, op: IoOp, cookie: u64) -> Result<()> {
        self.enqueue(Submission::Op { engine, op, cookie })
    }

    /// Submit a storage job completing under `cookie`.
    pub fn submit_job(
        &self,
        run: Box<dyn FnOnce() -> Result<usize> + Send>,
        cookie: u64,
    ) -> Result<()> {
        self.enqueue(Submission::Job { run, cookie })
    }

    fn enqueue(&self, sub: Submission) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(StrataError::ShutdownInProgress);
        }
        let mut state = self.shared.state.lock();
        while state.free_iocbs == 0 {
            if self.shared.shutdown.load(Ordering::Acquire) {
                return Err(StrataError::ShutdownInProgress);
            }
            self.shared.slot_cond.wait(&mut state);
        }
        state.free_iocbs -= 1;
        state.queue.push_back(sub);
        drop(state);
        self.shared.work_cond.notify_one();
        Ok(())
    }

    /// Stop accepting submissions, drain workers, fail anything pending.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.work_cond.notify_all();
        self.shared.slot_cond.notify_all();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }

        // Anything still queued never ran; complete it as shut down.
        let leftovers: Vec<Submission> = {
            let mut state = self.shared.state.lock();
            state.queue.drain(..).collect()
        };
        for sub in leftovers {
            let cookie = match sub {
                Submission::Op { cookie, .. } | Submission::Job { cookie, .. } => cookie,
            };
            self.shared
                .router
                .complete(cookie, IoCompletion::Error(StrataError::ShutdownInProgress));
        }
        self.shared.router.fail_pending();
        debug!(target: "strata::io", event = "endpoint_stopped");
    }
}

impl Drop for IoEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for IoEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoEndpoint")
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let batch: Vec<Submission> = {
            let mut state = shared.state.lock();
            loop {
                if !state.queue.is_empty() {
                    break;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.work_cond.wait(&mut state);
            }
            let n = state.queue.len().min(shared.max_completions);
            state.queue.drain(..n).collect()
        };

        for sub in batch {
            let (cookie, comp) = match sub {
                Submission::Op { engine, op, cookie } => {
                    trace!(target: "strata::io", event = "op_dispatch", cookie);
                    let comp = engine
                        .submit_batch(vec![op])
                        .pop()
                        .unwrap_or_else(|| {
                            IoCompletion::Error(StrataError::IoFailure {
                                dev: 0,
                                detail: "engine returned no completion".to_owned(),
                            })
                        });
                    (cookie, comp)
                }
                Submission::Job { run, cookie } => {
                    trace!(target: "strata::io", event = "job_dispatch", cookie);
                    let comp = match run() {
                        Ok(len) => IoCompletion::Write { len },
                        Err(err) => IoCompletion::Error(err),
                    };
                    (cookie, comp)
                }
            };

            {
                let mut state = shared.state.lock();
                state.free_iocbs += 1;
            }
            shared.slot_cond.notify_one();
            shared.router.complete(cookie, comp);
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
