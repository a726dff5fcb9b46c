//! Keyed and global task queueing
//!
//! Two kinds of exclusivity are provided:
//!
//! - **Keyed** tasks are serialized per key (an object name). Tasks on
//!   different keys run concurrently.
//! - **Global** tasks are exclusive with the whole system: a global task
//!   starts only after the keyed work queued before it has drained, and a
//!   keyed task submitted while global work is pending waits for the global
//!   tasks submitted before it.
//!
//! ## Architecture
//!
//! ```text
//!  enqueue_keyed(key) ──→ Registry ──→ SerialQueue(key)  ──→ worker task
//!                                   └─→ SerialQueue(key2) ──→ worker task
//!  enqueue_global ─────────────────→ SerialQueue(global) ──→ worker task
//! ```
//!
//! Every [`SerialQueue`] publishes a `(pushed, done)` counter pair on a
//! `watch` channel. Waiting for "the work queued so far" means waiting until
//! `done` reaches the `pushed` value observed at that moment, so a waiter is
//! never blocked by work submitted after it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::SyncError;

type Job = Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send + 'static>>;
type DoneHook = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// Completion handle
// ============================================================================

/// Resolves when a queued task has finished
///
/// Dropping a `Completion` does not cancel the task. Callers that need a
/// deadline wrap [`wait`](Completion::wait) in `tokio::time::timeout`.
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), SyncError>>,
}

impl Completion {
    /// Wait for the task and return its result
    ///
    /// Yields [`SyncError::QueueClosed`] if the queue worker went away
    /// before reporting.
    pub async fn wait(self) -> Result<(), SyncError> {
        self.rx.await.unwrap_or(Err(SyncError::QueueClosed))
    }
}

// ============================================================================
// SerialQueue - one worker, one task at a time
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Progress {
    pushed: u64,
    done: u64,
}

impl Progress {
    fn is_idle(&self) -> bool {
        self.done >= self.pushed
    }
}

struct Envelope {
    job: Job,
    on_done: Option<DoneHook>,
    reply: oneshot::Sender<Result<(), SyncError>>,
}

/// FIFO queue drained by a dedicated worker task
///
/// Each job runs on its own spawned task so that a panic surfaces as a
/// `JoinError` instead of killing the worker.
struct SerialQueue {
    tx: mpsc::UnboundedSender<Envelope>,
    progress: Arc<watch::Sender<Progress>>,
}

impl SerialQueue {
    fn spawn(label: String) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let (progress, _) = watch::channel(Progress::default());
        let progress = Arc::new(progress);
        let worker_progress = Arc::clone(&progress);

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let result = match tokio::spawn(envelope.job).await {
                    Ok(result) => result,
                    Err(join_err) => Err(SyncError::TaskPanicked(join_err.to_string())),
                };
                if let Err(ref e) = result {
                    error!(queue = %label, error = %e, "Queued task failed");
                }

                worker_progress.send_modify(|p| p.done += 1);
                if let Some(hook) = envelope.on_done {
                    hook();
                }
                // The caller may have dropped its Completion
                let _ = envelope.reply.send(result);
            }
            debug!(queue = %label, "Queue worker stopped");
        });

        Self { tx, progress }
    }

    /// Queue a job
    ///
    /// If the worker is gone the job is dropped, its Completion resolves with
    /// `QueueClosed`, and the undelivered `on_done` hook is handed back so the
    /// caller can run it outside any lock it holds.
    fn push(&self, job: Job, on_done: Option<DoneHook>) -> (Completion, Option<DoneHook>) {
        let (reply, rx) = oneshot::channel();
        self.progress.send_modify(|p| p.pushed += 1);

        let undelivered = match self.tx.send(Envelope {
            job,
            on_done,
            reply,
        }) {
            Ok(()) => None,
            Err(mpsc::error::SendError(envelope)) => {
                warn!("Queue worker unavailable, dropping task");
                self.progress.send_modify(|p| p.done += 1);
                envelope.on_done
            }
        };

        (Completion { rx }, undelivered)
    }

    fn snapshot(&self) -> Progress {
        *self.progress.borrow()
    }

    fn is_idle(&self) -> bool {
        self.snapshot().is_idle()
    }

    /// Receiver plus the `done` target covering everything pushed so far
    fn drain_target(&self) -> (watch::Receiver<Progress>, u64) {
        (self.progress.subscribe(), self.snapshot().pushed)
    }
}

/// Wait until `done` reaches `target`
///
/// Returns immediately if it already has. A closed channel means the worker
/// stopped, which only happens once the queue was dropped as idle.
async fn wait_done(mut rx: watch::Receiver<Progress>, target: u64) {
    let _ = rx.wait_for(|p| p.done >= target).await;
}

// ============================================================================
// Registry
// ============================================================================

struct KeyQueue {
    queue: SerialQueue,
    /// Sequence number (1-based) of the latest global task that captured this queue
    captured_by: Option<u64>,
}

#[derive(Default)]
struct Registry {
    queues: HashMap<String, KeyQueue>,
    /// Keyed tasks submitted but not yet finished
    live_tasks: usize,
}

impl Registry {
    /// Drop idle queues once no keyed work is live
    fn sweep(&mut self) {
        self.queues.retain(|name, kq| {
            if kq.queue.is_idle() {
                false
            } else {
                debug_assert!(false, "key queue '{name}' still busy with no live tasks");
                error!(queue = %name, "Key queue still busy with no live tasks, keeping it");
                true
            }
        });
    }
}

struct Inner {
    global: SerialQueue,
    registry: Mutex<Registry>,
}

impl Inner {
    fn keyed_task_finished(&self) {
        let mut registry = self.registry.lock().unwrap();
        debug_assert!(registry.live_tasks > 0, "live task counter underflow");
        registry.live_tasks = registry.live_tasks.saturating_sub(1);
        if registry.live_tasks == 0 {
            registry.sweep();
            debug!("All keyed tasks finished, registry swept");
        }
    }
}

// ============================================================================
// Queueing
// ============================================================================

/// Keyed / global task queueing
///
/// Cheap to clone; clones share the same queues. Must be created inside a
/// Tokio runtime because the global queue's worker is spawned eagerly.
#[derive(Clone)]
pub struct Queueing {
    inner: Arc<Inner>,
}

impl Queueing {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                global: SerialQueue::spawn("global".to_string()),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    /// Queue a task exclusive with the whole system
    ///
    /// Global tasks run one at a time in submission order. When keyed work is
    /// live at submission, the task first waits for every key queue to finish
    /// the work it had at that moment; keyed work submitted later does not
    /// delay it.
    pub fn enqueue_global<Fut>(&self, task: Fut) -> Completion
    where
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let mut registry = self.inner.registry.lock().unwrap();
        let sequence = self.inner.global.snapshot().pushed + 1;

        let captured: Vec<(watch::Receiver<Progress>, u64)> = if registry.live_tasks > 0 {
            registry
                .queues
                .values_mut()
                .filter(|kq| !kq.queue.is_idle())
                .map(|kq| {
                    kq.captured_by = Some(sequence);
                    kq.queue.drain_target()
                })
                .collect()
        } else {
            Vec::new()
        };

        debug!(sequence, captured = captured.len(), "Enqueuing global task");

        let job = async move {
            for (rx, target) in captured {
                wait_done(rx, target).await;
            }
            task.await
        };

        self.inner.global.push(Box::pin(job), None).0
    }

    /// Queue a task exclusive per `key`
    ///
    /// Same-key tasks run strictly in submission order. If global work is
    /// pending at submission, the task also waits for the global tasks
    /// submitted before it.
    ///
    /// When the existing queue for `key` still holds work that a pending
    /// global task captured, that queue is re-registered under a synthetic
    /// `<key>#<uuid>` name and a fresh queue takes over `key`. The new task
    /// still waits for the renamed queue's outstanding work.
    pub fn enqueue_keyed<Fut>(&self, key: &str, task: Fut) -> Completion
    where
        Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        let mut registry = self.inner.registry.lock().unwrap();
        let global = self.inner.global.snapshot();
        let global_busy = !global.is_idle();

        let needs_rename = global_busy
            && registry.queues.get(key).is_some_and(|kq| {
                !kq.queue.is_idle() && kq.captured_by.is_some_and(|seq| global.done < seq)
            });

        let mut predecessor = None;
        if needs_rename {
            if let Some(old) = registry.queues.remove(key) {
                let synthetic = format!("{key}#{}", Uuid::new_v4());
                debug!(key, renamed_to = %synthetic, "Key queue captured by pending global task, renaming");
                predecessor = Some(old.queue.drain_target());
                registry.queues.insert(synthetic, old);
            }
        }

        let gate = global_busy.then(|| self.inner.global.drain_target());

        registry.live_tasks += 1;
        let entry = registry
            .queues
            .entry(key.to_string())
            .or_insert_with(|| KeyQueue {
                queue: SerialQueue::spawn(key.to_string()),
                captured_by: None,
            });

        debug!(key, deferred = global_busy, "Enqueuing keyed task");

        let job = async move {
            if let Some((rx, target)) = predecessor {
                wait_done(rx, target).await;
            }
            if let Some((rx, target)) = gate {
                wait_done(rx, target).await;
            }
            task.await
        };

        let inner = Arc::clone(&self.inner);
        let hook: DoneHook = Box::new(move || inner.keyed_task_finished());

        let (completion, undelivered) = entry.queue.push(Box::pin(job), Some(hook));
        drop(registry);
        if let Some(hook) = undelivered {
            hook();
        }
        completion
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Number of registered key queues (including renamed ones)
    pub fn key_queue_count(&self) -> usize {
        self.inner.registry.lock().unwrap().queues.len()
    }

    /// Names of the registered key queues, sorted
    pub fn key_queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .registry
            .lock()
            .unwrap()
            .queues
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn has_key_queue(&self, key: &str) -> bool {
        self.inner.registry.lock().unwrap().queues.contains_key(key)
    }

    /// Keyed tasks submitted and not yet finished
    pub fn live_task_count(&self) -> usize {
        self.inner.registry.lock().unwrap().live_tasks
    }

    /// Whether a global task is queued or running
    pub fn is_global_busy(&self) -> bool {
        !self.inner.global.is_idle()
    }

    /// Wait until every key queue and the global queue have drained and the
    /// registry has been swept
    pub async fn wait_idle(&self) {
        loop {
            let targets: Vec<(watch::Receiver<Progress>, u64)> = {
                let registry = self.inner.registry.lock().unwrap();
                registry
                    .queues
                    .values()
                    .map(|kq| kq.queue.drain_target())
                    .chain(std::iter::once(self.inner.global.drain_target()))
                    .collect()
            };

            for (rx, target) in targets {
                wait_done(rx, target).await;
            }

            // live_tasks reaches zero only after the finishing task's sweep ran
            let idle = self.inner.registry.lock().unwrap().live_tasks == 0;
            if idle && self.inner.global.is_idle() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }
}

impl Default for Queueing {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Queueing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queueing")
            .field("key_queues", &self.key_queue_count())
            .field("live_tasks", &self.live_task_count())
            .field("global_busy", &self.is_global_busy())
            .finish()
    }
}
