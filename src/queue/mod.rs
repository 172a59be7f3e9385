//! Work items and the dispatcher that chains pipeline stages.
//!
//! The pipeline only ever sees [`Dispatcher`]. [`WorkQueue`] is the in-process
//! implementation: at-least-once delivery, a bounded pool of workers running
//! jobs on the blocking pool, exponential backoff for retryable failures and
//! a dead-letter list for everything else.

pub mod retry;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{PipelineError, PipelineResult};
use crate::events::{EventKind, RawEvent};
use crate::logging::{log, obj, v_str, v_u64, Domain, Level};

pub use retry::RetryConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    /// All events decoded from one transaction, in decode order.
    StoreTransaction {
        signature: String,
        events: Vec<RawEvent>,
    },
    Interpret {
        kind: EventKind,
        order_index: String,
    },
    CreateGameInstance {
        trial_id: u64,
    },
    ResolveGameInstance {
        trial_id: u64,
        result_index: u32,
    },
}

impl Job {
    pub fn interpret(event: &RawEvent) -> Self {
        Job::Interpret {
            kind: event.kind(),
            order_index: event.order_index.clone(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Job::StoreTransaction { .. } => "store.transaction",
            Job::Interpret { kind, .. } => kind.job_name(),
            Job::CreateGameInstance { .. } => "game.create_instance",
            Job::ResolveGameInstance { .. } => "game.resolve_instance",
        }
    }

    /// Identifying key for logs.
    pub fn key(&self) -> String {
        match self {
            Job::StoreTransaction { signature, .. } => signature.clone(),
            Job::Interpret { order_index, .. } => order_index.clone(),
            Job::CreateGameInstance { trial_id } => trial_id.to_string(),
            Job::ResolveGameInstance { trial_id, result_index } => {
                format!("{}:{}", trial_id, result_index)
            }
        }
    }
}

/// Capability to schedule follow-up work.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: Job) -> PipelineResult<()>;
}

/// Executes one job. Implemented by the pipeline.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, job: &Job) -> PipelineResult<()>;
}

/// Records dispatched jobs instead of running them.
#[derive(Default)]
pub struct RecordingDispatcher {
    jobs: Mutex<Vec<Job>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Drains and returns everything recorded so far.
    pub fn take(&self) -> Vec<Job> {
        std::mem::take(&mut *self.jobs.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(&self, job: Job) -> PipelineResult<()> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner()).push(job);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub job: Job,
    pub attempts: u32,
    pub class: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

struct Envelope {
    job: Job,
    attempt: u32,
}

struct Shared {
    retry: RetryConfig,
    /// Jobs queued, running or sleeping before a retry.
    outstanding: AtomicUsize,
    idle: Notify,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

/// Cloneable producer side of a [`WorkQueue`].
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<Envelope>,
    shared: Arc<Shared>,
}

impl QueueHandle {
    fn send(&self, envelope: Envelope) -> PipelineResult<()> {
        self.tx.send(envelope).map_err(|_| PipelineError::QueueClosed)
    }

    fn finish(&self) {
        if self.shared.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.idle.notify_waiters();
        }
    }

    /// Resolves once nothing is queued, running or waiting to be retried.
    pub async fn wait_idle(&self) {
        loop {
            // Registered before the check so a concurrent notify is not lost.
            let notified = self.shared.idle.notified();
            if self.shared.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            completed: self.shared.completed.load(Ordering::SeqCst),
            retried: self.shared.retried.load(Ordering::SeqCst),
            dead_lettered: self.shared.dead_lettered.load(Ordering::SeqCst),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared
            .dead_letters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn settle(&self, envelope: Envelope, outcome: Result<PipelineResult<()>, String>) {
        let job_fields = |extra: Vec<(&str, Value)>| {
            let mut fields = vec![
                ("job", v_str(envelope.job.name())),
                ("key", v_str(&envelope.job.key())),
                ("attempt", v_u64(envelope.attempt as u64 + 1)),
            ];
            fields.extend(extra);
            obj(&fields)
        };

        let err = match outcome {
            Ok(Ok(())) => {
                self.shared.completed.fetch_add(1, Ordering::SeqCst);
                log(Level::Debug, Domain::Queue, "job_completed", job_fields(vec![]));
                self.finish();
                return;
            }
            Ok(Err(err)) => err,
            Err(panic) => {
                self.dead_letter(envelope, "panic", panic);
                return;
            }
        };

        if err.is_retryable() && self.shared.retry.allows_retry(envelope.attempt) {
            let delay = self.shared.retry.delay_for_attempt(envelope.attempt);
            self.shared.retried.fetch_add(1, Ordering::SeqCst);
            let level = if matches!(err, PipelineError::MissingPrerequisite(_)) {
                Level::Info
            } else {
                Level::Warn
            };
            log(
                level,
                Domain::Queue,
                "retry_scheduled",
                job_fields(vec![
                    ("class", v_str(err.class())),
                    ("error", v_str(&err.to_string())),
                    ("delay_ms", v_u64(delay.as_millis() as u64)),
                ]),
            );
            let handle = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let next = Envelope {
                    job: envelope.job,
                    attempt: envelope.attempt + 1,
                };
                if let Err(closed) = handle.send(next) {
                    // Receiver is gone; the job cannot run again.
                    handle.shared.dead_lettered.fetch_add(1, Ordering::SeqCst);
                    log(
                        Level::Error,
                        Domain::Queue,
                        "retry_dropped",
                        obj(&[("error", v_str(&closed.to_string()))]),
                    );
                    handle.finish();
                }
            });
            return;
        }

        self.dead_letter(envelope, err.class(), err.to_string());
    }

    fn dead_letter(&self, envelope: Envelope, class: &'static str, error: String) {
        log(
            Level::Error,
            Domain::Queue,
            "job_dead_lettered",
            obj(&[
                ("job", v_str(envelope.job.name())),
                ("key", v_str(&envelope.job.key())),
                ("attempts", v_u64(envelope.attempt as u64 + 1)),
                ("class", v_str(class)),
                ("error", v_str(&error)),
            ]),
        );
        self.shared.dead_lettered.fetch_add(1, Ordering::SeqCst);
        self.shared
            .dead_letters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(DeadLetter {
                job: envelope.job,
                attempts: envelope.attempt + 1,
                class,
                error,
            });
        self.finish();
    }
}

impl Dispatcher for QueueHandle {
    fn dispatch(&self, job: Job) -> PipelineResult<()> {
        self.shared.outstanding.fetch_add(1, Ordering::SeqCst);
        let sent = self.send(Envelope { job, attempt: 0 });
        if sent.is_err() {
            self.finish();
        }
        sent
    }
}

/// In-process work queue. Create it, hand out [`QueueHandle`]s, then
/// [`start`](WorkQueue::start) it with the job handler.
pub struct WorkQueue {
    handle: QueueHandle,
    rx: mpsc::UnboundedReceiver<Envelope>,
    workers: usize,
}

impl WorkQueue {
    pub fn new(retry: RetryConfig, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            retry,
            outstanding: AtomicUsize::new(0),
            idle: Notify::new(),
            completed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            dead_letters: Mutex::new(Vec::new()),
        });
        Self {
            handle: QueueHandle { tx, shared },
            rx,
            workers: workers.max(1),
        }
    }

    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Spawns the delivery loop. At most `workers` jobs run at once.
    pub fn start<H: JobHandler>(self, handler: Arc<H>) -> JoinHandle<()> {
        let WorkQueue { handle, mut rx, workers } = self;
        log(
            Level::Info,
            Domain::Queue,
            "queue_started",
            obj(&[
                ("workers", v_u64(workers as u64)),
                ("max_attempts", v_u64(handle.shared.retry.max_attempts as u64)),
            ]),
        );
        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(workers));
            while let Some(envelope) = rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let handler = handler.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    let job = envelope.job.clone();
                    let outcome = tokio::task::spawn_blocking(move || handler.handle(&job))
                        .await
                        .map_err(|e| format!("worker panicked: {}", e));
                    drop(permit);
                    handle.settle(envelope, outcome);
                });
            }
        })
    }
}
