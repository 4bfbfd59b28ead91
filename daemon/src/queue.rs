//! Bounded job queue and worker pool.
//!
//! Submissions land in a fixed-capacity buffer and are rejected immediately
//! when it is full. A fixed number of workers pull jobs in FIFO order, run
//! each against the sandbox runner under a hard deadline, and deliver
//! exactly one [`JobResult`] through the job's one-shot channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::backend::ContainerRuntime;
use crate::config::QueueConfig;
use crate::deadline::{CancelSignal, Deadline, DeadlineCause};
use crate::error::{RunError, SubmitError};
use crate::report::ReportingConfig;
use crate::runner::{ExecutionResult, SandboxRunner};

/// Parsed queue settings with a `Duration` deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Buffer slots for pending jobs.
    pub capacity: usize,

    /// Concurrent sandbox units.
    pub workers: usize,

    /// Upper bound on a single run, independent of the caller.
    pub job_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 100,
            workers: 10,
            job_timeout: Duration::from_secs(12),
        }
    }
}

impl QueueSettings {
    /// Create from the file configuration values.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            workers: config.workers.max(1),
            job_timeout: Duration::from_secs(config.job_timeout_seconds),
        }
    }
}

/// Terminal outcome of a job.
///
/// `error` carries infrastructure failures and timeouts; a program that
/// exited non-zero has no error.
#[derive(Debug)]
pub struct JobResult {
    pub result: ExecutionResult,
    pub error: Option<RunError>,
}

impl JobResult {
    pub fn from_run(outcome: Result<ExecutionResult, RunError>) -> Self {
        match outcome {
            Ok(result) => Self {
                result,
                error: None,
            },
            Err(err) => {
                let result = match &err {
                    RunError::DeadlineExceeded { elapsed, .. } => {
                        ExecutionResult::timed_out(*elapsed)
                    }
                    _ => ExecutionResult::default(),
                };
                Self {
                    result,
                    error: Some(err),
                }
            }
        }
    }
}

/// Receiving half of a job's one-shot result channel.
pub type ResultReceiver = oneshot::Receiver<JobResult>;

struct Job {
    id: u64,
    code: String,
    language: String,
    cancel: CancelSignal,
    reply: oneshot::Sender<JobResult>,
}

/// Shared pieces every worker needs.
struct WorkerContext<R> {
    receiver: Mutex<mpsc::Receiver<Job>>,
    runner: Arc<SandboxRunner<R>>,
    reporting: ReportingConfig,
    job_timeout: Duration,
}

/// The execution service: bounded buffer, fixed worker pool, sandbox runner.
pub struct JobQueue<R> {
    sender: mpsc::Sender<Job>,
    context: Arc<WorkerContext<R>>,
    settings: QueueSettings,
    next_id: AtomicU64,
    started: AtomicBool,
}

impl<R: ContainerRuntime> JobQueue<R> {
    pub fn new(runner: SandboxRunner<R>, settings: QueueSettings, reporting: ReportingConfig) -> Self {
        let (sender, receiver) = mpsc::channel(settings.capacity.max(1));
        let context = Arc::new(WorkerContext {
            receiver: Mutex::new(receiver),
            runner: Arc::new(runner),
            reporting,
            job_timeout: settings.job_timeout,
        });
        Self {
            sender,
            context,
            settings,
            next_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
        }
    }

    pub const fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Jobs buffered and not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Enqueue a job without blocking.
    ///
    /// `cancel` is the submitter's own cancellation; the queue intersects it
    /// with its fixed job timeout. A full buffer is an immediate rejection.
    pub fn submit(
        &self,
        cancel: CancelSignal,
        code: impl Into<String>,
        language: impl Into<String>,
    ) -> Result<ResultReceiver, SubmitError> {
        let (reply, receiver) = oneshot::channel();
        let job = Job {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            code: code.into(),
            language: language.into(),
            cancel,
            reply,
        };
        let id = job.id;

        match self.sender.try_send(job) {
            Ok(()) => {
                debug!(job_id = id, "Job queued");
                Ok(receiver)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(job_id = id, capacity = self.settings.capacity, "Queue full, rejecting job");
                Err(SubmitError::QueueFull {
                    capacity: self.settings.capacity,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    /// Spawn the worker pool. Calling it again spawns nothing.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Job queue already started");
            return Vec::new();
        }

        info!(
            workers = self.settings.workers,
            capacity = self.settings.capacity,
            job_timeout = ?self.settings.job_timeout,
            "Starting job queue"
        );
        (0..self.settings.workers)
            .map(|worker| tokio::spawn(worker_loop(worker, Arc::clone(&self.context))))
            .collect()
    }
}

async fn worker_loop<R: ContainerRuntime>(worker: usize, context: Arc<WorkerContext<R>>) {
    loop {
        // Holding the lock while waiting keeps dispatch in buffer order.
        let next = context.receiver.lock().await.recv().await;
        let Some(job) = next else {
            debug!(worker, "Queue closed, worker exiting");
            return;
        };

        let job_id = job.id;
        let reply = job.reply;
        let result = run_job(
            &context,
            job_id,
            job.code,
            job.language,
            job.cancel,
        )
        .await;

        context.reporting.log(job_id, &result);
        if reply.send(result).is_err() {
            debug!(worker, job_id, "Submitter went away before the result arrived");
        }
    }
}

/// Run one job in its own task so a panic cannot take the worker down.
#[instrument(skip(context, code, language, cancel))]
async fn run_job<R: ContainerRuntime>(
    context: &WorkerContext<R>,
    job_id: u64,
    code: String,
    language: String,
    cancel: CancelSignal,
) -> JobResult {
    if cancel.is_cancelled() {
        debug!("Submitter cancelled before dispatch");
        return JobResult::from_run(Err(RunError::DeadlineExceeded {
            cause: DeadlineCause::CallerCancelled,
            elapsed: Duration::ZERO,
        }));
    }

    let deadline = Deadline::new(cancel, context.job_timeout);
    let runner = Arc::clone(&context.runner);
    let handle = tokio::spawn(async move { runner.run(&code, &language, deadline).await });

    match handle.await {
        Ok(outcome) => JobResult::from_run(outcome),
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic().as_ref());
            JobResult::from_run(Err(RunError::WorkerPanic(message)))
        }
        Err(e) => JobResult::from_run(Err(RunError::WorkerPanic(e.to_string()))),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
