use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;

use crate::config::PoolConfig;
use crate::error::LookupError;
use crate::events::{BroadcastHub, ExecutionEvent, HostStatus, OutputStream};
use crate::hosts::HostDirectory;
use crate::scheduler::{Job, JobOutcome, JobQueue, NackOutcome};
use crate::worker::executor::{ExitOutcome, SessionTransport};

/// Pause after a queue failure before trying to claim again.
const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Fixed set of workers draining the job queue.
///
/// Each worker handles one job at a time: claim, resolve credentials, run the
/// session, then ack or nack. Parallelism comes only from the number of
/// workers, so a large request is throttled by the pool size.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    directory: Arc<dyn HostDirectory>,
    transport: Arc<dyn SessionTransport>,
    hub: BroadcastHub,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        directory: Arc<dyn HostDirectory>,
        transport: Arc<dyn SessionTransport>,
        hub: BroadcastHub,
        config: PoolConfig,
    ) -> Self {
        Self {
            queue,
            directory,
            transport,
            hub,
            config,
        }
    }

    /// Start the workers on the current runtime.
    pub fn spawn(self) -> PoolHandle {
        let workers = self.config.workers.max(1);
        let grace = self.config.shutdown_grace;
        let queue = Arc::clone(&self.queue);
        let pool = Arc::new(self);

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let pool = Arc::clone(&pool);
            set.spawn(async move { pool.run_worker(worker_id).await });
        }

        tracing::info!(workers, "Worker pool started");
        PoolHandle {
            workers: set,
            queue,
            grace,
        }
    }

    async fn run_worker(&self, worker_id: usize) {
        loop {
            match self.queue.dequeue().await {
                Ok(Some(job)) => self.process(worker_id, job).await,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Failed to claim job");
                    tokio::time::sleep(QUEUE_ERROR_BACKOFF).await;
                }
            }
        }
        tracing::debug!(worker_id, "Worker stopped");
    }

    /// Run one attempt of a claimed job.
    async fn process(&self, worker_id: usize, job: Job) {
        tracing::info!(
            worker_id,
            job_id = %job.id,
            host_id = %job.host_id,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            "Dispatching job"
        );

        // Retries are internal: observers see `running` once per job
        if job.attempt == 1 {
            self.publish_status(&job, HostStatus::Running);
        }

        let host = match self.directory.resolve(&job.host_id).await {
            Ok(host) => host,
            Err(e @ LookupError::NotFound(_)) => {
                // Retrying cannot make an unknown host appear
                self.settle(&job, JobOutcome::Failed, None, Some(e.to_string()));
                return;
            }
            Err(e @ LookupError::Unavailable(_)) => {
                self.retry(&job, e.to_string());
                return;
            }
        };

        let hub = self.hub.clone();
        let job_id = job.id;
        let host_id = job.host_id.clone();
        let on_output = move |stream: OutputStream, data: String| {
            hub.publish(ExecutionEvent::output(job_id, host_id.as_str(), stream, data));
        };

        let outcome = self.transport.run(&host, &job.command, &on_output).await;

        match outcome {
            ExitOutcome {
                error: Some(e), ..
            } => self.retry(&job, e.to_string()),
            ExitOutcome {
                exit_code: Some(0),
                ..
            } => self.settle(&job, JobOutcome::Succeeded, Some(0), None),
            ExitOutcome {
                exit_code: Some(code),
                ..
            } => {
                // The command ran; running it again could repeat its side effects
                self.settle(
                    &job,
                    JobOutcome::Failed,
                    Some(code),
                    Some(format!("command exited with status {}", code)),
                )
            }
            ExitOutcome {
                exit_code: None,
                error: None,
            } => self.retry(&job, "session ended without an exit status".to_string()),
        }
    }

    /// Record a definitive outcome and emit the job's terminal status.
    fn settle(&self, job: &Job, outcome: JobOutcome, exit_code: Option<i32>, error: Option<String>) {
        match outcome {
            JobOutcome::Succeeded => {
                tracing::info!(job_id = %job.id, host_id = %job.host_id, "Job succeeded")
            }
            JobOutcome::Failed => tracing::warn!(
                job_id = %job.id,
                host_id = %job.host_id,
                exit_code = ?exit_code,
                error = error.as_deref().unwrap_or_default(),
                "Job failed"
            ),
        }

        if let Err(e) = self.queue.ack(&job.id, outcome, exit_code, error.clone()) {
            tracing::error!(job_id = %job.id, error = %e, "Failed to record job outcome");
            self.queue.finish_unrecorded(&job.id, outcome, exit_code, error);
        }

        let status = match outcome {
            JobOutcome::Succeeded => HostStatus::Success,
            JobOutcome::Failed => HostStatus::Error,
        };
        self.publish_status(job, status);
    }

    /// Hand a transient failure back to the queue's retry policy.
    fn retry(&self, job: &Job, reason: String) {
        match self.queue.nack(&job.id, Some(reason.clone())) {
            Ok(NackOutcome::Retrying {
                next_attempt,
                delay,
            }) => {
                tracing::warn!(
                    job_id = %job.id,
                    host_id = %job.host_id,
                    attempt = job.attempt,
                    next_attempt,
                    delay = ?delay,
                    error = %reason,
                    "Attempt failed, retrying"
                );
            }
            Ok(NackOutcome::Exhausted { attempts }) => {
                tracing::warn!(
                    job_id = %job.id,
                    host_id = %job.host_id,
                    attempts,
                    error = %reason,
                    "Job failed, attempts exhausted"
                );
                self.publish_status(job, HostStatus::Error);
            }
            Err(e) => {
                // Without a durable retry the job ends here rather than stay running
                tracing::error!(job_id = %job.id, error = %e, "Failed to requeue job");
                self.queue.finish_unrecorded(
                    &job.id,
                    JobOutcome::Failed,
                    None,
                    Some(format!("{}; retry not recorded: {}", reason, e)),
                );
                self.publish_status(job, HostStatus::Error);
            }
        }
    }

    fn publish_status(&self, job: &Job, status: HostStatus) {
        self.hub
            .publish(ExecutionEvent::status(job.id, job.host_id.as_str(), status));
    }
}

/// Running workers. Dropping the handle aborts them; `shutdown` lets
/// in-flight sessions finish first.
pub struct PoolHandle {
    workers: JoinSet<()>,
    queue: Arc<JobQueue>,
    grace: Duration,
}

impl PoolHandle {
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Stop claiming jobs, let in-flight sessions finish within the grace
    /// period, then abort whatever is left. Aborting a worker kills its
    /// session process.
    pub async fn shutdown(mut self) {
        self.queue.close();
        let in_flight = self.workers.len();
        tracing::info!(workers = in_flight, grace = ?self.grace, "Draining worker pool");

        let drained = tokio::time::timeout(self.grace, async {
            while let Some(result) = self.workers.join_next().await {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Worker task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = self.workers.len(),
                "Grace period elapsed, force-closing sessions"
            );
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }

        tracing::info!("Worker pool stopped");
    }
}
