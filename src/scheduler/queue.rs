use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{RetentionPolicy, RetryPolicy};
use crate::error::QueueError;
use crate::scheduler::job::{Job, JobOutcome, JobState};
use crate::scheduler::journal::{FileJournal, Journal, JournalRecord, MemoryJournal};

/// What `nack` did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The job is queued again and becomes claimable after `delay`
    Retrying { next_attempt: u32, delay: Duration },
    /// No attempts left; the job is now `Failed`
    Exhausted { attempts: u32 },
}

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub abandoned: usize,
}

enum Claim {
    Job(Job),
    Closed,
    /// Nothing ready; the earliest delayed retry becomes ready at the deadline
    Idle(Option<Instant>),
}

struct QueueState {
    jobs: HashMap<Uuid, Job>,
    ready: VecDeque<Uuid>,
    delayed: Vec<(Instant, Uuid)>,
    journal: Box<dyn Journal>,
    closed: bool,
}

impl QueueState {
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(deadline, _)| *deadline);
        let due = self
            .delayed
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .count();
        for (_, job_id) in self.delayed.drain(..due) {
            self.ready.push_back(job_id);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.iter().map(|(deadline, _)| *deadline).min()
    }

    fn running_job(&mut self, job_id: &Uuid) -> Result<&mut Job, QueueError> {
        let job = self
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        if job.state != JobState::Running {
            return Err(QueueError::InvalidState {
                job_id: job_id.to_string(),
                state: job.state.to_string(),
                expected: "running",
            });
        }
        Ok(job)
    }
}

/// Durable FIFO of pending jobs.
///
/// All mutations go through one lock and are journaled before they are
/// applied, so a job is claimed by at most one worker and the in-memory view
/// never runs ahead of what the journal recorded.
pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    policy: RetryPolicy,
}

impl JobQueue {
    /// In-memory queue without durability.
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_journal(Box::new(MemoryJournal), policy)
    }

    pub fn with_journal(journal: Box<dyn Journal>, policy: RetryPolicy) -> Self {
        Self::from_parts(journal, HashMap::new(), VecDeque::new(), policy)
    }

    /// Open a file-backed queue, replaying whatever the journal holds.
    ///
    /// Jobs that were running when the previous process stopped are queued
    /// again; pending retry delays restart as immediately ready.
    pub fn open(path: &Path, policy: RetryPolicy) -> Result<Self, QueueError> {
        let (journal, records) = FileJournal::open(path)?;
        let (jobs, ready) = replay(records);

        tracing::info!(
            path = %path.display(),
            jobs = jobs.len(),
            ready = ready.len(),
            "Recovered job queue"
        );

        Ok(Self::from_parts(Box::new(journal), jobs, ready, policy))
    }

    fn from_parts(
        journal: Box<dyn Journal>,
        jobs: HashMap<Uuid, Job>,
        ready: VecDeque<Uuid>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs,
                ready,
                delayed: Vec::new(),
                journal,
                closed: false,
            }),
            notify: Notify::new(),
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Record a whole batch. Either every job becomes visible or none does.
    pub fn enqueue_bulk(&self, jobs: Vec<Job>) -> Result<(), QueueError> {
        self.enqueue_bulk_then(jobs, |_| {})
    }

    /// Like `enqueue_bulk`, calling `on_recorded` once the batch is durable
    /// and visible but before any worker can claim from it. `on_recorded`
    /// runs without the queue lock held.
    pub fn enqueue_bulk_then<F>(&self, jobs: Vec<Job>, on_recorded: F) -> Result<(), QueueError>
    where
        F: FnOnce(&[Job]),
    {
        if jobs.is_empty() {
            return Ok(());
        }

        let recorded = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Unavailable("queue is closed".to_string()));
            }
            if let Some(job) = jobs
                .iter()
                .find(|j| j.state != JobState::Queued || state.jobs.contains_key(&j.id))
            {
                return Err(QueueError::InvalidState {
                    job_id: job.id.to_string(),
                    state: job.state.to_string(),
                    expected: "new queued job",
                });
            }

            state.journal.append(&JournalRecord::Enqueued { jobs: jobs.clone() })?;

            tracing::info!(jobs = jobs.len(), "Batch enqueued");
            // Visible to readers now, claimable only once released below
            for job in &jobs {
                state.jobs.insert(job.id, job.clone());
            }
            jobs
        };

        on_recorded(&recorded);

        {
            let mut state = self.state.lock();
            // Jobs cancelled in between are skipped when claimed
            state.ready.extend(recorded.iter().map(|job| job.id));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Claim the next ready job without waiting.
    pub fn try_dequeue(&self) -> Result<Option<Job>, QueueError> {
        match self.claim_next()? {
            Claim::Job(job) => Ok(Some(job)),
            Claim::Closed | Claim::Idle(_) => Ok(None),
        }
    }

    /// Claim the next ready job, suspending until one is available.
    ///
    /// Returns `Ok(None)` once the queue has been closed.
    pub async fn dequeue(&self) -> Result<Option<Job>, QueueError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so an enqueue in between is not missed
            notified.as_mut().enable();

            match self.claim_next()? {
                Claim::Job(job) => return Ok(Some(job)),
                Claim::Closed => return Ok(None),
                Claim::Idle(Some(deadline)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                Claim::Idle(None) => notified.await,
            }
        }
    }

    fn claim_next(&self) -> Result<Claim, QueueError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Ok(Claim::Closed);
        }
        state.promote_due(Instant::now());

        while let Some(job_id) = state.ready.pop_front() {
            let attempt = match state.jobs.get(&job_id) {
                Some(job) if job.state == JobState::Queued => job.attempt,
                _ => continue,
            };

            if let Err(e) = state
                .journal
                .append(&JournalRecord::Claimed { job_id, attempt })
            {
                state.ready.push_front(job_id);
                return Err(e);
            }

            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.state = JobState::Running;
                tracing::debug!(job_id = %job_id, host_id = %job.host_id, attempt, "Job claimed");
                return Ok(Claim::Job(job.clone()));
            }
        }

        Ok(Claim::Idle(state.next_deadline()))
    }

    /// Settle a running job with a final outcome.
    pub fn ack(
        &self,
        job_id: &Uuid,
        outcome: JobOutcome,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> Result<Job, QueueError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.running_job(job_id)?;

        let at = Utc::now();
        state.journal.append(&JournalRecord::Finished {
            job_id: *job_id,
            state: outcome.into(),
            exit_code,
            error: error.clone(),
            at,
        })?;

        let job = state.running_job(job_id)?;
        job.state = outcome.into();
        job.exit_code = exit_code;
        if error.is_some() {
            job.last_error = error;
        }
        job.finished_at = Some(at);
        Ok(job.clone())
    }

    /// Report a transient failure of the current attempt.
    ///
    /// The job goes back in line with `attempt + 1` after the backoff delay,
    /// or becomes `Failed` if it already used its last attempt.
    pub fn nack(&self, job_id: &Uuid, error: Option<String>) -> Result<NackOutcome, QueueError> {
        let outcome = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let (attempt, last_attempt) = {
                let job = state.running_job(job_id)?;
                (job.attempt, job.is_last_attempt())
            };

            if last_attempt {
                let at = Utc::now();
                state.journal.append(&JournalRecord::Finished {
                    job_id: *job_id,
                    state: JobState::Failed,
                    exit_code: None,
                    error: error.clone(),
                    at,
                })?;
                let job = state.running_job(job_id)?;
                job.state = JobState::Failed;
                job.last_error = error;
                job.finished_at = Some(at);
                NackOutcome::Exhausted { attempts: attempt }
            } else {
                let next_attempt = attempt + 1;
                let delay = self.policy.delay_after(attempt);
                state.journal.append(&JournalRecord::Requeued {
                    job_id: *job_id,
                    attempt: next_attempt,
                    error: error.clone(),
                })?;
                let job = state.running_job(job_id)?;
                job.state = JobState::Queued;
                job.attempt = next_attempt;
                job.last_error = error;
                state.delayed.push((Instant::now() + delay, *job_id));
                NackOutcome::Retrying {
                    next_attempt,
                    delay,
                }
            }
        };

        if matches!(outcome, NackOutcome::Retrying { .. }) {
            // Sleeping workers recompute their wake-up deadline
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    /// Settle a running job in memory only, after the journal refused to
    /// record its outcome. The journal still shows the job running, so a
    /// restart redelivers it.
    pub fn finish_unrecorded(
        &self,
        job_id: &Uuid,
        outcome: JobOutcome,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> Option<Job> {
        let mut guard = self.state.lock();
        let job = guard.running_job(job_id).ok()?;
        job.state = outcome.into();
        job.exit_code = exit_code;
        if error.is_some() {
            job.last_error = error;
        }
        job.finished_at = Some(Utc::now());
        tracing::warn!(job_id = %job_id, state = %job.state, "Job settled without a journal record");
        Some(job.clone())
    }

    /// Abandon a job that has not started running.
    pub fn cancel(&self, job_id: &Uuid) -> Result<Job, QueueError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let current = state
            .jobs
            .get(job_id)
            .map(|job| job.state)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        if current != JobState::Queued {
            return Err(QueueError::InvalidState {
                job_id: job_id.to_string(),
                state: current.to_string(),
                expected: "queued",
            });
        }

        let at = Utc::now();
        state.journal.append(&JournalRecord::Finished {
            job_id: *job_id,
            state: JobState::Abandoned,
            exit_code: None,
            error: None,
            at,
        })?;

        state.ready.retain(|id| id != job_id);
        state.delayed.retain(|(_, id)| id != job_id);

        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        job.state = JobState::Abandoned;
        job.finished_at = Some(at);
        Ok(job.clone())
    }

    /// Drop finished jobs according to the retention policy. Returns the
    /// number of jobs removed.
    pub fn purge_finished(&self, policy: &RetentionPolicy) -> Result<usize, QueueError> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let expired = |job: &Job| {
            job.finished_at
                .and_then(|at| (now - at).to_std().ok())
                .map(|age| age >= policy.finished_ttl)
                .unwrap_or(false)
        };

        let mut purge: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| matches!(j.state, JobState::Succeeded | JobState::Abandoned))
            .filter(|j| expired(j))
            .map(|j| j.id)
            .collect();

        let mut failed: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Failed)
            .collect();
        failed.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        purge.extend(failed.iter().skip(policy.keep_failed).map(|j| j.id));

        if purge.is_empty() {
            return Ok(0);
        }

        state.journal.append(&JournalRecord::Purged {
            job_ids: purge.clone(),
        })?;
        for job_id in &purge {
            state.jobs.remove(job_id);
        }
        Ok(purge.len())
    }

    /// Stop handing out jobs. Blocked `dequeue` calls return `None`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn get(&self, job_id: &Uuid) -> Option<Job> {
        self.state.lock().jobs.get(job_id).cloned()
    }

    /// Snapshot of all retained jobs, oldest first.
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.state.lock().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = QueueStats::default();
        for job in state.jobs.values() {
            match job.state {
                JobState::Queued => stats.queued += 1,
                JobState::Running => stats.running += 1,
                JobState::Succeeded => stats.succeeded += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Abandoned => stats.abandoned += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().jobs.is_empty()
    }
}

/// Rebuild queue contents from journal records.
fn replay(records: Vec<JournalRecord>) -> (HashMap<Uuid, Job>, VecDeque<Uuid>) {
    let mut jobs: HashMap<Uuid, Job> = HashMap::new();
    let mut order: Vec<Uuid> = Vec::new();

    for record in records {
        match record {
            JournalRecord::Enqueued { jobs: batch } => {
                for job in batch {
                    order.push(job.id);
                    jobs.insert(job.id, job);
                }
            }
            JournalRecord::Claimed { job_id, attempt } => {
                if let Some(job) = jobs.get_mut(&job_id) {
                    job.state = JobState::Running;
                    job.attempt = attempt;
                }
            }
            JournalRecord::Requeued {
                job_id,
                attempt,
                error,
            } => {
                if let Some(job) = jobs.get_mut(&job_id) {
                    job.state = JobState::Queued;
                    job.attempt = attempt;
                    job.last_error = error;
                }
            }
            JournalRecord::Finished {
                job_id,
                state,
                exit_code,
                error,
                at,
            } => {
                if let Some(job) = jobs.get_mut(&job_id) {
                    job.state = state;
                    job.exit_code = exit_code;
                    if error.is_some() {
                        job.last_error = error;
                    }
                    job.finished_at = Some(at);
                }
            }
            JournalRecord::Purged { job_ids } => {
                for job_id in job_ids {
                    jobs.remove(&job_id);
                }
            }
        }
    }

    let mut ready = VecDeque::new();
    for job_id in order {
        let Some(job) = jobs.get_mut(&job_id) else {
            continue;
        };
        match job.state {
            JobState::Running => {
                tracing::warn!(
                    job_id = %job_id,
                    host_id = %job.host_id,
                    attempt = job.attempt,
                    "Redelivering job interrupted mid-run"
                );
                job.state = JobState::Queued;
                ready.push_back(job_id);
            }
            JobState::Queued => ready.push_back(job_id),
            _ => {}
        }
    }

    (jobs, ready)
}
