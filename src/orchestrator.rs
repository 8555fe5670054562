use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::events::{BroadcastHub, ExecutionEvent, HostStatus};
use crate::scheduler::{Job, JobQueue, QueueStats};

/// One operator action: run `command` on every host in `host_ids`.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub command: String,
    /// Unique host ids, in first-seen order
    pub host_ids: Vec<String>,
    pub requested_at: DateTime<Utc>,
}

impl ExecutionRequest {
    /// Validate and normalize a request. Duplicate host ids are dropped.
    pub fn new<I, S>(command: impl Into<String>, host_ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = command.into();
        if command.trim().is_empty() {
            return Err(FleetError::Validation("Command is required".to_string()));
        }

        let mut seen = HashSet::new();
        let mut unique = Vec::new();
        for host_id in host_ids {
            let host_id = host_id.into();
            if host_id.trim().is_empty() {
                return Err(FleetError::Validation(
                    "Host ids must not be blank".to_string(),
                ));
            }
            if seen.insert(host_id.clone()) {
                unique.push(host_id);
            }
        }

        if unique.is_empty() {
            return Err(FleetError::Validation(
                "At least one host id is required".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            command,
            host_ids: unique,
            requested_at: Utc::now(),
        })
    }
}

/// What the caller gets back from `execute`. Progress is only observable
/// through the broadcast hub.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReceipt {
    pub request_id: Uuid,
    pub job_count: usize,
    pub job_ids: Vec<Uuid>,
}

/// Boundary operation of the system: turns a request into queued jobs.
#[derive(Clone)]
pub struct Orchestrator {
    queue: Arc<JobQueue>,
    hub: BroadcastHub,
}

impl Orchestrator {
    pub fn new(queue: Arc<JobQueue>, hub: BroadcastHub) -> Self {
        Self { queue, hub }
    }

    /// Queue one job per unique host and return immediately.
    ///
    /// Validation failures never touch the queue. A queue failure means
    /// nothing from this request was queued.
    pub fn execute<I, S>(
        &self,
        command: impl Into<String>,
        host_ids: I,
    ) -> Result<ExecutionReceipt>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let request = ExecutionRequest::new(command, host_ids)?;
        self.submit(request)
    }

    pub fn submit(&self, request: ExecutionRequest) -> Result<ExecutionReceipt> {
        let max_attempts = self.queue.policy().max_attempts;
        let jobs: Vec<Job> = request
            .host_ids
            .iter()
            .map(|host_id| {
                Job::new(
                    request.id,
                    host_id.clone(),
                    request.command.clone(),
                    max_attempts,
                )
            })
            .collect();

        let job_ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();

        // `pending` goes out before a worker can publish `running`
        let hub = &self.hub;
        let queued = self.queue.enqueue_bulk_then(jobs, |recorded| {
            for job in recorded {
                hub.publish(ExecutionEvent::status(
                    job.id,
                    job.host_id.as_str(),
                    HostStatus::Pending,
                ));
            }
        });
        if let Err(e) = queued {
            tracing::error!(
                request_id = %request.id,
                error = %e,
                "Failed to queue execution request"
            );
            return Err(e.into());
        }

        tracing::info!(
            request_id = %request.id,
            jobs = job_ids.len(),
            command = %request.command,
            "Execution started"
        );

        Ok(ExecutionReceipt {
            request_id: request.id,
            job_count: job_ids.len(),
            job_ids,
        })
    }

    /// Abandon a job that has not started yet. Observers get its terminal
    /// `error` status.
    pub fn cancel(&self, job_id: &Uuid) -> Result<Job> {
        let job = self.queue.cancel(job_id)?;
        tracing::info!(job_id = %job.id, host_id = %job.host_id, "Job abandoned");
        self.hub
            .publish(ExecutionEvent::status(job.id, job.host_id.as_str(), HostStatus::Error));
        Ok(job)
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.queue.jobs()
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_dedups_in_first_seen_order() {
        let request = ExecutionRequest::new("uptime", ["b", "a", "b", "c", "a"]).unwrap();
        assert_eq!(request.host_ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn request_rejects_blank_command() {
        let err = ExecutionRequest::new("   ", ["h1"]).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[test]
    fn request_rejects_blank_host_id() {
        let err = ExecutionRequest::new("uptime", ["h1", " "]).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[test]
    fn request_rejects_empty_host_set() {
        let err = ExecutionRequest::new("uptime", Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }
}
