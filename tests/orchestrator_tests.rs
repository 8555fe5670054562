
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use fleetrun::error::{FleetError, LookupError, QueueError, SessionError};
use fleetrun::events::{HostStatus, OutputStream};
use fleetrun::hosts::{HostCredentials, HostDirectory};
use fleetrun::node::Node;
use fleetrun::scheduler::{JobQueue, JobState, Journal, JournalRecord};
use fleetrun::worker::SessionTransport;
use test_harness::{
    collect_until_terminal, output_for, statuses_for, test_directory, test_node_config,
    ScriptedTransport, Step, TestFleet,
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_uptime_across_three_hosts_with_one_unreachable() {
    let transport = ScriptedTransport::new();
    transport.always("vm-a", Step::ok(" 10:00:00 up 3 days\n"));
    transport.always("vm-b", Step::unreachable());
    transport.always("vm-c", Step::ok(" 10:00:00 up 9 days\n"));
    let fleet = TestFleet::start(&["vm-a", "vm-b", "vm-c"], transport, 2);

    let mut events = fleet.node.hub().subscribe();
    let receipt = fleet
        .node
        .orchestrator()
        .execute("uptime", ["vm-a", "vm-b", "vm-c"])
        .unwrap();
    assert_eq!(receipt.job_count, 3);

    let events = collect_until_terminal(&mut events, &receipt.job_ids, WAIT).await;

    use HostStatus::*;
    assert_eq!(statuses_for(&events, "vm-a"), vec![Pending, Running, Success]);
    assert_eq!(statuses_for(&events, "vm-b"), vec![Pending, Running, Error]);
    assert_eq!(statuses_for(&events, "vm-c"), vec![Pending, Running, Success]);

    assert_eq!(
        output_for(&events, "vm-a", OutputStream::Stdout),
        " 10:00:00 up 3 days\n"
    );
    assert_eq!(output_for(&events, "vm-b", OutputStream::Stdout), "");

    // The unreachable host used every attempt, the others exactly one
    assert_eq!(fleet.transport.calls("vm-a"), 1);
    assert_eq!(fleet.transport.calls("vm-b"), 3);
    assert_eq!(fleet.transport.calls("vm-c"), 1);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_output_arrives_between_running_and_terminal_status() {
    let transport = ScriptedTransport::new();
    transport.always(
        "h1",
        Step::Exit {
            code: 0,
            stdout: "line one\n".to_string(),
            stderr: "warning\n".to_string(),
        },
    );
    let fleet = TestFleet::start(&["h1"], transport, 1);

    let mut sub = fleet.node.hub().subscribe();
    let receipt = fleet.node.orchestrator().execute("deploy", ["h1"]).unwrap();
    let events = collect_until_terminal(&mut sub, &receipt.job_ids, WAIT).await;

    let running = events
        .iter()
        .position(|e| e.host_status() == Some(HostStatus::Running))
        .unwrap();
    let success = events
        .iter()
        .position(|e| e.host_status() == Some(HostStatus::Success))
        .unwrap();
    let outputs: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.output_chunk().is_some())
        .map(|(i, _)| i)
        .collect();

    assert_eq!(outputs.len(), 2);
    assert!(outputs.iter().all(|&i| running < i && i < success));
    assert_eq!(output_for(&events, "h1", OutputStream::Stderr), "warning\n");

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_hosts_create_one_job_each() {
    let fleet = TestFleet::start(&["h1", "h2"], ScriptedTransport::new(), 2);

    let mut sub = fleet.node.hub().subscribe();
    let receipt = fleet
        .node
        .orchestrator()
        .execute("hostname", ["h1", "h2", "h1", "h1"])
        .unwrap();
    assert_eq!(receipt.job_count, 2);

    let events = collect_until_terminal(&mut sub, &receipt.job_ids, WAIT).await;
    let terminal: Vec<_> = events.iter().filter(|e| e.terminal_status().is_some()).collect();
    assert_eq!(terminal.len(), 2);
    assert_eq!(fleet.transport.calls("h1"), 1);
    assert_eq!(fleet.transport.calls("h2"), 1);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_transport_failure_retried_exactly_max_attempts() {
    let transport = ScriptedTransport::new();
    transport.always(
        "h1",
        Step::Fail(SessionError::Timeout(Duration::from_millis(5))),
    );
    let fleet = TestFleet::start(&["h1"], transport, 1);

    let mut sub = fleet.node.hub().subscribe();
    let receipt = fleet.node.orchestrator().execute("uptime", ["h1"]).unwrap();
    let events = collect_until_terminal(&mut sub, &receipt.job_ids, WAIT).await;

    assert_eq!(
        statuses_for(&events, "h1"),
        vec![HostStatus::Pending, HostStatus::Running, HostStatus::Error]
    );
    assert_eq!(fleet.transport.calls("h1"), 3);

    let job = fleet.node.queue().get(&receipt.job_ids[0]).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempt, 3);
    assert!(job.last_error.unwrap().contains("timed out"));

    // No further attempts after the terminal event
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fleet.transport.calls("h1"), 3);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_nonzero_exit_is_not_retried() {
    let transport = ScriptedTransport::new();
    transport.always("h1", Step::exit(1, "no such file\n"));
    let fleet = TestFleet::start(&["h1"], transport, 1);

    let mut sub = fleet.node.hub().subscribe();
    let receipt = fleet.node.orchestrator().execute("cat /nope", ["h1"]).unwrap();
    let events = collect_until_terminal(&mut sub, &receipt.job_ids, WAIT).await;

    assert_eq!(
        statuses_for(&events, "h1"),
        vec![HostStatus::Pending, HostStatus::Running, HostStatus::Error]
    );
    assert_eq!(output_for(&events, "h1", OutputStream::Stderr), "no such file\n");
    assert_eq!(fleet.transport.calls("h1"), 1);

    let job = fleet.node.queue().get(&receipt.job_ids[0]).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.exit_code, Some(1));
    assert_eq!(job.attempt, 1);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let transport = ScriptedTransport::new();
    transport.script("h1", vec![Step::unreachable(), Step::ok("recovered\n")]);
    let fleet = TestFleet::start(&["h1"], transport, 1);

    let mut sub = fleet.node.hub().subscribe();
    let receipt = fleet.node.orchestrator().execute("uptime", ["h1"]).unwrap();
    let events = collect_until_terminal(&mut sub, &receipt.job_ids, WAIT).await;

    // Retries stay internal: one running, one terminal
    assert_eq!(
        statuses_for(&events, "h1"),
        vec![HostStatus::Pending, HostStatus::Running, HostStatus::Success]
    );
    assert_eq!(output_for(&events, "h1", OutputStream::Stdout), "recovered\n");
    assert_eq!(fleet.transport.calls("h1"), 2);

    let job = fleet.node.queue().get(&receipt.job_ids[0]).unwrap();
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempt, 2);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_last_allowed_attempt_succeeds() {
    let transport = ScriptedTransport::new();
    transport.always("h1", Step::ok("h1 up\n"));
    transport.script(
        "h2",
        vec![
            Step::unreachable(),
            Step::unreachable(),
            Step::ok("h2 up\n"),
        ],
    );
    let fleet = TestFleet::start(&["h1", "h2"], transport, 2);

    let mut sub = fleet.node.hub().subscribe();
    let receipt = fleet
        .node
        .orchestrator()
        .execute("uptime", ["h1", "h2"])
        .unwrap();
    let events = collect_until_terminal(&mut sub, &receipt.job_ids, WAIT).await;

    use HostStatus::*;
    assert_eq!(statuses_for(&events, "h1"), vec![Pending, Running, Success]);
    assert_eq!(statuses_for(&events, "h2"), vec![Pending, Running, Success]);
    assert_eq!(output_for(&events, "h2", OutputStream::Stdout), "h2 up\n");
    assert_eq!(fleet.transport.calls("h1"), 1);
    assert_eq!(fleet.transport.calls("h2"), 3);

    let h2 = fleet
        .node
        .queue()
        .jobs()
        .into_iter()
        .find(|job| job.host_id == "h2")
        .unwrap();
    assert_eq!(h2.state, JobState::Succeeded);
    assert_eq!(h2.attempt, 3);
    assert_eq!(h2.max_attempts, 3);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_unknown_host_fails_without_session() {
    let fleet = TestFleet::start(&["h1"], ScriptedTransport::new(), 1);

    let mut sub = fleet.node.hub().subscribe();
    let receipt = fleet
        .node
        .orchestrator()
        .execute("uptime", ["h1", "ghost"])
        .unwrap();
    let events = collect_until_terminal(&mut sub, &receipt.job_ids, WAIT).await;

    assert_eq!(
        statuses_for(&events, "ghost"),
        vec![HostStatus::Pending, HostStatus::Running, HostStatus::Error]
    );
    assert_eq!(
        statuses_for(&events, "h1"),
        vec![HostStatus::Pending, HostStatus::Running, HostStatus::Success]
    );
    assert_eq!(fleet.transport.calls("ghost"), 0);

    let ghost = fleet
        .node
        .queue()
        .jobs()
        .into_iter()
        .find(|j| j.host_id == "ghost")
        .unwrap();
    assert_eq!(ghost.state, JobState::Failed);
    assert_eq!(ghost.attempt, 1);

    fleet.shutdown().await;
}

/// Directory whose lookups fail transiently a fixed number of times.
struct FlakyDirectory {
    failures_left: AtomicU32,
    inner: fleetrun::hosts::StaticDirectory,
}

#[async_trait]
impl HostDirectory for FlakyDirectory {
    async fn resolve(&self, host_id: &str) -> Result<HostCredentials, LookupError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(LookupError::Unavailable("directory offline".to_string()));
        }
        self.inner.resolve(host_id).await
    }
}

#[tokio::test]
async fn test_directory_outage_is_retried() {
    let config = test_node_config(1);
    let queue = Arc::new(JobQueue::new(config.retry));
    let transport = Arc::new(ScriptedTransport::new());
    let directory = FlakyDirectory {
        failures_left: AtomicU32::new(2),
        inner: test_directory(&["h1"]),
    };
    let node = Node::with_parts(
        config,
        queue,
        Arc::new(directory),
        Arc::clone(&transport) as Arc<dyn SessionTransport>,
    );
    let pool = node.spawn_workers();

    let mut sub = node.hub().subscribe();
    let receipt = node.orchestrator().execute("uptime", ["h1"]).unwrap();
    let events = collect_until_terminal(&mut sub, &receipt.job_ids, WAIT).await;

    assert_eq!(
        statuses_for(&events, "h1"),
        vec![HostStatus::Pending, HostStatus::Running, HostStatus::Success]
    );
    assert_eq!(transport.calls("h1"), 1);
    assert_eq!(node.queue().get(&receipt.job_ids[0]).unwrap().attempt, 3);

    pool.shutdown().await;
}

/// Journal that cannot record retries.
struct NoRetryJournal;

impl Journal for NoRetryJournal {
    fn append(&mut self, record: &JournalRecord) -> Result<(), QueueError> {
        match record {
            JournalRecord::Requeued { .. } => {
                Err(QueueError::Unavailable("disk full".to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[tokio::test]
async fn test_unrecorded_retry_still_ends_the_job() {
    let config = test_node_config(1);
    let queue = Arc::new(JobQueue::with_journal(Box::new(NoRetryJournal), config.retry));
    let transport = Arc::new(ScriptedTransport::new());
    transport.always("h1", Step::unreachable());
    let node = Node::with_parts(
        config,
        queue,
        Arc::new(test_directory(&["h1"])),
        Arc::clone(&transport) as Arc<dyn SessionTransport>,
    );
    let pool = node.spawn_workers();

    let mut sub = node.hub().subscribe();
    let receipt = node.orchestrator().execute("uptime", ["h1"]).unwrap();
    let events = collect_until_terminal(&mut sub, &receipt.job_ids, WAIT).await;

    assert_eq!(
        statuses_for(&events, "h1"),
        vec![HostStatus::Pending, HostStatus::Running, HostStatus::Error]
    );
    assert_eq!(transport.calls("h1"), 1);

    let job = node.queue().get(&receipt.job_ids[0]).unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.finished_at.is_some());
    assert!(job.last_error.unwrap().contains("retry not recorded"));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_failing_host_does_not_affect_others() {
    let hosts = ["h1", "h2", "h3", "h4", "h5"];
    let transport = ScriptedTransport::new();
    transport.always("h3", Step::unreachable());
    let fleet = TestFleet::start(&hosts, transport, 3);

    let mut sub = fleet.node.hub().subscribe();
    let receipt = fleet.node.orchestrator().execute("uptime", hosts).unwrap();
    let events = collect_until_terminal(&mut sub, &receipt.job_ids, WAIT).await;

    for host in hosts {
        let expected = if host == "h3" {
            HostStatus::Error
        } else {
            HostStatus::Success
        };
        assert_eq!(statuses_for(&events, host).last(), Some(&expected), "{}", host);
        assert_eq!(
            statuses_for(&events, host)
                .iter()
                .filter(|s| s.is_terminal())
                .count(),
            1
        );
    }

    let stats = fleet.node.orchestrator().stats();
    assert_eq!(stats.succeeded, 4);
    assert_eq!(stats.failed, 1);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_pool_size_bounds_concurrency() {
    let hosts: Vec<String> = (0..12).map(|i| format!("h{}", i)).collect();
    let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();
    let transport = ScriptedTransport::new().with_delay(Duration::from_millis(30));
    let fleet = TestFleet::start(&host_refs, transport, 3);

    let mut sub = fleet.node.hub().subscribe();
    let receipt = fleet
        .node
        .orchestrator()
        .execute("sleep 1", hosts.clone())
        .unwrap();
    assert_eq!(receipt.job_count, 12);

    collect_until_terminal(&mut sub, &receipt.job_ids, WAIT).await;

    assert_eq!(fleet.transport.total_calls(), 12);
    assert!(fleet.transport.max_concurrency() <= 3);
    assert!(fleet.transport.max_concurrency() >= 2);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_events_per_job_arrive_in_order() {
    let hosts = ["h1", "h2", "h3", "h4"];
    let transport = ScriptedTransport::new();
    for host in hosts {
        transport.always(host, Step::ok(&format!("{}\n", host)));
    }
    let fleet = TestFleet::start(&hosts, transport, 4);

    let mut sub = fleet.node.hub().subscribe();
    let receipt = fleet.node.orchestrator().execute("hostname", hosts).unwrap();
    let events = collect_until_terminal(&mut sub, &receipt.job_ids, WAIT).await;

    // pending -> running -> output* -> terminal for every job
    let mut phase: HashMap<Uuid, u8> = HashMap::new();
    for event in &events {
        let current = phase.entry(event.job_id).or_insert(0);
        let next = match (event.host_status(), event.output_chunk()) {
            (Some(HostStatus::Pending), _) => 1,
            (Some(HostStatus::Running), _) => 2,
            (None, Some(_)) => 3,
            (Some(_), _) => 4,
            (None, None) => unreachable!(),
        };
        assert!(next >= *current, "out of order event for {}", event.host_id);
        if next != 3 {
            assert!(next > *current, "repeated status for {}", event.host_id);
        }
        *current = next;
    }
    assert!(phase.values().all(|&p| p == 4));

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_empty_command_rejected_without_side_effects() {
    let fleet = TestFleet::start(&["h1"], ScriptedTransport::new(), 1);
    let mut sub = fleet.node.hub().subscribe();

    let err = fleet.node.orchestrator().execute("", ["h1"]).unwrap_err();
    assert!(matches!(err, FleetError::Validation(_)));

    let err = fleet
        .node
        .orchestrator()
        .execute("uptime", Vec::<String>::new())
        .unwrap_err();
    assert!(matches!(err, FleetError::Validation(_)));

    assert!(fleet.node.queue().is_empty());
    assert!(sub.try_recv().is_none());

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_closed_queue_rejects_request() {
    let fleet = TestFleet::idle(&["h1"], ScriptedTransport::new(), 1);
    let mut sub = fleet.node.hub().subscribe();
    fleet.node.queue().close();

    let err = fleet.node.orchestrator().execute("uptime", ["h1"]).unwrap_err();
    assert!(matches!(err, FleetError::Queue(QueueError::Unavailable(_))));
    assert!(fleet.node.queue().is_empty());
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let fleet = TestFleet::idle(&["h1", "h2"], ScriptedTransport::new(), 1);
    let mut sub = fleet.node.hub().subscribe();

    let receipt = fleet
        .node
        .orchestrator()
        .execute("uptime", ["h1", "h2"])
        .unwrap();
    let cancelled = fleet.node.orchestrator().cancel(&receipt.job_ids[0]).unwrap();
    assert_eq!(cancelled.state, JobState::Abandoned);

    // Two pending events, then the cancelled job's terminal error
    let mut statuses = Vec::new();
    while let Some(event) = sub.try_recv() {
        statuses.push((event.host_id.clone(), event.host_status().unwrap()));
    }
    assert_eq!(
        statuses,
        vec![
            ("h1".to_string(), HostStatus::Pending),
            ("h2".to_string(), HostStatus::Pending),
            ("h1".to_string(), HostStatus::Error),
        ]
    );

    // Only the remaining job runs once workers start
    let fleet = fleet.with_workers();
    collect_until_terminal(&mut sub, &receipt.job_ids[1..], WAIT).await;
    assert_eq!(fleet.transport.calls("h1"), 0);
    assert_eq!(fleet.transport.calls("h2"), 1);

    // A finished job cannot be cancelled
    let err = fleet
        .node
        .orchestrator()
        .cancel(&receipt.job_ids[1])
        .unwrap_err();
    assert!(matches!(err, FleetError::Queue(QueueError::InvalidState { .. })));

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_slow_observer_does_not_stall_execution() {
    let hosts: Vec<String> = (0..20).map(|i| format!("h{}", i)).collect();
    let host_refs: Vec<&str> = hosts.iter().map(String::as_str).collect();

    let mut config = test_node_config(4);
    config.observer_buffer = 4;
    let queue = Arc::new(JobQueue::new(config.retry));
    let transport = Arc::new(ScriptedTransport::new());
    let node = Node::with_parts(
        config,
        queue,
        Arc::new(test_directory(&host_refs)),
        Arc::clone(&transport) as Arc<dyn SessionTransport>,
    );
    let pool = node.spawn_workers();

    // Never read; its buffer fills up and it starts missing events
    let _stalled = node.hub().subscribe();

    let receipt = node.orchestrator().execute("uptime", hosts).unwrap();

    test_harness::assert_eventually(
        || async { node.orchestrator().stats().succeeded == receipt.job_count },
        WAIT,
        "jobs should finish while an observer is stalled",
    )
    .await;
    assert!(node.hub().dropped_events() > 0);
    assert_eq!(node.hub().observer_count(), 1);

    pool.shutdown().await;
}
