use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{NodeConfig, RetentionPolicy, TransportKind};
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::events::BroadcastHub;
use crate::hosts::{HostDirectory, StaticDirectory};
use crate::orchestrator::Orchestrator;
use crate::scheduler::JobQueue;
use crate::worker::{LocalTransport, PoolHandle, SessionTransport, SshTransport, WorkerPool};

/// Wires the queue, hub, worker pool and API together.
pub struct Node {
    pub config: NodeConfig,
    queue: Arc<JobQueue>,
    hub: BroadcastHub,
    orchestrator: Orchestrator,
    directory: Arc<dyn HostDirectory>,
    transport: Arc<dyn SessionTransport>,
}

impl Node {
    /// Build a node from configuration: load the host file, open the
    /// journal (replaying unfinished jobs) and pick the session transport.
    pub fn new(config: NodeConfig) -> Result<Self> {
        let queue = match &config.journal_path {
            Some(path) => JobQueue::open(path, config.retry)?,
            None => JobQueue::new(config.retry),
        };

        let directory = match &config.hosts_path {
            Some(path) => StaticDirectory::load(path)?,
            None => {
                tracing::warn!("No host file configured, every lookup will fail");
                StaticDirectory::new(Vec::new())
            }
        };
        tracing::info!(hosts = directory.len(), "Host directory loaded");

        let transport = build_transport(&config);

        Ok(Self::with_parts(
            config,
            Arc::new(queue),
            Arc::new(directory),
            transport,
        ))
    }

    /// Build a node from already constructed parts.
    pub fn with_parts(
        config: NodeConfig,
        queue: Arc<JobQueue>,
        directory: Arc<dyn HostDirectory>,
        transport: Arc<dyn SessionTransport>,
    ) -> Self {
        let hub = BroadcastHub::new(config.observer_buffer);
        let orchestrator = Orchestrator::new(Arc::clone(&queue), hub.clone());
        Self {
            config,
            queue,
            hub,
            orchestrator,
            directory,
            transport,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Start the worker pool.
    pub fn spawn_workers(&self) -> PoolHandle {
        WorkerPool::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.directory),
            Arc::clone(&self.transport),
            self.hub.clone(),
            self.config.pool,
        )
        .spawn()
    }

    /// Start the retention sweep. It stops when `shutdown` is cancelled.
    pub fn spawn_janitor(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let policy = self.config.retention;
        tokio::spawn(async move { janitor_loop(queue, policy, shutdown).await })
    }

    /// Run every subsystem until `shutdown` is cancelled:
    /// 1. Spawns the worker pool
    /// 2. Spawns the retention janitor
    /// 3. Serves the HTTP API and observer WebSocket (blocking)
    ///
    /// After the API stops, in-flight jobs get the pool's grace period and
    /// then observers are disconnected.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let pool = self.spawn_workers();
        let janitor = self.spawn_janitor(shutdown.clone());

        let state = DashboardState {
            orchestrator: self.orchestrator.clone(),
        };
        let served = run_dashboard(self.config.listen_addr, state, shutdown.clone()).await;

        // Make sure the janitor stops even if the server failed on its own
        shutdown.cancel();
        pool.shutdown().await;
        if let Err(e) = janitor.await {
            tracing::error!(error = %e, "Janitor task failed");
        }
        self.hub.close();

        served?;
        tracing::info!("Node stopped");
        Ok(())
    }
}

/// Session transport selected by `config.transport`.
pub fn build_transport(config: &NodeConfig) -> Arc<dyn SessionTransport> {
    match config.transport {
        TransportKind::Ssh => Arc::new(SshTransport::new(config.session.clone())),
        TransportKind::Local => Arc::new(LocalTransport::new(config.session.command_timeout)),
    }
}

async fn janitor_loop(queue: Arc<JobQueue>, policy: RetentionPolicy, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(policy.sweep_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => match queue.purge_finished(&policy) {
                Ok(0) => {}
                Ok(purged) => tracing::debug!(purged, "Purged finished jobs"),
                Err(e) => tracing::warn!(error = %e, "Failed to purge finished jobs"),
            }
        }
    }
}
