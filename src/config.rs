use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Retry policy applied to transient per-job failures.
///
/// Only transport-level failures are retried. A command that ran and exited
/// non-zero is a definitive outcome and never consumes another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts a job may make, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after the given (1-based) attempt failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Configuration for remote sessions driven through the OpenSSH client.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// OpenSSH client binary
    pub ssh_program: String,
    /// `sshpass` binary, used only for password secrets
    pub sshpass_program: String,
    /// Passed to ssh as `ConnectTimeout`
    pub connect_timeout: Duration,
    /// Hard ceiling for one command, connection included
    pub command_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            sshpass_program: "sshpass".to_string(),
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(300),
        }
    }
}

/// How long finished jobs stay visible for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Succeeded and abandoned jobs are purged once they are older than this
    pub finished_ttl: Duration,
    /// Number of most recent failed jobs kept around
    pub keep_failed: usize,
    /// How often the janitor applies the policy
    pub sweep_interval: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            finished_ttl: Duration::from_secs(60),
            keep_failed: 100,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of concurrent workers, independent of request size
    pub workers: usize,
    /// Time in-flight sessions get to finish at shutdown before being killed
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// How sessions reach their hosts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// System OpenSSH client
    #[default]
    Ssh,
    /// `sh -c` on this machine, host addresses are ignored
    Local,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    /// Host inventory file (JSON)
    pub hosts_path: Option<PathBuf>,
    /// Queue journal file. `None` keeps the queue in memory only.
    pub journal_path: Option<PathBuf>,
    /// Events buffered per observer before further events are dropped for it
    pub observer_buffer: usize,
    pub transport: TransportKind,
    pub retry: RetryPolicy,
    pub session: SessionConfig,
    pub retention: RetentionPolicy,
    pub pool: PoolConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            hosts_path: None,
            journal_path: None,
            observer_buffer: 256,
            transport: TransportKind::default(),
            retry: RetryPolicy::default(),
            session: SessionConfig::default(),
            retention: RetentionPolicy::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.hosts_path = Some(path.into());
        self
    }

    pub fn with_journal(mut self, path: impl Into<PathBuf>) -> Self {
        self.journal_path = Some(path.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.pool.workers = workers.max(1);
        self
    }
}
