//! Execution engine for queued jobs.
//!
//! - **Pool**: a fixed number of workers claiming jobs from the queue
//! - **Sessions**: one remote shell per attempt, output streamed as it arrives
//!
//! # Components
//!
//! - [`WorkerPool`]: claims jobs, resolves credentials, settles or retries
//! - [`SessionTransport`]: how a command reaches a host
//! - [`SshTransport`]: the system `ssh` client (with `sshpass` for passwords)
//! - [`LocalTransport`]: `sh -c` on this machine, for development and tests
//!
//! # Execution Flow
//!
//! 1. A worker claims the next ready job
//! 2. The host directory resolves the job's host id to credentials
//! 3. The transport runs the command and forwards each output chunk to the hub
//! 4. Exit status 0 acks the job, any other status fails it, session errors
//!    go back to the queue for a delayed retry. Over ssh, status 255 counts
//!    as a session error (see [`ssh::SSH_TRANSPORT_FAILURE`])
//!
//! # Security Note
//!
//! Commands run verbatim in the remote login shell. Nothing is sandboxed.

pub mod executor;
pub mod pool;
pub mod ssh;

pub use executor::{ExitOutcome, LocalTransport, OutputSink, SessionTransport};
pub use pool::{PoolHandle, WorkerPool};
pub use ssh::SshTransport;
