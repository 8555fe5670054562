use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::error::SessionError;
use crate::events::OutputStream;
use crate::hosts::HostCredentials;

/// Receives output chunks as soon as they are read, in read order per stream.
pub type OutputSink<'a> = &'a (dyn Fn(OutputStream, String) + Send + Sync);

const READ_CHUNK: usize = 8192;

/// Result of one session.
///
/// `error` is set for transport-level failures (could not connect, timed out,
/// lost the session). `exit_code` is the remote command's status when it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitOutcome {
    pub exit_code: Option<i32>,
    pub error: Option<SessionError>,
}

impl ExitOutcome {
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            error: None,
        }
    }

    pub fn failed(error: SessionError) -> Self {
        Self {
            exit_code: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.exit_code == Some(0)
    }
}

/// Runs one command against one host.
///
/// Implementations must release the connection on every path and report
/// failures through `ExitOutcome` instead of panicking.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn run(
        &self,
        host: &HostCredentials,
        command: &str,
        on_output: OutputSink<'_>,
    ) -> ExitOutcome;
}

/// Runs commands on the local machine with `sh -c`, ignoring the host's
/// address. Useful for trying the orchestrator without a fleet.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    timeout: Duration,
}

impl LocalTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl SessionTransport for LocalTransport {
    async fn run(
        &self,
        host: &HostCredentials,
        command: &str,
        on_output: OutputSink<'_>,
    ) -> ExitOutcome {
        tracing::info!(host_id = %host.host_id, command, "Executing locally");

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);

        match stream_process(cmd, self.timeout, on_output).await {
            Ok(code) => ExitOutcome::exited(code),
            Err(e) => ExitOutcome::failed(e),
        }
    }
}

/// Spawn `command`, forward both pipes to `on_output` as they are read, and
/// return the exit code.
///
/// The child is killed if the timeout fires or the returned future is
/// dropped, so no process outlives the call.
pub async fn stream_process(
    mut command: Command,
    timeout: Duration,
    on_output: OutputSink<'_>,
) -> Result<i32, SessionError> {
    let program = command.as_std().get_program().to_string_lossy().into_owned();

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command
        .spawn()
        .map_err(|e| SessionError::Connection(format!("failed to start {}: {}", program, e)))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let run = async {
        pump(stdout, stderr, on_output).await?;
        child
            .wait()
            .await
            .map_err(|e| SessionError::Io(e.to_string()))
    };

    let result = tokio::time::timeout(timeout, run).await;
    match result {
        Ok(Ok(status)) => status
            .code()
            .ok_or_else(|| SessionError::Io(format!("{} terminated by signal", program))),
        Ok(Err(e)) => {
            let _ = child.start_kill();
            Err(e)
        }
        Err(_) => {
            tracing::warn!(program = %program, timeout = ?timeout, "Session timed out, killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(SessionError::Timeout(timeout))
        }
    }
}

/// Read both pipes until EOF, emitting chunks as they arrive.
async fn pump<O, E>(
    mut stdout: Option<O>,
    mut stderr: Option<E>,
    on_output: OutputSink<'_>,
) -> Result<(), SessionError>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];
    let mut out_decoder = ChunkDecoder::default();
    let mut err_decoder = ChunkDecoder::default();

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_chunk(&mut stdout, &mut out_buf) => {
                let n = read.map_err(|e| SessionError::Io(e.to_string()))?;
                if n == 0 {
                    stdout = None;
                    emit(on_output, OutputStream::Stdout, out_decoder.finish());
                } else {
                    emit(on_output, OutputStream::Stdout, out_decoder.decode(&out_buf[..n]));
                }
            }
            read = read_chunk(&mut stderr, &mut err_buf) => {
                let n = read.map_err(|e| SessionError::Io(e.to_string()))?;
                if n == 0 {
                    stderr = None;
                    emit(on_output, OutputStream::Stderr, err_decoder.finish());
                } else {
                    emit(on_output, OutputStream::Stderr, err_decoder.decode(&err_buf[..n]));
                }
            }
        }
    }

    Ok(())
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

fn emit(on_output: OutputSink<'_>, stream: OutputStream, text: String) {
    if !text.is_empty() {
        on_output(stream, text);
    }
}

/// Turns arbitrary byte chunks into text without splitting a UTF-8 sequence
/// across two chunks. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        // Incomplete sequence at the end: hold it back for the next chunk
        let keep = incomplete_tail_len(&self.pending);
        let tail = self.pending.split_off(self.pending.len() - keep);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = tail;
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`, judged
/// on the tail alone so invalid bytes earlier in the chunk do not hide it.
fn incomplete_tail_len(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    for i in (start..bytes.len()).rev() {
        // Skip continuation bytes back to the sequence's lead byte
        if bytes[i] & 0xc0 == 0x80 {
            continue;
        }
        return match std::str::from_utf8(&bytes[i..]) {
            Err(e) if e.valid_up_to() == 0 && e.error_len().is_none() => bytes.len() - i,
            _ => 0,
        };
    }
    0
}
