//! Remote sessions through the system OpenSSH client.

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::hosts::{HostCredentials, Secret};
use crate::worker::executor::{stream_process, ExitOutcome, OutputSink, SessionTransport};

/// OpenSSH reserves this status for its own failures (connect, auth, ...).
///
/// The client cannot tell that apart from a remote command that itself exits
/// 255, so such a command is treated as a connection failure and run again up
/// to the retry limit. Commands with side effects should not exit 255.
///
/// `sshpass` reports its own failures through the same status channel (5 for
/// a rejected password, 6 for an unknown host key). Those overlap ordinary
/// command statuses and surface as the command's exit code, not as
/// connection errors.
pub const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Fully resolved process invocation for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct SshTransport {
    config: SessionConfig,
}

impl SshTransport {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    /// Build the client invocation. Passwords go through `sshpass -e` and the
    /// `SSHPASS` variable so they never show up in the process list.
    pub fn invocation(&self, host: &HostCredentials, command: &str) -> Invocation {
        let mut ssh_args = vec![
            "-p".to_string(),
            host.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!(
                "ConnectTimeout={}",
                self.config.connect_timeout.as_secs().max(1)
            ),
        ];

        match &host.secret {
            Secret::IdentityFile(path) => {
                ssh_args.push("-i".to_string());
                ssh_args.push(path.display().to_string());
                ssh_args.push("-o".to_string());
                ssh_args.push("IdentitiesOnly=yes".to_string());
                ssh_args.push("-o".to_string());
                ssh_args.push("BatchMode=yes".to_string());
            }
            Secret::Password(_) => {
                ssh_args.push("-o".to_string());
                ssh_args.push("PubkeyAuthentication=no".to_string());
                ssh_args.push("-o".to_string());
                ssh_args.push("PreferredAuthentications=password,keyboard-interactive".to_string());
            }
            Secret::None => {
                ssh_args.push("-o".to_string());
                ssh_args.push("BatchMode=yes".to_string());
            }
        }

        ssh_args.push("-l".to_string());
        ssh_args.push(host.username.clone());
        // Keep an address starting with '-' from being read as an option
        ssh_args.push("--".to_string());
        ssh_args.push(host.address.clone());
        ssh_args.push(command.to_string());

        match &host.secret {
            Secret::Password(password) => {
                let mut args = vec!["-e".to_string(), self.config.ssh_program.clone()];
                args.extend(ssh_args);
                Invocation {
                    program: self.config.sshpass_program.clone(),
                    args,
                    env: vec![("SSHPASS".to_string(), password.clone())],
                }
            }
            _ => Invocation {
                program: self.config.ssh_program.clone(),
                args: ssh_args,
                env: Vec::new(),
            },
        }
    }
}

#[async_trait]
impl SessionTransport for SshTransport {
    async fn run(
        &self,
        host: &HostCredentials,
        command: &str,
        on_output: OutputSink<'_>,
    ) -> ExitOutcome {
        let invocation = self.invocation(host, command);
        tracing::info!(
            host_id = %host.host_id,
            address = %host.address,
            port = host.port,
            user = %host.username,
            "Opening ssh session"
        );

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        let result = stream_process(cmd, self.config.command_timeout, on_output).await;
        tracing::debug!(host_id = %host.host_id, result = ?result, "ssh session closed");

        match result {
            Ok(SSH_TRANSPORT_FAILURE) => ExitOutcome::failed(SessionError::Connection(format!(
                "ssh to {}:{} failed (status {})",
                host.address, host.port, SSH_TRANSPORT_FAILURE
            ))),
            Ok(code) => ExitOutcome::exited(code),
            Err(e) => ExitOutcome::failed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn host(secret: Secret) -> HostCredentials {
        HostCredentials {
            host_id: "web-1".to_string(),
            address: "10.0.0.5".to_string(),
            port: 2222,
            username: "deploy".to_string(),
            secret,
        }
    }

    #[test]
    fn identity_file_invocation() {
        let transport = SshTransport::new(SessionConfig::default());
        let inv = transport.invocation(
            &host(Secret::IdentityFile(PathBuf::from("/keys/id_ed25519"))),
            "uptime",
        );

        assert_eq!(inv.program, "ssh");
        assert!(inv.env.is_empty());
        assert_eq!(
            inv.args,
            vec![
                "-p",
                "2222",
                "-o",
                "StrictHostKeyChecking=accept-new",
                "-o",
                "ConnectTimeout=10",
                "-i",
                "/keys/id_ed25519",
                "-o",
                "IdentitiesOnly=yes",
                "-o",
                "BatchMode=yes",
                "-l",
                "deploy",
                "--",
                "10.0.0.5",
                "uptime",
            ]
        );
    }

    #[test]
    fn password_goes_through_sshpass_env() {
        let transport = SshTransport::new(SessionConfig::default());
        let inv = transport.invocation(&host(Secret::Password("s3cret".to_string())), "df -h");

        assert_eq!(inv.program, "sshpass");
        assert_eq!(&inv.args[..2], &["-e".to_string(), "ssh".to_string()]);
        assert_eq!(inv.env, vec![("SSHPASS".to_string(), "s3cret".to_string())]);
        assert!(!inv.args.iter().any(|a| a.contains("s3cret")));
        assert_eq!(inv.args.last().map(String::as_str), Some("df -h"));
    }

    #[test]
    fn connect_timeout_is_at_least_one_second() {
        let config = SessionConfig {
            connect_timeout: Duration::from_millis(200),
            ..SessionConfig::default()
        };
        let inv = SshTransport::new(config).invocation(&host(Secret::None), "true");
        assert!(inv.args.contains(&"ConnectTimeout=1".to_string()));
        assert!(inv.args.contains(&"BatchMode=yes".to_string()));
    }

    #[tokio::test]
    async fn missing_client_is_a_connection_error() {
        let config = SessionConfig {
            ssh_program: "/nonexistent/ssh-client".to_string(),
            ..SessionConfig::default()
        };
        let transport = SshTransport::new(config);
        let outcome = transport
            .run(&host(Secret::None), "uptime", &|_, _| {})
            .await;

        assert!(matches!(outcome.error, Some(SessionError::Connection(_))));
        assert!(outcome.exit_code.is_none());
    }
}
