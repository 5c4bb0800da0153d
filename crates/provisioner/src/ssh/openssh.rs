use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::retry::{with_retries, RetrySettings};
use super::{
    CommandArguments, SshClient, SshClientFactory, SshCommandResult, SshError, SshRetryPolicy,
};
use crate::config::ProvisionerConfig;

/// Exit status `ssh` itself uses for connection-level failures.
const SSH_TRANSPORT_EXIT_CODE: i32 = 255;

#[derive(Debug, Clone)]
pub struct OpenSshSettings {
    pub user: String,
    pub port: u16,
    pub private_key_path: Option<String>,
    pub control_directory: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub retry: RetrySettings,
}

impl OpenSshSettings {
    #[must_use]
    pub fn from_config(config: &ProvisionerConfig) -> Self {
        Self {
            user: config.ssh_user(),
            port: config.ssh_port(),
            private_key_path: config.ssh_private_key_path(),
            control_directory: config.ssh_control_directory(),
            connect_timeout: config.ssh_connect_timeout(),
            command_timeout: config.ssh_command_timeout(),
            retry: RetrySettings {
                attempts: config.ssh_retry_attempts(),
                base_delay: config.ssh_retry_base_delay(),
            },
        }
    }
}

/// Opens sessions with the system `ssh` binary. One control master per host is kept alive and
/// shared by every command sent to it.
#[derive(Debug, Clone)]
pub struct OpenSshClientFactory {
    settings: OpenSshSettings,
}

impl OpenSshClientFactory {
    #[must_use]
    pub fn new(settings: OpenSshSettings) -> Self {
        Self { settings }
    }

    /// # Errors
    /// Returns an error unless `host` is a bare IP address or hostname.
    pub fn validate_host(host: &str) -> Result<()> {
        let regex = Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9.:-]*[A-Za-z0-9])?$")
            .map_err(|error| anyhow!("invalid host validator: {error}"))?;

        if !regex.is_match(host) {
            bail!("host must be a bare IP address or hostname");
        }

        Ok(())
    }
}

#[async_trait]
impl SshClientFactory for OpenSshClientFactory {
    async fn connect(
        &self,
        host: &str,
        cancellation: &CancellationToken,
    ) -> Result<Box<dyn SshClient>> {
        Self::validate_host(host)?;

        tokio::fs::create_dir_all(&self.settings.control_directory)
            .await
            .with_context(|| {
                format!(
                    "Failed to create ssh control directory: {}",
                    self.settings.control_directory
                )
            })?;

        let client = OpenSshClient {
            host: host.to_string(),
            settings: self.settings.clone(),
            cancellation: cancellation.clone(),
        };

        client
            .execute_command(SshRetryPolicy::AllowRetries, "true", &CommandArguments::new())
            .await
            .with_context(|| format!("Failed to open ssh session to {host}"))?;

        info!(host, user = %self.settings.user, "ssh session established");

        Ok(Box::new(client))
    }
}

#[derive(Debug)]
struct OpenSshClient {
    host: String,
    settings: OpenSshSettings,
    cancellation: CancellationToken,
}

impl OpenSshClient {
    fn ssh_arguments(&self) -> Vec<String> {
        let mut arguments = vec![
            "-p".to_string(),
            self.settings.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ControlMaster=auto".to_string(),
            "-o".to_string(),
            format!("ControlPath={}/%C", self.settings.control_directory),
            "-o".to_string(),
            "ControlPersist=600".to_string(),
        ];

        if let Some(private_key_path) = &self.settings.private_key_path {
            arguments.push("-i".to_string());
            arguments.push(private_key_path.clone());
        }

        arguments.push(format!("{}@{}", self.settings.user, self.host));
        arguments.push("bash -s".to_string());
        arguments
    }

    async fn run_once(&self, template: &str, script: &str) -> Result<SshCommandResult, SshError> {
        let transport = |message: String| SshError::Transport {
            host: self.host.clone(),
            message,
        };

        let mut child = tokio::process::Command::new("ssh")
            .args(self.ssh_arguments())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| transport(format!("failed to spawn ssh: {error}")))?;

        let stdin_handle = child.stdin.take();
        let input = format!("set -e\n{script}\n");
        let stdin_task = tokio::spawn(async move {
            if let Some(mut stdin) = stdin_handle {
                let _ = stdin.write_all(input.as_bytes()).await;
            }
        });

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        let timeout = self.settings.command_timeout;
        let (status, stdout, stderr) = tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut handle) = stdout_handle {
                            let _ = handle.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut handle) = stderr_handle {
                            let _ = handle.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                );
                let _ = stdin_task.await;
                (status, stdout, stderr)
            } => result,
            () = tokio::time::sleep(timeout) => {
                return Err(SshError::TimedOut {
                    command: template.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
            () = self.cancellation.cancelled() => {
                return Err(SshError::Cancelled {
                    command: template.to_string(),
                });
            }
        };

        let status = status.map_err(|error| transport(format!("waiting for ssh: {error}")))?;
        let stdout = String::from_utf8_lossy(&stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&stderr).trim().to_string();

        match status.code() {
            Some(0) => Ok(SshCommandResult {
                exit_code: 0,
                text: stdout,
            }),
            Some(SSH_TRANSPORT_EXIT_CODE) | None => Err(transport(stderr)),
            Some(exit_code) => Err(SshError::CommandFailed {
                command: template.to_string(),
                exit_code,
                text: if stderr.is_empty() { stdout } else { stderr },
            }),
        }
    }
}

#[async_trait]
impl SshClient for OpenSshClient {
    async fn execute_command(
        &self,
        policy: SshRetryPolicy,
        command: &str,
        arguments: &CommandArguments,
    ) -> Result<SshCommandResult, SshError> {
        let script = arguments.render(command)?;
        debug!(host = %self.host, command, ?policy, "executing ssh command");

        with_retries(policy, self.settings.retry, &self.cancellation, command, || {
            self.run_once(command, &script)
        })
        .await
    }
}
