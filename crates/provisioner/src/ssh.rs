use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use regex::{Captures, Regex};
use tokio_util::sync::CancellationToken;

mod openssh;
mod retry;

pub use openssh::{OpenSshClientFactory, OpenSshSettings};
pub use retry::{with_retries, RetrySettings};

/// Whether a failed command may be re-run on the same host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SshRetryPolicy {
    #[default]
    AllowRetries,
    ProhibitRetries,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshCommandResult {
    pub exit_code: i32,
    pub text: String,
}

/// Failures of a remote command. `command` is always the unexpanded template.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SshError {
    #[error("`{command}` exited with code {exit_code}: {text}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        text: String,
    },
    #[error("ssh transport to {host} failed: {message}")]
    Transport { host: String, message: String },
    #[error("`{command}` timed out after {seconds}s")]
    TimedOut { command: String, seconds: u64 },
    #[error("`{command}` was cancelled")]
    Cancelled { command: String },
    #[error("no value given for command argument @{0}")]
    MissingArgument(String),
    #[error("invalid command template: {0}")]
    InvalidTemplate(String),
}

impl SshError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled { .. } | Self::MissingArgument(_) | Self::InvalidTemplate(_)
        )
    }

    /// Captured output of a failed command, or the error message otherwise.
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::CommandFailed { text, .. } => text.clone(),
            other => other.to_string(),
        }
    }
}

/// Named values substituted into `@name` placeholders of a command template.
///
/// Values are shell-quoted on substitution and never appear in logs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandArguments {
    values: BTreeMap<String, String>,
}

impl CommandArguments {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Expands every `@name` in `template`.
    ///
    /// # Errors
    /// Returns [`SshError::MissingArgument`] for a placeholder without a value.
    pub fn render(&self, template: &str) -> Result<String, SshError> {
        let placeholder = Regex::new(r"@([A-Za-z_][A-Za-z0-9_]*)")
            .map_err(|error| SshError::InvalidTemplate(error.to_string()))?;

        let mut missing = None;
        let rendered = placeholder.replace_all(template, |captures: &Captures<'_>| {
            let name = &captures[1];
            if let Some(value) = self.values.get(name) {
                shell_quote(value)
            } else {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        });

        match missing {
            Some(name) => Err(SshError::MissingArgument(name)),
            None => Ok(rendered.into_owned()),
        }
    }
}

/// Wraps a value in single quotes for POSIX shells.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
pub trait SshClient: Send + Sync {
    /// Runs `command` after substituting `arguments`.
    ///
    /// # Errors
    /// Returns an [`SshError`] once the retry policy is exhausted.
    async fn execute_command(
        &self,
        policy: SshRetryPolicy,
        command: &str,
        arguments: &CommandArguments,
    ) -> Result<SshCommandResult, SshError>;
}

#[async_trait]
pub trait SshClientFactory: Send + Sync {
    /// Opens, or reuses, a session to `host`.
    ///
    /// # Errors
    /// Returns an error if the host cannot be reached.
    async fn connect(
        &self,
        host: &str,
        cancellation: &CancellationToken,
    ) -> Result<Box<dyn SshClient>>;
}
