use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/opt/provisioner/config.json";

const DEFAULT_DB_PATH: &str = "/opt/provisioner/data/provisioner.db";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 1;
const MAX_DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const DEFAULT_SSH_USER: &str = "ubuntu";
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_SSH_CONTROL_DIRECTORY: &str = "/tmp/provisioner-ssh";
const DEFAULT_SSH_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_SSH_COMMAND_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_SSH_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_SSH_RETRY_BASE_DELAY_MS: u64 = 1000;

const DEFAULT_REQUIRED_PORTS: &[&str] = &["22/tcp"];

const DEFAULT_STAGE_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_MAX_STAGE_POLLS: u32 = 90;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    pub database_path: Option<String>,
    pub database_max_connections: Option<u32>,
    pub database_acquire_timeout_secs: Option<u64>,
    pub encryption_key: Option<String>,
    pub ssh: SshConfig,
    pub firewall: FirewallConfig,
    pub provisioning: ProvisioningConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: Option<String>,
    pub port: Option<u16>,
    pub private_key_path: Option<String>,
    pub control_directory: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub command_timeout_secs: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_base_delay_ms: Option<u64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    pub required_ports: Option<Vec<String>>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    pub poll_interval_secs: Option<u64>,
    pub max_stage_polls: Option<u32>,
}

impl ProvisionerConfig {
    /// Loads the config file named by `PROVISIONER_CONFIG_PATH`, or defaults when it is absent.
    ///
    /// # Errors
    ///
    /// This function will return an error if the config file is located but JSON contents cannot be parsed
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PROVISIONER_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let path = Path::new(&config_path);
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {config_path}"))?;

        let config = serde_json::from_str::<Self>(&raw)
            .with_context(|| format!("Failed to parse config JSON: {config_path}"))?;

        Ok(config)
    }

    #[must_use]
    pub fn database_path(&self) -> String {
        self.database_path
            .as_deref()
            .unwrap_or(DEFAULT_DB_PATH)
            .trim()
            .to_string()
    }

    #[must_use]
    pub fn database_max_connections(&self) -> u32 {
        self.database_max_connections
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
    }

    /// How long a dispatch waits for a pool connection. Never shorter than a provisioning run,
    /// which holds its connection for the whole pipeline.
    #[must_use]
    pub fn database_acquire_timeout(&self) -> Duration {
        let run_budget = self.provisioning_run_budget();
        self.database_acquire_timeout_secs
            .map_or(run_budget, |secs| Duration::from_secs(secs).max(run_budget))
            .min(MAX_DB_ACQUIRE_TIMEOUT)
    }

    #[must_use]
    pub fn encryption_key(&self) -> Option<String> {
        self.encryption_key
            .clone()
            .or_else(|| std::env::var("PROVISIONER_ENCRYPTION_KEY").ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    #[must_use]
    pub fn ssh_user(&self) -> String {
        self.ssh
            .user
            .clone()
            .or_else(|| std::env::var("PROVISIONER_SSH_USER").ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_SSH_USER.to_string())
    }

    #[must_use]
    pub fn ssh_port(&self) -> u16 {
        self.ssh.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    #[must_use]
    pub fn ssh_private_key_path(&self) -> Option<String> {
        self.ssh
            .private_key_path
            .clone()
            .or_else(|| std::env::var("PROVISIONER_SSH_KEY_PATH").ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    #[must_use]
    pub fn ssh_control_directory(&self) -> String {
        self.ssh
            .control_directory
            .as_deref()
            .unwrap_or(DEFAULT_SSH_CONTROL_DIRECTORY)
            .trim()
            .trim_end_matches('/')
            .to_string()
    }

    #[must_use]
    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(
            self.ssh
                .connect_timeout_secs
                .unwrap_or(DEFAULT_SSH_CONNECT_TIMEOUT_SECS),
        )
    }

    #[must_use]
    pub fn ssh_command_timeout(&self) -> Duration {
        Duration::from_secs(
            self.ssh
                .command_timeout_secs
                .unwrap_or(DEFAULT_SSH_COMMAND_TIMEOUT_SECS),
        )
    }

    #[must_use]
    pub fn ssh_retry_attempts(&self) -> u32 {
        self.ssh
            .retry_attempts
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_SSH_RETRY_ATTEMPTS)
    }

    #[must_use]
    pub fn ssh_retry_base_delay(&self) -> Duration {
        Duration::from_millis(
            self.ssh
                .retry_base_delay_ms
                .unwrap_or(DEFAULT_SSH_RETRY_BASE_DELAY_MS),
        )
    }

    /// Ports the orchestrator itself needs open on every instance, as `port[-port]/protocol` entries.
    #[must_use]
    pub fn firewall_required_ports(&self) -> Vec<String> {
        match &self.firewall.required_ports {
            Some(ports) => ports
                .iter()
                .map(|value| value.trim().to_ascii_lowercase())
                .filter(|value| !value.is_empty())
                .collect(),
            None => DEFAULT_REQUIRED_PORTS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    #[must_use]
    pub fn stage_poll_interval(&self) -> Duration {
        Duration::from_secs(
            self.provisioning
                .poll_interval_secs
                .unwrap_or(DEFAULT_STAGE_POLL_INTERVAL_SECS),
        )
    }

    #[must_use]
    pub fn max_stage_polls(&self) -> u32 {
        self.provisioning
            .max_stage_polls
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_STAGE_POLLS)
    }

    /// Upper bound on one pipeline run: every poll of a stage plus one full command timeout.
    #[must_use]
    pub fn provisioning_run_budget(&self) -> Duration {
        self.stage_poll_interval()
            .checked_mul(self.max_stage_polls())
            .and_then(|polling| polling.checked_add(self.ssh_command_timeout()))
            .unwrap_or(MAX_DB_ACQUIRE_TIMEOUT)
    }
}
