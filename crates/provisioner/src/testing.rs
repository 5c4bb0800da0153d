//! Fakes shared by the unit tests of several modules.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::commands::{register_all, OpenFirewallPortsCommand, Services};
use crate::db::DbClient;
use crate::dispatch::{DispatchContext, Dispatcher, Handler};
use crate::firewall::{ExposedPortRange, SocketProtocol};
use crate::provisioning::EngineSettings;
use crate::secrets::SecretCipher;
use crate::ssh::{
    CommandArguments, SshClient, SshClientFactory, SshCommandResult, SshError, SshRetryPolicy,
};

pub(crate) const TEST_ENCRYPTION_KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

pub(crate) async fn temp_db() -> DbClient {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let db_path = tempdir.path().join("provisioner.db");
    std::mem::forget(tempdir);

    DbClient::initialize(&db_path.to_string_lossy())
        .await
        .expect("db init")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedCommand {
    pub host: String,
    pub policy: SshRetryPolicy,
    pub template: String,
    pub rendered: String,
}

#[derive(Debug, Default)]
struct FakeHosts {
    connections: Vec<String>,
    commands: Vec<RecordedCommand>,
    failures: Vec<(String, SshError)>,
    responses: Vec<(String, VecDeque<String>)>,
    unreachable: bool,
}

/// Records every command instead of reaching a host. Commands print `ready` unless scripted.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingSshClientFactory {
    hosts: Arc<Mutex<FakeHosts>>,
}

impl RecordingSshClientFactory {
    /// Fails every command whose template contains `needle`.
    pub fn fail_on(&self, needle: &str, error: SshError) {
        self.hosts
            .lock()
            .expect("lock")
            .failures
            .push((needle.to_string(), error));
    }

    /// Answers commands containing `needle` with `outputs` in order; the last one repeats.
    pub fn respond_on(&self, needle: &str, outputs: &[&str]) {
        self.hosts.lock().expect("lock").responses.push((
            needle.to_string(),
            outputs.iter().map(ToString::to_string).collect(),
        ));
    }

    pub fn make_unreachable(&self) {
        self.hosts.lock().expect("lock").unreachable = true;
    }

    pub fn connections(&self) -> Vec<String> {
        self.hosts.lock().expect("lock").connections.clone()
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.hosts.lock().expect("lock").commands.clone()
    }

    pub fn templates(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .map(|command| command.template)
            .collect()
    }
}

#[async_trait]
impl SshClientFactory for RecordingSshClientFactory {
    async fn connect(
        &self,
        host: &str,
        _cancellation: &CancellationToken,
    ) -> Result<Box<dyn SshClient>> {
        let mut hosts = self.hosts.lock().expect("lock");
        if hosts.unreachable {
            bail!("host {host} is unreachable");
        }
        hosts.connections.push(host.to_string());

        Ok(Box::new(RecordingSshClient {
            host: host.to_string(),
            hosts: self.hosts.clone(),
        }))
    }
}

struct RecordingSshClient {
    host: String,
    hosts: Arc<Mutex<FakeHosts>>,
}

#[async_trait]
impl SshClient for RecordingSshClient {
    async fn execute_command(
        &self,
        policy: SshRetryPolicy,
        command: &str,
        arguments: &CommandArguments,
    ) -> Result<SshCommandResult, SshError> {
        let rendered = arguments.render(command)?;
        let mut hosts = self.hosts.lock().expect("lock");
        hosts.commands.push(RecordedCommand {
            host: self.host.clone(),
            policy,
            template: command.to_string(),
            rendered,
        });

        if let Some((_, error)) = hosts
            .failures
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
        {
            return Err(error.clone());
        }

        let text = hosts
            .responses
            .iter_mut()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .and_then(|(_, outputs)| {
                if outputs.len() > 1 {
                    outputs.pop_front()
                } else {
                    outputs.front().cloned()
                }
            })
            .unwrap_or_else(|| "ready".to_string());

        Ok(SshCommandResult { exit_code: 0, text })
    }
}

/// Stands in for the ufw handler and remembers what it was asked to open.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingFirewallHandler {
    opened: Arc<Mutex<Vec<OpenFirewallPortsCommand>>>,
}

impl RecordingFirewallHandler {
    pub fn opened(&self) -> Vec<OpenFirewallPortsCommand> {
        self.opened.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Handler<OpenFirewallPortsCommand> for RecordingFirewallHandler {
    async fn handle(
        &self,
        request: OpenFirewallPortsCommand,
        _context: &mut DispatchContext<'_>,
    ) -> Result<()> {
        self.opened.lock().expect("lock").push(request);
        Ok(())
    }
}

pub(crate) fn test_services(ssh: &RecordingSshClientFactory) -> Services {
    Services {
        ssh: Arc::new(ssh.clone()),
        engine_settings: EngineSettings {
            poll_interval: Duration::from_millis(1),
            max_polls: 5,
        },
        required_ports: vec![ExposedPortRange::single(SocketProtocol::Tcp, 22)],
        cipher: Some(SecretCipher::from_base64_key(TEST_ENCRYPTION_KEY).expect("cipher")),
    }
}

/// A dispatcher with every default handler, a fake SSH layer and a fresh database.
pub(crate) async fn test_dispatcher(ssh: &RecordingSshClientFactory) -> Dispatcher {
    let mut dispatcher = Dispatcher::new(temp_db().await);
    register_all(&mut dispatcher, &test_services(ssh));
    dispatcher
}
