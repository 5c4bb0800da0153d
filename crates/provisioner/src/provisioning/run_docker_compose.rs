use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{anyhow, Result};
use base64::Engine;
use regex::Regex;
use tracing::{info, warn};

use super::{
    require_ip_address, InstanceFile, ProvisioningError, ProvisioningRun, RegistryAuthentication,
    StageFailure, StageKind, StageUpdate,
};
use crate::commands::{GetNecessaryInstanceFirewallPortsQuery, OpenFirewallPortsCommand};
use crate::compose::parse_exposed_ports;
use crate::dispatch::DispatchContext;
use crate::firewall::{resolve_firewall_ports, ExposedPortRange};
use crate::ssh::{CommandArguments, SshClient, SshClientFactory, SshError, SshRetryPolicy};

pub const DOCKER_COMPOSE_UP_FAIL: &str = "DOCKER_COMPOSE_UP_FAIL";

const WORKING_DIRECTORY: &str = "provisioning";

const WRITE_FILE_COMMAND: &str =
    "mkdir -p \"$(dirname @path)\" && printf '%s' @contents | base64 --decode > @path";

#[derive(Debug, Clone)]
struct ComposeDocument {
    file_name: String,
    contents: String,
    exposed_ports: Vec<ExposedPortRange>,
}

/// Uploads the workload and brings it up with `docker-compose`.
#[derive(Debug, Clone)]
pub struct RunDockerComposeStage {
    instance_name: String,
    ip_address: String,
    documents: Vec<ComposeDocument>,
    files: Vec<InstanceFile>,
    authentication: Vec<RegistryAuthentication>,
    build_arguments: BTreeMap<String, String>,
}

impl RunDockerComposeStage {
    pub(super) fn initialize(run: &ProvisioningRun) -> Result<Self, ProvisioningError> {
        let stage = StageKind::RunDockerCompose;
        let ip_address = require_ip_address(stage, run)?;

        if run.compose_documents.is_empty() {
            return Err(ProvisioningError::MissingRunParameter {
                stage,
                parameter: "compose documents",
            });
        }

        let documents = run
            .compose_documents
            .iter()
            .enumerate()
            .map(|(index, contents)| {
                let exposed_ports = parse_exposed_ports(contents).map_err(|error| {
                    ProvisioningError::InvalidRunParameter {
                        stage,
                        parameter: "compose document",
                        reason: error.to_string(),
                    }
                })?;

                Ok(ComposeDocument {
                    file_name: format!("docker-compose-{}.yml", index + 1),
                    contents: contents.clone(),
                    exposed_ports,
                })
            })
            .collect::<Result<Vec<_>, ProvisioningError>>()?;

        for file in &run.files {
            validate_file_path(&file.path).map_err(|reason| {
                ProvisioningError::InvalidRunParameter {
                    stage,
                    parameter: "file path",
                    reason,
                }
            })?;
        }

        let key_pattern = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|error| {
            ProvisioningError::InvalidRunParameter {
                stage,
                parameter: "build argument",
                reason: error.to_string(),
            }
        })?;
        if let Some(key) = run
            .build_arguments
            .keys()
            .find(|key| !key_pattern.is_match(key))
        {
            return Err(ProvisioningError::InvalidRunParameter {
                stage,
                parameter: "build argument",
                reason: format!("`{key}` is not a valid variable name"),
            });
        }

        if run
            .authentication
            .iter()
            .any(|entry| entry.username.trim().is_empty() || entry.password.is_empty())
        {
            return Err(ProvisioningError::InvalidRunParameter {
                stage,
                parameter: "registry authentication",
                reason: "username and password are required".to_string(),
            });
        }

        Ok(Self {
            instance_name: run.instance_name.clone(),
            ip_address,
            documents,
            files: run.files.clone(),
            authentication: run.authentication.clone(),
            build_arguments: run.build_arguments.clone(),
        })
    }

    pub(super) async fn update(
        &self,
        ssh: &dyn SshClientFactory,
        context: &mut DispatchContext<'_>,
    ) -> Result<StageUpdate> {
        let client = ssh.connect(&self.ip_address, context.cancellation()).await?;

        self.open_firewall(context).await?;

        client
            .execute_command(
                SshRetryPolicy::AllowRetries,
                "mkdir -p @directory",
                &CommandArguments::new().with("directory", WORKING_DIRECTORY),
            )
            .await?;

        for document in &self.documents {
            write_file(
                client.as_ref(),
                &format!("{WORKING_DIRECTORY}/{}", document.file_name),
                document.contents.as_bytes(),
            )
            .await?;
        }

        for file in &self.files {
            write_file(
                client.as_ref(),
                &format!("{WORKING_DIRECTORY}/{}", file.path),
                &file.contents,
            )
            .await?;
        }

        for entry in &self.authentication {
            sign_in(client.as_ref(), entry).await?;
        }

        let (command, arguments) = self.compose_up_command()?;
        match client
            .execute_command(SshRetryPolicy::ProhibitRetries, &command, &arguments)
            .await
        {
            Ok(_) => {
                info!(instance = %self.instance_name, "docker-compose up succeeded");
                Ok(StageUpdate::Succeeded)
            }
            Err(error @ SshError::Cancelled { .. }) => Err(error.into()),
            Err(error) => {
                warn!(instance = %self.instance_name, error = %error, "docker-compose up failed");
                Ok(StageUpdate::Failed(StageFailure {
                    error_code: DOCKER_COMPOSE_UP_FAIL.to_string(),
                    title: error.text(),
                    detail: Some(error.to_string()),
                }))
            }
        }
    }

    async fn open_firewall(&self, context: &mut DispatchContext<'_>) -> Result<()> {
        let required = context
            .dispatch(GetNecessaryInstanceFirewallPortsQuery {
                instance_name: self.instance_name.clone(),
            })
            .await?;

        let exposed = self
            .documents
            .iter()
            .flat_map(|document| document.exposed_ports.iter().copied())
            .collect::<Vec<_>>();

        context
            .dispatch(OpenFirewallPortsCommand {
                instance_name: self.instance_name.clone(),
                ip_address: self.ip_address.clone(),
                ports: resolve_firewall_ports(&required, &exposed),
            })
            .await
    }

    /// Build arguments reach compose as environment variables; their values stay in arguments.
    fn compose_up_command(&self) -> Result<(String, CommandArguments)> {
        let mut arguments = CommandArguments::new();
        let mut command = format!("cd {WORKING_DIRECTORY} && sudo");

        if !self.build_arguments.is_empty() {
            command.push_str(" env");
            for (index, (key, value)) in self.build_arguments.iter().enumerate() {
                let name = format!("buildArgument{index}");
                write!(command, " {key}=@{name}").map_err(|error| anyhow!(error))?;
                arguments.insert(name, value.clone());
            }
        }

        command.push_str(" docker-compose");
        for document in &self.documents {
            write!(command, " -f {}", document.file_name).map_err(|error| anyhow!(error))?;
        }
        command.push_str(" --compatibility up --detach --build --remove-orphans");

        Ok((command, arguments))
    }
}

async fn write_file(client: &dyn SshClient, path: &str, contents: &[u8]) -> Result<()> {
    let arguments = CommandArguments::new()
        .with("path", path)
        .with(
            "contents",
            base64::engine::general_purpose::STANDARD.encode(contents),
        );

    client
        .execute_command(SshRetryPolicy::AllowRetries, WRITE_FILE_COMMAND, &arguments)
        .await?;

    Ok(())
}

async fn sign_in(client: &dyn SshClient, entry: &RegistryAuthentication) -> Result<()> {
    let mut arguments = CommandArguments::new()
        .with("username", entry.username.clone())
        .with("password", entry.password.clone());

    let command = match &entry.registry {
        Some(registry) => {
            arguments.insert("registry", registry.clone());
            "echo @password | sudo docker login @registry --username @username --password-stdin"
        }
        None => "echo @password | sudo docker login --username @username --password-stdin",
    };

    client
        .execute_command(SshRetryPolicy::AllowRetries, command, &arguments)
        .await?;

    Ok(())
}

fn validate_file_path(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("path is empty".to_string());
    }
    if path.starts_with('/') {
        return Err(format!("`{path}` must be relative"));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(format!("`{path}` must not leave the provisioning directory"));
    }

    Ok(())
}
