use anyhow::Result;
use tracing::info;

use super::{require_ip_address, ProvisioningError, ProvisioningRun, StageKind, StageUpdate};
use crate::dispatch::DispatchContext;
use crate::ssh::{CommandArguments, SshClientFactory, SshRetryPolicy};

const BOOT_CHECK: &str = "if [ -f /var/lib/cloud/instance/boot-finished ] || ! command -v cloud-init >/dev/null 2>&1; then echo ready; else echo pending; fi";

const INSTALL_COMMANDS: &[&str] = &[
    "command -v docker >/dev/null 2>&1 || (curl -fsSL https://get.docker.com | sudo sh)",
    "command -v docker-compose >/dev/null 2>&1 || (sudo curl -fsSL \"https://github.com/docker/compose/releases/download/1.29.2/docker-compose-$(uname -s)-$(uname -m)\" -o /usr/local/bin/docker-compose && sudo chmod +x /usr/local/bin/docker-compose)",
    "command -v ufw >/dev/null 2>&1 || (sudo apt-get update -y && sudo apt-get install -y ufw)",
    "sudo systemctl enable --now docker",
];

/// Waits for first boot to finish, then installs the container runtime.
#[derive(Debug, Clone)]
pub struct InstallSoftwareStage {
    instance_name: String,
    ip_address: String,
}

impl InstallSoftwareStage {
    pub(super) fn initialize(run: &ProvisioningRun) -> Result<Self, ProvisioningError> {
        Ok(Self {
            instance_name: run.instance_name.clone(),
            ip_address: require_ip_address(StageKind::InstallSoftware, run)?,
        })
    }

    pub(super) async fn update(
        &self,
        ssh: &dyn SshClientFactory,
        context: &mut DispatchContext<'_>,
    ) -> Result<StageUpdate> {
        let client = ssh.connect(&self.ip_address, context.cancellation()).await?;
        let no_arguments = CommandArguments::new();

        let boot = client
            .execute_command(SshRetryPolicy::AllowRetries, BOOT_CHECK, &no_arguments)
            .await?;
        if boot.text.trim() != "ready" {
            info!(instance = %self.instance_name, "waiting for first boot to finish");
            return Ok(StageUpdate::InProgress);
        }

        for command in INSTALL_COMMANDS {
            client
                .execute_command(SshRetryPolicy::AllowRetries, command, &no_arguments)
                .await?;
        }

        Ok(StageUpdate::Succeeded)
    }
}
