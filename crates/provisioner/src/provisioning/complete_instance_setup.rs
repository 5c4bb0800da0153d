use anyhow::Result;

use super::{require_ip_address, ProvisioningError, ProvisioningRun, StageKind, StageUpdate};
use crate::commands::RegisterInstanceAsProvisionedCommand;
use crate::dispatch::DispatchContext;
use crate::ssh::{CommandArguments, SshClientFactory, SshRetryPolicy};

#[derive(Debug, Clone)]
pub struct CompleteInstanceSetupStage {
    instance_name: String,
    ip_address: String,
}

impl CompleteInstanceSetupStage {
    pub(super) fn initialize(run: &ProvisioningRun) -> Result<Self, ProvisioningError> {
        Ok(Self {
            instance_name: run.instance_name.clone(),
            ip_address: require_ip_address(StageKind::CompleteInstanceSetup, run)?,
        })
    }

    pub(super) async fn update(
        &self,
        ssh: &dyn SshClientFactory,
        context: &mut DispatchContext<'_>,
    ) -> Result<StageUpdate> {
        let client = ssh.connect(&self.ip_address, context.cancellation()).await?;

        client
            .execute_command(
                SshRetryPolicy::AllowRetries,
                "sudo docker image prune --force",
                &CommandArguments::new(),
            )
            .await?;

        context
            .dispatch(RegisterInstanceAsProvisionedCommand {
                instance_name: self.instance_name.clone(),
            })
            .await?;

        Ok(StageUpdate::Succeeded)
    }
}
