use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::dispatch::{DispatchContext, Handler, Request};
use crate::firewall::ExposedPortRange;
use crate::ssh::{CommandArguments, SshClientFactory, SshRetryPolicy};

/// Ports the orchestrator itself needs on an instance, such as SSH.
#[derive(Debug, Clone)]
pub struct GetNecessaryInstanceFirewallPortsQuery {
    pub instance_name: String,
}

impl Request for GetNecessaryInstanceFirewallPortsQuery {
    type Response = Vec<ExposedPortRange>;
    const NAME: &'static str = "GetNecessaryInstanceFirewallPortsQuery";
}

/// Opens `ports` on the instance firewall. Rules that already exist are left alone.
#[derive(Debug, Clone)]
pub struct OpenFirewallPortsCommand {
    pub instance_name: String,
    pub ip_address: String,
    pub ports: Vec<ExposedPortRange>,
}

impl Request for OpenFirewallPortsCommand {
    type Response = ();
    const NAME: &'static str = "OpenFirewallPortsCommand";
}

#[derive(Debug, Clone)]
pub struct NecessaryFirewallPortsHandler {
    required: Vec<ExposedPortRange>,
}

impl NecessaryFirewallPortsHandler {
    #[must_use]
    pub fn new(required: Vec<ExposedPortRange>) -> Self {
        Self { required }
    }
}

#[async_trait]
impl Handler<GetNecessaryInstanceFirewallPortsQuery> for NecessaryFirewallPortsHandler {
    async fn handle(
        &self,
        _request: GetNecessaryInstanceFirewallPortsQuery,
        _context: &mut DispatchContext<'_>,
    ) -> Result<Vec<ExposedPortRange>> {
        Ok(self.required.clone())
    }
}

/// Reconciles the host firewall with `ufw`.
#[derive(Clone)]
pub struct UfwFirewallHandler {
    ssh: Arc<dyn SshClientFactory>,
}

impl std::fmt::Debug for UfwFirewallHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UfwFirewallHandler").finish_non_exhaustive()
    }
}

impl UfwFirewallHandler {
    #[must_use]
    pub fn new(ssh: Arc<dyn SshClientFactory>) -> Self {
        Self { ssh }
    }
}

#[async_trait]
impl Handler<OpenFirewallPortsCommand> for UfwFirewallHandler {
    async fn handle(
        &self,
        request: OpenFirewallPortsCommand,
        context: &mut DispatchContext<'_>,
    ) -> Result<()> {
        // Enabling ufw without any allow rule would cut off SSH.
        if request.ports.is_empty() {
            return Ok(());
        }

        let client = self
            .ssh
            .connect(&request.ip_address, context.cancellation())
            .await?;

        for range in &request.ports {
            client
                .execute_command(
                    SshRetryPolicy::AllowRetries,
                    "sudo ufw allow @rule",
                    &CommandArguments::new().with("rule", range.ufw_rule()),
                )
                .await?;
        }

        client
            .execute_command(
                SshRetryPolicy::AllowRetries,
                "sudo ufw --force enable",
                &CommandArguments::new(),
            )
            .await?;

        info!(
            instance = %request.instance_name,
            ports = request.ports.len(),
            "firewall ports opened"
        );

        Ok(())
    }
}
