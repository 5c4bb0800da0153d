//! Commands and queries routed through the [`Dispatcher`].

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::ProvisionerConfig;
use crate::dispatch::Dispatcher;
use crate::firewall::ExposedPortRange;
use crate::provisioning::{EngineSettings, StageEngine, StageFailure, StageKind};
use crate::secrets::SecretCipher;
use crate::ssh::SshClientFactory;

mod clusters;
mod firewall;
mod instances;
mod provision;
mod pull_dog;

pub use clusters::{ClusterCommands, EnsureClusterWithIdCommand, GetClusterForUserQuery};
pub use firewall::{
    GetNecessaryInstanceFirewallPortsQuery, NecessaryFirewallPortsHandler,
    OpenFirewallPortsCommand, UfwFirewallHandler,
};
pub use instances::{
    DeleteInstanceByNameCommand, GetExpiredInstancesQuery,
    GetProvisionedClustersWithInstancesForUserQuery, InstanceCommands,
    RegisterInstanceAsProvisionedCommand, SetInstanceExpiryCommand,
};
pub use provision::{
    ProvisionInstanceCommand, ProvisionInstanceHandler, ProvisionTarget, ProvisioningReport,
};
pub use pull_dog::{
    CreatePullDogSettingsCommand, EnsurePullDogDatabaseInstanceCommand,
    EnsurePullDogPullRequestCommand, EnsurePullDogRepositoryCommand,
    GetAvailableClusterForPullRequestQuery, GetConfigurationForPullRequestQuery,
    OverrideConfigurationForPullRequestCommand, PullDogCommands, PULL_DOG_CLUSTER_NAME,
};


/// Expected domain failures. Handlers return these through `anyhow` so callers can downcast.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("user {user_id} has more than one cluster; a cluster id is required")]
    ClusterQueryTooBroad { user_id: String },
    #[error("cluster {0} was not found")]
    ClusterNotFound(String),
    #[error("instance {0} was not found")]
    InstanceNotFound(String),
    #[error("instance {instance_name} belongs to another cluster")]
    InstanceClusterMismatch { instance_name: String },
    #[error("the demo cluster already runs an instance")]
    DemoInstanceAlreadyProvisioned,
    #[error("pull request {0} was not found")]
    PullRequestNotFound(String),
    #[error("pull dog settings {0} were not found")]
    SettingsNotFound(String),
    #[error("all {pool_size} pull dog instances of this account are in use")]
    PoolSizeExceeded { pool_size: i64 },
    #[error("no encryption key is configured")]
    EncryptionKeyMissing,
    #[error("provisioning stage {stage} failed: {failure}")]
    ProvisioningFailed {
        stage: StageKind,
        failure: StageFailure,
    },
}

/// Collaborators shared by the default handlers.
#[derive(Clone)]
pub struct Services {
    pub ssh: Arc<dyn SshClientFactory>,
    pub engine_settings: EngineSettings,
    pub required_ports: Vec<ExposedPortRange>,
    pub cipher: Option<SecretCipher>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("engine_settings", &self.engine_settings)
            .field("required_ports", &self.required_ports)
            .field("cipher", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}

impl Services {
    /// # Errors
    /// Returns an error if a required firewall port or the encryption key is malformed.
    pub fn from_config(config: &ProvisionerConfig, ssh: Arc<dyn SshClientFactory>) -> Result<Self> {
        let required_ports = config
            .firewall_required_ports()
            .iter()
            .map(|value| {
                value
                    .parse::<ExposedPortRange>()
                    .with_context(|| format!("invalid firewall.required_ports entry: {value}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            ssh,
            engine_settings: EngineSettings::from_config(config),
            required_ports,
            cipher: SecretCipher::from_config(config)?,
        })
    }
}

/// Registers the default handler of every command and query.
pub fn register_all(dispatcher: &mut Dispatcher, services: &Services) {
    let pull_dog = PullDogCommands::new(services.cipher.clone());

    dispatcher
        .register::<EnsureClusterWithIdCommand, _>(ClusterCommands)
        .register::<GetClusterForUserQuery, _>(ClusterCommands)
        .register::<RegisterInstanceAsProvisionedCommand, _>(InstanceCommands)
        .register::<SetInstanceExpiryCommand, _>(InstanceCommands)
        .register::<DeleteInstanceByNameCommand, _>(InstanceCommands)
        .register::<GetProvisionedClustersWithInstancesForUserQuery, _>(InstanceCommands)
        .register::<GetExpiredInstancesQuery, _>(InstanceCommands)
        .register::<GetNecessaryInstanceFirewallPortsQuery, _>(NecessaryFirewallPortsHandler::new(
            services.required_ports.clone(),
        ))
        .register::<OpenFirewallPortsCommand, _>(UfwFirewallHandler::new(services.ssh.clone()))
        .register::<CreatePullDogSettingsCommand, _>(pull_dog.clone())
        .register::<EnsurePullDogRepositoryCommand, _>(pull_dog.clone())
        .register::<EnsurePullDogPullRequestCommand, _>(pull_dog.clone())
        .register::<OverrideConfigurationForPullRequestCommand, _>(pull_dog.clone())
        .register::<GetConfigurationForPullRequestQuery, _>(pull_dog.clone())
        .register::<GetAvailableClusterForPullRequestQuery, _>(pull_dog.clone())
        .register::<EnsurePullDogDatabaseInstanceCommand, _>(pull_dog)
        .register::<ProvisionInstanceCommand, _>(ProvisionInstanceHandler::new(StageEngine::new(
            services.ssh.clone(),
            services.engine_settings,
        )));
}
