use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use super::CommandError;
use crate::configuration::{ConfigurationFile, ConfigurationFileOverride};
use crate::db::{
    ClusterRecord, InstanceRecord, InstanceType, NewCluster, NewInstance, NewPullDogPullRequest,
    NewPullDogRepository, NewPullDogSettings, PullDogPullRequestRecord, PullDogRepositoryRecord,
    PullDogSettingsRecord, Store,
};
use crate::dispatch::{DispatchContext, Handler, Request};
use crate::secrets::SecretCipher;

pub const PULL_DOG_CLUSTER_NAME: &str = "pull-dog";

/// Shorter expiries are treated as "never expires".
const MINIMUM_EXPIRY: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct CreatePullDogSettingsCommand {
    pub user_id: String,
    pub plan_id: String,
    pub pool_size: i64,
    pub api_key: String,
}

impl std::fmt::Debug for CreatePullDogSettingsCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatePullDogSettingsCommand")
            .field("user_id", &self.user_id)
            .field("plan_id", &self.plan_id)
            .field("pool_size", &self.pool_size)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl Request for CreatePullDogSettingsCommand {
    type Response = PullDogSettingsRecord;
    const NAME: &'static str = "CreatePullDogSettingsCommand";
}

#[derive(Debug, Clone)]
pub struct EnsurePullDogRepositoryCommand {
    pub settings_id: String,
    pub handle: String,
    pub installation_id: Option<i64>,
}

impl Request for EnsurePullDogRepositoryCommand {
    type Response = PullDogRepositoryRecord;
    const NAME: &'static str = "EnsurePullDogRepositoryCommand";
}

#[derive(Debug, Clone)]
pub struct EnsurePullDogPullRequestCommand {
    pub repository_id: String,
    pub handle: String,
}

impl Request for EnsurePullDogPullRequestCommand {
    type Response = PullDogPullRequestRecord;
    const NAME: &'static str = "EnsurePullDogPullRequestCommand";
}

#[derive(Debug, Clone)]
pub struct OverrideConfigurationForPullRequestCommand {
    pub pull_request_id: String,
    pub configuration_override: ConfigurationFileOverride,
}

impl Request for OverrideConfigurationForPullRequestCommand {
    type Response = ();
    const NAME: &'static str = "OverrideConfigurationForPullRequestCommand";
}

/// Effective configuration of a pull request: `base` (or the default) with its override applied.
#[derive(Debug, Clone)]
pub struct GetConfigurationForPullRequestQuery {
    pub pull_request_id: String,
    pub base: Option<ConfigurationFile>,
}

impl Request for GetConfigurationForPullRequestQuery {
    type Response = ConfigurationFile;
    const NAME: &'static str = "GetConfigurationForPullRequestQuery";
}

#[derive(Debug, Clone)]
pub struct GetAvailableClusterForPullRequestQuery {
    pub pull_request_id: String,
}

impl Request for GetAvailableClusterForPullRequestQuery {
    type Response = ClusterRecord;
    const NAME: &'static str = "GetAvailableClusterForPullRequestQuery";
}

#[derive(Debug, Clone)]
pub struct EnsurePullDogDatabaseInstanceCommand {
    pub pull_request_id: String,
    pub configuration: ConfigurationFile,
}

impl Request for EnsurePullDogDatabaseInstanceCommand {
    type Response = InstanceRecord;
    const NAME: &'static str = "EnsurePullDogDatabaseInstanceCommand";
}

#[derive(Clone, Default)]
pub struct PullDogCommands {
    cipher: Option<SecretCipher>,
}

impl std::fmt::Debug for PullDogCommands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullDogCommands")
            .field("cipher", &self.cipher.is_some())
            .finish()
    }
}

impl PullDogCommands {
    #[must_use]
    pub fn new(cipher: Option<SecretCipher>) -> Self {
        Self { cipher }
    }
}

async fn settings_for_pull_request(
    store: &mut Store<'_>,
    pull_request_id: &str,
) -> Result<PullDogSettingsRecord> {
    if store
        .get_pull_dog_pull_request_by_id(pull_request_id)
        .await?
        .is_none()
    {
        return Err(CommandError::PullRequestNotFound(pull_request_id.to_string()).into());
    }

    store
        .get_pull_dog_settings_for_pull_request(pull_request_id)
        .await?
        .ok_or_else(|| CommandError::SettingsNotFound(pull_request_id.to_string()).into())
}

fn expiry_from_now(expiry: Duration, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    if expiry < MINIMUM_EXPIRY {
        return Ok(None);
    }

    let delta = chrono::Duration::from_std(expiry).context("expiry is out of range")?;
    now.checked_add_signed(delta)
        .map(Some)
        .context("expiry is out of range")
}

#[async_trait]
impl Handler<CreatePullDogSettingsCommand> for PullDogCommands {
    async fn handle(
        &self,
        request: CreatePullDogSettingsCommand,
        context: &mut DispatchContext<'_>,
    ) -> Result<PullDogSettingsRecord> {
        let cipher = self.cipher.as_ref().ok_or(CommandError::EncryptionKeyMissing)?;

        let settings = NewPullDogSettings {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id,
            plan_id: request.plan_id,
            pool_size: request.pool_size,
            encrypted_api_key: cipher.encrypt(&request.api_key)?,
        };

        let mut store = context.store();
        store.ensure_user(&settings.user_id).await?;
        store.insert_pull_dog_settings(&settings).await?;

        store
            .get_pull_dog_settings_by_id(&settings.id)
            .await?
            .with_context(|| format!("pull dog settings {} disappeared after insert", settings.id))
    }
}

#[async_trait]
impl Handler<EnsurePullDogRepositoryCommand> for PullDogCommands {
    async fn handle(
        &self,
        request: EnsurePullDogRepositoryCommand,
        context: &mut DispatchContext<'_>,
    ) -> Result<PullDogRepositoryRecord> {
        let mut store = context.store();
        if let Some(repository) = store
            .get_pull_dog_repository(&request.settings_id, &request.handle)
            .await?
        {
            return Ok(repository);
        }

        store
            .insert_pull_dog_repository(&NewPullDogRepository {
                id: Uuid::new_v4().to_string(),
                settings_id: request.settings_id.clone(),
                handle: request.handle.clone(),
                installation_id: request.installation_id,
            })
            .await?;

        store
            .get_pull_dog_repository(&request.settings_id, &request.handle)
            .await?
            .with_context(|| format!("repository {} disappeared after insert", request.handle))
    }
}

#[async_trait]
impl Handler<EnsurePullDogPullRequestCommand> for PullDogCommands {
    async fn handle(
        &self,
        request: EnsurePullDogPullRequestCommand,
        context: &mut DispatchContext<'_>,
    ) -> Result<PullDogPullRequestRecord> {
        let mut store = context.store();
        if let Some(pull_request) = store
            .get_pull_dog_pull_request(&request.repository_id, &request.handle)
            .await?
        {
            return Ok(pull_request);
        }

        insert_or_fetch_pull_request(
            &mut store,
            &NewPullDogPullRequest {
                id: Uuid::new_v4().to_string(),
                repository_id: request.repository_id,
                handle: request.handle,
            },
        )
        .await
    }
}

/// Inserts `pull_request` unless a concurrent caller got there first, then reads the stored row.
pub(super) async fn insert_or_fetch_pull_request(
    store: &mut Store<'_>,
    pull_request: &NewPullDogPullRequest,
) -> Result<PullDogPullRequestRecord> {
    if !store.insert_pull_dog_pull_request(pull_request).await? {
        info!(
            repository_id = %pull_request.repository_id,
            handle = %pull_request.handle,
            "pull request was inserted concurrently"
        );
    }

    store
        .get_pull_dog_pull_request(&pull_request.repository_id, &pull_request.handle)
        .await?
        .with_context(|| format!("pull request {} disappeared after insert", pull_request.handle))
}

#[async_trait]
impl Handler<OverrideConfigurationForPullRequestCommand> for PullDogCommands {
    async fn handle(
        &self,
        request: OverrideConfigurationForPullRequestCommand,
        context: &mut DispatchContext<'_>,
    ) -> Result<()> {
        if !context
            .store()
            .set_pull_dog_configuration_override(
                &request.pull_request_id,
                &request.configuration_override,
            )
            .await?
        {
            return Err(CommandError::PullRequestNotFound(request.pull_request_id).into());
        }

        Ok(())
    }
}

#[async_trait]
impl Handler<GetConfigurationForPullRequestQuery> for PullDogCommands {
    async fn handle(
        &self,
        request: GetConfigurationForPullRequestQuery,
        context: &mut DispatchContext<'_>,
    ) -> Result<ConfigurationFile> {
        let pull_request = context
            .store()
            .get_pull_dog_pull_request_by_id(&request.pull_request_id)
            .await?
            .ok_or_else(|| CommandError::PullRequestNotFound(request.pull_request_id.clone()))?;

        let base = request.base.unwrap_or_default();
        Ok(match pull_request.configuration_override {
            Some(configuration_override) => base.with_override(&configuration_override),
            None => base,
        })
    }
}

#[async_trait]
impl Handler<GetAvailableClusterForPullRequestQuery> for PullDogCommands {
    async fn handle(
        &self,
        request: GetAvailableClusterForPullRequestQuery,
        context: &mut DispatchContext<'_>,
    ) -> Result<ClusterRecord> {
        let mut store = context.store();
        let settings = settings_for_pull_request(&mut store, &request.pull_request_id).await?;

        // A pull request that already owns an instance keeps its slot.
        if let Some(instance) = store
            .get_instance_for_pull_request(&request.pull_request_id)
            .await?
        {
            return store
                .get_cluster_by_id(&instance.cluster_id)
                .await?
                .ok_or_else(|| CommandError::ClusterNotFound(instance.cluster_id).into());
        }

        let in_use = store
            .count_pull_dog_instances_for_settings(&settings.id)
            .await?;
        if in_use >= settings.pool_size {
            return Err(CommandError::PoolSizeExceeded {
                pool_size: settings.pool_size,
            }
            .into());
        }

        store.ensure_user(&settings.user_id).await?;
        if let Some(cluster) = store
            .list_clusters_for_user(&settings.user_id)
            .await?
            .into_iter()
            .find(|cluster| cluster.name == PULL_DOG_CLUSTER_NAME)
        {
            return Ok(cluster);
        }

        let cluster = NewCluster {
            id: Uuid::new_v4().to_string(),
            user_id: Some(settings.user_id.clone()),
            name: PULL_DOG_CLUSTER_NAME.to_string(),
        };
        store.insert_cluster(&cluster).await?;
        info!(user_id = %settings.user_id, cluster_id = %cluster.id, "pull dog cluster created");

        store
            .get_cluster_by_id(&cluster.id)
            .await?
            .with_context(|| format!("cluster {} disappeared after insert", cluster.id))
    }
}

#[async_trait]
impl Handler<EnsurePullDogDatabaseInstanceCommand> for PullDogCommands {
    async fn handle(
        &self,
        request: EnsurePullDogDatabaseInstanceCommand,
        context: &mut DispatchContext<'_>,
    ) -> Result<InstanceRecord> {
        let expires_at = expiry_from_now(request.configuration.expiry, Utc::now())?;

        let cluster = context
            .dispatch(GetAvailableClusterForPullRequestQuery {
                pull_request_id: request.pull_request_id.clone(),
            })
            .await?;

        let mut store = context.store();
        if let Some(instance) = store
            .get_instance_for_pull_request(&request.pull_request_id)
            .await?
        {
            store.set_instance_expiry(&instance.name, expires_at).await?;
            return store
                .get_instance_by_name(&instance.name)
                .await?
                .ok_or_else(|| CommandError::InstanceNotFound(instance.name).into());
        }

        let settings = settings_for_pull_request(&mut store, &request.pull_request_id).await?;
        let instance = NewInstance {
            id: Uuid::new_v4().to_string(),
            cluster_id: cluster.id,
            name: format!("{PULL_DOG_CLUSTER_NAME}_{}_{}", settings.user_id, Uuid::new_v4()),
            plan_id: settings.plan_id,
            instance_type: InstanceType::DockerCompose,
            is_provisioned: false,
            expires_at,
            pull_dog_pull_request_id: Some(request.pull_request_id.clone()),
        };
        store.insert_instance(&instance).await?;
        info!(
            instance = %instance.name,
            pull_request_id = %request.pull_request_id,
            "pull dog instance registered"
        );

        store
            .get_instance_by_name(&instance.name)
            .await?
            .with_context(|| format!("instance {} disappeared after insert", instance.name))
    }
}
