use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::{
    CommandError, EnsureClusterWithIdCommand, EnsurePullDogDatabaseInstanceCommand,
    GetClusterForUserQuery, GetConfigurationForPullRequestQuery,
};
use crate::configuration::ConfigurationFile;
use crate::db::{
    ClusterRecord, InstanceRecord, InstanceType, NewCluster, NewInstance, DEMO_CLUSTER_ID,
};
use crate::dispatch::{DispatchContext, Handler, Request};
use crate::provisioning::{
    InstanceFile, ProvisioningOutcome, ProvisioningRun, RegistryAuthentication, StageEngine,
    StageKind,
};

const DEFAULT_USER_CLUSTER_NAME: &str = "default";

/// Whose cluster the instance is provisioned into.
#[derive(Debug, Clone)]
pub enum ProvisionTarget {
    Demo,
    User {
        user_id: String,
        cluster_id: Option<String>,
    },
    PullRequest {
        pull_request_id: String,
        configuration: ConfigurationFile,
    },
}

/// Registers (or reuses) an instance and runs the provisioning pipeline against it.
#[derive(Debug, Clone)]
pub struct ProvisionInstanceCommand {
    pub target: ProvisionTarget,
    pub instance_name: Option<String>,
    pub plan_id: String,
    pub ip_address: Option<String>,
    pub compose_documents: Vec<String>,
    pub files: Vec<InstanceFile>,
    pub authentication: Vec<RegistryAuthentication>,
    pub build_arguments: BTreeMap<String, String>,
}

impl Request for ProvisionInstanceCommand {
    type Response = ProvisioningReport;
    const NAME: &'static str = "ProvisionInstanceCommand";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisioningReport {
    pub instance: InstanceRecord,
    pub stages: Vec<StageKind>,
}

#[derive(Debug, Clone)]
pub struct ProvisionInstanceHandler {
    engine: StageEngine,
}

impl ProvisionInstanceHandler {
    #[must_use]
    pub fn new(engine: StageEngine) -> Self {
        Self { engine }
    }
}

async fn cluster_for_user(
    context: &mut DispatchContext<'_>,
    user_id: &str,
    cluster_id: Option<String>,
) -> Result<ClusterRecord> {
    context.store().ensure_user(user_id).await?;

    let existing = context
        .dispatch(GetClusterForUserQuery {
            user_id: user_id.to_string(),
            cluster_id: cluster_id.clone(),
        })
        .await?;

    match (existing, cluster_id) {
        (Some(cluster), _) => Ok(cluster),
        (None, Some(cluster_id)) => Err(CommandError::ClusterNotFound(cluster_id).into()),
        (None, None) => {
            let cluster = NewCluster {
                id: Uuid::new_v4().to_string(),
                user_id: Some(user_id.to_string()),
                name: DEFAULT_USER_CLUSTER_NAME.to_string(),
            };
            let mut store = context.store();
            store.insert_cluster(&cluster).await?;
            info!(user_id, cluster_id = %cluster.id, "user cluster created");

            store
                .get_cluster_by_id(&cluster.id)
                .await?
                .with_context(|| format!("cluster {} disappeared after insert", cluster.id))
        }
    }
}

async fn instance_in_cluster(
    context: &mut DispatchContext<'_>,
    cluster: &ClusterRecord,
    instance_name: Option<String>,
    plan_id: &str,
) -> Result<InstanceRecord> {
    let name = instance_name.unwrap_or_else(|| Uuid::new_v4().to_string());
    let mut store = context.store();

    if let Some(instance) = store.get_instance_by_name(&name).await? {
        if instance.cluster_id != cluster.id {
            return Err(CommandError::InstanceClusterMismatch {
                instance_name: name,
            }
            .into());
        }
        return Ok(instance);
    }

    store
        .insert_instance(&NewInstance {
            id: Uuid::new_v4().to_string(),
            cluster_id: cluster.id.clone(),
            name: name.clone(),
            plan_id: plan_id.to_string(),
            instance_type: InstanceType::DockerCompose,
            is_provisioned: false,
            expires_at: None,
            pull_dog_pull_request_id: None,
        })
        .await?;

    store
        .get_instance_by_name(&name)
        .await?
        .with_context(|| format!("instance {name} disappeared after insert"))
}

#[async_trait]
impl Handler<ProvisionInstanceCommand> for ProvisionInstanceHandler {
    async fn handle(
        &self,
        request: ProvisionInstanceCommand,
        context: &mut DispatchContext<'_>,
    ) -> Result<ProvisioningReport> {
        let mut build_arguments = BTreeMap::new();

        let instance = match request.target {
            ProvisionTarget::Demo => {
                let cluster = context
                    .dispatch(EnsureClusterWithIdCommand {
                        id: DEMO_CLUSTER_ID.to_string(),
                    })
                    .await?;

                let occupied = context
                    .store()
                    .list_instances_for_cluster(&cluster.id)
                    .await?
                    .into_iter()
                    .any(|instance| Some(&instance.name) != request.instance_name.as_ref());
                if occupied {
                    return Err(CommandError::DemoInstanceAlreadyProvisioned.into());
                }

                instance_in_cluster(context, &cluster, request.instance_name, &request.plan_id)
                    .await?
            }
            ProvisionTarget::User {
                user_id,
                cluster_id,
            } => {
                let cluster = cluster_for_user(context, &user_id, cluster_id).await?;
                instance_in_cluster(context, &cluster, request.instance_name, &request.plan_id)
                    .await?
            }
            ProvisionTarget::PullRequest {
                pull_request_id,
                configuration,
            } => {
                // A stored override wins over the repository configuration.
                let configuration = context
                    .dispatch(GetConfigurationForPullRequestQuery {
                        pull_request_id: pull_request_id.clone(),
                        base: Some(configuration),
                    })
                    .await?;

                build_arguments.clone_from(&configuration.build_arguments);
                context
                    .dispatch(EnsurePullDogDatabaseInstanceCommand {
                        pull_request_id,
                        configuration,
                    })
                    .await?
            }
        };

        build_arguments.extend(request.build_arguments);

        let run = ProvisioningRun {
            instance_name: instance.name.clone(),
            ip_address: request.ip_address,
            compose_documents: request.compose_documents,
            files: request.files,
            authentication: request.authentication,
            build_arguments,
        };

        match self.engine.run(&run, context).await? {
            ProvisioningOutcome::Completed { stages } => {
                let instance = context
                    .store()
                    .get_instance_by_name(&instance.name)
                    .await?
                    .ok_or_else(|| CommandError::InstanceNotFound(instance.name.clone()))?;

                Ok(ProvisioningReport { instance, stages })
            }
            ProvisioningOutcome::Failed { stage, failure } => {
                Err(CommandError::ProvisioningFailed { stage, failure }.into())
            }
        }
    }
}
