use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::CommandError;
use crate::db::{ClusterWithInstances, InstanceRecord};
use crate::dispatch::{DispatchContext, Handler, Request};

#[derive(Debug, Clone)]
pub struct RegisterInstanceAsProvisionedCommand {
    pub instance_name: String,
}

impl Request for RegisterInstanceAsProvisionedCommand {
    type Response = ();
    const NAME: &'static str = "RegisterInstanceAsProvisionedCommand";
}

/// Sets when an instance should be torn down. `None` keeps it forever.
#[derive(Debug, Clone)]
pub struct SetInstanceExpiryCommand {
    pub instance_name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Request for SetInstanceExpiryCommand {
    type Response = ();
    const NAME: &'static str = "SetInstanceExpiryCommand";
}

#[derive(Debug, Clone)]
pub struct DeleteInstanceByNameCommand {
    pub instance_name: String,
}

impl Request for DeleteInstanceByNameCommand {
    type Response = bool;
    const NAME: &'static str = "DeleteInstanceByNameCommand";
}

#[derive(Debug, Clone)]
pub struct GetProvisionedClustersWithInstancesForUserQuery {
    pub user_id: String,
}

impl Request for GetProvisionedClustersWithInstancesForUserQuery {
    type Response = Vec<ClusterWithInstances>;
    const NAME: &'static str = "GetProvisionedClustersWithInstancesForUserQuery";
}

#[derive(Debug, Clone)]
pub struct GetExpiredInstancesQuery {
    pub now: DateTime<Utc>,
}

impl Request for GetExpiredInstancesQuery {
    type Response = Vec<InstanceRecord>;
    const NAME: &'static str = "GetExpiredInstancesQuery";
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceCommands;

#[async_trait]
impl Handler<RegisterInstanceAsProvisionedCommand> for InstanceCommands {
    async fn handle(
        &self,
        request: RegisterInstanceAsProvisionedCommand,
        context: &mut DispatchContext<'_>,
    ) -> Result<()> {
        if !context
            .store()
            .set_instance_provisioned(&request.instance_name)
            .await?
        {
            return Err(CommandError::InstanceNotFound(request.instance_name).into());
        }

        Ok(())
    }
}

#[async_trait]
impl Handler<SetInstanceExpiryCommand> for InstanceCommands {
    async fn handle(
        &self,
        request: SetInstanceExpiryCommand,
        context: &mut DispatchContext<'_>,
    ) -> Result<()> {
        if !context
            .store()
            .set_instance_expiry(&request.instance_name, request.expires_at)
            .await?
        {
            return Err(CommandError::InstanceNotFound(request.instance_name).into());
        }

        Ok(())
    }
}

#[async_trait]
impl Handler<DeleteInstanceByNameCommand> for InstanceCommands {
    async fn handle(
        &self,
        request: DeleteInstanceByNameCommand,
        context: &mut DispatchContext<'_>,
    ) -> Result<bool> {
        context
            .store()
            .delete_instance_by_name(&request.instance_name)
            .await
    }
}

#[async_trait]
impl Handler<GetProvisionedClustersWithInstancesForUserQuery> for InstanceCommands {
    async fn handle(
        &self,
        request: GetProvisionedClustersWithInstancesForUserQuery,
        context: &mut DispatchContext<'_>,
    ) -> Result<Vec<ClusterWithInstances>> {
        context
            .store()
            .list_provisioned_clusters_with_instances_for_user(&request.user_id)
            .await
    }
}

#[async_trait]
impl Handler<GetExpiredInstancesQuery> for InstanceCommands {
    async fn handle(
        &self,
        request: GetExpiredInstancesQuery,
        context: &mut DispatchContext<'_>,
    ) -> Result<Vec<InstanceRecord>> {
        context.store().list_expired_instances(request.now).await
    }
}
