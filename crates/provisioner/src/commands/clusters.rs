use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::CommandError;
use crate::db::{ClusterRecord, NewCluster, Store, DEMO_CLUSTER_ID};
use crate::dispatch::{DispatchContext, Handler, Request};

/// Returns the cluster with `id`, creating an unowned one if it does not exist yet.
#[derive(Debug, Clone)]
pub struct EnsureClusterWithIdCommand {
    pub id: String,
}

impl Request for EnsureClusterWithIdCommand {
    type Response = ClusterRecord;
    const NAME: &'static str = "EnsureClusterWithIdCommand";
}

/// Finds the user's cluster. Without an id the user must have at most one.
#[derive(Debug, Clone)]
pub struct GetClusterForUserQuery {
    pub user_id: String,
    pub cluster_id: Option<String>,
}

impl Request for GetClusterForUserQuery {
    type Response = Option<ClusterRecord>;
    const NAME: &'static str = "GetClusterForUserQuery";
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterCommands;

#[async_trait]
impl Handler<EnsureClusterWithIdCommand> for ClusterCommands {
    async fn handle(
        &self,
        request: EnsureClusterWithIdCommand,
        context: &mut DispatchContext<'_>,
    ) -> Result<ClusterRecord> {
        let mut store = context.store();
        if let Some(cluster) = store.get_cluster_by_id(&request.id).await? {
            return Ok(cluster);
        }

        let name = if request.id == DEMO_CLUSTER_ID {
            "demo".to_string()
        } else {
            request.id.clone()
        };

        insert_or_fetch_cluster(
            &mut store,
            &NewCluster {
                id: request.id,
                user_id: None,
                name,
            },
        )
        .await
    }
}

/// Inserts `cluster` unless a concurrent caller got there first, then reads the stored row.
pub(super) async fn insert_or_fetch_cluster(
    store: &mut Store<'_>,
    cluster: &NewCluster,
) -> Result<ClusterRecord> {
    if !store.insert_cluster(cluster).await? {
        info!(cluster_id = %cluster.id, "cluster was inserted concurrently");
    }

    store
        .get_cluster_by_id(&cluster.id)
        .await?
        .with_context(|| format!("cluster {} disappeared after insert", cluster.id))
}

#[async_trait]
impl Handler<GetClusterForUserQuery> for ClusterCommands {
    async fn handle(
        &self,
        request: GetClusterForUserQuery,
        context: &mut DispatchContext<'_>,
    ) -> Result<Option<ClusterRecord>> {
        let clusters = context
            .store()
            .list_clusters_for_user(&request.user_id)
            .await?;

        match request.cluster_id {
            Some(cluster_id) => Ok(clusters.into_iter().find(|cluster| cluster.id == cluster_id)),
            None if clusters.len() > 1 => Err(CommandError::ClusterQueryTooBroad {
                user_id: request.user_id,
            }
            .into()),
            None => Ok(clusters.into_iter().next()),
        }
    }
}
