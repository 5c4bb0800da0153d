use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::{ClusterRecord, ClusterWithInstances, InstanceRecord, NewInstance, Store};

type InstanceRow = (
    String,
    String,
    String,
    String,
    String,
    bool,
    Option<i64>,
    Option<String>,
);

fn instance_from_row(row: InstanceRow) -> Result<InstanceRecord> {
    let (
        id,
        cluster_id,
        name,
        plan_id,
        instance_type,
        is_provisioned,
        expires_at,
        pull_dog_pull_request_id,
    ) = row;

    let expires_at = expires_at
        .map(|seconds| {
            DateTime::<Utc>::from_timestamp(seconds, 0)
                .with_context(|| format!("instance {name} has an invalid expiry timestamp"))
        })
        .transpose()?;

    Ok(InstanceRecord {
        id,
        cluster_id,
        plan_id,
        instance_type: instance_type.parse()?,
        is_provisioned,
        expires_at,
        pull_dog_pull_request_id,
        name,
    })
}

impl Store<'_> {
    /// # Errors
    /// Returns an error if the insert fails, including when the name is already taken.
    pub async fn insert_instance(&mut self, instance: &NewInstance) -> Result<()> {
        sqlx::query(
            "INSERT INTO instances (id, cluster_id, name, plan_id, instance_type, is_provisioned, expires_at, pull_dog_pull_request_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&instance.id)
        .bind(&instance.cluster_id)
        .bind(&instance.name)
        .bind(&instance.plan_id)
        .bind(instance.instance_type.as_str())
        .bind(instance.is_provisioned)
        .bind(instance.expires_at.map(|value| value.timestamp()))
        .bind(instance.pull_dog_pull_request_id.as_deref())
        .execute(&mut *self.connection)
        .await?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_instance_by_name(&mut self, name: &str) -> Result<Option<InstanceRecord>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT id, cluster_id, name, plan_id, instance_type, is_provisioned, expires_at, pull_dog_pull_request_id FROM instances WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&mut *self.connection)
        .await?;

        row.map(instance_from_row).transpose()
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_instance_for_pull_request(
        &mut self,
        pull_request_id: &str,
    ) -> Result<Option<InstanceRecord>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT id, cluster_id, name, plan_id, instance_type, is_provisioned, expires_at, pull_dog_pull_request_id FROM instances WHERE pull_dog_pull_request_id = ?1",
        )
        .bind(pull_request_id)
        .fetch_optional(&mut *self.connection)
        .await?;

        row.map(instance_from_row).transpose()
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_instances_for_cluster(
        &mut self,
        cluster_id: &str,
    ) -> Result<Vec<InstanceRecord>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            "SELECT id, cluster_id, name, plan_id, instance_type, is_provisioned, expires_at, pull_dog_pull_request_id FROM instances WHERE cluster_id = ?1 ORDER BY created_at, name",
        )
        .bind(cluster_id)
        .fetch_all(&mut *self.connection)
        .await?;

        rows.into_iter().map(instance_from_row).collect()
    }

    /// Counts instances backing pull requests of repositories under one settings row.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn count_pull_dog_instances_for_settings(
        &mut self,
        settings_id: &str,
    ) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM instances i JOIN pull_dog_pull_requests pr ON pr.id = i.pull_dog_pull_request_id JOIN pull_dog_repositories r ON r.id = pr.repository_id WHERE r.settings_id = ?1",
        )
        .bind(settings_id)
        .fetch_one(&mut *self.connection)
        .await?;

        Ok(count)
    }

    /// Marks an instance as provisioned. Returns `false` when no instance has that name.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn set_instance_provisioned(&mut self, name: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE instances SET is_provisioned = 1 WHERE name = ?1")
            .bind(name)
            .execute(&mut *self.connection)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Sets or clears the expiry. Returns `false` when no instance has that name.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn set_instance_expiry(
        &mut self,
        name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE instances SET expires_at = ?2 WHERE name = ?1")
            .bind(name)
            .bind(expires_at.map(|value| value.timestamp()))
            .execute(&mut *self.connection)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_instance_by_name(&mut self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM instances WHERE name = ?1")
            .bind(name)
            .execute(&mut *self.connection)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Instances whose expiry is at or before `now`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_expired_instances(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Vec<InstanceRecord>> {
        let rows = sqlx::query_as::<_, InstanceRow>(
            "SELECT id, cluster_id, name, plan_id, instance_type, is_provisioned, expires_at, pull_dog_pull_request_id FROM instances WHERE expires_at IS NOT NULL AND expires_at <= ?1 ORDER BY expires_at, name",
        )
        .bind(now.timestamp())
        .fetch_all(&mut *self.connection)
        .await?;

        rows.into_iter().map(instance_from_row).collect()
    }

    /// Groups a user's provisioned instances by cluster. Clusters without any are left out.
    ///
    /// # Errors
    /// Returns an error if a query fails.
    pub async fn list_provisioned_clusters_with_instances_for_user(
        &mut self,
        user_id: &str,
    ) -> Result<Vec<ClusterWithInstances>> {
        let clusters = self.list_clusters_for_user(user_id).await?;

        let rows = sqlx::query_as::<_, InstanceRow>(
            "SELECT i.id, i.cluster_id, i.name, i.plan_id, i.instance_type, i.is_provisioned, i.expires_at, i.pull_dog_pull_request_id FROM instances i JOIN clusters c ON c.id = i.cluster_id WHERE c.user_id = ?1 AND i.is_provisioned = 1 ORDER BY i.created_at, i.name",
        )
        .bind(user_id)
        .fetch_all(&mut *self.connection)
        .await?;

        let mut instances = rows
            .into_iter()
            .map(instance_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(clusters
            .into_iter()
            .filter_map(|cluster: ClusterRecord| {
                let (owned, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut instances)
                    .into_iter()
                    .partition(|instance| instance.cluster_id == cluster.id);
                instances = rest;

                if owned.is_empty() {
                    None
                } else {
                    Some(ClusterWithInstances {
                        cluster,
                        instances: owned,
                    })
                }
            })
            .collect())
    }
}
