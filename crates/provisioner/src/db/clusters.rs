use anyhow::Result;

use super::{is_unique_violation, ClusterRecord, NewCluster, Store};

impl Store<'_> {
    /// Inserts a cluster. Returns `false` when a cluster with the same id already exists.
    ///
    /// # Errors
    /// Returns an error if the insert fails for any other reason.
    pub async fn insert_cluster(&mut self, cluster: &NewCluster) -> Result<bool> {
        let result = sqlx::query("INSERT INTO clusters (id, user_id, name) VALUES (?1, ?2, ?3)")
            .bind(&cluster.id)
            .bind(cluster.user_id.as_deref())
            .bind(&cluster.name)
            .execute(&mut *self.connection)
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(error) if is_unique_violation(&error) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_cluster_by_id(&mut self, cluster_id: &str) -> Result<Option<ClusterRecord>> {
        let row = sqlx::query_as::<_, (String, Option<String>, String)>(
            "SELECT id, user_id, name FROM clusters WHERE id = ?1",
        )
        .bind(cluster_id)
        .fetch_optional(&mut *self.connection)
        .await?;

        Ok(row.map(|(id, user_id, name)| ClusterRecord { id, user_id, name }))
    }

    /// Lists a user's clusters, oldest first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn list_clusters_for_user(&mut self, user_id: &str) -> Result<Vec<ClusterRecord>> {
        let rows = sqlx::query_as::<_, (String, Option<String>, String)>(
            "SELECT id, user_id, name FROM clusters WHERE user_id = ?1 ORDER BY created_at, id",
        )
        .bind(user_id)
        .fetch_all(&mut *self.connection)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, user_id, name)| ClusterRecord { id, user_id, name })
            .collect())
    }
}
