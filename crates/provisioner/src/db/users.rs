use anyhow::Result;

use super::Store;

impl Store<'_> {
    /// Makes sure a user row exists for an externally established identity.
    ///
    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn ensure_user(&mut self, user_id: &str) -> Result<()> {
        sqlx::query("INSERT INTO users (id) VALUES (?1) ON CONFLICT(id) DO NOTHING")
            .bind(user_id)
            .execute(&mut *self.connection)
            .await?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn user_exists(&mut self, user_id: &str) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_one(&mut *self.connection)
            .await?;

        Ok(count > 0)
    }
}
