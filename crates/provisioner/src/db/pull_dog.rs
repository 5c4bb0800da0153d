use anyhow::{Context, Result};

use crate::configuration::ConfigurationFileOverride;

use super::{
    is_unique_violation, NewPullDogPullRequest, NewPullDogRepository, NewPullDogSettings,
    PullDogPullRequestRecord, PullDogRepositoryRecord, PullDogSettingsRecord, Store,
};

type SettingsRow = (String, String, String, i64, String);

fn settings_from_row(row: SettingsRow) -> PullDogSettingsRecord {
    let (id, user_id, plan_id, pool_size, encrypted_api_key) = row;
    PullDogSettingsRecord {
        id,
        user_id,
        plan_id,
        pool_size,
        encrypted_api_key,
    }
}

fn pull_request_from_row(
    row: (String, String, String, Option<String>),
) -> Result<PullDogPullRequestRecord> {
    let (id, repository_id, handle, configuration_override) = row;
    let configuration_override = configuration_override
        .map(|raw| {
            serde_json::from_str::<ConfigurationFileOverride>(&raw)
                .with_context(|| {
                    format!("pull request {id} has a malformed configuration override")
                })
        })
        .transpose()?;

    Ok(PullDogPullRequestRecord {
        id,
        repository_id,
        handle,
        configuration_override,
    })
}

impl Store<'_> {
    /// # Errors
    /// Returns an error if the insert fails, including when the user already has settings.
    pub async fn insert_pull_dog_settings(&mut self, settings: &NewPullDogSettings) -> Result<()> {
        sqlx::query(
            "INSERT INTO pull_dog_settings (id, user_id, plan_id, pool_size, encrypted_api_key) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&settings.id)
        .bind(&settings.user_id)
        .bind(&settings.plan_id)
        .bind(settings.pool_size)
        .bind(&settings.encrypted_api_key)
        .execute(&mut *self.connection)
        .await?;

        Ok(())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_pull_dog_settings_by_id(
        &mut self,
        settings_id: &str,
    ) -> Result<Option<PullDogSettingsRecord>> {
        let row = sqlx::query_as::<_, SettingsRow>(
            "SELECT id, user_id, plan_id, pool_size, encrypted_api_key FROM pull_dog_settings WHERE id = ?1",
        )
        .bind(settings_id)
        .fetch_optional(&mut *self.connection)
        .await?;

        Ok(row.map(settings_from_row))
    }

    /// Settings owning the repository a pull request belongs to.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_pull_dog_settings_for_pull_request(
        &mut self,
        pull_request_id: &str,
    ) -> Result<Option<PullDogSettingsRecord>> {
        let row = sqlx::query_as::<_, SettingsRow>(
            "SELECT s.id, s.user_id, s.plan_id, s.pool_size, s.encrypted_api_key FROM pull_dog_settings s JOIN pull_dog_repositories r ON r.settings_id = s.id JOIN pull_dog_pull_requests pr ON pr.repository_id = r.id WHERE pr.id = ?1",
        )
        .bind(pull_request_id)
        .fetch_optional(&mut *self.connection)
        .await?;

        Ok(row.map(settings_from_row))
    }

    /// Inserts a repository. Returns `false` if (settings, handle) already exists.
    ///
    /// # Errors
    /// Returns an error if the insert fails for any other reason.
    pub async fn insert_pull_dog_repository(
        &mut self,
        repository: &NewPullDogRepository,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO pull_dog_repositories (id, settings_id, handle, installation_id) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&repository.id)
        .bind(&repository.settings_id)
        .bind(&repository.handle)
        .bind(repository.installation_id)
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
    pub async fn get_pull_dog_repository(
        &mut self,
        settings_id: &str,
        handle: &str,
    ) -> Result<Option<PullDogRepositoryRecord>> {
        let row = sqlx::query_as::<_, (String, String, String, Option<i64>)>(
            "SELECT id, settings_id, handle, installation_id FROM pull_dog_repositories WHERE settings_id = ?1 AND handle = ?2",
        )
        .bind(settings_id)
        .bind(handle)
        .fetch_optional(&mut *self.connection)
        .await?;

        Ok(row.map(
            |(id, settings_id, handle, installation_id)| PullDogRepositoryRecord {
                id,
                settings_id,
                handle,
                installation_id,
            },
        ))
    }

    /// Inserts a pull request. Returns `false` if (repository, handle) already exists.
    ///
    /// # Errors
    /// Returns an error if the insert fails for any other reason.
    pub async fn insert_pull_dog_pull_request(
        &mut self,
        pull_request: &NewPullDogPullRequest,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO pull_dog_pull_requests (id, repository_id, handle) VALUES (?1, ?2, ?3)",
        )
        .bind(&pull_request.id)
        .bind(&pull_request.repository_id)
        .bind(&pull_request.handle)
        .execute(&mut *self.connection)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(error) if is_unique_violation(&error) => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    /// # Errors
    /// Returns an error if the query fails or the stored override cannot be parsed.
    pub async fn get_pull_dog_pull_request(
        &mut self,
        repository_id: &str,
        handle: &str,
    ) -> Result<Option<PullDogPullRequestRecord>> {
        let row = sqlx::query_as::<_, (String, String, String, Option<String>)>(
            "SELECT id, repository_id, handle, configuration_override FROM pull_dog_pull_requests WHERE repository_id = ?1 AND handle = ?2",
        )
        .bind(repository_id)
        .bind(handle)
        .fetch_optional(&mut *self.connection)
        .await?;

        row.map(pull_request_from_row).transpose()
    }

    /// # Errors
    /// Returns an error if the query fails or the stored override cannot be parsed.
    pub async fn get_pull_dog_pull_request_by_id(
        &mut self,
        pull_request_id: &str,
    ) -> Result<Option<PullDogPullRequestRecord>> {
        let row = sqlx::query_as::<_, (String, String, String, Option<String>)>(
            "SELECT id, repository_id, handle, configuration_override FROM pull_dog_pull_requests WHERE id = ?1",
        )
        .bind(pull_request_id)
        .fetch_optional(&mut *self.connection)
        .await?;

        row.map(pull_request_from_row).transpose()
    }

    /// Replaces the stored override. Returns `false` when the pull request does not exist.
    ///
    /// # Errors
    /// Returns an error if serialization or the update fails.
    pub async fn set_pull_dog_configuration_override(
        &mut self,
        pull_request_id: &str,
        configuration_override: &ConfigurationFileOverride,
    ) -> Result<bool> {
        let raw = serde_json::to_string(configuration_override)?;
        let result = sqlx::query(
            "UPDATE pull_dog_pull_requests SET configuration_override = ?2 WHERE id = ?1",
        )
        .bind(pull_request_id)
        .bind(raw)
        .execute(&mut *self.connection)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
