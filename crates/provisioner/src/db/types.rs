use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::configuration::ConfigurationFileOverride;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    DockerCompose,
}

impl InstanceType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DockerCompose => "docker-compose",
        }
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceType {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "docker-compose" => Ok(Self::DockerCompose),
            other => bail!("unknown instance type: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCluster {
    pub id: String,
    pub user_id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NewInstance {
    pub id: String,
    pub cluster_id: String,
    pub name: String,
    pub plan_id: String,
    pub instance_type: InstanceType,
    pub is_provisioned: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub pull_dog_pull_request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRecord {
    pub id: String,
    pub cluster_id: String,
    pub name: String,
    pub plan_id: String,
    pub instance_type: InstanceType,
    pub is_provisioned: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub pull_dog_pull_request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterWithInstances {
    pub cluster: ClusterRecord,
    pub instances: Vec<InstanceRecord>,
}

#[derive(Debug, Clone)]
pub struct NewPullDogSettings {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub pool_size: i64,
    pub encrypted_api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullDogSettingsRecord {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub pool_size: i64,
    pub encrypted_api_key: String,
}

#[derive(Debug, Clone)]
pub struct NewPullDogRepository {
    pub id: String,
    pub settings_id: String,
    pub handle: String,
    pub installation_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullDogRepositoryRecord {
    pub id: String,
    pub settings_id: String,
    pub handle: String,
    pub installation_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewPullDogPullRequest {
    pub id: String,
    pub repository_id: String,
    pub handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullDogPullRequestRecord {
    pub id: String,
    pub repository_id: String,
    pub handle: String,
    pub configuration_override: Option<ConfigurationFileOverride>,
}
