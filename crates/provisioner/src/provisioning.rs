//! Stage-based provisioning of a Docker Compose workload onto one host.
//!
//! A run walks `InstallSoftware -> RunDockerCompose -> CompleteInstanceSetup`. Every stage is
//! idempotent, so an interrupted or cancelled run is simply started again from the top.

use std::fmt;

use anyhow::Result;
use serde::Serialize;

use crate::dispatch::DispatchContext;
use crate::ssh::SshClientFactory;

mod complete_instance_setup;
mod engine;
mod install_software;
mod run;
mod run_docker_compose;

pub use complete_instance_setup::CompleteInstanceSetupStage;
pub use engine::{EngineSettings, ProvisioningOutcome, StageEngine};
pub use install_software::InstallSoftwareStage;
pub use run::{InstanceFile, ProvisioningRun, RegistryAuthentication};
pub use run_docker_compose::{RunDockerComposeStage, DOCKER_COMPOSE_UP_FAIL};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    InstallSoftware,
    RunDockerCompose,
    CompleteInstanceSetup,
}

impl StageKind {
    pub const FIRST: Self = Self::InstallSoftware;

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InstallSoftware => "install-software",
            Self::RunDockerCompose => "run-docker-compose",
            Self::CompleteInstanceSetup => "complete-instance-setup",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected failure of a stage, reported to callers as problem details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{error_code}: {title}")]
pub struct StageFailure {
    pub error_code: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageUpdate {
    Succeeded,
    /// Remote work is still settling; poll the same stage again.
    InProgress,
    Failed(StageFailure),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Advance(StageKind),
    Retry(StageKind),
    Complete,
    Abort(StageFailure),
}

/// Resolves what follows `current` after it reported `update`.
#[must_use]
pub fn next_stage(current: StageKind, update: StageUpdate) -> Transition {
    match update {
        StageUpdate::InProgress => Transition::Retry(current),
        StageUpdate::Failed(failure) => Transition::Abort(failure),
        StageUpdate::Succeeded => match current {
            StageKind::InstallSoftware => Transition::Advance(StageKind::RunDockerCompose),
            StageKind::RunDockerCompose => Transition::Advance(StageKind::CompleteInstanceSetup),
            StageKind::CompleteInstanceSetup => Transition::Complete,
        },
    }
}

/// Faults that abort a run without being a remote stage failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    #[error("stage {stage} requires the {parameter} run parameter")]
    MissingRunParameter {
        stage: StageKind,
        parameter: &'static str,
    },
    #[error("stage {stage} received an invalid {parameter}: {reason}")]
    InvalidRunParameter {
        stage: StageKind,
        parameter: &'static str,
        reason: String,
    },
    #[error("stage {stage} was still in progress after {polls} polls")]
    StageTimedOut { stage: StageKind, polls: u32 },
    #[error("provisioning was cancelled during stage {stage}")]
    Cancelled { stage: StageKind },
}

#[derive(Debug, Clone)]
pub enum Stage {
    InstallSoftware(InstallSoftwareStage),
    RunDockerCompose(RunDockerComposeStage),
    CompleteInstanceSetup(CompleteInstanceSetupStage),
}

impl Stage {
    /// Validates the run parameters `kind` needs and prepares the stage.
    ///
    /// # Errors
    /// Returns a [`ProvisioningError`] when a parameter is missing or invalid.
    pub fn initialize(kind: StageKind, run: &ProvisioningRun) -> Result<Self, ProvisioningError> {
        Ok(match kind {
            StageKind::InstallSoftware => {
                Self::InstallSoftware(InstallSoftwareStage::initialize(run)?)
            }
            StageKind::RunDockerCompose => {
                Self::RunDockerCompose(RunDockerComposeStage::initialize(run)?)
            }
            StageKind::CompleteInstanceSetup => {
                Self::CompleteInstanceSetup(CompleteInstanceSetupStage::initialize(run)?)
            }
        })
    }

    #[must_use]
    pub fn kind(&self) -> StageKind {
        match self {
            Self::InstallSoftware(_) => StageKind::InstallSoftware,
            Self::RunDockerCompose(_) => StageKind::RunDockerCompose,
            Self::CompleteInstanceSetup(_) => StageKind::CompleteInstanceSetup,
        }
    }

    /// Performs one unit of remote work.
    ///
    /// # Errors
    /// Returns an error for faults: unreachable hosts, exhausted retries, failed sub-commands.
    pub async fn update(
        &self,
        ssh: &dyn SshClientFactory,
        context: &mut DispatchContext<'_>,
    ) -> Result<StageUpdate> {
        match self {
            Self::InstallSoftware(stage) => stage.update(ssh, context).await,
            Self::RunDockerCompose(stage) => stage.update(ssh, context).await,
            Self::CompleteInstanceSetup(stage) => stage.update(ssh, context).await,
        }
    }
}

pub(crate) fn require_ip_address(
    stage: StageKind,
    run: &ProvisioningRun,
) -> Result<String, ProvisioningError> {
    run.ip_address
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .ok_or(ProvisioningError::MissingRunParameter {
            stage,
            parameter: "ip address",
        })
}
