use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use super::{
    next_stage, ProvisioningError, ProvisioningRun, Stage, StageFailure, StageKind, Transition,
};
use crate::config::ProvisionerConfig;
use crate::dispatch::DispatchContext;
use crate::ssh::SshClientFactory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub poll_interval: Duration,
    pub max_polls: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_polls: 90,
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub fn from_config(config: &ProvisionerConfig) -> Self {
        Self {
            poll_interval: config.stage_poll_interval(),
            max_polls: config.max_stage_polls(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum ProvisioningOutcome {
    Completed {
        stages: Vec<StageKind>,
    },
    Failed {
        stage: StageKind,
        failure: StageFailure,
    },
}

/// Drives stages in order until the pipeline completes or a stage fails.
#[derive(Clone)]
pub struct StageEngine {
    ssh: Arc<dyn SshClientFactory>,
    settings: EngineSettings,
}

impl std::fmt::Debug for StageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageEngine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl StageEngine {
    #[must_use]
    pub fn new(ssh: Arc<dyn SshClientFactory>, settings: EngineSettings) -> Self {
        Self { ssh, settings }
    }

    /// Runs the whole pipeline.
    ///
    /// # Errors
    /// Returns an error for faults; expected stage failures come back as
    /// [`ProvisioningOutcome::Failed`].
    pub async fn run(
        &self,
        run: &ProvisioningRun,
        context: &mut DispatchContext<'_>,
    ) -> Result<ProvisioningOutcome> {
        self.run_from(StageKind::FIRST, run, context).await
    }

    /// Runs the pipeline starting at `start`.
    ///
    /// # Errors
    /// Same as [`StageEngine::run`].
    pub async fn run_from(
        &self,
        start: StageKind,
        run: &ProvisioningRun,
        context: &mut DispatchContext<'_>,
    ) -> Result<ProvisioningOutcome> {
        let mut current = start;
        let mut completed = Vec::new();

        loop {
            if context.cancellation().is_cancelled() {
                return Err(ProvisioningError::Cancelled { stage: current }.into());
            }

            let stage = Stage::initialize(current, run)?;
            info!(instance = %run.instance_name, stage = %current, "stage started");

            let mut polls = 0;
            loop {
                let update = stage.update(self.ssh.as_ref(), context).await?;
                match next_stage(current, update) {
                    Transition::Retry(kind) => {
                        polls += 1;
                        if polls >= self.settings.max_polls {
                            return Err(
                                ProvisioningError::StageTimedOut { stage: kind, polls }.into()
                            );
                        }
                        self.wait_before_poll(kind, context).await?;
                    }
                    Transition::Advance(next) => {
                        info!(
                            instance = %run.instance_name,
                            stage = %current,
                            next = %next,
                            "stage succeeded"
                        );
                        completed.push(current);
                        current = next;
                        break;
                    }
                    Transition::Complete => {
                        completed.push(current);
                        info!(instance = %run.instance_name, "provisioning completed");
                        return Ok(ProvisioningOutcome::Completed { stages: completed });
                    }
                    Transition::Abort(failure) => {
                        warn!(
                            instance = %run.instance_name,
                            stage = %current,
                            error_code = %failure.error_code,
                            "stage failed"
                        );
                        return Ok(ProvisioningOutcome::Failed {
                            stage: current,
                            failure,
                        });
                    }
                }
            }
        }
    }

    async fn wait_before_poll(
        &self,
        stage: StageKind,
        context: &DispatchContext<'_>,
    ) -> Result<()> {
        tokio::select! {
            () = context.cancellation().cancelled() => {
                Err(ProvisioningError::Cancelled { stage }.into())
            }
            () = tokio::time::sleep(self.settings.poll_interval) => Ok(()),
        }
    }
}
