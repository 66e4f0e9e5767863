// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step execution engine.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::definition::{ProcessDefinition, ProcessRegistry, StepContext, StepDefinition};
use super::state::{FrontendStepBehavior, ProcessState, RunProcessInput, RunProcessOutput, RunStatus};
use crate::config::EtlConfig;
use crate::error::{CoreError, Result};
use crate::jobs::{AsyncJobManager, JobOutcome};
use crate::state::{StateKey, StateStore};

/// Runs processes step by step, persisting state between steps.
///
/// Cheap to clone; clones share the registry, store, job manager and the
/// set of runs currently executing.
#[derive(Clone)]
pub struct ProcessRunner {
    registry: Arc<ProcessRegistry>,
    store: Arc<dyn StateStore>,
    jobs: AsyncJobManager,
    etl_config: EtlConfig,
    active_runs: Arc<ActiveRuns>,
}

impl ProcessRunner {
    /// Create a runner.
    pub fn new(
        registry: Arc<ProcessRegistry>,
        store: Arc<dyn StateStore>,
        jobs: AsyncJobManager,
    ) -> Self {
        Self {
            registry,
            store,
            jobs,
            etl_config: EtlConfig::default(),
            active_runs: Arc::new(ActiveRuns::default()),
        }
    }

    /// Set the streamed ETL tuning handed to steps.
    pub fn with_etl_config(mut self, etl_config: EtlConfig) -> Self {
        self.etl_config = etl_config;
        self
    }

    /// Streamed ETL tuning handed to steps.
    pub fn etl_config(&self) -> &EtlConfig {
        &self.etl_config
    }

    /// Process definitions.
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Job manager handed to steps.
    pub fn jobs(&self) -> &AsyncJobManager {
        &self.jobs
    }

    /// Stored state of a run.
    pub async fn get_process_state(&self, run_id: Uuid) -> Result<Option<ProcessState>> {
        self.store.get(&StateKey::process_state(run_id)).await
    }

    /// Run a process until it completes, fails or pauses at a frontend step.
    ///
    /// A second concurrent invocation for the same run id fails with
    /// [`CoreError::RunInProgress`].
    pub async fn run(&self, input: RunProcessInput) -> Result<RunProcessOutput> {
        self.execute(input, &self.jobs).await
    }

    async fn execute(
        &self,
        input: RunProcessInput,
        jobs: &AsyncJobManager,
    ) -> Result<RunProcessOutput> {
        let definition = self.registry.get(&input.process_name)?;
        let run_id = input.run_id.unwrap_or_else(Uuid::new_v4);
        let _guard = self.active_runs.acquire(run_id)?;

        let behavior = input.frontend_step_behavior;
        let (mut state, start_index) = self.prepare(&definition, run_id, input).await?;
        let remaining = &definition.steps[start_index..];

        for (offset, step) in remaining.iter().enumerate() {
            match step {
                StepDefinition::Frontend(frontend) => match behavior {
                    FrontendStepBehavior::Break => {
                        state.next_step_name = Some(frontend.name.clone());
                        state.frontend_callbacks = frontend.callbacks.clone();
                        self.persist(run_id, &mut state).await?;
                        info!(
                            run_id = %run_id,
                            process = %definition.name,
                            step = %frontend.name,
                            "Process paused at frontend step"
                        );
                        return Ok(RunProcessOutput::from_state(
                            run_id,
                            &state,
                            RunStatus::PausedAtFrontendStep,
                        ));
                    }
                    FrontendStepBehavior::Skip => {
                        debug!(run_id = %run_id, step = %frontend.name, "Skipping frontend step");
                    }
                    FrontendStepBehavior::Fail => {
                        let err = CoreError::FrontendStepNotAllowed {
                            process: definition.name.clone(),
                            step: frontend.name.clone(),
                        };
                        state.next_step_name = Some(frontend.name.clone());
                        state.last_error = Some(err.to_string());
                        self.persist(run_id, &mut state).await?;
                        error!(
                            run_id = %run_id,
                            process = %definition.name,
                            step = %frontend.name,
                            "Frontend step reached while frontend steps are not allowed"
                        );
                        return Err(err);
                    }
                },
                StepDefinition::Backend(backend) => {
                    state.next_step_name = Some(backend.name.clone());
                    debug!(run_id = %run_id, step = %backend.name, "Running backend step");

                    let result = {
                        let mut ctx = StepContext::new(
                            run_id,
                            &backend.name,
                            &mut state,
                            jobs,
                            &self.etl_config,
                        );
                        backend.step.run(&mut ctx).await
                    };

                    if let Err(source) = result {
                        // The failing step stays recorded as next.
                        state.last_error = Some(format!("{source:#}"));
                        self.persist(run_id, &mut state).await?;
                        error!(
                            run_id = %run_id,
                            process = %definition.name,
                            step = %backend.name,
                            error = %format!("{source:#}"),
                            "Backend step failed"
                        );
                        let output =
                            RunProcessOutput::from_state(run_id, &state, RunStatus::Failed);
                        return Err(CoreError::StepFailed {
                            step: backend.name.clone(),
                            output: Box::new(output),
                            source,
                        });
                    }

                    state.next_step_name = remaining
                        .get(offset + 1)
                        .map(|next| next.name().to_string());
                    self.persist(run_id, &mut state).await?;
                    debug!(run_id = %run_id, step = %backend.name, "Backend step complete");
                }
            }
        }

        state.next_step_name = None;
        state.frontend_callbacks.clear();
        self.persist(run_id, &mut state).await?;
        info!(
            run_id = %run_id,
            process = %definition.name,
            record_count = state.records.len(),
            "Process complete"
        );
        Ok(RunProcessOutput::from_state(run_id, &state, RunStatus::Complete))
    }

    /// Run a process as an async job, waiting up to `timeout` for it.
    ///
    /// The invocation always gets a run id before the job starts, so a caller
    /// that set none can still find the run through the job result. Jobs the
    /// steps start run nested under the invocation's job and take no further
    /// pool slot.
    pub async fn run_async(
        &self,
        input: RunProcessInput,
        timeout: Duration,
    ) -> Result<JobOutcome<RunProcessOutput>> {
        let run_id = input.run_id.unwrap_or_else(Uuid::new_v4);
        let input = input.with_run_id(run_id);
        let job_name = format!("run-process:{}", input.process_name);
        let runner = self.clone();

        self.jobs
            .start_job(job_name, timeout, move |callback| async move {
                callback
                    .update_status(format!("Running process '{}'", input.process_name))
                    .await?;
                let nested = runner.jobs.nested();
                let output = runner.execute(input, &nested).await?;
                Ok(output)
            })
            .await
    }

    async fn prepare(
        &self,
        definition: &ProcessDefinition,
        run_id: Uuid,
        input: RunProcessInput,
    ) -> Result<(ProcessState, usize)> {
        let start_index = match &input.start_after_step {
            Some(step) => definition
                .step_index(step)
                .map(|index| index + 1)
                .ok_or_else(|| CoreError::StepNotFound {
                    process: definition.name.clone(),
                    step: step.clone(),
                })?,
            None => 0,
        };

        // A supplied run id always continues the stored state when there is one.
        let stored = match input.run_id {
            Some(_) => self.get_process_state(run_id).await?,
            None => None,
        };
        let mut state = match stored {
            Some(state) => {
                info!(
                    run_id = %run_id,
                    process = %definition.name,
                    after_step = input.start_after_step.as_deref().unwrap_or_default(),
                    "Resuming process"
                );
                state
            }
            None if input.run_id.is_some() && input.start_after_step.is_some() => {
                return Err(CoreError::ProcessStateNotFound {
                    run_id,
                    process: definition.name.clone(),
                });
            }
            None => {
                info!(run_id = %run_id, process = %definition.name, "Starting process");
                ProcessState::new(definition.name.clone())
            }
        };

        state.process_name = definition.name.clone();
        state.values.extend(input.values);
        if !input.records.is_empty() {
            state.records = input.records;
        }

        let remaining = &definition.steps[start_index..];
        state.step_list = remaining
            .iter()
            .map(|step| step.name().to_string())
            .collect();
        state.next_step_name = state.step_list.first().cloned();
        state.frontend_callbacks.clear();
        state.last_error = None;

        self.persist(run_id, &mut state).await?;
        Ok((state, start_index))
    }

    async fn persist(&self, run_id: Uuid, state: &mut ProcessState) -> Result<()> {
        state.updated_at = Utc::now();
        self.store
            .put(StateKey::process_state(run_id), &*state)
            .await
    }
}

/// Run ids currently executing.
#[derive(Debug, Default)]
struct ActiveRuns {
    runs: Mutex<HashSet<Uuid>>,
}

impl ActiveRuns {
    fn acquire(self: &Arc<Self>, run_id: Uuid) -> Result<RunGuard> {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        if !runs.insert(run_id) {
            return Err(CoreError::RunInProgress { run_id });
        }
        Ok(RunGuard {
            runs: Arc::clone(self),
            run_id,
        })
    }

    #[cfg(test)]
    fn is_active(&self, run_id: Uuid) -> bool {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&run_id)
    }
}

/// Releases a run id when the invocation ends, however it ends.
struct RunGuard {
    runs: Arc<ActiveRuns>,
    run_id: Uuid,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.run_id);
    }
}
