// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Async job runner.
//!
//! A job body runs as a tokio task on a bounded pool. The caller waits for it
//! up to a timeout; if the body has not finished by then the caller gets
//! [`JobOutcome::GoingAsync`] with the job id and the task keeps running,
//! reporting progress through its [`AsyncJobCallback`]. Status and result
//! land in the [`StateStore`] so any later call can poll them.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{JobsConfig, SaturationPolicy};
use crate::error::{CoreError, Result};
use crate::state::{StateKey, StateStore};

/// Lifecycle state of an async job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AsyncJobState {
    /// The body is still executing.
    Running,
    /// The body returned a value.
    Complete,
    /// The body failed or panicked.
    Error,
}

/// A job failure captured into its status record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaughtError {
    /// Top-level error message.
    pub message: String,
    /// Messages of the underlying causes, outermost first.
    pub chain: Vec<String>,
}

impl From<&anyhow::Error> for CaughtError {
    fn from(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            chain: err.chain().skip(1).map(ToString::to_string).collect(),
        }
    }
}

impl std::fmt::Display for CaughtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)?;
        for cause in &self.chain {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

/// Pollable status record of an async job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncJobStatus {
    /// Job identifier.
    pub job_id: Uuid,
    /// Human-readable job name.
    pub job_name: String,
    /// Lifecycle state.
    pub state: AsyncJobState,
    /// Latest progress message.
    pub message: Option<String>,
    /// Progress counter.
    pub current: Option<u64>,
    /// Progress total.
    pub total: Option<u64>,
    /// When the job started.
    pub started_at: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Failure captured when the job ended in ERROR.
    pub caught_error: Option<CaughtError>,
}

impl AsyncJobStatus {
    fn running(job_id: Uuid, job_name: String) -> Self {
        Self {
            job_id,
            job_name,
            state: AsyncJobState::Running,
            message: None,
            current: None,
            total: None,
            started_at: Utc::now(),
            finished_at: None,
            caught_error: None,
        }
    }

    /// Whether the job is COMPLETE or ERROR.
    pub fn is_terminal(&self) -> bool {
        self.state != AsyncJobState::Running
    }

    /// The failure that ended the job, if it ended in ERROR.
    pub fn caught_error(&self) -> Option<&CaughtError> {
        self.caught_error.as_ref()
    }
}

/// Result of [`AsyncJobManager::start_job`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome<T> {
    /// The job finished within the timeout.
    Complete(T),
    /// The timeout elapsed; the job continues in the background.
    GoingAsync(Uuid),
}

impl<T> JobOutcome<T> {
    /// The completed value, if the job did not go async.
    pub fn into_complete(self) -> Option<T> {
        match self {
            Self::Complete(value) => Some(value),
            Self::GoingAsync(_) => None,
        }
    }

    /// The job id, if the job went async.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            Self::Complete(_) => None,
            Self::GoingAsync(job_id) => Some(*job_id),
        }
    }
}

/// Progress reporter handed to a running job body.
///
/// Every call persists the status immediately. Once the job has reached a
/// terminal state further updates are ignored.
#[derive(Clone)]
pub struct AsyncJobCallback {
    job_id: Uuid,
    store: Arc<dyn StateStore>,
    status: Arc<Mutex<AsyncJobStatus>>,
}

impl AsyncJobCallback {
    /// Identifier of the job this callback reports for.
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Set the progress message.
    pub async fn update_status(&self, message: impl Into<String>) -> Result<()> {
        let message = message.into();
        self.mutate(|status| status.message = Some(message)).await
    }

    /// Set the progress message and counters.
    pub async fn update_status_with_counts(
        &self,
        message: impl Into<String>,
        current: u64,
        total: u64,
    ) -> Result<()> {
        let message = message.into();
        self.mutate(|status| {
            status.message = Some(message);
            status.current = Some(current);
            status.total = Some(total);
        })
        .await
    }

    /// Set the progress counters, keeping the message.
    pub async fn update_counts(&self, current: u64, total: u64) -> Result<()> {
        self.mutate(|status| {
            status.current = Some(current);
            status.total = Some(total);
        })
        .await
    }

    /// Drop the progress counters.
    pub async fn clear_current_and_total(&self) -> Result<()> {
        self.mutate(|status| {
            status.current = None;
            status.total = None;
        })
        .await
    }

    async fn mutate(&self, apply: impl FnOnce(&mut AsyncJobStatus)) -> Result<()> {
        let mut status = self.status.lock().await;
        if status.is_terminal() {
            return Ok(());
        }
        apply(&mut status);
        // Lock is held across the write so persisted updates keep their order.
        self.store
            .put(StateKey::job_status(self.job_id), &*status)
            .await
    }

    async fn complete<T: Serialize + Sync>(&self, value: &T) -> Result<()> {
        // The result must be readable by the time a poller sees COMPLETE.
        self.store
            .put(StateKey::job_result(self.job_id), value)
            .await?;
        self.finish(AsyncJobState::Complete, None).await
    }

    async fn fail(&self, err: &anyhow::Error) -> Result<()> {
        self.finish(AsyncJobState::Error, Some(CaughtError::from(err)))
            .await
    }

    async fn finish(&self, state: AsyncJobState, caught_error: Option<CaughtError>) -> Result<()> {
        let mut status = self.status.lock().await;
        status.state = state;
        status.finished_at = Some(Utc::now());
        status.caught_error = caught_error;
        self.store
            .put(StateKey::job_status(self.job_id), &*status)
            .await
    }
}

/// Runs job bodies on a bounded pool and tracks their status.
///
/// Jobs started through a manager returned by [`nested`](Self::nested) share
/// the pool's store and status tracking but take no pool slot: the enclosing
/// job already holds one, and waiting on a second slot from the same pool
/// would deadlock once every slot is taken by an outer job.
#[derive(Clone)]
pub struct AsyncJobManager {
    store: Arc<dyn StateStore>,
    permits: Arc<Semaphore>,
    config: JobsConfig,
    nested: bool,
}

impl AsyncJobManager {
    /// Create a manager writing job status into `store`.
    pub fn new(store: Arc<dyn StateStore>, config: JobsConfig) -> Self {
        Self {
            store,
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            nested: false,
        }
    }

    /// Manager for jobs started from inside a running job.
    pub fn nested(&self) -> Self {
        Self {
            nested: true,
            ..self.clone()
        }
    }

    /// Whether jobs started here bypass the pool bound.
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// The store job status is written to.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Pool configuration.
    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// Number of free worker slots.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Start a job and wait up to `timeout` for it.
    ///
    /// Returns the body's value if it finishes in time, or
    /// [`JobOutcome::GoingAsync`] otherwise. A body that fails or panics within
    /// the timeout surfaces as [`CoreError::JobExecution`]; after the timeout
    /// the failure is only visible in the job's status.
    pub async fn start_job<T, F, Fut>(
        &self,
        job_name: impl Into<String>,
        timeout: Duration,
        job: F,
    ) -> Result<JobOutcome<T>>
    where
        T: Serialize + Send + Sync + 'static,
        F: FnOnce(AsyncJobCallback) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let job_name = job_name.into();
        let permit = if self.nested {
            None
        } else {
            Some(self.acquire_permit().await?)
        };

        let job_id = Uuid::new_v4();
        let status = AsyncJobStatus::running(job_id, job_name.clone());
        self.store.put(StateKey::job_status(job_id), &status).await?;

        let callback = AsyncJobCallback {
            job_id,
            store: self.store.clone(),
            status: Arc::new(Mutex::new(status)),
        };

        info!(job_id = %job_id, job_name = %job_name, "Async job started");

        let mut handle = tokio::spawn(run_job(permit, job_name, callback, job));

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(value))) => Ok(JobOutcome::Complete(value)),
            Ok(Ok(Err(source))) => Err(CoreError::JobExecution { job_id, source }),
            Ok(Err(join_error)) => Err(CoreError::JobExecution {
                job_id,
                source: anyhow::Error::new(join_error),
            }),
            Err(_) => {
                debug!(job_id = %job_id, timeout_ms = timeout.as_millis() as u64, "Async job going async");
                Ok(JobOutcome::GoingAsync(job_id))
            }
        }
    }

    /// Current status of a job, or `None` if the id is unknown.
    pub async fn get_job_status(&self, job_id: Uuid) -> Result<Option<AsyncJobStatus>> {
        self.store.get(&StateKey::job_status(job_id)).await
    }

    /// Result of a COMPLETE job, read back as `T`.
    pub async fn get_job_result<T: DeserializeOwned>(&self, job_id: Uuid) -> Result<Option<T>> {
        self.store.get(&StateKey::job_result(job_id)).await
    }

    /// Poll until the job is terminal or `timeout` elapses.
    pub async fn wait_for_job(
        &self,
        job_id: Uuid,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<AsyncJobStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self
                .get_job_status(job_id)
                .await?
                .ok_or(CoreError::JobNotFound(job_id))?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CoreError::JobWaitTimeout { job_id });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        let saturated = || CoreError::JobPoolSaturated {
            max_concurrent_jobs: self.config.max_concurrent_jobs,
        };
        match self.config.saturation_policy {
            SaturationPolicy::Queue => self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| saturated()),
            SaturationPolicy::Reject => self.permits.clone().try_acquire_owned().map_err(|_| {
                warn!(
                    max_concurrent_jobs = self.config.max_concurrent_jobs,
                    "Async job pool saturated, rejecting job"
                );
                saturated()
            }),
        }
    }
}

async fn run_job<T, F, Fut>(
    _permit: Option<OwnedSemaphorePermit>,
    job_name: String,
    callback: AsyncJobCallback,
    job: F,
) -> anyhow::Result<T>
where
    T: Serialize + Send + Sync + 'static,
    F: FnOnce(AsyncJobCallback) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let job_id = callback.job_id;
    let body_callback = callback.clone();
    let outcome = AssertUnwindSafe(async move { job(body_callback).await })
        .catch_unwind()
        .await;

    let result = match outcome {
        Ok(result) => result,
        Err(payload) => Err(anyhow::anyhow!(
            "async job panicked: {}",
            panic_message(payload.as_ref())
        )),
    };

    match result {
        Ok(value) => {
            if let Err(e) = callback.complete(&value).await {
                error!(job_id = %job_id, error = %e, "Failed to persist async job completion");
            }
            info!(job_id = %job_id, job_name = %job_name, "Async job complete");
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = callback.fail(&err).await {
                error!(job_id = %job_id, error = %e, "Failed to persist async job failure");
            }
            warn!(job_id = %job_id, job_name = %job_name, error = %format!("{err:#}"), "Async job failed");
            Err(err)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
