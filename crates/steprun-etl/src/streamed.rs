// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Streamed extract-transform-load step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use steprun_core::CoreError;
use steprun_core::config::EtlConfig;
use steprun_core::jobs::{AsyncJobCallback, AsyncJobManager, AsyncJobState, JobOutcome};
use steprun_core::process::{BackendStep, StepContext};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{Transaction, TransactionalBackend};
use crate::error::{EtlError, Result};
use crate::pipe::RecordPipe;
use steprun_core::record::Record;

/// Process value receiving the number of loaded records.
pub const RECORD_COUNT_VALUE: &str = "record_count";

/// Process value receiving the load throughput.
pub const RECORDS_PER_SECOND_VALUE: &str = "records_per_second";

/// Producer side of a streamed ETL run. Runs inside an async job.
#[async_trait]
pub trait ExtractStep: Send + Sync {
    /// Feed every extracted record into `pipe`, reporting progress through
    /// `callback`.
    async fn extract(&self, pipe: &RecordPipe, callback: &AsyncJobCallback) -> anyhow::Result<()>;
}

/// Batch transformation between extract and load.
#[async_trait]
pub trait TransformStep: Send + Sync {
    /// Transform one drained batch.
    async fn transform(&self, records: Vec<Record>) -> anyhow::Result<Vec<Record>>;
}

/// Transform passing records through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

#[async_trait]
impl TransformStep for PassThrough {
    async fn transform(&self, records: Vec<Record>) -> anyhow::Result<Vec<Record>> {
        Ok(records)
    }
}

/// Consumer side of a streamed ETL run. Writes through the run's transaction.
#[async_trait]
pub trait LoadStep<T: Transaction>: Send + Sync {
    /// Load one transformed batch.
    async fn load(&self, txn: &mut T, records: Vec<Record>) -> anyhow::Result<()>;
}

/// Totals of a committed run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EtlSummary {
    /// Records loaded.
    pub record_count: u64,
    /// Wall time of the run.
    pub elapsed: Duration,
    /// Load throughput.
    pub records_per_second: f64,
}

/// Runs extract as a background job and loads its records in one transaction.
pub struct StreamedEtlStep<B: TransactionalBackend> {
    backend: B,
    extract: Arc<dyn ExtractStep>,
    transform: Arc<dyn TransformStep>,
    load: Arc<dyn LoadStep<B::Txn>>,
    config: Option<EtlConfig>,
}

impl<B: TransactionalBackend> StreamedEtlStep<B> {
    /// Create a step with a pass-through transform.
    ///
    /// Without [`with_config`](Self::with_config) the step uses the tuning of
    /// the process runner it runs under, or the defaults when executed
    /// directly.
    pub fn new(
        backend: B,
        extract: impl ExtractStep + 'static,
        load: impl LoadStep<B::Txn> + 'static,
    ) -> Self {
        Self {
            backend,
            extract: Arc::new(extract),
            transform: Arc::new(PassThrough),
            load: Arc::new(load),
            config: None,
        }
    }

    /// Set the transform.
    pub fn with_transform(mut self, transform: impl TransformStep + 'static) -> Self {
        self.transform = Arc::new(transform);
        self
    }

    /// Set backoff, stall and pipe tuning for this step.
    pub fn with_config(mut self, config: EtlConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Tuning set on this step, if any.
    pub fn config(&self) -> Option<&EtlConfig> {
        self.config.as_ref()
    }

    /// Run one streamed ETL pass.
    ///
    /// On success the transaction is committed; on any failure the pipe is
    /// terminated and the transaction rolled back before the error is
    /// returned. The transaction is closed on both paths.
    pub async fn execute(&self, jobs: &AsyncJobManager) -> Result<EtlSummary> {
        match &self.config {
            Some(config) => self.execute_with(jobs, config).await,
            None => self.execute_with(jobs, &EtlConfig::default()).await,
        }
    }

    async fn execute_with(
        &self,
        jobs: &AsyncJobManager,
        config: &EtlConfig,
    ) -> Result<EtlSummary> {
        let started = Instant::now();
        let mut txn = self
            .backend
            .begin_transaction()
            .await
            .map_err(EtlError::Transaction)?;
        let pipe = Arc::new(RecordPipe::new(config.pipe_capacity));

        let mut result = self.drive(jobs, config, &pipe, &mut txn).await;
        if let Ok(count) = result {
            result = txn
                .commit()
                .await
                .map(|()| count)
                .map_err(EtlError::Transaction);
        }

        if let Err(e) = &result {
            error!(error = %e, "Streamed ETL failed, rolling back");
            pipe.terminate();
            if let Err(rollback_error) = txn.rollback().await {
                warn!(error = %format!("{rollback_error:#}"), "Rollback failed");
            }
        }
        if let Err(close_error) = txn.close().await {
            warn!(error = %format!("{close_error:#}"), "Closing transaction failed");
        }

        let record_count = result?;
        let elapsed = started.elapsed();
        let records_per_second = record_count as f64 / (elapsed.as_secs_f64() + 1e-9);
        info!(
            record_count,
            elapsed_ms = elapsed.as_millis() as u64,
            records_per_second,
            "Streamed ETL committed"
        );

        Ok(EtlSummary {
            record_count,
            elapsed,
            records_per_second,
        })
    }

    async fn drive(
        &self,
        jobs: &AsyncJobManager,
        config: &EtlConfig,
        pipe: &Arc<RecordPipe>,
        txn: &mut B::Txn,
    ) -> Result<u64> {
        let extract = self.extract.clone();
        let producer = pipe.clone();
        let outcome = jobs
            .start_job("streamed-etl-extract", Duration::ZERO, move |callback| async move {
                extract.extract(&producer, &callback).await
            })
            .await;

        let job_id = match outcome {
            Ok(JobOutcome::GoingAsync(job_id)) => Some(job_id),
            Ok(JobOutcome::Complete(())) => None,
            Err(CoreError::JobExecution { job_id, source }) => {
                return Err(EtlError::ExtractFailed {
                    job_id,
                    message: format!("{source:#}"),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut record_count = 0u64;
        if let Some(job_id) = job_id {
            self.poll_until_done(jobs, config, job_id, pipe, txn, &mut record_count)
                .await?;
        }

        let trailing = pipe.consume_available_records();
        if !trailing.is_empty() {
            record_count += self.load_batch(trailing, txn).await?;
        }
        Ok(record_count)
    }

    async fn poll_until_done(
        &self,
        jobs: &AsyncJobManager,
        config: &EtlConfig,
        job_id: Uuid,
        pipe: &RecordPipe,
        txn: &mut B::Txn,
        record_count: &mut u64,
    ) -> Result<()> {
        let mut backoff = config.initial_backoff;
        let mut last_batch_at = Instant::now();

        loop {
            let batch = pipe.consume_available_records();
            if !batch.is_empty() {
                *record_count += self.load_batch(batch, txn).await?;
                backoff = config.initial_backoff;
                last_batch_at = Instant::now();
                debug!(job_id = %job_id, record_count = *record_count, "Loaded batch");
                continue;
            }

            let status = jobs
                .get_job_status(job_id)
                .await?
                .ok_or(CoreError::JobNotFound(job_id))?;
            match status.state {
                AsyncJobState::Running => {}
                AsyncJobState::Complete => return Ok(()),
                AsyncJobState::Error => {
                    return Err(EtlError::ExtractFailed {
                        job_id,
                        message: status
                            .caught_error()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "extract job failed".to_string()),
                    });
                }
            }

            let waited = last_batch_at.elapsed();
            if waited > config.stall_timeout {
                error!(
                    job_id = %job_id,
                    waited_ms = waited.as_millis() as u64,
                    "Extract job appears stalled"
                );
                return Err(EtlError::ProducerStalled { waited });
            }

            tokio::time::sleep(backoff).await;
            let next = (backoff * 2).min(config.max_backoff);
            if next != backoff {
                debug!(backoff_ms = next.as_millis() as u64, "Pipe empty, backing off");
            }
            backoff = next;
        }
    }

    async fn load_batch(&self, batch: Vec<Record>, txn: &mut B::Txn) -> Result<u64> {
        let transformed = self
            .transform
            .transform(batch)
            .await
            .map_err(EtlError::Transform)?;
        let count = transformed.len() as u64;
        self.load
            .load(txn, transformed)
            .await
            .map_err(EtlError::Load)?;
        Ok(count)
    }
}

#[async_trait]
impl<B: TransactionalBackend> BackendStep for StreamedEtlStep<B> {
    async fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        let config = self.config.as_ref().unwrap_or(ctx.etl_config());
        let summary = self.execute_with(ctx.jobs(), config).await?;
        ctx.set_value(RECORD_COUNT_VALUE, summary.record_count);
        ctx.set_value(RECORDS_PER_SECOND_VALUE, summary.records_per_second);
        Ok(())
    }
}
