// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for steprun-etl integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use steprun_core::config::{EtlConfig, JobsConfig};
use steprun_core::jobs::{AsyncJobCallback, AsyncJobManager};
use steprun_core::state::InMemoryStateStore;
use steprun_etl::backend::memory::MemoryTransaction;
use steprun_etl::{ExtractStep, LoadStep, Record, RecordPipe, TransformStep};

/// Install a fmt subscriber honoring RUST_LOG. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn job_manager() -> AsyncJobManager {
    init_tracing();
    AsyncJobManager::new(Arc::new(InMemoryStateStore::new()), JobsConfig::default())
}

/// Fast tuning so tests do not wait on production backoff.
pub fn fast_config() -> EtlConfig {
    EtlConfig::default()
        .with_backoff(Duration::from_millis(1), Duration::from_millis(8))
        .with_stall_timeout(Duration::from_secs(5))
        .with_pipe_capacity(16)
}

pub fn people(count: i64) -> Vec<Record> {
    (0..count)
        .map(|id| Record::new().with("id", id).with("name", format!("person-{id}")))
        .collect()
}

/// Extract producing `total` records in chunks, pausing between chunks so
/// the consumer sees several fill cycles.
pub struct ChunkedExtract {
    pub total: i64,
    pub chunk: usize,
    pub pause: Duration,
}

#[async_trait]
impl ExtractStep for ChunkedExtract {
    async fn extract(&self, pipe: &RecordPipe, callback: &AsyncJobCallback) -> anyhow::Result<()> {
        let records = people(self.total);
        let total = records.len() as u64;
        let mut sent = 0u64;
        for chunk in records.chunks(self.chunk) {
            pipe.add_records(chunk.to_vec()).await?;
            sent += chunk.len() as u64;
            callback.update_counts(sent, total).await?;
            tokio::time::sleep(self.pause).await;
        }
        Ok(())
    }
}

/// Extract producing a few records and then never finishing.
pub struct StallingExtract {
    pub before_stall: i64,
}

#[async_trait]
impl ExtractStep for StallingExtract {
    async fn extract(&self, pipe: &RecordPipe, _callback: &AsyncJobCallback) -> anyhow::Result<()> {
        pipe.add_records(people(self.before_stall)).await?;
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Extract producing some records and then failing.
pub struct FailingExtract {
    pub before_failure: i64,
}

#[async_trait]
impl ExtractStep for FailingExtract {
    async fn extract(&self, pipe: &RecordPipe, _callback: &AsyncJobCallback) -> anyhow::Result<()> {
        pipe.add_records(people(self.before_failure)).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        anyhow::bail!("source connection lost")
    }
}

/// Transform upper-casing the `name` value.
pub struct UppercaseNames;

#[async_trait]
impl TransformStep for UppercaseNames {
    async fn transform(&self, records: Vec<Record>) -> anyhow::Result<Vec<Record>> {
        Ok(records
            .into_iter()
            .map(|mut record| {
                let upper = record.get_str("name").map(str::to_uppercase);
                if let Some(upper) = upper {
                    record.set("name", upper);
                }
                record
            })
            .collect())
    }
}

/// Memory load that stages records and fails on the given batch.
pub struct FailingLoad {
    pub fail_on_batch: usize,
    pub batches: AtomicUsize,
}

impl FailingLoad {
    pub fn new(fail_on_batch: usize) -> Self {
        Self {
            fail_on_batch,
            batches: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LoadStep<MemoryTransaction> for FailingLoad {
    async fn load(&self, txn: &mut MemoryTransaction, records: Vec<Record>) -> anyhow::Result<()> {
        let batch = self.batches.fetch_add(1, Ordering::SeqCst) + 1;
        txn.insert(records)?;
        if batch >= self.fail_on_batch {
            anyhow::bail!("target rejected batch {batch}");
        }
        Ok(())
    }
}
