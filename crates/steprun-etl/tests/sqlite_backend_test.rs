// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Streamed ETL against in-memory SQLite databases.

#![cfg(feature = "sqlite")]

mod common;

use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use steprun_etl::backend::memory::{MemoryTable, MemoryTableExtract, MemoryTableLoad};
use steprun_etl::backend::sqlite::{
    SqliteBackend, SqliteQueryExtract, SqliteTableLoad, SqliteTransaction,
};
use steprun_etl::backend::{Transaction, TransactionalBackend};
use steprun_etl::{EtlError, LoadStep, Record, StreamedEtlStep};

use common::*;

async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool")
}

async fn backend_with_table(table: &str) -> SqliteBackend {
    let backend = SqliteBackend::new(memory_pool().await);
    backend.create_table(table).await.unwrap();
    backend
}

#[tokio::test]
async fn test_memory_source_loads_into_sqlite() {
    let jobs = job_manager();
    let source = MemoryTable::new("source");
    source.seed(people(120));
    let target = backend_with_table("people").await;

    let step = StreamedEtlStep::new(
        target.clone(),
        MemoryTableExtract::new(source, 25),
        SqliteTableLoad::new("people").unwrap(),
    )
    .with_transform(UppercaseNames)
    .with_config(fast_config());

    let summary = step.execute(&jobs).await.unwrap();

    assert_eq!(summary.record_count, 120);
    assert_eq!(target.count("people").await.unwrap(), 120);
    let rows = target.rows("people").await.unwrap();
    assert_eq!(rows[7].get_str("name"), Some("PERSON-7"));
}

#[tokio::test]
async fn test_sqlite_source_streams_into_memory() {
    let jobs = job_manager();
    let source = backend_with_table("people").await;
    let mut txn = source.begin_transaction().await.unwrap();
    txn.insert("people", &people(60)).await.unwrap();
    txn.commit().await.unwrap();
    txn.close().await.unwrap();

    let target = MemoryTable::new("people");
    let step = StreamedEtlStep::new(
        target.clone(),
        SqliteQueryExtract::new(source.pool().clone(), "people", 8).unwrap(),
        MemoryTableLoad,
    )
    .with_config(fast_config());

    let summary = step.execute(&jobs).await.unwrap();

    assert_eq!(summary.record_count, 60);
    let ids: Vec<i64> = target
        .rows()
        .iter()
        .map(|r| r.get_i64("id").unwrap())
        .collect();
    assert_eq!(ids, (0..60).collect::<Vec<_>>());
}

/// SQLite load failing once enough rows went through the transaction.
struct FailingSqliteLoad {
    inner: SqliteTableLoad,
    fail_on_batch: usize,
    batches: AtomicUsize,
}

#[async_trait]
impl LoadStep<SqliteTransaction> for FailingSqliteLoad {
    async fn load(&self, txn: &mut SqliteTransaction, records: Vec<Record>) -> anyhow::Result<()> {
        let batch = self
            .batches
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        self.inner.load(txn, records).await?;
        if batch >= self.fail_on_batch {
            anyhow::bail!("constraint check failed on batch {batch}");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_sqlite_rollback_leaves_table_empty() {
    let jobs = job_manager();
    let target = backend_with_table("people").await;

    let step = StreamedEtlStep::new(
        target.clone(),
        ChunkedExtract {
            total: 100,
            chunk: 10,
            pause: Duration::from_millis(2),
        },
        FailingSqliteLoad {
            inner: SqliteTableLoad::new("people").unwrap(),
            fail_on_batch: 2,
            batches: AtomicUsize::new(0),
        },
    )
    .with_config(fast_config());

    let err = step.execute(&jobs).await.unwrap_err();

    assert!(matches!(err, EtlError::Load(_)));
    assert_eq!(target.count("people").await.unwrap(), 0);
}

#[tokio::test]
async fn test_invalid_table_names_are_rejected() {
    let target = backend_with_table("people").await;

    let err = SqliteTableLoad::new("people; DROP TABLE people").unwrap_err();
    assert_eq!(err.error_code(), "INVALID_TABLE_NAME");
    assert!(target.count("1people").await.is_err());
    assert!(
        SqliteQueryExtract::new(target.pool().clone(), "", 10)
            .unwrap_err()
            .to_string()
            .contains("Invalid table name")
    );
}
