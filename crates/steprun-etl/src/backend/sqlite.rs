// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite table backend.
//!
//! Tables hold one JSON-encoded record per row:
//!
//! ```sql
//! CREATE TABLE <name> (id INTEGER PRIMARY KEY AUTOINCREMENT, payload TEXT NOT NULL)
//! ```

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::{Sqlite, SqlitePool};
use steprun_core::jobs::AsyncJobCallback;
use tracing::debug;

use super::{Transaction, TransactionalBackend};
use crate::error::{EtlError, Result};
use crate::pipe::RecordPipe;
use crate::streamed::{ExtractStep, LoadStep};
use steprun_core::record::Record;

/// Check that `name` is a plain SQL identifier.
pub fn validate_table_name(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(name)
    } else {
        Err(EtlError::InvalidTableName(name.to_string()))
    }
}

/// SQLite-backed store of record tables.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Create a new SQLite backend.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a record table if it does not exist.
    pub async fn create_table(&self, table: &str) -> Result<()> {
        let table = validate_table_name(table)?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (id INTEGER PRIMARY KEY AUTOINCREMENT, payload TEXT NOT NULL)"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Number of committed rows in a table.
    pub async fn count(&self, table: &str) -> Result<i64> {
        let table = validate_table_name(table)?;
        let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Committed rows of a table, in insertion order.
    pub async fn rows(&self, table: &str) -> Result<Vec<Record>> {
        let table = validate_table_name(table)?;
        let payloads: Vec<String> =
            sqlx::query_scalar(&format!("SELECT payload FROM {table} ORDER BY id"))
                .fetch_all(&self.pool)
                .await?;
        payloads
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(EtlError::from))
            .collect()
    }
}

#[async_trait]
impl TransactionalBackend for SqliteBackend {
    type Txn = SqliteTransaction;

    async fn begin_transaction(&self) -> anyhow::Result<SqliteTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .context("failed to begin sqlite transaction")?;
        Ok(SqliteTransaction { tx: Some(tx) })
    }
}

/// An open SQLite transaction. `None` once committed or rolled back.
pub struct SqliteTransaction {
    tx: Option<sqlx::Transaction<'static, Sqlite>>,
}

impl std::fmt::Debug for SqliteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTransaction")
            .field("open", &self.tx.is_some())
            .finish()
    }
}

impl SqliteTransaction {
    /// Insert records as JSON payload rows.
    pub async fn insert(&mut self, table: &str, records: &[Record]) -> anyhow::Result<u64> {
        let table = validate_table_name(table)?;
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| anyhow!("sqlite transaction is no longer open"))?;

        let sql = format!("INSERT INTO {table} (payload) VALUES (?)");
        let mut inserted = 0;
        for record in records {
            let payload = serde_json::to_string(record)?;
            let result = sqlx::query(&sql)
                .bind(payload)
                .execute(&mut **tx)
                .await
                .with_context(|| format!("failed to insert into '{table}'"))?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }
}

#[async_trait]
impl Transaction for SqliteTransaction {
    async fn commit(&mut self) -> anyhow::Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| anyhow!("sqlite transaction is no longer open"))?;
        tx.commit().await.context("failed to commit sqlite transaction")?;
        debug!("SQLite transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback()
                .await
                .context("failed to roll back sqlite transaction")?;
            debug!("SQLite transaction rolled back");
        }
        Ok(())
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.rollback().await
    }
}

/// Load step inserting records into a SQLite table.
#[derive(Debug, Clone)]
pub struct SqliteTableLoad {
    table: String,
}

impl SqliteTableLoad {
    /// Load into `table`.
    pub fn new(table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { table })
    }
}

#[async_trait]
impl LoadStep<SqliteTransaction> for SqliteTableLoad {
    async fn load(&self, txn: &mut SqliteTransaction, records: Vec<Record>) -> anyhow::Result<()> {
        txn.insert(&self.table, &records).await?;
        Ok(())
    }
}

/// Extract step streaming a SQLite table's rows into the pipe.
///
/// Holds a pool connection for the whole stream; give it a pool separate
/// from the load side when the pool has a single connection.
#[derive(Debug, Clone)]
pub struct SqliteQueryExtract {
    pool: SqlitePool,
    table: String,
    batch_size: usize,
}

impl SqliteQueryExtract {
    /// Stream `table` in batches of `batch_size` rows.
    pub fn new(pool: SqlitePool, table: impl Into<String>, batch_size: usize) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self {
            pool,
            table,
            batch_size: batch_size.max(1),
        })
    }
}

#[async_trait]
impl ExtractStep for SqliteQueryExtract {
    async fn extract(&self, pipe: &RecordPipe, callback: &AsyncJobCallback) -> anyhow::Result<()> {
        let sql = format!("SELECT payload FROM {} ORDER BY id", self.table);
        let mut rows = sqlx::query_scalar::<_, String>(&sql).fetch(&self.pool);

        let mut batch = Vec::with_capacity(self.batch_size);
        let mut sent = 0u64;
        while let Some(payload) = rows.try_next().await? {
            batch.push(serde_json::from_str::<Record>(&payload)?);
            if batch.len() >= self.batch_size {
                sent += batch.len() as u64;
                pipe.add_records(std::mem::take(&mut batch)).await?;
                callback
                    .update_status(format!("Read {sent} rows from '{}'", self.table))
                    .await?;
            }
        }
        if !batch.is_empty() {
            sent += batch.len() as u64;
            pipe.add_records(batch).await?;
        }
        callback
            .update_status(format!("Read {sent} rows from '{}'", self.table))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn backend() -> SqliteBackend {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let backend = SqliteBackend::new(pool);
        backend.create_table("people").await.unwrap();
        backend
    }

    #[test]
    fn test_validate_table_name() {
        assert!(validate_table_name("people").is_ok());
        assert!(validate_table_name("_staging_2").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("2people").is_err());
        assert!(validate_table_name("people; DROP TABLE x").is_err());
    }

    #[tokio::test]
    async fn test_commit_makes_rows_visible() {
        let backend = backend().await;
        let mut txn = backend.begin_transaction().await.unwrap();
        let inserted = txn
            .insert("people", &[Record::new().with("id", 1), Record::new().with("id", 2)])
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        txn.commit().await.unwrap();
        txn.close().await.unwrap();

        assert_eq!(backend.count("people").await.unwrap(), 2);
        let rows = backend.rows("people").await.unwrap();
        assert_eq!(rows[1].get_i64("id"), Some(2));
    }

    #[tokio::test]
    async fn test_close_rolls_back_uncommitted_rows() {
        let backend = backend().await;
        let mut txn = backend.begin_transaction().await.unwrap();
        txn.insert("people", &[Record::new().with("id", 1)])
            .await
            .unwrap();

        txn.close().await.unwrap();
        txn.close().await.unwrap();

        assert_eq!(backend.count("people").await.unwrap(), 0);
        assert!(txn.commit().await.is_err());
    }
}
