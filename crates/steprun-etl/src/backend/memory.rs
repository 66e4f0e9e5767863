// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory table backend.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use async_trait::async_trait;
use steprun_core::jobs::AsyncJobCallback;
use tracing::debug;

use super::{Transaction, TransactionalBackend};
use crate::pipe::RecordPipe;
use crate::streamed::{ExtractStep, LoadStep};
use steprun_core::record::Record;

#[derive(Debug, Default)]
struct TableInner {
    rows: Vec<Record>,
    commits: usize,
    rollbacks: usize,
    open_transactions: usize,
}

/// A named in-memory table. Clones share the same rows.
#[derive(Debug, Clone)]
pub struct MemoryTable {
    name: Arc<str>,
    inner: Arc<Mutex<TableInner>>,
}

impl MemoryTable {
    /// Create an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::from(name.into()),
            inner: Arc::default(),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append committed rows directly, outside any transaction.
    pub fn seed(&self, records: impl IntoIterator<Item = Record>) {
        self.lock().rows.extend(records);
    }

    /// Committed rows.
    pub fn rows(&self) -> Vec<Record> {
        self.lock().rows.clone()
    }

    /// Number of committed rows.
    pub fn len(&self) -> usize {
        self.lock().rows.len()
    }

    /// Whether the table has no committed rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transactions committed against this table.
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    /// Transactions rolled back against this table.
    pub fn rollback_count(&self) -> usize {
        self.lock().rollbacks
    }

    /// Transactions begun and not yet closed.
    pub fn open_transactions(&self) -> usize {
        self.lock().open_transactions
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TransactionalBackend for MemoryTable {
    type Txn = MemoryTransaction;

    async fn begin_transaction(&self) -> anyhow::Result<MemoryTransaction> {
        self.lock().open_transactions += 1;
        debug!(table = %self.name, "Memory transaction begun");
        Ok(MemoryTransaction {
            table: self.clone(),
            staged: Vec::new(),
            state: TxnState::Open,
            closed: false,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Open,
    Committed,
    RolledBack,
}

/// Transaction staging inserts into a [`MemoryTable`] until commit.
#[derive(Debug)]
pub struct MemoryTransaction {
    table: MemoryTable,
    staged: Vec<Record>,
    state: TxnState,
    closed: bool,
}

impl MemoryTransaction {
    /// Stage rows for insertion.
    pub fn insert(&mut self, records: impl IntoIterator<Item = Record>) -> anyhow::Result<()> {
        if self.state != TxnState::Open {
            bail!("transaction on table '{}' is no longer open", self.table.name());
        }
        self.staged.extend(records);
        Ok(())
    }

    /// Number of staged rows.
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(&mut self) -> anyhow::Result<()> {
        if self.state != TxnState::Open {
            bail!("transaction on table '{}' is no longer open", self.table.name());
        }
        let staged = std::mem::take(&mut self.staged);
        let count = staged.len();
        {
            let mut inner = self.table.lock();
            inner.rows.extend(staged);
            inner.commits += 1;
        }
        self.state = TxnState::Committed;
        debug!(table = %self.table.name(), count, "Memory transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> anyhow::Result<()> {
        match self.state {
            TxnState::Open => {
                self.staged.clear();
                self.table.lock().rollbacks += 1;
                self.state = TxnState::RolledBack;
                debug!(table = %self.table.name(), "Memory transaction rolled back");
                Ok(())
            }
            TxnState::RolledBack => Ok(()),
            TxnState::Committed => bail!(
                "transaction on table '{}' is already committed",
                self.table.name()
            ),
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.state == TxnState::Open {
            self.rollback().await?;
        }
        self.closed = true;
        self.table.lock().open_transactions -= 1;
        Ok(())
    }
}

/// Load step inserting records into a memory table through its transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryTableLoad;

#[async_trait]
impl LoadStep<MemoryTransaction> for MemoryTableLoad {
    async fn load(&self, txn: &mut MemoryTransaction, records: Vec<Record>) -> anyhow::Result<()> {
        txn.insert(records)
    }
}

/// Extract step streaming a memory table's committed rows into the pipe.
#[derive(Debug, Clone)]
pub struct MemoryTableExtract {
    table: MemoryTable,
    batch_size: usize,
}

impl MemoryTableExtract {
    /// Stream `table` in batches of `batch_size` rows.
    pub fn new(table: MemoryTable, batch_size: usize) -> Self {
        Self {
            table,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait]
impl ExtractStep for MemoryTableExtract {
    async fn extract(&self, pipe: &RecordPipe, callback: &AsyncJobCallback) -> anyhow::Result<()> {
        let rows = self.table.rows();
        let total = rows.len() as u64;
        let mut sent = 0u64;

        for chunk in rows.chunks(self.batch_size) {
            pipe.add_records(chunk.to_vec()).await?;
            sent += chunk.len() as u64;
            callback
                .update_status_with_counts(
                    format!("Read {sent} of {total} rows from '{}'", self.table.name()),
                    sent,
                    total,
                )
                .await?;
        }
        Ok(())
    }
}
