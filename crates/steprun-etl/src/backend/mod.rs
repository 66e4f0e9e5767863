// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction abstraction and table backends.
//!
//! The streamed ETL step opens one [`Transaction`] per run through a
//! [`TransactionalBackend`] and hands it to its load step only. Backends:
//!
//! - [`memory`]: in-memory tables, staging inserts until commit
//! - [`sqlite`]: SQLite tables through `sqlx` (feature `sqlite`)

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

/// A backend transaction scoped to one ETL run.
///
/// `close` releases the transaction. It rolls back uncommitted work, is safe
/// to call after commit or rollback, and is idempotent.
#[async_trait]
pub trait Transaction: Send {
    /// Make the transaction's writes visible.
    async fn commit(&mut self) -> anyhow::Result<()>;

    /// Discard the transaction's writes.
    async fn rollback(&mut self) -> anyhow::Result<()>;

    /// Release the transaction.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// A store that can open transactions.
#[async_trait]
pub trait TransactionalBackend: Send + Sync {
    /// Transaction handle type.
    type Txn: Transaction + 'static;

    /// Open a transaction.
    async fn begin_transaction(&self) -> anyhow::Result<Self::Txn>;
}
