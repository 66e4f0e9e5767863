// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Snapshot store shared by the job runner and the step engine.
//!
//! A single key-value backend holds several logical stores; the [`StateKind`]
//! half of a [`StateKey`] keeps them apart. Values are stored serialized
//! together with the Rust type name they were written as, and reading a
//! snapshot back as another type is reported as
//! [`CoreError::StateTypeMismatch`].

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Logical store a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateKind {
    /// Status record of an async job.
    AsyncJobStatus,
    /// Result value of a completed async job.
    AsyncJobResult,
    /// Snapshot of a process run.
    ProcessState,
}

impl StateKind {
    /// Returns the string representation of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AsyncJobStatus => "ASYNC_JOB_STATUS",
            Self::AsyncJobResult => "ASYNC_JOB_RESULT",
            Self::ProcessState => "PROCESS_STATE",
        }
    }
}

/// Composite key: identifier plus kind. Equality is structural.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateKey {
    /// Job or run identifier.
    pub id: Uuid,
    /// Logical store.
    pub kind: StateKind,
}

impl StateKey {
    /// Create a key.
    pub fn new(id: Uuid, kind: StateKind) -> Self {
        Self { id, kind }
    }

    /// Key of an async job's status record.
    pub fn job_status(job_id: Uuid) -> Self {
        Self::new(job_id, StateKind::AsyncJobStatus)
    }

    /// Key of an async job's result.
    pub fn job_result(job_id: Uuid) -> Self {
        Self::new(job_id, StateKind::AsyncJobResult)
    }

    /// Key of a process run's state.
    pub fn process_state(run_id: Uuid) -> Self {
        Self::new(run_id, StateKind::ProcessState)
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// A serialized snapshot and the type it was written as.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    /// `std::any::type_name` of the stored value.
    pub type_name: String,
    /// Serialized value.
    pub value: serde_json::Value,
    /// When the snapshot was written.
    pub stored_at: DateTime<Utc>,
}

impl StoredSnapshot {
    /// Serialize a value into a snapshot tagged with its type name.
    pub fn of<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self {
            type_name: type_name::<T>().to_string(),
            value: serde_json::to_value(value)?,
            stored_at: Utc::now(),
        })
    }
}

/// Key-value snapshot store.
///
/// Implementations must be safe to call concurrently: a job task writes its
/// status while another task polls it. Only single-key operations are
/// required.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Store a snapshot, unconditionally overwriting any previous one.
    async fn put_snapshot(&self, key: StateKey, snapshot: StoredSnapshot) -> Result<()>;

    /// Fetch a snapshot. Absent if never stored, removed or expired.
    async fn get_snapshot(&self, key: &StateKey) -> Result<Option<StoredSnapshot>>;

    /// Remove a snapshot. Returns whether one was present.
    async fn remove(&self, key: &StateKey) -> Result<bool>;

    /// Drop every snapshot past the store's retention policy.
    async fn evict_expired(&self) -> Result<usize>;
}

impl dyn StateStore {
    /// Serialize and store a value.
    pub async fn put<T>(&self, key: StateKey, value: &T) -> Result<()>
    where
        T: Serialize + Sync + ?Sized,
    {
        let snapshot = StoredSnapshot::of(value)?;
        self.put_snapshot(key, snapshot).await
    }

    /// Fetch and deserialize a value stored as `T`.
    ///
    /// Fails with [`CoreError::StateTypeMismatch`] when the snapshot was
    /// written as a different type.
    pub async fn get<T: DeserializeOwned>(&self, key: &StateKey) -> Result<Option<T>> {
        let Some(snapshot) = self.get_snapshot(key).await? else {
            return Ok(None);
        };

        let expected = type_name::<T>();
        if snapshot.type_name != expected {
            return Err(CoreError::StateTypeMismatch {
                key: *key,
                expected: expected.to_string(),
                found: snapshot.type_name,
            });
        }

        Ok(Some(serde_json::from_value(snapshot.value)?))
    }
}

/// Volatile in-process store. All data is lost when the process exits.
///
/// Construct one at application startup and share it through `Arc`.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    entries: RwLock<HashMap<StateKey, StoredSnapshot>>,
    ttl: Option<Duration>,
}

impl InMemoryStateStore {
    /// Create a store that keeps snapshots until they are removed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose snapshots expire `ttl` after their last write.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: RwLock::default(),
            ttl: Some(ttl),
        }
    }

    /// Configured retention, if any.
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Number of stored snapshots, expired ones included.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no snapshots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every snapshot.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn is_expired(&self, snapshot: &StoredSnapshot, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        // A negative age (clock moved backwards) fails `to_std` and counts as fresh.
        now.signed_duration_since(snapshot.stored_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put_snapshot(&self, key: StateKey, snapshot: StoredSnapshot) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CoreError::Store("state store lock poisoned".to_string()))?;
        entries.insert(key, snapshot);
        Ok(())
    }

    async fn get_snapshot(&self, key: &StateKey) -> Result<Option<StoredSnapshot>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| CoreError::Store("state store lock poisoned".to_string()))?;
        let now = Utc::now();
        Ok(entries
            .get(key)
            .filter(|snapshot| !self.is_expired(snapshot, now))
            .cloned())
    }

    async fn remove(&self, key: &StateKey) -> Result<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| CoreError::Store("state store lock poisoned".to_string()))?;
        Ok(entries.remove(key).is_some())
    }

    async fn evict_expired(&self) -> Result<usize> {
        if self.ttl.is_none() {
            return Ok(0);
        }

        let mut entries = self
            .entries
            .write()
            .map_err(|_| CoreError::Store("state store lock poisoned".to_string()))?;
        let now = Utc::now();
        let before = entries.len();
        entries.retain(|_, snapshot| !self.is_expired(snapshot, now));
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "Evicted expired snapshots");
        }
        Ok(evicted)
    }
}
