// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded record hand-off between a producer task and a polling consumer.
//!
//! The producer appends with [`RecordPipe::add_records`], which waits while
//! the pipe is full. The consumer never blocks: it peeks with
//! [`RecordPipe::count_available_records`] and drains with
//! [`RecordPipe::consume_available_records`] at its own pace.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::debug;

use crate::error::{EtlError, Result};
use steprun_core::record::Record;

#[derive(Debug, Default)]
struct PipeInner {
    records: VecDeque<Record>,
    terminated: bool,
    total_added: u64,
}

/// Bounded, internally synchronized record queue. Share it through `Arc`.
#[derive(Debug)]
pub struct RecordPipe {
    inner: Mutex<PipeInner>,
    room: Notify,
    capacity: usize,
}

impl RecordPipe {
    /// Create a pipe buffering at most `capacity` records (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(PipeInner::default()),
            room: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Maximum number of buffered records.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append one record, waiting for room.
    pub async fn add_record(&self, record: Record) -> Result<()> {
        self.add_records(vec![record]).await
    }

    /// Append records in order, waiting for room whenever the pipe is full.
    ///
    /// Fails with [`EtlError::PipeTerminated`] once the consumer has
    /// terminated the pipe; records accepted before that stay accepted.
    pub async fn add_records(&self, records: Vec<Record>) -> Result<()> {
        let mut pending = records.into_iter().peekable();

        loop {
            let notified = self.room.notified();
            tokio::pin!(notified);
            // Register before checking capacity so a drain in between is not missed.
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.terminated {
                    return Err(EtlError::PipeTerminated);
                }
                while inner.records.len() < self.capacity {
                    match pending.next() {
                        Some(record) => {
                            inner.records.push_back(record);
                            inner.total_added += 1;
                        }
                        None => break,
                    }
                }
            }

            if pending.peek().is_none() {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Number of records ready to be consumed.
    pub fn count_available_records(&self) -> usize {
        self.lock().records.len()
    }

    /// Drain everything buffered, in insertion order. Never blocks.
    pub fn consume_available_records(&self) -> Vec<Record> {
        let drained: Vec<Record> = self.lock().records.drain(..).collect();
        if !drained.is_empty() {
            self.room.notify_waiters();
        }
        drained
    }

    /// Stop accepting records and release any waiting producer.
    ///
    /// Buffered records are discarded.
    pub fn terminate(&self) {
        let discarded = {
            let mut inner = self.lock();
            inner.terminated = true;
            let discarded = inner.records.len();
            inner.records.clear();
            discarded
        };
        self.room.notify_waiters();
        debug!(discarded, "Record pipe terminated");
    }

    /// Whether [`terminate`](Self::terminate) has been called.
    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    /// Records accepted since the pipe was created.
    pub fn total_records_added(&self) -> u64 {
        self.lock().total_added
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PipeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
