// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steprun ETL - Streamed Extract-Transform-Load for steprun processes
//!
//! An extract step runs as an async job and feeds a bounded [`pipe::RecordPipe`].
//! The [`streamed::StreamedEtlStep`] drains the pipe with exponential backoff,
//! transforms each batch and loads it through one backend transaction that
//! spans the whole run. The run commits once the extract job is done, and
//! rolls back on any failure, including a producer that stops delivering
//! records for longer than the stall timeout.
//!
//! ```text
//!   extract job ──add_records──► RecordPipe ──consume──► transform ──► load ──► Transaction
//!   (async job)                  (bounded)               (polling loop, caller task)
//! ```
//!
//! `StreamedEtlStep` implements [`steprun_core::process::BackendStep`], so it
//! is placed in a process definition like any other backend step.
//!
//! # Features
//!
//! - `sqlite` (default): [`backend::sqlite`] table backend over `sqlx`.

#![deny(missing_docs)]

/// Transaction abstraction and table backends.
pub mod backend;

/// ETL error types.
pub mod error;

/// Bounded producer/consumer record hand-off.
pub mod pipe;

/// Streamed ETL step.
pub mod streamed;

pub use error::{EtlError, Result};
pub use pipe::RecordPipe;
pub use steprun_core::record::Record;
pub use streamed::{EtlSummary, ExtractStep, LoadStep, PassThrough, StreamedEtlStep, TransformStep};
