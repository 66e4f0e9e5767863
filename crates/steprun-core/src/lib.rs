// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Steprun Core - Resumable Process Execution Engine
//!
//! This crate runs named processes made of ordered steps. Backend steps run
//! server-side and mutate a shared [`process::ProcessState`]; frontend steps mark
//! the points where a caller is expected to supply input. The state is
//! snapshotted into a [`state::StateStore`] after every backend step, so a run
//! can be paused at a frontend step and resumed by a later, independent call
//! (for example a second HTTP request) that only carries the run identifier.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  Callers (HTTP, CLI, tests)                  │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ RunProcessInput
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                ProcessRunner (step engine)                   │
//! │   resolve definition → load/merge state → iterate steps      │
//! └──────────────────────────────────────────────────────────────┘
//!           │ persist after each step          │ start_job
//!           ▼                                  ▼
//! ┌───────────────────────┐        ┌──────────────────────────────┐
//! │      StateStore       │◄───────│       AsyncJobManager        │
//! │ (ProcessState, job    │ status │  bounded worker pool, going  │
//! │  status, job result)  │        │  async after a timeout       │
//! └───────────────────────┘        └──────────────────────────────┘
//! ```
//!
//! # Run State Machine
//!
//! ```text
//!   NOT_STARTED ──run──► RUNNING ──frontend step (BREAK)──► PAUSED_AT_FRONTEND_STEP
//!                           │                                        │
//!                           │                              resume after step
//!                           │                                        │
//!                           ├──────────────◄─────────────────────────┘
//!                           │
//!               ┌───────────┴────────────┐
//!        all steps done          backend failure / FAIL
//!               ▼                        ▼
//!           COMPLETE                   FAILED
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `STEPRUN_MAX_CONCURRENT_JOBS` | No | `32` | Bound of the async job worker pool |
//! | `STEPRUN_JOB_SATURATION_POLICY` | No | `queue` | `queue` or `reject` when the pool is full |
//! | `STEPRUN_STATE_TTL_SECS` | No | - | Expire stored snapshots after this many seconds |
//! | `STEPRUN_ETL_INITIAL_BACKOFF_MS` | No | `10` | First sleep when the record pipe is empty |
//! | `STEPRUN_ETL_MAX_BACKOFF_MS` | No | `1000` | Backoff cap |
//! | `STEPRUN_ETL_STALL_TIMEOUT_SECS` | No | `600` | Producer stall threshold |
//! | `STEPRUN_RECORD_PIPE_CAPACITY` | No | `1000` | Record pipe bound |
//!
//! # Modules
//!
//! - [`config`]: Engine configuration from environment variables
//! - [`error`]: Error types with stable error codes
//! - [`state`]: Key-value snapshot store
//! - [`jobs`]: Async job runner with pollable status
//! - [`process`]: Process definitions, process state and the step engine
//! - [`record`]: Record value bags shared by steps and pipes
//! - [`runtime`]: Builder wiring store, job manager and runner together

#![deny(missing_docs)]

/// Engine configuration loaded from environment variables.
pub mod config;

/// Error types for engine operations.
pub mod error;

/// Async job runner: bounded pool, timeouts, pollable status.
pub mod jobs;

/// Process definitions, process state and the step execution engine.
pub mod process;

/// Record value bags.
pub mod record;

/// Embeddable engine wiring.
pub mod runtime;

/// Snapshot store keyed by identifier and state kind.
pub mod state;

pub use error::{CoreError, Result};
