// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for steprun-core.
//!
//! Every error carries a human-readable message and maps to a stable error
//! code that request/response adapters can hand to their clients.

use thiserror::Error;
use uuid::Uuid;

use crate::process::RunProcessOutput;
use crate::state::StateKey;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the state store, the async job runner and the step engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// No process definition is registered under the requested name.
    #[error("Process '{name}' is not defined")]
    ProcessNotFound {
        /// The requested process name.
        name: String,
    },

    /// A step name does not belong to the process definition.
    #[error("Step '{step}' is not defined in process '{process}'")]
    StepNotFound {
        /// The process name.
        process: String,
        /// The unknown step name.
        step: String,
    },

    /// A frontend step behavior selector could not be recognized.
    #[error("Unknown frontend step behavior '{0}': expected break, skip or fail")]
    UnknownFrontendStepBehavior(String),

    /// A frontend step was reached while the caller asked for FAIL behavior.
    #[error("Frontend step '{step}' reached in process '{process}' while frontend steps are not allowed")]
    FrontendStepNotAllowed {
        /// The process name.
        process: String,
        /// The frontend step that was reached.
        step: String,
    },

    /// Resumption was requested for a run with no stored state.
    #[error("No stored state for run '{run_id}' of process '{process}'")]
    ProcessStateNotFound {
        /// The run identifier.
        run_id: Uuid,
        /// The process name.
        process: String,
    },

    /// Another invocation is already executing the same run.
    #[error("Run '{run_id}' is already executing")]
    RunInProgress {
        /// The run identifier.
        run_id: Uuid,
    },

    /// A backend step failed. The output reflects the state the run reached.
    #[error("Step '{step}' failed: {source}")]
    StepFailed {
        /// The failing step.
        step: String,
        /// Output of the run up to the failure, with its error slot filled.
        output: Box<RunProcessOutput>,
        /// The step's failure.
        #[source]
        source: anyhow::Error,
    },

    /// A snapshot was read back as a different type than it was stored as.
    #[error("State under '{key}' holds '{found}', expected '{expected}'")]
    StateTypeMismatch {
        /// The key that was read.
        key: StateKey,
        /// The type the caller asked for.
        expected: String,
        /// The type that was stored.
        found: String,
    },

    /// A snapshot could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An async job failed while the caller was still waiting for it.
    #[error("Async job '{job_id}' failed: {source}")]
    JobExecution {
        /// The job identifier.
        job_id: Uuid,
        /// The job's failure.
        #[source]
        source: anyhow::Error,
    },

    /// The async job pool is full and the saturation policy rejects new jobs.
    #[error("Async job pool is saturated ({max_concurrent_jobs} jobs running)")]
    JobPoolSaturated {
        /// Configured pool bound.
        max_concurrent_jobs: usize,
    },

    /// No status is stored for the job identifier.
    #[error("Async job '{0}' not found")]
    JobNotFound(Uuid),

    /// Polling for a job's terminal status timed out.
    #[error("Timed out waiting for async job '{job_id}'")]
    JobWaitTimeout {
        /// The job identifier.
        job_id: Uuid,
    },

    /// The state store backend failed.
    #[error("State store error: {0}")]
    Store(String),
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ProcessNotFound { .. } => "PROCESS_NOT_FOUND",
            Self::StepNotFound { .. } => "STEP_NOT_FOUND",
            Self::UnknownFrontendStepBehavior(_) => "UNKNOWN_FRONTEND_STEP_BEHAVIOR",
            Self::FrontendStepNotAllowed { .. } => "FRONTEND_STEP_NOT_ALLOWED",
            Self::ProcessStateNotFound { .. } => "PROCESS_STATE_NOT_FOUND",
            Self::RunInProgress { .. } => "RUN_IN_PROGRESS",
            Self::StepFailed { .. } => "STEP_FAILED",
            Self::StateTypeMismatch { .. } => "STATE_TYPE_MISMATCH",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::JobExecution { .. } => "JOB_EXECUTION_FAILED",
            Self::JobPoolSaturated { .. } => "JOB_POOL_SATURATED",
            Self::JobNotFound(_) => "JOB_NOT_FOUND",
            Self::JobWaitTimeout { .. } => "JOB_WAIT_TIMEOUT",
            Self::Store(_) => "STATE_STORE_ERROR",
        }
    }

    /// Whether this is a configuration error (bad definition or selector),
    /// which callers should not retry.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::ProcessNotFound { .. }
                | Self::StepNotFound { .. }
                | Self::UnknownFrontendStepBehavior(_)
        )
    }

    /// The partial run output carried by a step failure, if any.
    pub fn run_output(&self) -> Option<&RunProcessOutput> {
        match self {
            Self::StepFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}
