// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for steprun-etl.

use std::time::Duration;

use steprun_core::CoreError;
use thiserror::Error;
use uuid::Uuid;

/// Result type using EtlError
pub type Result<T> = std::result::Result<T, EtlError>;

/// Errors raised by the record pipe, backends and the streamed ETL step.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EtlError {
    /// The consumer terminated the pipe; no more records are accepted.
    #[error("Record pipe has been terminated")]
    PipeTerminated,

    /// The producer delivered nothing for longer than the stall timeout.
    #[error("Producer appears stalled: no records received for {waited:?}")]
    ProducerStalled {
        /// Time since the last batch.
        waited: Duration,
    },

    /// The extract job ended in ERROR.
    #[error("Extract job '{job_id}' failed: {message}")]
    ExtractFailed {
        /// The extract job.
        job_id: Uuid,
        /// The job's captured failure.
        message: String,
    },

    /// The transform step failed.
    #[error("Transform failed: {0:#}")]
    Transform(#[source] anyhow::Error),

    /// The load step failed.
    #[error("Load failed: {0:#}")]
    Load(#[source] anyhow::Error),

    /// Beginning or committing the transaction failed.
    #[error("Transaction error: {0:#}")]
    Transaction(#[source] anyhow::Error),

    /// A table name is not a plain identifier.
    #[error("Invalid table name '{0}'")]
    InvalidTableName(String),

    /// Engine error (job runner or state store).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Database error.
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EtlError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::PipeTerminated => "PIPE_TERMINATED",
            Self::ProducerStalled { .. } => "PRODUCER_STALLED",
            Self::ExtractFailed { .. } => "EXTRACT_FAILED",
            Self::Transform(_) => "TRANSFORM_FAILED",
            Self::Load(_) => "LOAD_FAILED",
            Self::Transaction(_) => "TRANSACTION_ERROR",
            Self::InvalidTableName(_) => "INVALID_TABLE_NAME",
            Self::Core(e) => e.error_code(),
            #[cfg(feature = "sqlite")]
            Self::Database(_) => "DATABASE_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etl_error_codes() {
        let test_cases = vec![
            (EtlError::PipeTerminated, "PIPE_TERMINATED"),
            (
                EtlError::ProducerStalled {
                    waited: Duration::from_secs(600),
                },
                "PRODUCER_STALLED",
            ),
            (
                EtlError::ExtractFailed {
                    job_id: Uuid::nil(),
                    message: "query failed".to_string(),
                },
                "EXTRACT_FAILED",
            ),
            (EtlError::Load(anyhow::anyhow!("disk full")), "LOAD_FAILED"),
            (
                EtlError::InvalidTableName("people; DROP".to_string()),
                "INVALID_TABLE_NAME",
            ),
            (
                EtlError::Core(CoreError::JobNotFound(Uuid::nil())),
                "JOB_NOT_FOUND",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
        }
    }

    #[test]
    fn test_etl_error_display() {
        let err = EtlError::Load(anyhow::anyhow!("constraint violated").context("insert people"));
        assert_eq!(err.to_string(), "Load failed: insert people: constraint violated");

        let err = EtlError::ProducerStalled {
            waited: Duration::from_millis(1500),
        };
        assert!(err.to_string().starts_with("Producer appears stalled"));
    }
}
