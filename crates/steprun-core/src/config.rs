// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

/// What the job pool does with a new job when every worker slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaturationPolicy {
    /// Wait for a slot to free up.
    #[default]
    Queue,
    /// Fail immediately with `CoreError::JobPoolSaturated`.
    Reject,
}

impl FromStr for SaturationPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "reject" => Ok(Self::Reject),
            _ => Err(ConfigError::Invalid(
                "STEPRUN_JOB_SATURATION_POLICY",
                "must be 'queue' or 'reject'",
            )),
        }
    }
}

/// Async job pool configuration.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Maximum number of jobs running at once.
    pub max_concurrent_jobs: usize,
    /// Behavior when the pool is full.
    pub saturation_policy: SaturationPolicy,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 32,
            saturation_policy: SaturationPolicy::Queue,
        }
    }
}

/// Streamed ETL tuning.
#[derive(Debug, Clone)]
pub struct EtlConfig {
    /// Sleep after the first empty poll of the record pipe.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling backoff.
    pub max_backoff: Duration,
    /// How long the producer may go without delivering records before the run fails.
    pub stall_timeout: Duration,
    /// Record pipe bound.
    pub pipe_capacity: usize,
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(1000),
            stall_timeout: Duration::from_secs(600),
            pipe_capacity: 1000,
        }
    }
}

impl EtlConfig {
    /// Set the backoff range.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the stall threshold.
    pub fn with_stall_timeout(mut self, stall_timeout: Duration) -> Self {
        self.stall_timeout = stall_timeout;
        self
    }

    /// Set the record pipe bound.
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }
}

/// Steprun configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Async job pool settings.
    pub jobs: JobsConfig,
    /// Retention of stored snapshots. `None` keeps them until removed.
    pub state_ttl: Option<Duration>,
    /// Streamed ETL settings.
    pub etl: EtlConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `STEPRUN_MAX_CONCURRENT_JOBS`: job pool bound (default: 32)
    /// - `STEPRUN_JOB_SATURATION_POLICY`: `queue` or `reject` (default: queue)
    /// - `STEPRUN_STATE_TTL_SECS`: snapshot retention (default: unset, keep forever)
    /// - `STEPRUN_ETL_INITIAL_BACKOFF_MS`: first empty-pipe sleep (default: 10)
    /// - `STEPRUN_ETL_MAX_BACKOFF_MS`: backoff cap (default: 1000)
    /// - `STEPRUN_ETL_STALL_TIMEOUT_SECS`: producer stall threshold (default: 600)
    /// - `STEPRUN_RECORD_PIPE_CAPACITY`: record pipe bound (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let max_concurrent_jobs: usize = parse_var(
            "STEPRUN_MAX_CONCURRENT_JOBS",
            "32",
            "must be a positive integer",
        )?;
        if max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid(
                "STEPRUN_MAX_CONCURRENT_JOBS",
                "must be a positive integer",
            ));
        }

        let saturation_policy: SaturationPolicy = std::env::var("STEPRUN_JOB_SATURATION_POLICY")
            .unwrap_or_else(|_| "queue".to_string())
            .parse()?;

        let state_ttl = match std::env::var("STEPRUN_STATE_TTL_SECS") {
            Ok(value) => Some(Duration::from_secs(value.parse().map_err(|_| {
                ConfigError::Invalid("STEPRUN_STATE_TTL_SECS", "must be a number of seconds")
            })?)),
            Err(_) => None,
        };

        let initial_backoff_ms: u64 = parse_var(
            "STEPRUN_ETL_INITIAL_BACKOFF_MS",
            "10",
            "must be a number of milliseconds",
        )?;
        let max_backoff_ms: u64 = parse_var(
            "STEPRUN_ETL_MAX_BACKOFF_MS",
            "1000",
            "must be a number of milliseconds",
        )?;
        if max_backoff_ms < initial_backoff_ms {
            return Err(ConfigError::Invalid(
                "STEPRUN_ETL_MAX_BACKOFF_MS",
                "must not be lower than STEPRUN_ETL_INITIAL_BACKOFF_MS",
            ));
        }

        let stall_timeout_secs: u64 = parse_var(
            "STEPRUN_ETL_STALL_TIMEOUT_SECS",
            "600",
            "must be a number of seconds",
        )?;

        let pipe_capacity: usize = parse_var(
            "STEPRUN_RECORD_PIPE_CAPACITY",
            "1000",
            "must be a positive integer",
        )?;
        if pipe_capacity == 0 {
            return Err(ConfigError::Invalid(
                "STEPRUN_RECORD_PIPE_CAPACITY",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            jobs: JobsConfig {
                max_concurrent_jobs,
                saturation_policy,
            },
            state_ttl,
            etl: EtlConfig {
                initial_backoff: Duration::from_millis(initial_backoff_ms),
                max_backoff: Duration::from_millis(max_backoff_ms),
                stall_timeout: Duration::from_secs(stall_timeout_secs),
                pipe_capacity,
            },
        })
    }

    /// Set the job pool settings.
    pub fn with_jobs(mut self, jobs: JobsConfig) -> Self {
        self.jobs = jobs;
        self
    }

    /// Set the snapshot retention.
    pub fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = Some(ttl);
        self
    }

    /// Set the streamed ETL settings.
    pub fn with_etl(mut self, etl: EtlConfig) -> Self {
        self.etl = etl;
        self
    }
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: &str,
    message: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(name, message))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
