// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process run state and invocation input/output.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::CoreError;
use crate::record::Record;

/// Snapshot of one process run, persisted after every backend step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    /// Name of the process definition the run belongs to.
    pub process_name: String,
    /// Named values shared between steps.
    pub values: Map<String, Value>,
    /// Output records accumulated by the steps.
    pub records: Vec<Record>,
    /// Step to run next. `None` once the run is complete.
    pub next_step_name: Option<String>,
    /// Steps scheduled by the latest invocation.
    pub step_list: Vec<String>,
    /// Callback configuration of the frontend step the run is paused at.
    pub frontend_callbacks: Map<String, Value>,
    /// Why the latest invocation failed. Cleared when the run is invoked again.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Last time the state was written.
    pub updated_at: DateTime<Utc>,
}

impl ProcessState {
    /// Empty state for a new run.
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            values: Map::new(),
            records: Vec::new(),
            next_step_name: None,
            step_list: Vec::new(),
            frontend_callbacks: Map::new(),
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Whether every scheduled step has run.
    pub fn is_complete(&self) -> bool {
        self.next_step_name.is_none()
    }
}

/// What a run does when it reaches a frontend step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrontendStepBehavior {
    /// Pause and return to the caller, recording the step as next.
    #[default]
    Break,
    /// Omit the step and continue.
    Skip,
    /// Abort the run with an error.
    Fail,
}

impl FrontendStepBehavior {
    /// Returns the string representation of the behavior.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Break => "BREAK",
            Self::Skip => "SKIP",
            Self::Fail => "FAIL",
        }
    }
}

impl FromStr for FrontendStepBehavior {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BREAK" => Ok(Self::Break),
            "SKIP" => Ok(Self::Skip),
            "FAIL" => Ok(Self::Fail),
            _ => Err(CoreError::UnknownFrontendStepBehavior(s.to_string())),
        }
    }
}

/// Input of one engine invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProcessInput {
    /// Process to run.
    pub process_name: String,
    /// Run to continue, or the id to give a fresh run.
    pub run_id: Option<Uuid>,
    /// Resume after this step.
    pub start_after_step: Option<String>,
    /// Frontend step handling for this invocation.
    pub frontend_step_behavior: FrontendStepBehavior,
    /// Values merged over the stored ones.
    pub values: Map<String, Value>,
    /// Records replacing the stored ones when non-empty.
    pub records: Vec<Record>,
}

impl RunProcessInput {
    /// Input starting a fresh run of `process_name`.
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            process_name: process_name.into(),
            run_id: None,
            start_after_step: None,
            frontend_step_behavior: FrontendStepBehavior::default(),
            values: Map::new(),
            records: Vec::new(),
        }
    }

    /// Input resuming `run_id` after `step`.
    pub fn resume(process_name: impl Into<String>, run_id: Uuid, step: impl Into<String>) -> Self {
        Self::new(process_name)
            .with_run_id(run_id)
            .with_start_after_step(step)
    }

    /// Set the run id.
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    /// Set the step to resume after.
    pub fn with_start_after_step(mut self, step: impl Into<String>) -> Self {
        self.start_after_step = Some(step.into());
        self
    }

    /// Set the frontend step behavior.
    pub fn with_frontend_step_behavior(mut self, behavior: FrontendStepBehavior) -> Self {
        self.frontend_step_behavior = behavior;
        self
    }

    /// Add a caller value.
    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Replace the caller values.
    pub fn with_values(mut self, values: Map<String, Value>) -> Self {
        self.values = values;
        self
    }

    /// Replace the caller records.
    pub fn with_records(mut self, records: Vec<Record>) -> Self {
        self.records = records;
        self
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Stopped before a frontend step; resume after it.
    PausedAtFrontendStep,
    /// Every step ran.
    Complete,
    /// A step failed.
    Failed,
}

/// Output of one engine invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProcessOutput {
    /// Run identifier to pass back when resuming.
    pub run_id: Uuid,
    /// Process name.
    pub process_name: String,
    /// Values at the end of the invocation.
    pub values: Map<String, Value>,
    /// Records at the end of the invocation.
    pub records: Vec<Record>,
    /// Step to run next, `None` when complete.
    pub next_step_name: Option<String>,
    /// Frontend callback configuration when paused.
    pub frontend_callbacks: Map<String, Value>,
    /// How the invocation ended.
    pub status: RunStatus,
    /// Failure message when the status is `Failed`.
    pub error: Option<String>,
}

impl RunProcessOutput {
    pub(crate) fn from_state(run_id: Uuid, state: &ProcessState, status: RunStatus) -> Self {
        Self {
            run_id,
            process_name: state.process_name.clone(),
            values: state.values.clone(),
            records: state.records.clone(),
            next_step_name: state.next_step_name.clone(),
            frontend_callbacks: state.frontend_callbacks.clone(),
            status,
            error: state.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frontend_step_behavior_parse() {
        assert_eq!(
            "break".parse::<FrontendStepBehavior>().unwrap(),
            FrontendStepBehavior::Break
        );
        assert_eq!(
            " Skip ".parse::<FrontendStepBehavior>().unwrap(),
            FrontendStepBehavior::Skip
        );
        assert_eq!(
            "FAIL".parse::<FrontendStepBehavior>().unwrap(),
            FrontendStepBehavior::Fail
        );

        let err = "pause".parse::<FrontendStepBehavior>().unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_FRONTEND_STEP_BEHAVIOR");
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_frontend_step_behavior_roundtrips_as_str() {
        for behavior in [
            FrontendStepBehavior::Break,
            FrontendStepBehavior::Skip,
            FrontendStepBehavior::Fail,
        ] {
            assert_eq!(behavior.as_str().parse::<FrontendStepBehavior>().unwrap(), behavior);
        }
    }

    #[test]
    fn test_resume_input_builder() {
        let run_id = Uuid::new_v4();
        let input = RunProcessInput::resume("onboarding", run_id, "review")
            .with_value("approved", true)
            .with_frontend_step_behavior(FrontendStepBehavior::Skip);

        assert_eq!(input.run_id, Some(run_id));
        assert_eq!(input.start_after_step.as_deref(), Some("review"));
        assert_eq!(input.values.get("approved"), Some(&Value::Bool(true)));
        assert_eq!(input.frontend_step_behavior, FrontendStepBehavior::Skip);
    }

    #[test]
    fn test_new_state_is_complete_until_scheduled() {
        let mut state = ProcessState::new("onboarding");
        assert!(state.is_complete());
        state.next_step_name = Some("collect".to_string());
        assert!(!state.is_complete());
    }
}
