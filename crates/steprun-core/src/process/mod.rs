// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process definitions, process state and the step execution engine.
//!
//! A [`ProcessDefinition`] is an ordered list of [`StepDefinition`]s. The
//! [`ProcessRunner`] walks the list for one run, persisting the
//! [`ProcessState`] after every backend step so a later call can resume the
//! run after a frontend step.

mod definition;
mod runner;
mod state;

pub use definition::{
    BackendStep, BackendStepDefinition, FnStep, FrontendStep, ProcessDefinition,
    ProcessRegistry, StepContext, StepDefinition, StepKind,
};
pub use runner::ProcessRunner;
pub use state::{FrontendStepBehavior, ProcessState, RunProcessInput, RunProcessOutput, RunStatus};
