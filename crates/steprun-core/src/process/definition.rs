// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process and step definitions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::state::ProcessState;
use crate::config::EtlConfig;
use crate::error::{CoreError, Result};
use crate::jobs::AsyncJobManager;
use crate::record::Record;

/// Server-side step body.
///
/// A step mutates the run's values and records through its context. A
/// returned error fails the run; the state reached so far is kept.
#[async_trait]
pub trait BackendStep: Send + Sync {
    /// Execute the step.
    async fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()>;
}

/// Adapter running a synchronous closure as a backend step.
pub struct FnStep<F>(pub F);

#[async_trait]
impl<F> BackendStep for FnStep<F>
where
    F: Fn(&mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    async fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        (self.0)(ctx)
    }
}

/// The view of a run a backend step executes against.
pub struct StepContext<'a> {
    run_id: Uuid,
    step_name: &'a str,
    state: &'a mut ProcessState,
    jobs: &'a AsyncJobManager,
    etl_config: &'a EtlConfig,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        run_id: Uuid,
        step_name: &'a str,
        state: &'a mut ProcessState,
        jobs: &'a AsyncJobManager,
        etl_config: &'a EtlConfig,
    ) -> Self {
        Self {
            run_id,
            step_name,
            state,
            jobs,
            etl_config,
        }
    }

    /// Run identifier.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Name of the process being run.
    pub fn process_name(&self) -> &str {
        &self.state.process_name
    }

    /// Name of the executing step.
    pub fn step_name(&self) -> &str {
        self.step_name
    }

    /// All run values.
    pub fn values(&self) -> &Map<String, Value> {
        &self.state.values
    }

    /// A run value by name.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.state.values.get(name)
    }

    /// Set a run value.
    pub fn set_value(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.state.values.insert(name.into(), value.into());
    }

    /// Remove a run value.
    pub fn remove_value(&mut self, name: &str) -> Option<Value> {
        self.state.values.remove(name)
    }

    /// Output records collected so far.
    pub fn records(&self) -> &[Record] {
        &self.state.records
    }

    /// Append an output record.
    pub fn add_record(&mut self, record: Record) {
        self.state.records.push(record);
    }

    /// Append several output records.
    pub fn add_records(&mut self, records: impl IntoIterator<Item = Record>) {
        self.state.records.extend(records);
    }

    /// Take the output records, leaving none.
    pub fn take_records(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.state.records)
    }

    /// Job manager for steps that run work in the background.
    pub fn jobs(&self) -> &AsyncJobManager {
        self.jobs
    }

    /// Streamed ETL tuning configured on the runner.
    pub fn etl_config(&self) -> &EtlConfig {
        self.etl_config
    }
}

/// Discriminant of a step definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Interactive step.
    Frontend,
    /// Server-side step.
    Backend,
}

/// A point where the caller supplies input.
#[derive(Debug, Clone, PartialEq)]
pub struct FrontendStep {
    /// Step name, unique within the process.
    pub name: String,
    /// Display label.
    pub label: Option<String>,
    /// Callback configuration handed to the caller when the run pauses here.
    pub callbacks: Map<String, Value>,
}

/// A server-side step and its body.
#[derive(Clone)]
pub struct BackendStepDefinition {
    /// Step name, unique within the process.
    pub name: String,
    /// Step body.
    pub step: Arc<dyn BackendStep>,
}

impl fmt::Debug for BackendStepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendStepDefinition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// One entry of a process definition.
#[derive(Debug, Clone)]
pub enum StepDefinition {
    /// Interactive step.
    Frontend(FrontendStep),
    /// Server-side step.
    Backend(BackendStepDefinition),
}

impl StepDefinition {
    /// A frontend step without label or callbacks.
    pub fn frontend(name: impl Into<String>) -> Self {
        Self::Frontend(FrontendStep {
            name: name.into(),
            label: None,
            callbacks: Map::new(),
        })
    }

    /// A backend step.
    pub fn backend(name: impl Into<String>, step: impl BackendStep + 'static) -> Self {
        Self::Backend(BackendStepDefinition {
            name: name.into(),
            step: Arc::new(step),
        })
    }

    /// A backend step from a synchronous closure.
    pub fn backend_fn<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut StepContext<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::backend(name, FnStep(f))
    }

    /// Step name.
    pub fn name(&self) -> &str {
        match self {
            Self::Frontend(step) => &step.name,
            Self::Backend(step) => &step.name,
        }
    }

    /// Step discriminant.
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Frontend(_) => StepKind::Frontend,
            Self::Backend(_) => StepKind::Backend,
        }
    }
}

/// A named, ordered list of steps.
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    /// Process name.
    pub name: String,
    /// Display label.
    pub label: Option<String>,
    /// Steps in execution order.
    pub steps: Vec<StepDefinition>,
}

impl ProcessDefinition {
    /// Empty process.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            steps: Vec::new(),
        }
    }

    /// Set the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Append a step.
    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Position of a step by name.
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.name() == name)
    }

    /// Step names in order.
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.name().to_string()).collect()
    }
}

/// Process definitions by name.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    processes: HashMap<String, Arc<ProcessDefinition>>,
}

impl ProcessRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition, replacing any with the same name.
    pub fn register(&mut self, definition: ProcessDefinition) {
        self.processes
            .insert(definition.name.clone(), Arc::new(definition));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_process(mut self, definition: ProcessDefinition) -> Self {
        self.register(definition);
        self
    }

    /// Look up a definition.
    pub fn get(&self, name: &str) -> Result<Arc<ProcessDefinition>> {
        self.processes
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::ProcessNotFound {
                name: name.to_string(),
            })
    }

    /// Registered process names.
    pub fn names(&self) -> Vec<&str> {
        self.processes.keys().map(String::as_str).collect()
    }
}
