// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for steprun-core integration tests.
//!
//! Provides TestContext wiring a store, job manager and runner around a
//! registry of sample processes.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use steprun_core::config::JobsConfig;
use steprun_core::jobs::AsyncJobManager;
use steprun_core::process::{ProcessDefinition, ProcessRegistry, ProcessRunner, StepDefinition};
use steprun_core::record::Record;
use steprun_core::state::{InMemoryStateStore, StateStore};

pub const POLL_INTERVAL: Duration = Duration::from_millis(5);
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a fmt subscriber honoring RUST_LOG. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Store, job manager and runner sharing one in-memory store.
pub struct TestContext {
    pub store: Arc<InMemoryStateStore>,
    pub jobs: AsyncJobManager,
    pub runner: ProcessRunner,
}

impl TestContext {
    pub fn new(registry: ProcessRegistry) -> Self {
        Self::with_jobs_config(registry, JobsConfig::default())
    }

    pub fn with_jobs_config(registry: ProcessRegistry, config: JobsConfig) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryStateStore::new());
        let shared: Arc<dyn StateStore> = store.clone();
        let jobs = AsyncJobManager::new(shared.clone(), config);
        let runner = ProcessRunner::new(Arc::new(registry), shared, jobs.clone());
        Self {
            store,
            jobs,
            runner,
        }
    }
}

/// Backend step adding `amount` to the integer value `counter` and emitting
/// a record with the new total.
pub fn add_step(name: &str, amount: i64) -> StepDefinition {
    let step_name = name.to_string();
    StepDefinition::backend_fn(name, move |ctx| {
        let total = ctx
            .value("counter")
            .and_then(|v| v.as_i64())
            .unwrap_or_default()
            + amount;
        ctx.set_value("counter", total);
        ctx.add_record(Record::new().with("step", step_name.as_str()).with("total", total));
        Ok(())
    })
}

/// Backend step that always fails.
pub fn failing_step(name: &str, message: &'static str) -> StepDefinition {
    StepDefinition::backend_fn(name, move |ctx| {
        ctx.set_value("attempted", true);
        anyhow::bail!(message)
    })
}

/// Backend step counting its executions.
pub fn counting_step(name: &str, counter: Arc<AtomicUsize>) -> StepDefinition {
    StepDefinition::backend_fn(name, move |_ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

/// `collect -> review (frontend) -> activate`
pub fn onboarding_process() -> ProcessDefinition {
    ProcessDefinition::new("onboarding")
        .with_step(add_step("collect", 1))
        .with_step(StepDefinition::frontend("review"))
        .with_step(add_step("activate", 10))
}

/// Three backend steps and no frontend step.
pub fn backend_only_process() -> ProcessDefinition {
    ProcessDefinition::new("tally")
        .with_step(add_step("first", 1))
        .with_step(add_step("second", 2))
        .with_step(add_step("third", 3))
}
