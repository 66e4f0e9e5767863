// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for async jobs started from backend steps.

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::sync::oneshot;

use common::*;
use steprun_core::config::{JobsConfig, SaturationPolicy};
use steprun_core::jobs::{AsyncJobState, JobOutcome};
use steprun_core::process::{
    ProcessDefinition, ProcessRegistry, RunProcessInput, RunProcessOutput, RunStatus,
};
use steprun_core::state::{StateKey, StateKind, StateStore};

#[tokio::test]
async fn test_status_lands_in_shared_store() {
    let ctx = TestContext::new(ProcessRegistry::new());
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let outcome = ctx
        .jobs
        .start_job("export", Duration::ZERO, |cb| async move {
            cb.update_status_with_counts("Exporting", 1, 3).await?;
            let _ = release_rx.await;
            cb.update_counts(3, 3).await?;
            Ok(vec![1, 2, 3])
        })
        .await
        .unwrap();
    let job_id = outcome.job_id().unwrap();

    let key = StateKey::new(job_id, StateKind::AsyncJobStatus);
    assert!(ctx.store.get_snapshot(&key).await.unwrap().is_some());

    release_tx.send(()).unwrap();
    let status = ctx
        .jobs
        .wait_for_job(job_id, POLL_INTERVAL, WAIT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(status.state, AsyncJobState::Complete);
    assert_eq!(status.job_name, "export");
    assert_eq!((status.current, status.total), (Some(3), Some(3)));

    let result: Vec<i32> = ctx.jobs.get_job_result(job_id).await.unwrap().unwrap();
    assert_eq!(result, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_error_status_keeps_caught_error() {
    let ctx = TestContext::new(ProcessRegistry::new());

    let outcome = ctx
        .jobs
        .start_job("import", Duration::ZERO, |_cb| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<(), _>(anyhow::anyhow!("row 17 is malformed"))
        })
        .await
        .unwrap();
    let JobOutcome::GoingAsync(job_id) = outcome else {
        panic!("expected the job to go async");
    };

    let status = ctx
        .jobs
        .wait_for_job(job_id, POLL_INTERVAL, WAIT_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(status.state, AsyncJobState::Error);
    assert_eq!(
        status.caught_error().map(|e| e.message.as_str()),
        Some("row 17 is malformed")
    );
}

#[tokio::test]
async fn test_backend_step_can_poll_its_own_job() {
    let process = ProcessDefinition::new("background").with_step(
        steprun_core::process::StepDefinition::backend(
            "compute",
            ComputeStep,
        ),
    );
    let ctx = TestContext::new(ProcessRegistry::new().with_process(process));

    let output = ctx
        .runner
        .run(RunProcessInput::new("background"))
        .await
        .unwrap();

    assert_eq!(output.status, RunStatus::Complete);
    assert_eq!(output.values.get("answer"), Some(&json!(42)));
}

#[tokio::test]
async fn test_step_jobs_inside_run_async_do_not_exhaust_pool() {
    for saturation_policy in [SaturationPolicy::Queue, SaturationPolicy::Reject] {
        let process = ProcessDefinition::new("background").with_step(
            steprun_core::process::StepDefinition::backend("compute", ComputeStep),
        );
        let ctx = TestContext::with_jobs_config(
            ProcessRegistry::new().with_process(process),
            JobsConfig {
                max_concurrent_jobs: 1,
                saturation_policy,
            },
        );

        let outcome = ctx
            .runner
            .run_async(RunProcessInput::new("background"), Duration::ZERO)
            .await
            .unwrap();
        let job_id = match outcome {
            JobOutcome::GoingAsync(job_id) => job_id,
            JobOutcome::Complete(output) => {
                assert_eq!(output.values.get("answer"), Some(&json!(42)));
                continue;
            }
        };

        let status = ctx
            .jobs
            .wait_for_job(job_id, POLL_INTERVAL, WAIT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(status.state, AsyncJobState::Complete, "{saturation_policy:?}");

        let output: RunProcessOutput = ctx.jobs.get_job_result(job_id).await.unwrap().unwrap();
        assert_eq!(output.status, RunStatus::Complete);
        assert_eq!(output.values.get("answer"), Some(&json!(42)));
    }
}

struct ComputeStep;

#[async_trait::async_trait]
impl steprun_core::process::BackendStep for ComputeStep {
    async fn run(&self, ctx: &mut steprun_core::process::StepContext<'_>) -> anyhow::Result<()> {
        let jobs = ctx.jobs().clone();
        let outcome = jobs
            .start_job("answer", Duration::ZERO, |_cb| async { Ok(42u32) })
            .await?;
        let answer = match outcome {
            JobOutcome::Complete(answer) => answer,
            JobOutcome::GoingAsync(job_id) => {
                jobs.wait_for_job(job_id, POLL_INTERVAL, WAIT_TIMEOUT).await?;
                jobs.get_job_result::<u32>(job_id)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("job {job_id} left no result"))?
            }
        };
        ctx.set_value("answer", answer);
        Ok(())
    }
}
