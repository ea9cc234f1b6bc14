//! Structured observability hooks for release runs.
//!
//! Lifecycle events are emitted at `info!` with a stable `event` field so
//! JSON log output can be filtered per job.

use tracing::{info, warn};

/// Run-scoped span; instrument the run future with it.
pub fn run_span(run_id: &str, version: &str) -> tracing::Span {
    tracing::info_span!("supci.run", run_id = %run_id, version = %version)
}

pub fn emit_run_started(run_id: &str, jobs: usize, publish: bool) {
    info!(event = "run.started", run_id = %run_id, jobs = jobs, publish = publish);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, success: bool) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        success = success,
    );
}

pub fn emit_job_started(job: &str) {
    info!(event = "job.started", job = %job);
}

pub fn emit_job_finished(job: &str, status: &str, duration_ms: u64) {
    info!(event = "job.finished", job = %job, status = %status, duration_ms = duration_ms);
}

pub fn emit_job_skipped(job: &str, guard: &str) {
    info!(event = "job.skipped", job = %job, guard = %guard);
}

pub fn emit_job_failed(job: &str, error: &dyn std::fmt::Display) {
    warn!(event = "job.failed", job = %job, error = %error);
}

pub fn emit_integration_state(state: &str) {
    info!(event = "integration.state", state = %state);
}

pub fn emit_check(step: &str, passed: bool) {
    info!(event = "verification.check", step = %step, passed = passed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let span = run_span("test-run-id", "2024.10.0");
        let _entered = span.enter();
        emit_job_started("build:amd64");
    }
}
