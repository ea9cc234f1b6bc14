//! Integration test against a live instance.
//!
//! The runner walks a fixed state sequence:
//!
//! ```text
//! Provisioning → Starting → AwaitingReady → Verifying → Succeeded
//!       │            │            │              │
//!       └────────────┴────────────┴──────────────┴──→ CollectingDiagnostics → Failed
//! ```
//!
//! Once an instance has started it is always removed, whether the run
//! succeeded, failed or was cancelled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::build::{ArtifactBuilder, BuildJob, RUNNER_TAG};
use crate::config::{ReadinessConfig, ReleaseConfig};
use crate::context::RunContext;
use crate::control::ControlApi;
use crate::dag::{JobAction, JobFailure};
use crate::error::{ReleaseError, Result};
use crate::obs;
use crate::runtime::{ContainerRuntime, InstanceHandle, LaunchSpec};
use crate::verification::{CheckResult, VerificationPlan};

/// Integration state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationState {
    Provisioning,
    Starting,
    AwaitingReady,
    Verifying,
    CollectingDiagnostics,
    Succeeded,
    Failed,
}

impl IntegrationState {
    pub fn name(&self) -> &'static str {
        match self {
            IntegrationState::Provisioning => "provisioning",
            IntegrationState::Starting => "starting",
            IntegrationState::AwaitingReady => "awaiting_ready",
            IntegrationState::Verifying => "verifying",
            IntegrationState::CollectingDiagnostics => "collecting_diagnostics",
            IntegrationState::Succeeded => "succeeded",
            IntegrationState::Failed => "failed",
        }
    }
}

/// Readiness poll bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl From<&ReadinessConfig> for ReadinessPolicy {
    fn from(config: &ReadinessConfig) -> Self {
        Self {
            interval: config.interval(),
            timeout: config.timeout(),
        }
    }
}

/// Poll `ping` until it answers `result: ok`.
///
/// Returns the number of attempts. Transport errors and non-ok answers are
/// retried until the deadline; cancellation aborts immediately.
pub async fn await_ready(
    control: &dyn ControlApi,
    address: &str,
    policy: ReadinessPolicy,
    cancel: &CancellationToken,
) -> Result<u32> {
    let deadline = Instant::now() + policy.timeout;
    let mut attempts = 0u32;
    let mut last_observed = "no response".to_string();

    loop {
        attempts += 1;
        let ping = tokio::time::timeout_at(deadline, control.ping(address));
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ReleaseError::Cancelled(
                    IntegrationState::AwaitingReady.name().to_string(),
                ));
            }
            outcome = ping => outcome,
        };

        match outcome {
            Ok(Ok(response)) if response.is_ok() => {
                debug!(attempts, "instance ready");
                return Ok(attempts);
            }
            Ok(Ok(response)) => last_observed = response.to_string(),
            Ok(Err(e)) => last_observed = e.to_string(),
            Err(_) => last_observed = "ping still pending at deadline".to_string(),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ReleaseError::ReadinessTimeout {
                address: address.to_string(),
                timeout_secs: policy.timeout.as_secs(),
                last_observed,
            });
        }

        let wake = std::cmp::min(now + policy.interval, deadline);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ReleaseError::Cancelled(
                    IntegrationState::AwaitingReady.name().to_string(),
                ));
            }
            _ = tokio::time::sleep_until(wake) => {}
        }
    }
}

/// A started instance that must be removed.
///
/// Call [`RunningInstance::release`] on every path. If the value is dropped
/// without release (a panic or an aborted task), removal is spawned onto the
/// current runtime.
pub struct RunningInstance {
    handle: InstanceHandle,
    runtime: Arc<dyn ContainerRuntime>,
    released: bool,
}

impl RunningInstance {
    pub fn new(handle: InstanceHandle, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            handle,
            runtime,
            released: false,
        }
    }

    pub fn handle(&self) -> &InstanceHandle {
        &self.handle
    }

    pub fn address(&self) -> &str {
        &self.handle.address
    }

    /// Best-effort log capture.
    pub async fn capture_logs(&self) -> Option<String> {
        match self.runtime.logs(&self.handle).await {
            Ok(logs) => Some(logs),
            Err(e) => {
                warn!(container = %self.handle.id, error = %e, "failed to capture instance logs");
                None
            }
        }
    }

    /// Remove the instance. Failures are logged, never propagated.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.runtime.remove(&self.handle).await {
            warn!(container = %self.handle.id, error = %e, "failed to remove instance");
        }
    }
}

impl Drop for RunningInstance {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let runtime = Arc::clone(&self.runtime);
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = runtime.remove(&handle).await {
                        warn!(container = %handle.id, error = %e, "failed to remove instance");
                    }
                });
            }
            Err(_) => warn!(container = %handle.id, "instance leaked: no runtime to remove it"),
        }
    }
}

/// Everything observed during one integration run.
#[derive(Debug, Default, Serialize)]
pub struct IntegrationReport {
    pub states: Vec<IntegrationState>,
    pub checks: Vec<CheckResult>,
    pub ready_attempts: u32,
    /// Instance logs, captured when the run failed after start.
    pub logs: Option<String>,
    pub instance: Option<InstanceHandle>,
    #[serde(skip)]
    pub error: Option<ReleaseError>,
}

impl IntegrationReport {
    pub fn succeeded(&self) -> bool {
        self.states.last() == Some(&IntegrationState::Succeeded)
    }

    fn enter(&mut self, state: IntegrationState) {
        obs::emit_integration_state(state.name());
        self.states.push(state);
    }
}

/// Drives the integration state machine.
pub struct IntegrationRunner {
    config: Arc<ReleaseConfig>,
    builder: Arc<ArtifactBuilder>,
    runtime: Arc<dyn ContainerRuntime>,
    control: Arc<dyn ControlApi>,
}

impl IntegrationRunner {
    pub fn new(
        config: Arc<ReleaseConfig>,
        builder: Arc<ArtifactBuilder>,
        runtime: Arc<dyn ContainerRuntime>,
        control: Arc<dyn ControlApi>,
    ) -> Self {
        Self {
            config,
            builder,
            runtime,
            control,
        }
    }

    /// Local image reference the instance is launched from.
    pub fn runner_image(&self) -> String {
        format!(
            "{}:{}",
            self.config.image_for(&self.config.runner_architecture),
            RUNNER_TAG
        )
    }

    pub async fn run(&self, ctx: &RunContext, cancel: &CancellationToken) -> IntegrationReport {
        let mut report = IntegrationReport::default();

        report.enter(IntegrationState::Provisioning);
        if let Err(e) = self.provision(ctx, cancel).await {
            return self.fail(report, None, e).await;
        }

        report.enter(IntegrationState::Starting);
        let spec = LaunchSpec::supervisor(self.runner_image(), &self.config.instance);
        let instance = match self.runtime.launch(&spec, cancel).await {
            Ok(handle) => {
                report.instance = Some(handle.clone());
                RunningInstance::new(handle, Arc::clone(&self.runtime))
            }
            Err(e) => {
                let e = if e.is_cancelled() {
                    e
                } else {
                    ReleaseError::Provision(format!("launch: {e}"))
                };
                return self.fail(report, None, e).await;
            }
        };

        match self.exercise(ctx, &instance, &mut report, cancel).await {
            Ok(()) => {
                instance.release().await;
                report.enter(IntegrationState::Succeeded);
                info!(checks = report.checks.len(), "integration test passed");
                report
            }
            Err(e) => self.fail(report, Some(instance), e).await,
        }
    }

    /// Produce the `runner` image: build it locally in test mode, pull the
    /// published build otherwise.
    async fn provision(&self, ctx: &RunContext, cancel: &CancellationToken) -> Result<()> {
        let arch = self.config.runner_architecture.as_str();
        let wrap = |e: ReleaseError| {
            if e.is_cancelled() {
                e
            } else {
                ReleaseError::Provision(e.to_string())
            }
        };

        if ctx.test_mode() {
            let job = BuildJob::new(arch, Arc::new(ctx.clone()));
            self.builder.build(&job, cancel).await.map_err(wrap)?;
        } else {
            let image = self.config.image_for(arch);
            let published = format!("{image}:{}", ctx.version);
            self.runtime.pull(&published, cancel).await.map_err(wrap)?;
            self.runtime
                .tag(&published, &self.runner_image(), cancel)
                .await
                .map_err(wrap)?;
        }
        Ok(())
    }

    async fn exercise(
        &self,
        ctx: &RunContext,
        instance: &RunningInstance,
        report: &mut IntegrationReport,
        cancel: &CancellationToken,
    ) -> Result<()> {
        report.enter(IntegrationState::AwaitingReady);
        let policy = ReadinessPolicy::from(&self.config.readiness);
        report.ready_attempts =
            await_ready(self.control.as_ref(), instance.address(), policy, cancel).await?;

        report.enter(IntegrationState::Verifying);
        let plan = VerificationPlan::for_context(ctx, &self.config.addon_smoke_tests);
        let (checks, error) = plan
            .run(self.control.as_ref(), instance.address(), cancel)
            .await;
        report.checks = checks;
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn fail(
        &self,
        mut report: IntegrationReport,
        instance: Option<RunningInstance>,
        error: ReleaseError,
    ) -> IntegrationReport {
        if let Some(instance) = instance {
            report.enter(IntegrationState::CollectingDiagnostics);
            report.logs = instance.capture_logs().await;
            instance.release().await;
        }
        report.enter(IntegrationState::Failed);
        report.error = Some(error);
        report
    }
}

/// DAG action for the integration job.
pub struct IntegrationAction {
    runner: IntegrationRunner,
}

impl IntegrationAction {
    pub fn new(runner: IntegrationRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl JobAction for IntegrationAction {
    async fn run(&self, ctx: &RunContext, cancel: &CancellationToken) -> std::result::Result<(), JobFailure> {
        let report = self.runner.run(ctx, cancel).await;
        match report.error {
            None => Ok(()),
            Some(error) => Err(JobFailure::with_diagnostics(error, report.logs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ApiResponse;
    use crate::fakes::ScriptedControlApi;

    fn policy(interval: u64, timeout: u64) -> ReadinessPolicy {
        ReadinessPolicy {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_retries_until_ok() {
        let control = ScriptedControlApi::new().pings(vec![
            Err("connection refused".to_string()),
            Ok(ApiResponse::with_result("error")),
            Ok(ApiResponse::ok()),
        ]);
        let attempts = await_ready(&control, "10.0.0.2:80", policy(5, 60), &CancellationToken::new())
            .await
            .expect("ready");
        assert_eq!(attempts, 3);
        assert_eq!(control.ping_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_times_out_with_last_observation() {
        let control =
            ScriptedControlApi::new().pings(vec![Ok(ApiResponse::with_result("starting"))]);
        let started = Instant::now();
        let err = await_ready(&control, "10.0.0.2:80", policy(5, 20), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ReleaseError::ReadinessTimeout {
                timeout_secs,
                last_observed,
                ..
            } => {
                assert_eq!(timeout_secs, 20);
                assert!(last_observed.contains("starting"));
            }
            other => panic!("expected readiness timeout, got {other:?}"),
        }
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(control.ping_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_ready_cancelled() {
        let control = ScriptedControlApi::new().pings(vec![Err("refused".to_string())]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            trigger.cancel();
        });
        let err = await_ready(&control, "10.0.0.2:80", policy(5, 600), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(IntegrationState::AwaitingReady.name(), "awaiting_ready");
        assert_eq!(
            IntegrationState::CollectingDiagnostics.name(),
            "collecting_diagnostics"
        );
    }
}
