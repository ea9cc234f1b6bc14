//! Verification plan executed against a ready instance.
//!
//! Steps run in order and stop at the first failure. Which steps are
//! included depends on the run context: the security and resolution checks
//! only make sense against a published build.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::RunContext;
use crate::control::{ApiResponse, ControlApi, ControlCommand};
use crate::error::ReleaseError;
use crate::obs;

/// What a step's response must look like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expectation {
    /// Top-level `result` equals `"ok"`.
    ResultOk,
    /// `result` is `"ok"` and the value at `pointer` is an empty array.
    EmptyList { pointer: String },
}

impl Expectation {
    /// `None` when satisfied, otherwise the observed value.
    pub fn check(&self, response: &ApiResponse) -> Option<String> {
        if !response.is_ok() {
            return Some(match response.result() {
                Some(result) => format!("result '{result}'"),
                None => format!("no result field in {response}"),
            });
        }
        match self {
            Expectation::ResultOk => None,
            Expectation::EmptyList { pointer } => match response.pointer(pointer) {
                Some(Value::Array(items)) if items.is_empty() => None,
                Some(other) => Some(format!("{pointer} = {other}")),
                None => Some(format!("{pointer} missing")),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationStep {
    pub command: ControlCommand,
    pub expectation: Expectation,
}

impl VerificationStep {
    pub fn ok(command: ControlCommand) -> Self {
        Self {
            command,
            expectation: Expectation::ResultOk,
        }
    }

    pub fn name(&self) -> String {
        self.command.to_string()
    }
}

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub step: String,
    pub passed: bool,
    /// Observed value when the step failed.
    pub observed: Option<String>,
}

/// Ordered checks for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationPlan {
    pub steps: Vec<VerificationStep>,
}

impl VerificationPlan {
    /// Core info checks always; trust and health checks in publish mode;
    /// then install-and-start for each configured add-on.
    pub fn for_context(ctx: &RunContext, addons: &[String]) -> Self {
        let mut steps = vec![
            VerificationStep::ok(ControlCommand::SupervisorInfo),
            VerificationStep::ok(ControlCommand::NetworkInfo),
        ];

        if ctx.publish {
            steps.push(VerificationStep::ok(ControlCommand::SecurityOptions {
                content_trust: true,
            }));
            steps.push(VerificationStep::ok(ControlCommand::ResolutionHealthcheck));
            steps.push(VerificationStep {
                command: ControlCommand::ResolutionInfo,
                expectation: Expectation::EmptyList {
                    pointer: "/data/unhealthy".to_string(),
                },
            });
        }

        for slug in addons {
            steps.push(VerificationStep::ok(ControlCommand::AddonInstall {
                slug: slug.clone(),
            }));
            steps.push(VerificationStep::ok(ControlCommand::AddonStart {
                slug: slug.clone(),
            }));
        }

        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run steps in order, stopping at the first failure.
    ///
    /// On cancellation the checks completed so far are returned with a
    /// `Cancelled` error; the interrupted step is not recorded.
    pub async fn run(
        &self,
        control: &dyn ControlApi,
        address: &str,
        cancel: &CancellationToken,
    ) -> (Vec<CheckResult>, Option<ReleaseError>) {
        let mut checks = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            let name = step.name();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return (checks, Some(ReleaseError::Cancelled("verifying".to_string())));
                }
                outcome = control.execute(address, &step.command) => outcome,
            };
            // Transport errors count as a failed step.
            let observed = match outcome {
                Ok(response) => step.expectation.check(&response),
                Err(e) => Some(e.to_string()),
            };

            obs::emit_check(&name, observed.is_none());
            let passed = observed.is_none();
            checks.push(CheckResult {
                step: name.clone(),
                passed,
                observed: observed.clone(),
            });

            if let Some(observed) = observed {
                return (
                    checks,
                    Some(ReleaseError::Verification {
                        step: name,
                        observed,
                    }),
                );
            }
        }

        (checks, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TriggerKind;
    use crate::fakes::ScriptedControlApi;
    use serde_json::json;

    fn ctx(publish: bool) -> RunContext {
        RunContext {
            trigger_kind: TriggerKind::Manual,
            channel: "dev".to_string(),
            version: "1.0.0".to_string(),
            publish,
            stable: false,
            requirements_changed: false,
        }
    }

    fn names(plan: &VerificationPlan) -> Vec<String> {
        plan.steps.iter().map(VerificationStep::name).collect()
    }

    #[test]
    fn test_test_mode_plan_has_core_checks_only() {
        let plan = VerificationPlan::for_context(&ctx(false), &[]);
        assert_eq!(names(&plan), vec!["supervisor info", "network info"]);
    }

    #[test]
    fn test_publish_plan_adds_trust_and_health() {
        let plan = VerificationPlan::for_context(&ctx(true), &["core_ssh".to_string()]);
        assert_eq!(
            names(&plan),
            vec![
                "supervisor info",
                "network info",
                "security options --content-trust=true",
                "resolution healthcheck",
                "resolution info",
                "addons install core_ssh",
                "addons start core_ssh",
            ]
        );
    }

    #[test]
    fn test_empty_list_expectation() {
        let expectation = Expectation::EmptyList {
            pointer: "/data/unhealthy".to_string(),
        };
        let healthy = ApiResponse(json!({ "result": "ok", "data": { "unhealthy": [] } }));
        assert_eq!(expectation.check(&healthy), None);

        let unhealthy =
            ApiResponse(json!({ "result": "ok", "data": { "unhealthy": ["docker"] } }));
        let observed = expectation.check(&unhealthy).expect("should fail");
        assert!(observed.contains("docker"));

        let missing = ApiResponse(json!({ "result": "ok", "data": {} }));
        assert!(expectation.check(&missing).is_some());
    }

    #[tokio::test]
    async fn test_run_stops_at_first_failure() {
        let control = ScriptedControlApi::new()
            .respond("network info", ApiResponse::with_result("error"));
        let plan = VerificationPlan::for_context(&ctx(true), &[]);

        let (checks, error) = plan
            .run(&control, "10.0.0.2:80", &CancellationToken::new())
            .await;
        assert_eq!(checks.len(), 2);
        assert!(checks[0].passed);
        assert!(!checks[1].passed);
        match error {
            Some(ReleaseError::Verification { step, observed }) => {
                assert_eq!(step, "network info");
                assert!(observed.contains("error"));
            }
            other => panic!("expected verification error, got {other:?}"),
        }
        assert_eq!(control.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_transport_error_fails_the_step() {
        let control = ScriptedControlApi::new().fail("supervisor info", "connection reset");
        let plan = VerificationPlan::for_context(&ctx(false), &[]);

        let (checks, error) = plan
            .run(&control, "10.0.0.2:80", &CancellationToken::new())
            .await;
        assert_eq!(checks.len(), 1);
        assert!(!checks[0].passed);
        match error {
            Some(ReleaseError::Verification { step, observed }) => {
                assert_eq!(step, "supervisor info");
                assert!(observed.contains("connection reset"));
            }
            other => panic!("expected verification error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_keeps_completed_checks() {
        let control = ScriptedControlApi::new().stall("network info");
        let plan = VerificationPlan::for_context(&ctx(true), &[]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let (checks, error) = plan.run(&control, "10.0.0.2:80", &cancel).await;
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].step, "supervisor info");
        assert!(checks[0].passed);
        assert!(error.is_some_and(|e| e.is_cancelled()));
    }
}
