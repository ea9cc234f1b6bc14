//! Workspace signing. Runs only in publish mode.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{render_template, CommandTemplates};
use crate::context::RunContext;
use crate::dag::{JobAction, JobFailure};
use crate::error::{ReleaseError, Result};
use crate::process::{CommandSpec, ProcessRunner};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    pub workspace: PathBuf,
    pub version: String,
    pub organization: String,
}

/// Signed statement bound to a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub version: String,
    pub organization: String,
    pub signature: String,
    pub signed_at: DateTime<Utc>,
}

/// Signing service.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, request: &SignRequest, cancel: &CancellationToken) -> Result<Attestation>;
}

/// Signer driven by an argument template.
pub struct CommandSigner {
    templates: CommandTemplates,
}

impl CommandSigner {
    pub fn new(templates: CommandTemplates) -> Self {
        Self { templates }
    }
}

#[async_trait]
impl Signer for CommandSigner {
    async fn sign(&self, request: &SignRequest, cancel: &CancellationToken) -> Result<Attestation> {
        let workspace = request.workspace.to_string_lossy().to_string();
        let argv = render_template(
            &self.templates.signer,
            &[
                ("workspace", workspace.as_str()),
                ("version", request.version.as_str()),
                ("organization", request.organization.as_str()),
            ],
        );
        let spec = CommandSpec::new("sign", argv).with_timeout(self.templates.timeout_secs);
        let output = ProcessRunner::execute_checked(&spec, cancel).await?;

        let signature = hex::encode(Sha256::digest(output.stdout.as_bytes()));
        Ok(Attestation {
            version: request.version.clone(),
            organization: request.organization.clone(),
            signature,
            signed_at: Utc::now(),
        })
    }
}

/// DAG action signing the workspace for the resolved version.
pub struct SignAction {
    signer: Arc<dyn Signer>,
    workspace: PathBuf,
    organization: String,
}

impl SignAction {
    pub fn new(signer: Arc<dyn Signer>, workspace: PathBuf, organization: impl Into<String>) -> Self {
        Self {
            signer,
            workspace,
            organization: organization.into(),
        }
    }
}

#[async_trait]
impl JobAction for SignAction {
    async fn run(&self, ctx: &RunContext, cancel: &CancellationToken) -> std::result::Result<(), JobFailure> {
        let request = SignRequest {
            workspace: self.workspace.clone(),
            version: ctx.version.clone(),
            organization: self.organization.clone(),
        };
        let attestation = self.signer.sign(&request, cancel).await.map_err(|e| {
            if e.is_cancelled() {
                e
            } else {
                ReleaseError::Signing(e.to_string())
            }
        })?;
        if attestation.version != ctx.version {
            return Err(ReleaseError::Signing(format!(
                "attestation bound to {} instead of {}",
                attestation.version, ctx.version
            ))
            .into());
        }
        info!(
            version = %attestation.version,
            organization = %attestation.organization,
            "workspace signed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TriggerKind;
    use crate::fakes::FakeSigner;

    fn ctx() -> RunContext {
        RunContext {
            trigger_kind: TriggerKind::Release,
            channel: "beta".to_string(),
            version: "2024.10.0".to_string(),
            publish: true,
            stable: false,
            requirements_changed: false,
        }
    }

    #[tokio::test]
    async fn test_sign_action_binds_version() {
        let signer = Arc::new(FakeSigner::new());
        let action = SignAction::new(signer.clone(), PathBuf::from("."), "example.org");
        action
            .run(&ctx(), &CancellationToken::new())
            .await
            .expect("sign");
        let requests = signer.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].version, "2024.10.0");
        assert_eq!(requests[0].organization, "example.org");
    }

    #[tokio::test]
    async fn test_sign_failure_is_signing_error() {
        let signer = Arc::new(FakeSigner::failing());
        let action = SignAction::new(signer, PathBuf::from("."), "example.org");
        let failure = action
            .run(&ctx(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, ReleaseError::Signing(_)));
    }

    #[tokio::test]
    async fn test_command_signer_runs_template() {
        let mut templates = CommandTemplates::default();
        templates.signer = vec![
            "echo".to_string(),
            "{organization}".to_string(),
            "{version}".to_string(),
        ];
        let signer = CommandSigner::new(templates);
        let request = SignRequest {
            workspace: PathBuf::from("."),
            version: "1.2.3".to_string(),
            organization: "org".to_string(),
        };
        let attestation = signer
            .sign(&request, &CancellationToken::new())
            .await
            .expect("sign");
        assert_eq!(attestation.version, "1.2.3");
        assert_eq!(attestation.signature.len(), 64);
    }
}
