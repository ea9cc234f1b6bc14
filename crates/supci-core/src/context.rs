//! Trigger inputs and the resolved, immutable run context.

use serde::{Deserialize, Serialize};

/// Which event started the run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    PullRequest,
    Release,
    Push,
}

impl TriggerKind {
    pub fn name(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::PullRequest => "pull_request",
            TriggerKind::Release => "release",
            TriggerKind::Push => "push",
        }
    }
}

/// Inputs supplied on manual dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManualInputs {
    pub channel: String,
    pub version: Option<String>,
    pub publish: bool,
    pub stable: bool,
}

/// Trigger metadata for a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Trigger {
    Manual(ManualInputs),
    PullRequest { base_ref: String },
    Release { tag: String },
    Push { branch: String },
}

impl Trigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Trigger::Manual(_) => TriggerKind::Manual,
            Trigger::PullRequest { .. } => TriggerKind::PullRequest,
            Trigger::Release { .. } => TriggerKind::Release,
            Trigger::Push { .. } => TriggerKind::Push,
        }
    }
}

/// Facts about the run, resolved once and shared read-only with every job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunContext {
    pub trigger_kind: TriggerKind,
    pub channel: String,
    pub version: String,
    pub publish: bool,
    /// Also mark the published build as the stable release.
    pub stable: bool,
    /// A watched dependency manifest changed; forces a cache rebuild.
    pub requirements_changed: bool,
}

impl RunContext {
    /// Builds skip registry pushes and produce local test images.
    pub fn test_mode(&self) -> bool {
        !self.publish
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_kind_mapping() {
        let trigger = Trigger::Release {
            tag: "2024.10.0".to_string(),
        };
        assert_eq!(trigger.kind(), TriggerKind::Release);
        assert_eq!(trigger.kind().name(), "release");
    }

    #[test]
    fn test_trigger_serializes_with_event_tag() {
        let trigger = Trigger::Push {
            branch: "main".to_string(),
        };
        let json = serde_json::to_value(&trigger).expect("serialize");
        assert_eq!(json["event"], "push");
        assert_eq!(json["branch"], "main");
    }

    #[test]
    fn test_test_mode_is_inverse_of_publish() {
        let ctx = RunContext {
            trigger_kind: TriggerKind::PullRequest,
            channel: "dev".to_string(),
            version: "2024.10.dev0112".to_string(),
            publish: false,
            stable: false,
            requirements_changed: false,
        };
        assert!(ctx.test_mode());
    }
}
