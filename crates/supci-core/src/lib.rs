//! supci core - build and release orchestration for the Supervisor container
//!
//! Provides:
//! - Version resolution from trigger metadata into an immutable run context
//! - A guarded job DAG: per-architecture builds, signing, integration test
//!   and version publication
//! - An integration state machine with a bounded readiness poll and an
//!   interpreted verification plan
//! - In-memory fakes for every external collaborator

pub mod build;
pub mod config;
pub mod context;
pub mod control;
pub mod dag;
pub mod error;
pub mod fakes;
pub mod integration;
pub mod matrix;
pub mod obs;
pub mod orchestrator;
pub mod process;
pub mod publish;
pub mod release;
pub mod runtime;
pub mod sign;
pub mod telemetry;
pub mod verification;
pub mod version;

// Re-export key types
pub use build::{ArtifactBuilder, BuildArtifact, BuildJob};
pub use config::ReleaseConfig;
pub use context::{ManualInputs, RunContext, Trigger, TriggerKind};
pub use dag::{Guard, JobAction, JobFailure, JobGraph, JobNode};
pub use error::{ReleaseError, Result};
pub use integration::{IntegrationReport, IntegrationRunner, IntegrationState, ReadinessPolicy};
pub use matrix::ArchitectureMatrix;
pub use orchestrator::{JobOutcome, JobStatus, Orchestrator, PlannedJob, RunReport};
pub use release::{Collaborators, ReleaseRun};
pub use version::{GitChangeSource, VersionResolver};
