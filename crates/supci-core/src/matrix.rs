//! Target architecture matrix.

use serde::{Deserialize, Serialize};

use crate::config::ReleaseConfig;
use crate::error::{ReleaseError, Result};

/// Ordered, duplicate-free set of target architectures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchitectureMatrix {
    architectures: Vec<String>,
}

impl ArchitectureMatrix {
    /// Build a matrix, keeping first occurrences. An empty set is rejected
    /// so a fan-out can never silently succeed with zero cells.
    pub fn new<I, S>(architectures: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for arch in architectures {
            let arch = arch.into().trim().to_string();
            if arch.is_empty() {
                return Err(ReleaseError::Configuration(
                    "architecture identifiers must not be blank".to_string(),
                ));
            }
            if !unique.contains(&arch) {
                unique.push(arch);
            }
        }
        if unique.is_empty() {
            return Err(ReleaseError::Configuration(
                "architecture matrix is empty".to_string(),
            ));
        }
        Ok(Self {
            architectures: unique,
        })
    }

    pub fn from_config(config: &ReleaseConfig) -> Result<Self> {
        Self::new(config.architectures.iter().cloned())
    }

    pub fn len(&self) -> usize {
        self.architectures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.architectures.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.architectures.iter().map(String::as_str)
    }

    pub fn contains(&self, architecture: &str) -> bool {
        self.architectures.iter().any(|a| a == architecture)
    }
}
