//! Version publication.
//!
//! The version store maps an artifact key to the version current on each
//! channel. Writes happen only after the integration test passed; the DAG
//! edge `integration → version` enforces that ordering.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::context::RunContext;
use crate::dag::{JobAction, JobFailure};
use crate::error::{ReleaseError, Result};

/// Channel additionally written for stable releases.
pub const STABLE_CHANNEL: &str = "stable";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub version: String,
    pub channel: String,
}

/// External version-tracking store.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Apply every record for `key` together; on error none of them is kept.
    async fn write(&self, key: &str, records: &[VersionRecord]) -> Result<()>;

    async fn read(&self, key: &str, channel: &str) -> Result<Option<VersionRecord>>;
}

/// JSON file store: `{ "<key>": { "<channel>": "<version>" } }`.
pub struct FileVersionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

type VersionTable = BTreeMap<String, BTreeMap<String, String>>;

impl FileVersionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<VersionTable> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(VersionTable::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl VersionStore for FileVersionStore {
    async fn write(&self, key: &str, records: &[VersionRecord]) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut table = self.load().await?;
        let channels = table.entry(key.to_string()).or_default();
        for record in records {
            channels.insert(record.channel.clone(), record.version.clone());
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never see a torn file.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&table)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn read(&self, key: &str, channel: &str) -> Result<Option<VersionRecord>> {
        let _guard = self.lock.lock().await;
        let table = self.load().await?;
        Ok(table
            .get(key)
            .and_then(|channels| channels.get(channel))
            .map(|version| VersionRecord {
                version: version.clone(),
                channel: channel.to_string(),
            }))
    }
}

/// Records the resolved version for the artifact.
pub struct VersionPublisher {
    store: Arc<dyn VersionStore>,
    artifact_name: String,
}

impl VersionPublisher {
    pub fn new(store: Arc<dyn VersionStore>, artifact_name: impl Into<String>) -> Self {
        Self {
            store,
            artifact_name: artifact_name.into(),
        }
    }

    /// Records written for a context: its channel, plus `stable` if flagged.
    pub fn records_for(ctx: &RunContext) -> Vec<VersionRecord> {
        let mut records = vec![VersionRecord {
            version: ctx.version.clone(),
            channel: ctx.channel.clone(),
        }];
        if ctx.stable && ctx.channel != STABLE_CHANNEL {
            records.push(VersionRecord {
                version: ctx.version.clone(),
                channel: STABLE_CHANNEL.to_string(),
            });
        }
        records
    }

    pub async fn publish(&self, ctx: &RunContext) -> Result<Vec<VersionRecord>> {
        let records = Self::records_for(ctx);
        self.store
            .write(&self.artifact_name, &records)
            .await
            .map_err(|e| ReleaseError::Publish(e.to_string()))?;
        for record in &records {
            info!(
                artifact = %self.artifact_name,
                version = %record.version,
                channel = %record.channel,
                "version recorded"
            );
        }
        Ok(records)
    }
}

/// DAG action wrapping [`VersionPublisher`].
pub struct PublishAction {
    publisher: VersionPublisher,
}

impl PublishAction {
    pub fn new(publisher: VersionPublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl JobAction for PublishAction {
    async fn run(&self, ctx: &RunContext, cancel: &CancellationToken) -> std::result::Result<(), JobFailure> {
        if cancel.is_cancelled() {
            return Err(ReleaseError::Cancelled("version publish".to_string()).into());
        }
        self.publisher.publish(ctx).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TriggerKind;

    fn ctx(channel: &str, stable: bool) -> RunContext {
        RunContext {
            trigger_kind: TriggerKind::Manual,
            channel: channel.to_string(),
            version: "2024.10.2".to_string(),
            publish: true,
            stable,
            requirements_changed: false,
        }
    }

    #[test]
    fn test_records_for_stable_adds_stable_channel() {
        assert_eq!(VersionPublisher::records_for(&ctx("beta", false)).len(), 1);
        let records = VersionPublisher::records_for(&ctx("beta", true));
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].channel, STABLE_CHANNEL);
        assert_eq!(VersionPublisher::records_for(&ctx("stable", true)).len(), 1);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_keeps_other_channels() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileVersionStore::new(dir.path().join("nested/versions.json"));

        assert!(store.read("supervisor", "dev").await.unwrap().is_none());

        store
            .write(
                "supervisor",
                &[VersionRecord {
                    version: "2024.10.dev0314".to_string(),
                    channel: "dev".to_string(),
                }],
            )
            .await
            .expect("write dev");
        store
            .write(
                "supervisor",
                &[VersionRecord {
                    version: "2024.10.0".to_string(),
                    channel: "beta".to_string(),
                }],
            )
            .await
            .expect("write beta");

        let dev = store.read("supervisor", "dev").await.unwrap().expect("dev");
        assert_eq!(dev.version, "2024.10.dev0314");
        let beta = store.read("supervisor", "beta").await.unwrap().expect("beta");
        assert_eq!(beta.version, "2024.10.0");
    }

    #[tokio::test]
    async fn test_publisher_writes_through_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileVersionStore::new(dir.path().join("versions.json")));
        let publisher = VersionPublisher::new(store.clone(), "supervisor");

        let written = publisher.publish(&ctx("beta", true)).await.expect("publish");
        assert_eq!(written.len(), 2);
        let stable = store
            .read("supervisor", STABLE_CHANNEL)
            .await
            .unwrap()
            .expect("stable record");
        assert_eq!(stable.version, "2024.10.2");
    }

    #[tokio::test]
    async fn test_stable_publish_is_a_single_store_write() {
        let store = Arc::new(crate::fakes::MemoryVersionStore::new());
        let publisher = VersionPublisher::new(store.clone(), "supervisor");

        publisher.publish(&ctx("beta", true)).await.expect("publish");
        assert_eq!(store.writes(), 1);
        assert!(store.read("supervisor", "beta").await.unwrap().is_some());
        assert!(store.read("supervisor", STABLE_CHANNEL).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_stable_publish_leaves_no_channel_written() {
        let store = Arc::new(crate::fakes::MemoryVersionStore::failing());
        let publisher = VersionPublisher::new(store.clone(), "supervisor");

        let err = publisher.publish(&ctx("beta", true)).await.unwrap_err();
        assert!(matches!(err, ReleaseError::Publish(_)));
        assert!(store.read("supervisor", "beta").await.unwrap().is_none());
        assert!(store.read("supervisor", STABLE_CHANNEL).await.unwrap().is_none());
    }
}
