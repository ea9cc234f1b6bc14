//! In-memory fakes for the collaborator traits (testing only)
//!
//! Every fake records the calls it receives so tests can assert on what the
//! orchestrator did, not only on the report it produced.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::build::{BuildArtifact, BuildRequest, CacheBuilder, CacheScope, Packager, RegistryLogin};
use crate::context::Trigger;
use crate::control::{ApiResponse, ControlApi, ControlCommand};
use crate::error::{ReleaseError, Result};
use crate::publish::{VersionRecord, VersionStore};
use crate::runtime::{ContainerRuntime, InstanceHandle, LaunchSpec};
use crate::sign::{Attestation, SignRequest, Signer};
use crate::version::ChangeSource;

// ---------------------------------------------------------------------------
// StaticChangeSource
// ---------------------------------------------------------------------------

/// Change source returning a fixed file list, or failing.
#[derive(Debug, Default)]
pub struct StaticChangeSource {
    files: Option<Vec<String>>,
    calls: AtomicUsize,
}

impl StaticChangeSource {
    pub fn new(files: Vec<String>) -> Self {
        Self {
            files: Some(files),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeSource for StaticChangeSource {
    async fn changed_files(&self, _trigger: &Trigger) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.files.clone().ok_or_else(|| ReleaseError::Process {
            command: "git diff".to_string(),
            reason: "no history".to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Build collaborators
// ---------------------------------------------------------------------------

/// Packager producing deterministic digests; fails for selected architectures.
#[derive(Debug, Default)]
pub struct FakePackager {
    failing: HashSet<String>,
    requests: Mutex<Vec<BuildRequest>>,
}

impl FakePackager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on<I, S>(architectures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            failing: architectures.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<BuildRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Packager for FakePackager {
    async fn package(
        &self,
        request: &BuildRequest,
        _cancel: &CancellationToken,
    ) -> Result<BuildArtifact> {
        self.requests.lock().unwrap().push(request.clone());
        if self.failing.contains(&request.architecture) {
            return Err(ReleaseError::Process {
                command: format!("package_{}", request.architecture),
                reason: "exited with code 1".to_string(),
            });
        }
        let digest = Sha256::digest(format!("{}:{}", request.image, request.version).as_bytes());
        Ok(BuildArtifact {
            architecture: request.architecture.clone(),
            image: request.image.clone(),
            tags: request.tags.clone(),
            digest: format!("sha256:{}", hex::encode(digest)),
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeCacheBuilder {
    fail: bool,
    scopes: Mutex<Vec<CacheScope>>,
}

impl FakeCacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn scopes(&self) -> Vec<CacheScope> {
        self.scopes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CacheBuilder for FakeCacheBuilder {
    async fn rebuild(&self, scope: &CacheScope, _cancel: &CancellationToken) -> Result<()> {
        self.scopes.lock().unwrap().push(scope.clone());
        if self.fail {
            return Err(ReleaseError::Process {
                command: format!("cache_{}", scope.architecture),
                reason: "wheel build failed".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeRegistryLogin {
    calls: AtomicUsize,
}

impl FakeRegistryLogin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistryLogin for FakeRegistryLogin {
    async fn login(&self, _registry: &str, _cancel: &CancellationToken) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeSigner
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct FakeSigner {
    fail: bool,
    requests: Mutex<Vec<SignRequest>>,
}

impl FakeSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<SignRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Signer for FakeSigner {
    async fn sign(&self, request: &SignRequest, _cancel: &CancellationToken) -> Result<Attestation> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(ReleaseError::Process {
                command: "sign".to_string(),
                reason: "signer unavailable".to_string(),
            });
        }
        Ok(Attestation {
            version: request.version.clone(),
            organization: request.organization.clone(),
            signature: hex::encode(Sha256::digest(request.version.as_bytes())),
            signed_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryVersionStore
// ---------------------------------------------------------------------------

/// In-memory version store backed by `HashMap<key, BTreeMap<channel, version>>`.
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    fail: bool,
    table: Mutex<HashMap<String, BTreeMap<String, String>>>,
    writes: AtomicUsize,
}

impl MemoryVersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn write(&self, key: &str, records: &[VersionRecord]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ReleaseError::Publish("store unavailable".to_string()));
        }
        let mut table = self.table.lock().unwrap();
        let channels = table.entry(key.to_string()).or_default();
        for record in records {
            channels.insert(record.channel.clone(), record.version.clone());
        }
        Ok(())
    }

    async fn read(&self, key: &str, channel: &str) -> Result<Option<VersionRecord>> {
        let table = self.table.lock().unwrap();
        Ok(table
            .get(key)
            .and_then(|channels| channels.get(channel))
            .map(|version| VersionRecord {
                version: version.clone(),
                channel: channel.to_string(),
            }))
    }
}

// ---------------------------------------------------------------------------
// FakeRuntime
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RuntimeLog {
    pulls: Vec<String>,
    tags: Vec<(String, String)>,
    launches: Vec<LaunchSpec>,
    log_reads: usize,
    removed: Vec<String>,
}

/// Container runtime that never touches a real daemon.
#[derive(Debug, Default)]
pub struct FakeRuntime {
    fail_pull: bool,
    fail_launch: bool,
    logs: String,
    state: Mutex<RuntimeLog>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            logs: "supervisor booted".to_string(),
            ..Self::default()
        }
    }

    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }

    pub fn failing_pull(mut self) -> Self {
        self.fail_pull = true;
        self
    }

    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    pub fn pulls(&self) -> Vec<String> {
        self.state.lock().unwrap().pulls.clone()
    }

    pub fn tags(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().tags.clone()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state.lock().unwrap().launches.clone()
    }

    pub fn log_reads(&self) -> usize {
        self.state.lock().unwrap().log_reads
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull(&self, image: &str, _cancel: &CancellationToken) -> Result<()> {
        self.state.lock().unwrap().pulls.push(image.to_string());
        if self.fail_pull {
            return Err(ReleaseError::Process {
                command: "docker_pull".to_string(),
                reason: format!("manifest unknown: {image}"),
            });
        }
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str, _cancel: &CancellationToken) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .tags
            .push((source.to_string(), target.to_string()));
        Ok(())
    }

    async fn launch(
        &self,
        spec: &LaunchSpec,
        _cancel: &CancellationToken,
    ) -> Result<InstanceHandle> {
        let mut state = self.state.lock().unwrap();
        state.launches.push(spec.clone());
        if self.fail_launch {
            return Err(ReleaseError::Process {
                command: "docker_run".to_string(),
                reason: "permission denied".to_string(),
            });
        }
        Ok(InstanceHandle {
            id: format!("fake-{}", state.launches.len()),
            address: format!("172.30.32.2:{}", spec.control_port),
            started_at: Utc::now(),
        })
    }

    async fn logs(&self, _instance: &InstanceHandle) -> Result<String> {
        self.state.lock().unwrap().log_reads += 1;
        Ok(self.logs.clone())
    }

    async fn remove(&self, instance: &InstanceHandle) -> Result<()> {
        self.state.lock().unwrap().removed.push(instance.id.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedControlApi
// ---------------------------------------------------------------------------

/// Control API answering from a script.
///
/// Pings are served from a queue whose last entry repeats forever. Commands
/// answer `result: ok` unless a response was scripted for their CLI form.
#[derive(Debug)]
pub struct ScriptedControlApi {
    pings: Mutex<VecDeque<std::result::Result<ApiResponse, String>>>,
    responses: HashMap<String, std::result::Result<ApiResponse, String>>,
    stalled: HashSet<String>,
    ping_count: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl Default for ScriptedControlApi {
    fn default() -> Self {
        Self {
            pings: Mutex::new(VecDeque::from([Ok(ApiResponse::ok())])),
            responses: HashMap::new(),
            stalled: HashSet::new(),
            ping_count: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedControlApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the ping script. `Err` entries become transport errors.
    pub fn pings(self, script: Vec<std::result::Result<ApiResponse, String>>) -> Self {
        *self.pings.lock().unwrap() = script.into();
        self
    }

    pub fn respond(mut self, command: &str, response: ApiResponse) -> Self {
        self.responses.insert(command.to_string(), Ok(response));
        self
    }

    pub fn fail(mut self, command: &str, error: &str) -> Self {
        self.responses
            .insert(command.to_string(), Err(error.to_string()));
        self
    }

    /// The command never answers.
    pub fn stall(mut self, command: &str) -> Self {
        self.stalled.insert(command.to_string());
        self
    }

    pub fn ping_count(&self) -> usize {
        self.ping_count.load(Ordering::SeqCst)
    }

    /// Commands executed, in CLI form.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlApi for ScriptedControlApi {
    async fn ping(&self, _address: &str) -> Result<ApiResponse> {
        self.ping_count.fetch_add(1, Ordering::SeqCst);
        let mut pings = self.pings.lock().unwrap();
        let next = if pings.len() > 1 {
            pings.pop_front()
        } else {
            pings.front().cloned()
        };
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(ReleaseError::Control(e)),
            None => Err(ReleaseError::Control("no ping scripted".to_string())),
        }
    }

    async fn execute(&self, _address: &str, command: &ControlCommand) -> Result<ApiResponse> {
        let name = command.to_string();
        self.executed.lock().unwrap().push(name.clone());
        if self.stalled.contains(&name) {
            std::future::pending::<()>().await;
        }
        match self.responses.get(&name) {
            Some(Ok(response)) => Ok(response.clone()),
            Some(Err(e)) => Err(ReleaseError::Control(e.clone())),
            None => Ok(match command {
                ControlCommand::ResolutionInfo => ApiResponse(serde_json::json!({
                    "result": "ok",
                    "data": { "unhealthy": [], "unsupported": [] }
                })),
                _ => ApiResponse::ok(),
            }),
        }
    }
}
