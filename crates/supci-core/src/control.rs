//! Supervisor control API client.
//!
//! Commands mirror the `ha` CLI surface and map onto REST endpoints. The
//! JSON body is returned untouched (raw-output mode) so expectations can
//! inspect any field.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{ReleaseError, Result};

/// Raw JSON response from the control API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiResponse(pub Value);

impl ApiResponse {
    /// `{"result": "ok", "data": {}}`
    pub fn ok() -> Self {
        Self(json!({ "result": "ok", "data": {} }))
    }

    pub fn with_result(result: &str) -> Self {
        Self(json!({ "result": result, "data": {} }))
    }

    /// The top-level `result` field.
    pub fn result(&self) -> Option<&str> {
        self.0.get("result").and_then(Value::as_str)
    }

    pub fn is_ok(&self) -> bool {
        self.result() == Some("ok")
    }

    /// Look up a value by JSON pointer, e.g. `/data/unhealthy`.
    pub fn pointer(&self, pointer: &str) -> Option<&Value> {
        self.0.pointer(pointer)
    }
}

impl fmt::Display for ApiResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Commands understood by the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    SupervisorInfo,
    NetworkInfo,
    AddonInstall { slug: String },
    AddonStart { slug: String },
    SecurityOptions { content_trust: bool },
    ResolutionHealthcheck,
    ResolutionInfo,
}

/// HTTP method for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl ControlCommand {
    /// Method, path and optional JSON body for the REST call.
    pub fn endpoint(&self) -> (Method, String, Option<Value>) {
        match self {
            ControlCommand::SupervisorInfo => (Method::Get, "/supervisor/info".into(), None),
            ControlCommand::NetworkInfo => (Method::Get, "/network/info".into(), None),
            ControlCommand::AddonInstall { slug } => {
                (Method::Post, format!("/addons/{slug}/install"), None)
            }
            ControlCommand::AddonStart { slug } => {
                (Method::Post, format!("/addons/{slug}/start"), None)
            }
            ControlCommand::SecurityOptions { content_trust } => (
                Method::Post,
                "/security/options".into(),
                Some(json!({ "content_trust": content_trust })),
            ),
            ControlCommand::ResolutionHealthcheck => {
                (Method::Post, "/resolution/healthcheck".into(), None)
            }
            ControlCommand::ResolutionInfo => (Method::Get, "/resolution/info".into(), None),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::SupervisorInfo => write!(f, "supervisor info"),
            ControlCommand::NetworkInfo => write!(f, "network info"),
            ControlCommand::AddonInstall { slug } => write!(f, "addons install {slug}"),
            ControlCommand::AddonStart { slug } => write!(f, "addons start {slug}"),
            ControlCommand::SecurityOptions { content_trust } => {
                write!(f, "security options --content-trust={content_trust}")
            }
            ControlCommand::ResolutionHealthcheck => write!(f, "resolution healthcheck"),
            ControlCommand::ResolutionInfo => write!(f, "resolution info"),
        }
    }
}

/// Control API of a running instance.
#[async_trait]
pub trait ControlApi: Send + Sync {
    /// `GET /supervisor/ping`
    async fn ping(&self, address: &str) -> Result<ApiResponse>;

    async fn execute(&self, address: &str, command: &ControlCommand) -> Result<ApiResponse>;
}

/// reqwest-backed control API client.
pub struct HttpControlApi {
    client: reqwest::Client,
    token: Option<String>,
}

impl HttpControlApi {
    pub fn new(request_timeout: Duration, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("supci/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|e| ReleaseError::Control(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, token })
    }

    async fn send(
        &self,
        address: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<ApiResponse> {
        let url = format!("http://{address}{path}");
        debug!(url = %url, "control request");

        let mut request = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
        };
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        // Error responses still carry a JSON body with `result: error`.
        let response = request
            .send()
            .await
            .map_err(|e| ReleaseError::Control(format!("{url}: {e}")))?;
        let status = response.status();
        let value = response
            .json::<Value>()
            .await
            .map_err(|e| ReleaseError::Control(format!("{url}: HTTP {status}, invalid JSON: {e}")))?;
        Ok(ApiResponse(value))
    }
}

#[async_trait]
impl ControlApi for HttpControlApi {
    async fn ping(&self, address: &str) -> Result<ApiResponse> {
        self.send(address, Method::Get, "/supervisor/ping", None).await
    }

    async fn execute(&self, address: &str, command: &ControlCommand) -> Result<ApiResponse> {
        let (method, path, body) = command.endpoint();
        self.send(address, method, &path, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_result_field() {
        assert!(ApiResponse::ok().is_ok());
        let resp = ApiResponse(json!({ "result": "error", "message": "boom" }));
        assert_eq!(resp.result(), Some("error"));
        assert!(!resp.is_ok());
        assert_eq!(ApiResponse(json!({})).result(), None);
    }

    #[test]
    fn test_response_pointer() {
        let resp = ApiResponse(json!({ "result": "ok", "data": { "unhealthy": ["docker"] } }));
        assert_eq!(
            resp.pointer("/data/unhealthy"),
            Some(&json!(["docker"]))
        );
    }

    #[test]
    fn test_command_display_matches_cli() {
        assert_eq!(ControlCommand::SupervisorInfo.to_string(), "supervisor info");
        assert_eq!(
            ControlCommand::SecurityOptions {
                content_trust: true
            }
            .to_string(),
            "security options --content-trust=true"
        );
        assert_eq!(
            ControlCommand::AddonInstall {
                slug: "core_ssh".to_string()
            }
            .to_string(),
            "addons install core_ssh"
        );
    }

    #[test]
    fn test_command_endpoints() {
        let (method, path, body) = ControlCommand::SecurityOptions {
            content_trust: true,
        }
        .endpoint();
        assert_eq!(method, Method::Post);
        assert_eq!(path, "/security/options");
        assert_eq!(body, Some(json!({ "content_trust": true })));

        let (method, path, _) = ControlCommand::AddonStart {
            slug: "core_ssh".to_string(),
        }
        .endpoint();
        assert_eq!(method, Method::Post);
        assert_eq!(path, "/addons/core_ssh/start");

        let (method, path, body) = ControlCommand::ResolutionInfo.endpoint();
        assert_eq!(method, Method::Get);
        assert_eq!(path, "/resolution/info");
        assert!(body.is_none());
    }

    #[tokio::test]
    async fn test_ping_unreachable_is_control_error() {
        let api = HttpControlApi::new(Duration::from_millis(500), None).expect("client");
        let err = api.ping("127.0.0.1:9").await.unwrap_err();
        assert!(matches!(err, ReleaseError::Control(_)));
    }
}
