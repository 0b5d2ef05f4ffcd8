// src/management.rs
// Management connection layer: HTTP clients for talking to the ReflexSOAR
// management console, plus the process-wide named connection registry that
// the supervisor shares with every role worker.

use std::ops::Deref;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::errors::{AgentError, Result};

pub const MGMT_API_VERSION: &str = "v2.0";

/// Name reserved for the primary console connection. Only the supervisor may
/// register or replace it.
pub const DEFAULT_CONNECTION_NAME: &str = "default";

fn agent_user_agent() -> String {
    format!("reflexsoar-agent/{}", env!("CARGO_PKG_VERSION"))
}

struct ConnectionInner {
    name: String,
    url: String,
    ignore_tls: bool,
    api_key: RwLock<String>,
    headers: RwLock<HeaderMap>,
    client: reqwest::Client,
}

/// A named HTTP client with the agent's default headers. Generic transport
/// only; the typed console endpoints live on [`ManagementConnection`].
#[derive(Clone)]
pub struct HttpConnection {
    inner: Arc<ConnectionInner>,
}

impl HttpConnection {
    pub fn new(url: &str, api_key: &str, ignore_tls: bool, name: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}"))
                .unwrap_or_else(|_| HeaderValue::from_static("Bearer")),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&agent_user_agent())
                .unwrap_or_else(|_| HeaderValue::from_static("reflexsoar-agent")),
        );

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(ignore_tls)
            .build()?;

        Ok(HttpConnection {
            inner: Arc::new(ConnectionInner {
                name: name.to_string(),
                url: url.trim_end_matches('/').to_string(),
                ignore_tls,
                api_key: RwLock::new(api_key.to_string()),
                headers: RwLock::new(headers),
                client,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn ignore_tls(&self) -> bool {
        self.inner.ignore_tls
    }

    pub fn api_key(&self) -> String {
        self.inner.api_key.read().expect("api_key lock poisoned").clone()
    }

    /// Replaces the stored API key and the Authorization header in one step.
    pub fn set_api_key(&self, api_key: &str) {
        *self.inner.api_key.write().expect("api_key lock poisoned") = api_key.to_string();
        self.update_header("Authorization", &format!("Bearer {api_key}"));
    }

    /// Sets or replaces a default header sent with every request.
    pub fn update_header(&self, key: &str, value: &str) {
        let name = match key.parse::<HeaderName>() {
            Ok(name) => name,
            Err(e) => {
                warn!("Refusing to set invalid header name \"{}\": {}", key, e);
                return;
            }
        };
        let value = match HeaderValue::from_str(value) {
            Ok(value) => value,
            Err(e) => {
                warn!("Refusing to set invalid header value for \"{}\": {}", key, e);
                return;
            }
        };
        self.inner
            .headers
            .write()
            .expect("headers lock poisoned")
            .insert(name, value);
    }

    /// A redacted view of the connection suitable for logging.
    pub fn config(&self) -> Value {
        serde_json::json!({
            "name": self.name(),
            "url": self.url(),
            "ignore_tls": self.ignore_tls(),
            "user_agent": agent_user_agent(),
        })
    }

    /// Makes an HTTP call against `<url>/<endpoint>`. Leading and trailing
    /// slashes on the endpoint are normalized away. Transport failures are
    /// logged and surfaced as `None`; status handling is the caller's job.
    pub async fn call_api(
        &self,
        method: Method,
        endpoint: &str,
        data: Option<&Value>,
    ) -> Option<Response> {
        let endpoint = endpoint.trim_matches('/');
        let url = format!("{}/{}", self.inner.url, endpoint);

        let headers = self.inner.headers.read().expect("headers lock poisoned").clone();
        let mut request = self.inner.client.request(method, &url).headers(headers);
        if let Some(data) = data {
            request = request.json(data);
        }

        match request.send().await {
            Ok(response) => Some(response),
            Err(e) if e.is_connect() => {
                error!("Failed to connect to {}: {}", url, e);
                None
            }
            Err(e) => {
                error!("Failed to make a call to {}: {}", url, e);
                None
            }
        }
    }
}

/// A console connection: an [`HttpConnection`] plus the typed management API
/// endpoints under `/api/v2.0/`.
#[derive(Clone)]
pub struct ManagementConnection {
    http: HttpConnection,
}

impl Deref for ManagementConnection {
    type Target = HttpConnection;

    fn deref(&self) -> &Self::Target {
        &self.http
    }
}

impl ManagementConnection {
    pub fn new(url: &str, api_key: &str, ignore_tls: bool, name: &str) -> Result<Self> {
        Ok(ManagementConnection {
            http: HttpConnection::new(url, api_key, ignore_tls, name)?,
        })
    }

    pub fn from_http(http: HttpConnection) -> Self {
        ManagementConnection { http }
    }

    fn endpoint(path: &str) -> String {
        format!("api/{}/{}", MGMT_API_VERSION, path.trim_matches('/'))
    }

    /// Pairs this agent with the console. On success the returned token
    /// replaces the connection's API key for all subsequent calls.
    pub async fn agent_pair(&self, payload: &Value) -> Result<Value> {
        let response = self
            .call_api(Method::POST, &Self::endpoint("agent"), Some(payload))
            .await
            .ok_or_else(|| AgentError::PairingUnreachable(self.url().to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let body: Value = response.json().await?;
                if let Some(token) = body.get("token").and_then(Value::as_str) {
                    self.set_api_key(token);
                }
                Ok(body)
            }
            StatusCode::CONFLICT => Err(AgentError::PairingConflict(self.url().to_string())),
            status => Err(AgentError::PairingUnreachable(format!(
                "{} returned {}",
                self.url(),
                status
            ))),
        }
    }

    /// Sends a heartbeat for `agent_id`. Any non-200 answer (or no answer at
    /// all) is a failed heartbeat.
    pub async fn agent_heartbeat(&self, agent_id: &str, body: &Value) -> Result<Value> {
        let endpoint = Self::endpoint(&format!("agent/heartbeat/{agent_id}"));
        let response = self
            .call_api(Method::POST, &endpoint, Some(body))
            .await
            .ok_or_else(|| AgentError::HeartbeatFailed(self.url().to_string()))?;

        if response.status() == StatusCode::OK {
            Ok(response.json().await?)
        } else {
            Err(AgentError::HeartbeatFailed(format!(
                "{} returned {}",
                self.url(),
                response.status()
            )))
        }
    }

    /// Fetches the agent document and returns its attached policy.
    pub async fn agent_get_policy(&self, agent_id: &str) -> Option<Value> {
        let endpoint = Self::endpoint(&format!("agent/{agent_id}"));
        let response = self.call_api(Method::GET, &endpoint, None).await?;
        if response.status() != StatusCode::OK {
            debug!(
                "Policy fetch for agent {} returned {}",
                agent_id,
                response.status()
            );
            return None;
        }
        let body: Value = response.json().await.ok()?;
        body.get("policy").cloned()
    }

    /// Fetches the inputs assigned to this agent.
    pub async fn agent_get_inputs(&self) -> Option<Vec<Value>> {
        let response = self
            .call_api(Method::GET, &Self::endpoint("agent/inputs"), None)
            .await?;
        if response.status() != StatusCode::OK {
            debug!("Input fetch returned {}", response.status());
            return None;
        }
        let body: Value = response.json().await.ok()?;
        body.get("inputs")
            .and_then(Value::as_array)
            .map(|inputs| inputs.to_vec())
    }

    /// Fetches the detection rules assigned to this agent.
    pub async fn agent_get_detections(&self) -> Option<Value> {
        let response = self
            .call_api(Method::GET, &Self::endpoint("agent/detections"), None)
            .await?;
        if response.status() != StatusCode::OK {
            debug!("Detection fetch returned {}", response.status());
            return None;
        }
        response.json().await.ok()
    }

    /// Resolves an input credential: the username from the credential record
    /// and the decrypted secret from the decrypt endpoint.
    pub async fn agent_get_input_credentials(&self, cred_id: &str) -> Option<(String, String)> {
        let response = self
            .call_api(
                Method::GET,
                &Self::endpoint(&format!("credential/{cred_id}")),
                None,
            )
            .await?;
        if response.status() != StatusCode::OK {
            return None;
        }
        let body: Value = response.json().await.ok()?;
        let username = body.get("username")?.as_str()?.to_string();

        let response = self
            .call_api(
                Method::GET,
                &Self::endpoint(&format!("credential/decrypt/{cred_id}")),
                None,
            )
            .await?;
        if response.status() != StatusCode::OK {
            return None;
        }
        let body: Value = response.json().await.ok()?;
        let secret = body.get("secret")?.as_str()?.to_string();

        Some((username, secret))
    }

    /// Ships a batch of events to the console's bulk endpoint. Returns true
    /// when the console accepted the batch.
    pub async fn bulk_events<T: Serialize>(&self, events: &[T]) -> bool {
        let payload = match serde_json::to_value(events) {
            Ok(value) => serde_json::json!({ "events": value }),
            Err(e) => {
                error!("Failed to serialize event batch: {}", e);
                return false;
            }
        };
        let response = self
            .call_api(Method::POST, &Self::endpoint("event/_bulk"), Some(&payload))
            .await;
        match response {
            Some(response) if response.status() == StatusCode::OK => true,
            Some(response) => {
                warn!("Bulk event submission returned {}", response.status());
                false
            }
            None => false,
        }
    }
}

/// Process-wide named map of console connections. The supervisor owns one
/// registry and hands clones (cheap, shared) to every role worker.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, ManagementConnection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection under its name. Names are unique.
    pub fn add(&self, conn: ManagementConnection) -> Result<()> {
        let name = conn.name().to_string();
        if self.connections.contains_key(&name) {
            return Err(AgentError::DuplicateConnection(name));
        }
        self.connections.insert(name, conn);
        Ok(())
    }

    /// Removes a connection by name.
    pub fn remove(&self, name: &str) -> Result<()> {
        self.connections
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| AgentError::ConnectionNotExist(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<ManagementConnection> {
        self.connections.get(name).map(|entry| entry.value().clone())
    }

    pub fn get_default(&self) -> Option<ManagementConnection> {
        self.get(DEFAULT_CONNECTION_NAME)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.connections.contains_key(name)
    }

    /// Replaces the `"default"` console connection. Supervisor-only: role
    /// workers go through the role context, which refuses this name.
    pub fn set_default(&self, conn: ManagementConnection) {
        self.connections
            .insert(DEFAULT_CONNECTION_NAME.to_string(), conn);
    }
}

/// Builds a generic HTTP connection.
pub fn build_http_connection(
    url: &str,
    api_key: &str,
    ignore_tls: bool,
    name: &str,
) -> Result<HttpConnection> {
    HttpConnection::new(url, api_key, ignore_tls, name)
}

/// Builds a management connection, optionally registering it in `registry`.
pub fn build_management_connection(
    url: &str,
    api_key: &str,
    ignore_tls: bool,
    name: &str,
    register_in: Option<&ConnectionRegistry>,
) -> Result<ManagementConnection> {
    let conn = ManagementConnection::new(url, api_key, ignore_tls, name)?;
    if let Some(registry) = register_in {
        registry.add(conn.clone())?;
    }
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn mgmt(url: &str) -> ManagementConnection {
        ManagementConnection::new(url, "foo", false, "mock-api").unwrap()
    }

    #[test]
    fn registry_add_remove_get() {
        let registry = ConnectionRegistry::new();
        let conn = ManagementConnection::new("https://localhost", "", false, "test").unwrap();

        registry.add(conn.clone()).unwrap();
        assert!(matches!(
            registry.add(conn.clone()),
            Err(AgentError::DuplicateConnection(_))
        ));

        assert!(registry.get("foo").is_none());
        assert_eq!(registry.get("test").unwrap().name(), "test");

        registry.remove("test").unwrap();
        assert!(matches!(
            registry.remove("test"),
            Err(AgentError::ConnectionNotExist(_))
        ));

        // After removal the name is free again.
        registry.add(conn).unwrap();
    }

    #[test]
    fn build_helpers() {
        let registry = ConnectionRegistry::new();
        let conn = build_management_connection(
            "https://localhost",
            "",
            false,
            "test",
            Some(&registry),
        )
        .unwrap();
        assert_eq!(conn.name(), "test");
        assert!(registry.contains("test"));

        let http = build_http_connection("https://localhost/", "", false, "http-test").unwrap();
        assert_eq!(http.name(), "http-test");
        assert_eq!(http.url(), "https://localhost");
    }

    #[test]
    fn connection_config_view() {
        let conn = mgmt("https://localhost");
        let config = conn.config();
        assert_eq!(config["name"], "mock-api");
        assert_eq!(config["url"], "https://localhost");
        assert_eq!(config["ignore_tls"], false);
    }

    #[tokio::test]
    async fn call_api_normalizes_endpoints() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(&server)
            .await;

        let conn = mgmt(&server.uri());
        for endpoint in ["test", "/test", "test/", "/test/"] {
            let response = conn.call_api(Method::GET, endpoint, None).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn call_api_sends_default_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/test"))
            .and(header("Authorization", "Bearer foo"))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .expect(1)
            .mount(&server)
            .await;

        let conn = mgmt(&server.uri());
        assert!(conn.call_api(Method::GET, "test", None).await.is_some());
    }

    #[tokio::test]
    async fn call_api_connection_error_returns_none() {
        // Nothing is listening on this port.
        let conn = mgmt("http://127.0.0.1:1");
        assert!(conn.call_api(Method::GET, "test", None).await.is_none());
    }

    #[tokio::test]
    async fn agent_pair_updates_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2.0/agent"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"uuid": "agent-1", "token": "successtoken"})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2.0/agent"))
            .respond_with(ResponseTemplate::new(409))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2.0/agent"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let conn = mgmt(&server.uri());
        let body = conn.agent_pair(&json!({"name": "host"})).await.unwrap();
        assert_eq!(body["token"], "successtoken");
        assert_eq!(conn.api_key(), "successtoken");

        assert!(matches!(
            conn.agent_pair(&json!({})).await,
            Err(AgentError::PairingConflict(_))
        ));
        assert!(matches!(
            conn.agent_pair(&json!({})).await,
            Err(AgentError::PairingUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn agent_heartbeat_success_and_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2.0/agent/heartbeat/123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2.0/agent/heartbeat/failed"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let conn = mgmt(&server.uri());
        let body = conn.agent_heartbeat("123", &json!({})).await.unwrap();
        assert_eq!(body["success"], true);

        assert!(matches!(
            conn.agent_heartbeat("failed", &json!({})).await,
            Err(AgentError::HeartbeatFailed(_))
        ));
    }

    #[tokio::test]
    async fn agent_get_policy_unwraps_policy_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/agent/123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"policy": {"health_check_interval": 10}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/agent/456"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let conn = mgmt(&server.uri());
        let policy = conn.agent_get_policy("123").await.unwrap();
        assert_eq!(policy["health_check_interval"], 10);
        assert!(conn.agent_get_policy("456").await.is_none());
    }

    #[tokio::test]
    async fn agent_get_inputs_unwraps_list() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/agent/inputs"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"inputs": [{"uuid": "abc123"}]})),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/agent/inputs"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let conn = mgmt(&server.uri());
        let inputs = conn.agent_get_inputs().await.unwrap();
        assert_eq!(inputs, vec![json!({"uuid": "abc123"})]);
        assert!(conn.agent_get_inputs().await.is_none());
    }

    #[tokio::test]
    async fn agent_get_input_credentials_makes_two_calls() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/credential/123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"username": "foo"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2.0/credential/decrypt/123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"secret": "bar"})))
            .mount(&server)
            .await;

        let conn = mgmt(&server.uri());
        let (username, secret) = conn.agent_get_input_credentials("123").await.unwrap();
        assert_eq!(username, "foo");
        assert_eq!(secret, "bar");
    }

    #[tokio::test]
    async fn bulk_events_reports_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2.0/event/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v2.0/event/_bulk"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let conn = mgmt(&server.uri());
        assert!(conn.bulk_events(&[json!({"foo": "bar"})]).await);
        assert!(!conn.bulk_events(&[json!({"foo": "bar"})]).await);
    }
}
