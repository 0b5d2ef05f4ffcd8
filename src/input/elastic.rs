// src/input/elastic.rs
// Poll-type input for Elasticsearch and OpenSearch clusters. Queries the
// _search API over HTTP for recent documents and returns the raw hits.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::errors::{AgentError, Result};
use crate::input::{Credentials, Input, ParsedInputConfig};

pub const ALIAS: &str = "elastic";

/// Driver-specific keys of the input's policy config.
pub const CONFIG_FIELDS: &[&str] = &[
    "hosts",
    "index",
    "search_period",
    "lucene_filter",
    "search_size",
    "max_hits",
    "auth_method",
    "cafile",
    "cert_verification",
    "check_hostname",
    "no_scroll",
    "distro",
];

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const SCROLL_KEEPALIVE: &str = "2m";

// Outcome of one search attempt, used to decide whether to retry.
enum SearchFailure {
    Auth(String),
    BadRequest(String),
    Api(String),
}

pub struct ElasticInput {
    parsed: ParsedInputConfig,
    credentials: Option<Credentials>,
    client: reqwest::Client,
    last_run: Option<DateTime<Utc>>,
    running: bool,
}

impl ElasticInput {
    /// Builds the input from a console input document.
    pub fn from_entry(entry: &Value, credentials: Option<Credentials>) -> Result<Self> {
        Self::new(ParsedInputConfig::parse(entry, CONFIG_FIELDS), credentials)
    }

    pub fn new(parsed: ParsedInputConfig, credentials: Option<Credentials>) -> Result<Self> {
        // A cert_verification of "none" (or an unset cafile) means the
        // cluster is reached without certificate validation.
        let verify = parsed
            .config
            .get("cert_verification")
            .and_then(Value::as_str)
            .map(|mode| mode == "required")
            .unwrap_or(false);

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify)
            .build()?;

        Ok(ElasticInput {
            parsed,
            credentials,
            client,
            last_run: None,
            running: false,
        })
    }

    fn config_str(&self, key: &str) -> Option<String> {
        self.parsed
            .config
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn hosts(&self) -> Vec<String> {
        self.parsed
            .config
            .get("hosts")
            .and_then(Value::as_array)
            .map(|hosts| {
                hosts
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|h| h.trim_end_matches('/').to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The bool query body: a @timestamp range over the search period plus
    /// an optional lucene filter.
    pub fn build_query_body(search_period: &str, lucene_filter: Option<&str>) -> Value {
        let mut must = vec![json!({
            "range": {"@timestamp": {"gte": format!("now-{search_period}")}}
        })];
        if let Some(filter) = lucene_filter {
            if !filter.is_empty() {
                must.push(json!({"query_string": {"query": filter}}));
            }
        }
        json!({"bool": {"must": must}})
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let Some((username, secret)) = &self.credentials else {
            return request;
        };
        match self.config_str("auth_method").as_deref() {
            Some("api_key") => {
                let token = STANDARD.encode(format!("{username}:{secret}"));
                request.header("Authorization", format!("ApiKey {token}"))
            }
            _ => request.basic_auth(username, Some(secret)),
        }
    }

    async fn search(
        &self,
        host: &str,
        index: &str,
        body: &Value,
        scroll: bool,
    ) -> std::result::Result<Value, SearchFailure> {
        let mut url = format!("{host}/{index}/_search");
        if scroll {
            url.push_str(&format!("?scroll={SCROLL_KEEPALIVE}"));
        }
        self.send(&url, body).await
    }

    async fn scroll(&self, host: &str, scroll_id: &str) -> std::result::Result<Value, SearchFailure> {
        let url = format!("{host}/_search/scroll");
        let body = json!({"scroll": SCROLL_KEEPALIVE, "scroll_id": scroll_id});
        self.send(&url, &body).await
    }

    async fn send(&self, url: &str, body: &Value) -> std::result::Result<Value, SearchFailure> {
        let request = self.apply_auth(self.client.post(url).json(body));
        let response = request
            .send()
            .await
            .map_err(|e| SearchFailure::Api(e.to_string()))?;

        match response.status() {
            StatusCode::OK => response
                .json::<Value>()
                .await
                .map_err(|e| SearchFailure::Api(e.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(SearchFailure::Auth(url.to_string()))
            }
            StatusCode::BAD_REQUEST => Err(SearchFailure::BadRequest(url.to_string())),
            status => Err(SearchFailure::Api(format!("{url} returned {status}"))),
        }
    }

    /// One full poll: search, then scroll until exhaustion, `no_scroll`, or
    /// `max_hits`. API errors retry with exponential backoff; auth and bad
    /// request failures end the poll with no events.
    async fn poll(&self) -> Vec<Value> {
        let index = match self.config_str("index") {
            Some(index) if !index.is_empty() => index,
            _ => {
                error!("Index not specified for {}", ALIAS);
                return Vec::new();
            }
        };
        let Some(host) = self.hosts().into_iter().next() else {
            error!("No hosts configured for {}", ALIAS);
            return Vec::new();
        };

        let search_period = self.config_str("search_period").unwrap_or_else(|| "5m".to_string());
        let lucene_filter = self.config_str("lucene_filter");
        let search_size = self
            .parsed
            .config
            .get("search_size")
            .and_then(Value::as_u64)
            .unwrap_or(1000);
        let max_hits = self.parsed.config.get("max_hits").and_then(Value::as_u64);
        let no_scroll = self
            .parsed
            .config
            .get("no_scroll")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let query = Self::build_query_body(&search_period, lucene_filter.as_deref());
        let body = json!({"query": query, "size": search_size});

        let mut events: Vec<Value> = Vec::new();
        let mut response = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self.search(&host, &index, &body, !no_scroll).await {
                Ok(result) => {
                    response = Some(result);
                    break;
                }
                Err(SearchFailure::Auth(target)) => {
                    error!("{}", AgentError::AuthorizationFailed(target));
                    return Vec::new();
                }
                Err(SearchFailure::BadRequest(target)) => {
                    error!("Bad request for {}: {}", ALIAS, target);
                    return Vec::new();
                }
                Err(SearchFailure::Api(reason)) => {
                    warn!(
                        "API error for {} (attempt {}/{}): {}",
                        ALIAS,
                        attempt + 1,
                        MAX_ATTEMPTS,
                        reason
                    );
                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
                    }
                }
            }
        }
        let Some(mut result) = response else {
            return Vec::new();
        };

        if let Some(total) = result
            .get("hits")
            .and_then(|h| h.get("total"))
            .and_then(|t| t.get("value"))
            .and_then(Value::as_u64)
        {
            info!("Found {} total events in {}", total, index);
        }
        let mut batch = take_hits(&result);
        let mut scroll_size = batch.len();
        events.append(&mut batch);

        while scroll_size > 0 && !no_scroll {
            if let Some(max) = max_hits {
                if events.len() as u64 >= max {
                    warn!("Max hits {} reached for {}", max, ALIAS);
                    break;
                }
            }
            let Some(scroll_id) = result
                .get("_scroll_id")
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                break;
            };
            match self.scroll(&host, &scroll_id).await {
                Ok(next) => {
                    result = next;
                    let mut batch = take_hits(&result);
                    scroll_size = batch.len();
                    events.append(&mut batch);
                }
                Err(SearchFailure::Auth(target)) => {
                    error!("{}", AgentError::AuthorizationFailed(target));
                    break;
                }
                Err(SearchFailure::BadRequest(target)) | Err(SearchFailure::Api(target)) => {
                    warn!("Scroll ended early for {}: {}", ALIAS, target);
                    break;
                }
            }
        }

        events
    }
}

fn take_hits(result: &Value) -> Vec<Value> {
    result
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl Input for ElasticInput {
    fn alias(&self) -> &'static str {
        ALIAS
    }

    fn parsed_config(&self) -> &ParsedInputConfig {
        &self.parsed
    }

    fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run
    }

    fn set_last_run(&mut self, at: Option<DateTime<Utc>>) {
        self.last_run = at;
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    async fn main(&mut self) -> Result<Vec<Value>> {
        Ok(self.poll().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn parsed_for(server_url: &str, extra: &[(&str, Value)]) -> ParsedInputConfig {
        let mut config = Map::new();
        config.insert("hosts".to_string(), json!([server_url]));
        config.insert("index".to_string(), json!("winlogbeat-*"));
        config.insert("search_period".to_string(), json!("5m"));
        config.insert("search_size".to_string(), json!(10));
        for (key, value) in extra {
            config.insert((*key).to_string(), value.clone());
        }
        ParsedInputConfig {
            source_field: "_source".to_string(),
            config,
            ..ParsedInputConfig::default()
        }
    }

    #[test]
    fn query_body_has_range_and_optional_filter() {
        let body = ElasticInput::build_query_body("5m", None);
        assert_eq!(
            body["bool"]["must"][0]["range"]["@timestamp"]["gte"],
            "now-5m"
        );
        assert_eq!(body["bool"]["must"].as_array().unwrap().len(), 1);

        let body = ElasticInput::build_query_body("15m", Some("event.code: 1"));
        assert_eq!(
            body["bool"]["must"][1]["query_string"]["query"],
            "event.code: 1"
        );
    }

    #[tokio::test]
    async fn poll_returns_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/winlogbeat-*/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hits": {"total": {"value": 1}, "hits": [{"_source": {"message": "hello"}}]}
            })))
            .mount(&server)
            .await;

        let mut input = ElasticInput::new(
            parsed_for(&server.uri(), &[("no_scroll", json!(true))]),
            Some(("user".to_string(), "pass".to_string())),
        )
        .unwrap();

        let events = input.run().await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["_source"]["message"], "hello");
        assert!(input.last_run().is_some());
        assert!(!input.is_running());
    }

    #[tokio::test]
    async fn poll_follows_scroll_until_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/winlogbeat-*/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_scroll_id": "scroll-1",
                "hits": {"total": {"value": 2}, "hits": [{"_source": {"n": 1}}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_scroll_id": "scroll-1",
                "hits": {"hits": [{"_source": {"n": 2}}]}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_scroll_id": "scroll-1",
                "hits": {"hits": []}
            })))
            .mount(&server)
            .await;

        let mut input = ElasticInput::new(parsed_for(&server.uri(), &[]), None).unwrap();
        let events = input.run().await.unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn poll_with_bad_credentials_returns_no_events() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/winlogbeat-*/_search"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let mut input = ElasticInput::new(
            parsed_for(&server.uri(), &[]),
            Some(("test".to_string(), "badpassword".to_string())),
        )
        .unwrap();
        let events = input.run().await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn poll_without_index_returns_no_events() {
        let mut parsed = parsed_for("http://127.0.0.1:1", &[]);
        parsed.config.remove("index");
        let mut input = ElasticInput::new(parsed, None).unwrap();
        assert!(input.run().await.unwrap().is_empty());
    }
}
