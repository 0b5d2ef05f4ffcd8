// src/role/detector.rs
// Detector role: fetches the agent's detection rules each tick, decides
// which are due through the interval/mute/catchup schedule, evaluates their
// queries against the configured backend, and emits the matching records as
// Events.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::errors::Result;
use crate::event::{Event, EventPayload, EventSpec};
use crate::input::{ElasticInput, Input};
use crate::role::detection::{Detection, RuleType};
use crate::role::{Role, RoleContext};

pub const SHORTNAME: &str = "detector";

const DETECTION_SOURCE: &str = "detector";

#[derive(Default)]
pub struct Detector;

impl Detector {
    pub fn new() -> Self {
        Self
    }

    fn parse_rules(detections: &Value) -> Vec<Detection> {
        detections
            .get("detections")
            .and_then(Value::as_array)
            .map(|rules| {
                rules
                    .iter()
                    .filter_map(|rule| match serde_json::from_value(rule.clone()) {
                        Ok(rule) => Some(rule),
                        Err(e) => {
                            warn!("Skipping malformed detection rule: {}", e);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The catchup window a rule may use, bounded by the role-level
    /// `max_catchup_period` when the policy sets one.
    fn effective_catchup(&self, rule: &Detection, ctx: &RoleContext) -> i64 {
        match ctx
            .config_value("max_catchup_period")
            .and_then(|v| v.as_i64())
        {
            Some(max) if max > 0 => rule.catchup_period.min(max),
            _ => rule.catchup_period,
        }
    }

    /// Evaluates the rule's query against its backend and returns the raw
    /// hits. Backend connection settings come from the role's shared config,
    /// keyed by backend name.
    async fn run_query(&self, rule: &Detection, ctx: &RoleContext) -> Vec<Value> {
        let backend = rule.query.backend.to_lowercase();
        let Some(backend_config) = ctx.config_value(&backend).and_then(|v| {
            v.as_object().cloned()
        }) else {
            warn!(
                "No \"{}\" backend configured for the detector; skipping rule {}",
                backend, rule.name
            );
            return Vec::new();
        };

        match backend.as_str() {
            "elasticsearch" | "opensearch" => {
                self.run_elastic_query(rule, backend_config).await
            }
            other => {
                warn!("Unsupported detection backend \"{}\"", other);
                Vec::new()
            }
        }
    }

    async fn run_elastic_query(&self, rule: &Detection, backend_config: Map<String, Value>) -> Vec<Value> {
        let credentials = match (
            backend_config.get("username").and_then(Value::as_str),
            backend_config.get("password").and_then(Value::as_str),
        ) {
            (Some(username), Some(password)) => {
                Some((username.to_string(), password.to_string()))
            }
            _ => None,
        };

        // The rule supplies the filter and the window; everything else about
        // reaching the cluster comes from the backend config.
        let mut config = backend_config;
        config.insert("lucene_filter".to_string(), json!(rule.query.query));
        config.insert(
            "search_period".to_string(),
            json!(format!("{}m", rule.lookbehind.max(1))),
        );

        let entry = json!({ "config": Value::Object(config) });
        let mut input = match ElasticInput::from_entry(&entry, credentials) {
            Ok(input) => input,
            Err(e) => {
                warn!("Failed to build query client for rule {}: {}", rule.name, e);
                return Vec::new();
            }
        };
        match input.run().await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Query for rule {} failed: {}", rule.name, e);
                Vec::new()
            }
        }
    }

    /// Applies the rule-type post-processing policy to the raw hits.
    fn process_hits(rule: &Detection, hits: Vec<Value>) -> Vec<Value> {
        match rule.rule_type() {
            RuleType::Threshold => {
                let threshold = rule
                    .rule_type_config
                    .as_ref()
                    .and_then(|c| c.get("threshold"))
                    .and_then(Value::as_u64)
                    .unwrap_or(1) as usize;
                if hits.len() >= threshold {
                    hits
                } else {
                    Vec::new()
                }
            }
            // Match semantics; the remaining policies post-process the same
            // hit set at this layer.
            RuleType::Match | RuleType::Metric | RuleType::Mismatch | RuleType::NewTerm => hits,
        }
    }

    /// Builds an Event for a record matched by a rule. The rule supplies
    /// identity, severity and risk scoring; the record supplies observables
    /// and the signature material.
    pub fn build_rule_event(rule: &Detection, record: &Value) -> Result<Event> {
        let mut base_fields = Map::new();
        base_fields.insert("original_date_field".to_string(), json!("@timestamp"));

        let spec = EventSpec {
            base_fields,
            signature_fields: rule.signature_fields.clone(),
            observable_mapping: rule.observable_fields.clone(),
            source_field: Some("_source".to_string()),
            source: Some(DETECTION_SOURCE.to_string()),
            severity_map: None,
        };

        let mut event = Event::from_record(record, &spec)?;
        event.title = rule.name.clone();
        event.description = rule.description.clone();
        event.reference = rule.uuid.clone();
        event.severity = if (1..=4).contains(&rule.severity) {
            rule.severity
        } else {
            1
        };
        event.detection_id = Some(rule.uuid.clone());
        event.risk_score = Some(rule.risk_score);
        event.tags.extend(rule.tags.iter().cloned());
        Ok(event)
    }

    async fn execute_rule(&self, rule: &mut Detection, ctx: &RoleContext) {
        let hits = self.run_query(rule, ctx).await;
        let hits = Self::process_hits(rule, hits);
        rule.last_run = Some(
            Utc::now()
                .naive_utc()
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        );
        if hits.is_empty() {
            debug!("Rule {} produced no events", rule.name);
            return;
        }

        rule.total_hits += hits.len() as i64;
        let mut payloads: Vec<EventPayload> = Vec::with_capacity(hits.len());
        for hit in &hits {
            match Self::build_rule_event(rule, hit) {
                Ok(event) => payloads.push(event.into()),
                Err(e) => warn!("Dropping malformed hit for rule {}: {}", rule.name, e),
            }
        }
        if payloads.is_empty() {
            return;
        }
        info!("Rule {} matched {} events", rule.name, payloads.len());
        if let Err(e) = ctx
            .event_manager()
            .prepare_events(payloads, &EventSpec::default())
            .await
        {
            warn!("Failed to queue events for rule {}: {}", rule.name, e);
        }
    }
}

#[async_trait]
impl Role for Detector {
    fn shortname(&self) -> &'static str {
        SHORTNAME
    }

    async fn main(&mut self, ctx: &RoleContext) -> Result<()> {
        let Some(conn) = ctx.default_connection() else {
            warn!("Detector has no default console connection yet");
            return Ok(());
        };

        let Some(detections) = conn.agent_get_detections().await else {
            debug!("No detections returned by the console");
            return Ok(());
        };
        let mut rules = Self::parse_rules(&detections);
        info!("Loaded {} detections", rules.len());

        for rule in &mut rules {
            if !rule.active {
                continue;
            }
            let catchup = self.effective_catchup(rule, ctx);
            match rule.should_run(catchup) {
                Ok(true) => self.execute_rule(rule, ctx).await,
                Ok(false) => {}
                Err(e) => warn!("Rule {} cannot be scheduled: {}", rule.name, e),
            }
        }
        Ok(())
    }
}
