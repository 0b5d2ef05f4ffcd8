// src/input/mod.rs
// Input adapter framework. Inputs are pluggable data sources (an
// Elasticsearch query, for example) that produce raw records for the
// EventManager. Implementations register in the process-local InputRegistry
// and are indexed by alias, which replaces the original runtime subclass
// discovery.

pub mod elastic;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::errors::{AgentError, Result};
use crate::event::{EventSpec, ObservableMapping};

pub use elastic::ElasticInput;

/// Username/secret pair resolved through the console's credential endpoint.
pub type Credentials = (String, String);

// The Event base-field keys an input may configure. Everything else in the
// input's config document belongs to the driver.
const BASE_FIELD_KEYS: &[&str] = &[
    "rule_name",
    "description_field",
    "severity_field",
    "source_reference",
    "original_date_field",
    "tag_fields",
    "static_tags",
];

/// The operationally relevant slice of an input's policy document.
#[derive(Debug, Clone, Default)]
pub struct ParsedInputConfig {
    pub organization: Option<String>,
    pub observable_mapping: Vec<ObservableMapping>,
    pub signature_fields: Vec<String>,
    pub source_field: String,
    pub base_fields: Map<String, Value>,
    pub config: Map<String, Value>,
}

impl ParsedInputConfig {
    /// Extracts the operational configuration from a console input
    /// document. The document nests the driver configuration under a
    /// `config` key; only the keys named in `config_fields` are kept for
    /// the driver.
    pub fn parse(entry: &Value, config_fields: &[&str]) -> Self {
        let organization = entry
            .get("organization")
            .and_then(Value::as_str)
            .map(str::to_string);

        let observable_mapping = entry
            .get("field_mapping")
            .and_then(|fm| fm.get("fields"))
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| serde_json::from_value(f.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        let actual_config = entry
            .get("config")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let signature_fields = actual_config
            .get("signature_fields")
            .and_then(Value::as_array)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let source_field = actual_config
            .get("source_field")
            .and_then(Value::as_str)
            .unwrap_or("_source")
            .to_string();

        let mut base_fields = Map::new();
        for key in BASE_FIELD_KEYS {
            if let Some(value) = actual_config.get(*key) {
                base_fields.insert((*key).to_string(), value.clone());
            }
        }

        let mut config = Map::new();
        for key in config_fields {
            if let Some(value) = actual_config.get(*key) {
                config.insert((*key).to_string(), value.clone());
            }
        }

        ParsedInputConfig {
            organization,
            observable_mapping,
            signature_fields,
            source_field,
            base_fields,
            config,
        }
    }

    /// The extraction spec handed to the EventManager along with this
    /// input's records.
    pub fn event_spec(&self) -> EventSpec {
        EventSpec {
            base_fields: self.base_fields.clone(),
            signature_fields: self.signature_fields.clone(),
            observable_mapping: self.observable_mapping.clone(),
            source_field: Some(self.source_field.clone()),
            source: None,
            severity_map: None,
        }
    }
}

/// A pluggable data source. `main` does the driver-specific work; `run`
/// wraps it with the running flag and last-run bookkeeping the Poller
/// schedules on.
#[async_trait]
pub trait Input: Send + Sync {
    fn alias(&self) -> &'static str;
    fn parsed_config(&self) -> &ParsedInputConfig;
    fn last_run(&self) -> Option<DateTime<Utc>>;
    fn set_last_run(&mut self, at: Option<DateTime<Utc>>);
    fn is_running(&self) -> bool;
    fn set_running(&mut self, running: bool);

    async fn main(&mut self) -> Result<Vec<Value>>;

    async fn run(&mut self) -> Result<Vec<Value>> {
        self.set_running(true);
        let data = self.main().await;
        self.set_last_run(Some(Utc::now()));
        self.set_running(false);
        data
    }
}

/// Constructor signature for registering an input implementation. Each
/// driver parses the console input document itself, keeping only its own
/// config fields.
pub type InputCtor = fn(&Value, Option<Credentials>) -> Result<Box<dyn Input>>;

/// Process-local registry of input implementations, indexed by alias.
#[derive(Default)]
pub struct InputRegistry {
    ctors: HashMap<String, InputCtor>,
}

impl InputRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in inputs.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(elastic::ALIAS, |entry, credentials| {
            Ok(Box::new(ElasticInput::from_entry(entry, credentials)?))
        });
        registry
    }

    pub fn register(&mut self, alias: &str, ctor: InputCtor) {
        self.ctors.insert(alias.to_string(), ctor);
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.ctors.contains_key(alias)
    }

    pub fn aliases(&self) -> Vec<String> {
        self.ctors.keys().cloned().collect()
    }

    /// Instantiates the input registered under `alias` from its console
    /// input document.
    pub fn build(
        &self,
        alias: &str,
        entry: &Value,
        credentials: Option<Credentials>,
    ) -> Result<Box<dyn Input>> {
        let ctor = self
            .ctors
            .get(alias)
            .ok_or_else(|| AgentError::InputError(format!("no input installed for \"{alias}\"")))?;
        ctor(entry, credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input_entry() -> Value {
        json!({
            "uuid": "input-1",
            "plugin": "Elastic",
            "organization": "test-org",
            "field_mapping": {
                "fields": [
                    {"field": "host.name", "alias": "hostname", "data_type": "host", "tlp": 3, "tags": ["workstation"]}
                ]
            },
            "config": {
                "signature_fields": ["host.hostname"],
                "source_field": "_source",
                "rule_name": "kibana.alert.rule.name",
                "static_tags": ["from-elastic"],
                "hosts": ["https://localhost:9200"],
                "index": "winlogbeat-*",
                "search_period": "5m",
                "not_a_config_field": true
            }
        })
    }

    #[test]
    fn parse_config_splits_operational_fields() {
        let parsed = ParsedInputConfig::parse(&input_entry(), &["hosts", "index", "search_period"]);

        assert_eq!(parsed.organization.as_deref(), Some("test-org"));
        assert_eq!(parsed.signature_fields, vec!["host.hostname".to_string()]);
        assert_eq!(parsed.source_field, "_source");
        assert_eq!(parsed.observable_mapping.len(), 1);
        assert_eq!(parsed.observable_mapping[0].field, "host.name");

        // Base fields keep only the allow-listed keys.
        assert!(parsed.base_fields.contains_key("rule_name"));
        assert!(parsed.base_fields.contains_key("static_tags"));
        assert!(!parsed.base_fields.contains_key("hosts"));

        // Driver config keeps only the declared fields.
        assert!(parsed.config.contains_key("hosts"));
        assert!(parsed.config.contains_key("index"));
        assert!(!parsed.config.contains_key("not_a_config_field"));
    }

    #[test]
    fn parse_config_defaults_source_field() {
        let parsed = ParsedInputConfig::parse(&json!({"config": {}}), &[]);
        assert_eq!(parsed.source_field, "_source");
        assert!(parsed.signature_fields.is_empty());
    }

    #[test]
    fn registry_builds_registered_inputs() {
        let registry = InputRegistry::with_builtins();
        assert!(registry.contains("elastic"));

        let input = registry
            .build(
                "elastic",
                &input_entry(),
                Some(("user".to_string(), "pass".to_string())),
            )
            .unwrap();
        assert_eq!(input.alias(), "elastic");
        assert!(input.last_run().is_none());
        assert!(input.parsed_config().config.contains_key("hosts"));

        assert!(registry.build("nope", &input_entry(), None).is_err());
    }
}
