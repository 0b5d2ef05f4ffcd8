// src/event/base.rs
// Event and Observable model. Events are normalized security records built
// either from a pre-formed mapping or from a raw source record plus an
// extraction specification (base fields, signature fields, observable
// mapping).

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::errors::{AgentError, Result};

/// An artifact extracted from an event (host, IP, user, ...).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Observable {
    pub value: String,
    pub data_type: String,
    #[serde(default)]
    pub tlp: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ioc: bool,
    #[serde(default)]
    pub spotted: bool,
    #[serde(default)]
    pub safe: bool,
    #[serde(default)]
    pub source_field: String,
    #[serde(default)]
    pub original_source_field: String,
}

impl Observable {
    /// Builds an Observable from a JSON mapping. Anything that is not a
    /// mapping is rejected.
    pub fn from_value(value: &Value) -> Result<Self> {
        if !value.is_object() {
            return Err(AgentError::InvalidEventField(format!(
                "observables must be mappings or Observable values, got {value}"
            )));
        }
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// One entry of an observable mapping: which field to pull a value from and
/// how to type/tag the resulting observable.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ObservableMapping {
    pub field: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub tlp: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub ioc: bool,
    #[serde(default)]
    pub spotted: bool,
    #[serde(default)]
    pub safe: bool,
}

/// Extraction specification for building Events from raw records.
#[derive(Debug, Clone, Default)]
pub struct EventSpec {
    pub base_fields: Map<String, Value>,
    pub signature_fields: Vec<String>,
    pub observable_mapping: Vec<ObservableMapping>,
    pub source_field: Option<String>,
    pub source: Option<String>,
    pub severity_map: Option<HashMap<String, i64>>,
}

/// A normalized security record shipped to the console.
///
/// The underscored internals (`_message`, `_base_fields`, ...) are carried
/// for debugging and are omitted from serialized output unless explicitly
/// requested through [`Event::jsonify_with`].
#[derive(Debug, Clone, Default)]
pub struct Event {
    pub title: String,
    pub description: String,
    pub reference: String,
    pub raw_log: String,
    pub signature: String,
    pub source: String,
    pub severity: i64,
    pub tlp: i64,
    pub tags: Vec<String>,
    pub observables: Vec<Observable>,
    pub event_type: Option<String>,
    pub detection_id: Option<String>,
    pub risk_score: Option<i64>,
    pub original_date: Option<String>,

    base_fields: Map<String, Value>,
    signature_fields: Vec<String>,
    observable_mapping: Vec<ObservableMapping>,
    message: Value,
    custom_severity_map: Option<HashMap<String, i64>>,
}

impl Event {
    /// Construction path A: a pre-formed mapping carrying the event fields
    /// directly. `source` is required; `observables` must be a list of
    /// mappings or Observables.
    pub fn from_mapping(mapping: &Value) -> Result<Self> {
        let map = mapping.as_object().ok_or_else(|| {
            AgentError::InvalidEventField("an event must be built from a mapping".to_string())
        })?;

        let source = map
            .get("source")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AgentError::InvalidEventField("source is required".to_string()))?
            .to_string();

        let mut observables = Vec::new();
        if let Some(raw) = map.get("observables") {
            let items = raw.as_array().ok_or_else(|| {
                AgentError::InvalidEventField(format!(
                    "observables must be a list, got {raw}"
                ))
            })?;
            for item in items {
                observables.push(Observable::from_value(item)?);
            }
        }

        let title = string_field(map, "title");
        let severity = map_severity(map.get("severity"), None)?;

        let signature = match map.get("signature").and_then(Value::as_str) {
            Some(sig) => sig.to_string(),
            None => compute_signature(&title, &Value::Null, &[]),
        };

        Ok(Event {
            title,
            description: string_field(map, "description"),
            reference: string_field(map, "reference"),
            raw_log: string_field(map, "raw_log"),
            signature,
            source,
            severity,
            tlp: map.get("tlp").and_then(Value::as_i64).unwrap_or(0),
            tags: string_list_field(map, "tags"),
            observables,
            event_type: map.get("type").and_then(Value::as_str).map(str::to_string),
            detection_id: map
                .get("detection_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            risk_score: map.get("risk_score").and_then(Value::as_i64),
            original_date: map
                .get("original_date")
                .and_then(Value::as_str)
                .map(strip_trailing_z),
            ..Event::default()
        })
    }

    /// Construction path B: a raw source record plus an extraction spec.
    pub fn from_record(data: &Value, spec: &EventSpec) -> Result<Self> {
        // Pull the working message out of the record when a source_field is
        // configured (e.g. "_source" for Elasticsearch hits).
        let message = match &spec.source_field {
            Some(field) if !field.is_empty() => data
                .get(field)
                .cloned()
                .ok_or_else(|| {
                    AgentError::InvalidEventField(format!(
                        "source_field \"{field}\" not present in record"
                    ))
                })?,
            _ => data.clone(),
        };

        let base = &spec.base_fields;

        let title = extract_string(&message, base, "rule_name");
        let description = extract_string(&message, base, "description_field");
        let reference = extract_string(&message, base, "source_reference");
        let original_date = base
            .get("original_date_field")
            .and_then(Value::as_str)
            .and_then(|field| extract_field_value(&message, field))
            .map(|v| strip_trailing_z(&value_to_string(&v)));

        let source = spec
            .source
            .clone()
            .or_else(|| base.get("source").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| AgentError::InvalidEventField("source is required".to_string()))?;

        let severity_value = base
            .get("severity_field")
            .and_then(Value::as_str)
            .and_then(|field| extract_field_value(&message, field));
        let severity = map_severity(severity_value.as_ref(), spec.severity_map.as_ref())?;

        let mut tags: Vec<String> = base
            .get("static_tags")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(value_to_string).collect())
            .unwrap_or_default();
        if let Some(tag_fields) = base.get("tag_fields").and_then(Value::as_array) {
            for field in tag_fields.iter().filter_map(Value::as_str) {
                if let Some(value) = extract_field_value(&message, field) {
                    match value {
                        Value::Array(items) => {
                            tags.extend(
                                items
                                    .iter()
                                    .map(|item| format!("{field}:{}", value_to_string(item))),
                            );
                        }
                        other => tags.push(format!("{field}:{}", value_to_string(&other))),
                    }
                }
            }
        }

        let observables = extract_observables(&message, &spec.observable_mapping);
        let signature = compute_signature(&title, &message, &spec.signature_fields);

        Ok(Event {
            title,
            description,
            reference,
            raw_log: serde_json::to_string(&message)?,
            signature,
            source,
            severity,
            tlp: base.get("tlp").and_then(Value::as_i64).unwrap_or(0),
            tags,
            observables,
            event_type: base.get("type").and_then(Value::as_str).map(str::to_string),
            detection_id: None,
            risk_score: base.get("risk_score").and_then(Value::as_i64),
            original_date,
            base_fields: base.clone(),
            signature_fields: spec.signature_fields.clone(),
            observable_mapping: spec.observable_mapping.clone(),
            message,
            custom_severity_map: spec.severity_map.clone(),
        })
    }

    /// Serializes the event with the default rules: private fields omitted,
    /// empty/null fields skipped.
    pub fn jsonify(&self) -> String {
        self.jsonify_with(true, true)
    }

    /// Serializes the event, optionally keeping private fields and
    /// empty/null values.
    pub fn jsonify_with(&self, ignore_private_fields: bool, skip_null: bool) -> String {
        serde_json::to_string(&self.to_value(ignore_private_fields, skip_null))
            .unwrap_or_else(|_| "{}".to_string())
    }

    pub fn to_value(&self, ignore_private_fields: bool, skip_null: bool) -> Value {
        let mut map = Map::new();
        map.insert("title".to_string(), json!(self.title));
        map.insert("description".to_string(), json!(self.description));
        map.insert("reference".to_string(), json!(self.reference));
        map.insert("raw_log".to_string(), json!(self.raw_log));
        map.insert("signature".to_string(), json!(self.signature));
        map.insert("source".to_string(), json!(self.source));
        map.insert("severity".to_string(), json!(self.severity));
        map.insert("tlp".to_string(), json!(self.tlp));
        map.insert("tags".to_string(), json!(self.tags));
        map.insert("observables".to_string(), json!(self.observables));
        map.insert("type".to_string(), json!(self.event_type));
        map.insert("detection_id".to_string(), json!(self.detection_id));
        map.insert("risk_score".to_string(), json!(self.risk_score));
        map.insert("original_date".to_string(), json!(self.original_date));

        if !ignore_private_fields {
            map.insert("_base_fields".to_string(), json!(self.base_fields));
            map.insert("_signature_fields".to_string(), json!(self.signature_fields));
            map.insert(
                "_observable_mapping".to_string(),
                json!(self.observable_mapping),
            );
            map.insert("_message".to_string(), self.message.clone());
            map.insert(
                "_custom_severity_map".to_string(),
                json!(self.custom_severity_map),
            );
        }

        if skip_null {
            map.retain(|_, v| !is_empty_value(v));
        }

        Value::Object(map)
    }
}

// Events ship to the console with the default serialization rules.
impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value(true, true).serialize(serializer)
    }
}

/// Resolves a value from a (possibly nested) record by dot path.
///
/// A key that is literally present wins over path traversal, so flattened
/// keys such as `"host.hostname"` resolve directly. Lists of mappings are
/// mapped over and the results flattened one level.
pub fn extract_field_value(message: &Value, field: &str) -> Option<Value> {
    let parts: Vec<&str> = field.split('.').collect();
    extract_parts(message, &parts)
}

fn extract_parts(message: &Value, parts: &[&str]) -> Option<Value> {
    if parts.is_empty() {
        return match message {
            Value::Null => None,
            other => Some(other.clone()),
        };
    }
    match message {
        Value::Object(map) => {
            // Literal key (including dots) takes precedence over traversal.
            let joined = parts.join(".");
            if let Some(value) = map.get(&joined) {
                return match value {
                    Value::Null => None,
                    other => Some(other.clone()),
                };
            }
            extract_parts(map.get(parts[0])?, &parts[1..])
        }
        Value::Array(items) => {
            let mut collected = Vec::new();
            for item in items {
                if let Some(value) = extract_parts(item, parts) {
                    match value {
                        Value::Array(mut inner) => collected.append(&mut inner),
                        other => collected.push(other),
                    }
                }
            }
            if collected.is_empty() {
                None
            } else {
                Some(Value::Array(collected))
            }
        }
        _ => None,
    }
}

/// Maps a raw severity value to the numeric scale. Strings go through the
/// custom map when provided, otherwise the default mapping; integers are
/// kept when already in range. Missing or unknown values map to 1.
pub fn map_severity(
    value: Option<&Value>,
    custom: Option<&HashMap<String, i64>>,
) -> Result<i64> {
    let Some(value) = value else {
        return Ok(1);
    };
    match value {
        Value::Null => Ok(1),
        Value::String(raw) => {
            let key = raw.to_lowercase();
            match custom {
                Some(map) => Ok(map.get(&key).copied().unwrap_or(1)),
                None => Ok(default_severity(&key)),
            }
        }
        Value::Number(n) => {
            let n = n.as_i64().unwrap_or(0);
            match custom {
                Some(map) => Ok(map
                    .get(&n.to_string())
                    .copied()
                    .unwrap_or_else(|| clamp_severity(n))),
                None => Ok(clamp_severity(n)),
            }
        }
        other => Err(AgentError::InvalidEventField(format!(
            "severity must be a string or an integer, got {other}"
        ))),
    }
}

fn default_severity(key: &str) -> i64 {
    match key {
        "low" | "1" => 1,
        "medium" | "2" => 2,
        "high" | "3" => 3,
        "critical" | "4" => 4,
        _ => 1,
    }
}

fn clamp_severity(n: i64) -> i64 {
    if (1..=4).contains(&n) {
        n
    } else {
        1
    }
}

fn extract_observables(message: &Value, mapping: &[ObservableMapping]) -> Vec<Observable> {
    let mut observables = Vec::new();
    for entry in mapping {
        let Some(value) = extract_field_value(message, &entry.field) else {
            continue;
        };
        let source_field = entry.alias.clone().unwrap_or_else(|| entry.field.clone());
        let values = match value {
            Value::Array(items) => items,
            other => vec![other],
        };
        for item in values {
            observables.push(Observable {
                value: value_to_string(&item),
                data_type: entry.data_type.clone(),
                tlp: entry.tlp,
                tags: entry.tags.clone(),
                ioc: entry.ioc,
                spotted: entry.spotted,
                safe: entry.safe,
                source_field: source_field.clone(),
                original_source_field: entry.field.clone(),
            });
        }
    }
    observables
}

/// Deterministic hex digest over the ordered signature material. With no
/// signature fields the digest covers the title and the current UTC time, so
/// such events never deduplicate against each other.
fn compute_signature(title: &str, message: &Value, signature_fields: &[String]) -> String {
    let material: Vec<Value> = if signature_fields.is_empty() {
        vec![json!(title), json!(Utc::now().to_rfc3339())]
    } else {
        signature_fields
            .iter()
            .map(|field| extract_field_value(message, field).unwrap_or(Value::Null))
            .collect()
    };
    let serialized = serde_json::to_string(&material).unwrap_or_default();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

fn extract_string(message: &Value, base: &Map<String, Value>, key: &str) -> String {
    base.get(key)
        .and_then(Value::as_str)
        .and_then(|field| extract_field_value(message, field))
        .map(|v| value_to_string(&v))
        .unwrap_or_default()
}

fn string_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key).map(value_to_string).unwrap_or_default()
}

fn string_list_field(map: &Map<String, Value>, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().map(value_to_string).collect())
        .unwrap_or_default()
}

fn strip_trailing_z(value: &str) -> String {
    value.trim_end_matches('Z').to_string()
}

pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join(","),
        other => other.to_string(),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_item() -> Value {
        json!({
            "title": "Test Event",
            "description": "A test event",
            "severity": "low",
            "tlp": 3,
            "tags": ["test"],
            "source": "test-suite",
            "observables": [observable_item()],
            "reference": "abc-1234",
            "raw_log": "foobar",
            "detection_id": "1234",
            "risk_score": 1000,
            "original_date": "2022-11-14T00:00:00.000Z",
        })
    }

    fn observable_item() -> Value {
        json!({
            "value": "test",
            "data_type": "hostname",
            "tags": ["test"],
            "tlp": 3,
            "spotted": false,
            "safe": false,
            "ioc": false,
            "source_field": "host.hostname",
            "original_source_field": "host.hostname"
        })
    }

    fn signal_record(hostname: &str, rule: &str) -> Value {
        json!({
            "_source": {
                "@timestamp": "2022-11-14T10:01:02.000Z",
                "host": {"hostname": hostname, "name": hostname},
                "kibana": {
                    "alert": {
                        "rule": {
                            "name": rule,
                            "uuid": "rule-uuid-1",
                            "description": "Something suspicious",
                            "severity": "high",
                            "tags": ["windows", "lateral-movement"]
                        }
                    }
                },
                "process": {"pid": 4242}
            }
        })
    }

    fn signal_spec() -> EventSpec {
        let mut base_fields = Map::new();
        base_fields.insert("rule_name".into(), json!("kibana.alert.rule.name"));
        base_fields.insert("description_field".into(), json!("kibana.alert.rule.description"));
        base_fields.insert("severity_field".into(), json!("kibana.alert.rule.severity"));
        base_fields.insert("source_reference".into(), json!("kibana.alert.rule.uuid"));
        base_fields.insert("original_date_field".into(), json!("@timestamp"));
        base_fields.insert("tag_fields".into(), json!(["kibana.alert.rule.tags"]));
        base_fields.insert("static_tags".into(), json!(["awesome"]));
        base_fields.insert("tlp".into(), json!(2));

        EventSpec {
            base_fields,
            signature_fields: vec![
                "host.hostname".to_string(),
                "kibana.alert.rule.name".to_string(),
            ],
            observable_mapping: vec![ObservableMapping {
                field: "host.name".to_string(),
                alias: Some("hostname".to_string()),
                data_type: "host".to_string(),
                tlp: 3,
                tags: vec!["workstation".to_string()],
                ..ObservableMapping::default()
            }],
            source_field: Some("_source".to_string()),
            source: Some("test-suite".to_string()),
            severity_map: None,
        }
    }

    #[test]
    fn event_from_mapping_carries_fields_through() {
        let event = Event::from_mapping(&event_item()).unwrap();
        assert_eq!(event.title, "Test Event");
        assert_eq!(event.severity, 1);
        assert_eq!(event.tlp, 3);
        assert_eq!(event.source, "test-suite");
        assert_eq!(event.risk_score, Some(1000));
        assert_eq!(event.original_date.as_deref(), Some("2022-11-14T00:00:00.000"));
        assert_eq!(event.observables.len(), 1);
        assert_eq!(event.observables[0].value, "test");
    }

    #[test]
    fn event_requires_source() {
        let mut item = event_item();
        item.as_object_mut().unwrap().remove("source");
        assert!(matches!(
            Event::from_mapping(&item),
            Err(AgentError::InvalidEventField(_))
        ));
    }

    #[test]
    fn observable_from_mapping() {
        let observable = Observable::from_value(&observable_item()).unwrap();
        assert_eq!(observable.value, "test");
        assert_eq!(observable.data_type, "hostname");
        assert_eq!(observable.tlp, 3);
        assert!(!observable.ioc);
    }

    #[test]
    fn observables_must_be_mappings() {
        for bad in [json!({"observables": 1234, "source": "x"}),
                    json!({"observables": [1, 2, 3], "source": "x"}),
                    json!({"observables": ["a", "b"], "source": "x"})] {
            assert!(Event::from_mapping(&bad).is_err());
        }
    }

    #[test]
    fn event_from_record_extracts_fields() {
        let event = Event::from_record(&signal_record("ws-01", "Rule A"), &signal_spec()).unwrap();
        assert_eq!(event.title, "Rule A");
        assert_eq!(event.description, "Something suspicious");
        assert_eq!(event.reference, "rule-uuid-1");
        assert_eq!(event.severity, 3);
        assert_eq!(event.tlp, 2);
        assert_eq!(event.source, "test-suite");
        assert!(!event.original_date.as_deref().unwrap().ends_with('Z'));
        assert!(event.tags.contains(&"awesome".to_string()));
        assert!(event
            .tags
            .contains(&"kibana.alert.rule.tags:windows".to_string()));
        assert_eq!(event.observables.len(), 1);
        assert_eq!(event.observables[0].source_field, "hostname");
        assert_eq!(event.observables[0].original_source_field, "host.name");
        assert!((1..=4).contains(&event.severity));
        assert!((0..=4).contains(&event.tlp));
    }

    #[test]
    fn signature_is_stable_over_signature_fields() {
        let spec = signal_spec();
        let a = Event::from_record(&signal_record("ws-01", "Rule A"), &spec).unwrap();
        // Same signature fields, different unrelated content.
        let mut other = signal_record("ws-01", "Rule A");
        other["_source"]["process"]["pid"] = json!(9999);
        let b = Event::from_record(&other, &spec).unwrap();
        assert_eq!(a.signature, b.signature);

        let c = Event::from_record(&signal_record("ws-02", "Rule A"), &spec).unwrap();
        assert_ne!(a.signature, c.signature);
    }

    #[test]
    fn severity_mapping_rules() {
        // Default map.
        assert_eq!(map_severity(Some(&json!("low")), None).unwrap(), 1);
        assert_eq!(map_severity(Some(&json!("critical")), None).unwrap(), 4);
        assert_eq!(map_severity(Some(&json!("unknown")), None).unwrap(), 1);
        assert_eq!(map_severity(None, None).unwrap(), 1);

        // Integers keep their value in range, fall back to 1 otherwise.
        assert_eq!(map_severity(Some(&json!(3)), None).unwrap(), 3);
        assert_eq!(map_severity(Some(&json!(5)), None).unwrap(), 1);

        // A custom map wins, even outside the 1-4 range.
        let custom: HashMap<String, i64> = [("low".to_string(), 10)].into();
        assert_eq!(map_severity(Some(&json!("low")), Some(&custom)).unwrap(), 10);

        // Anything else is a type error.
        assert!(map_severity(Some(&json!(["low"])), None).is_err());
        assert!(map_severity(Some(&json!({"level": "low"})), None).is_err());
    }

    #[test]
    fn dot_path_extraction() {
        let message = json!({
            "host": {"hostname": "ws-01"},
            "flat.key": "flat-value",
            "users": [
                {"name": "alice", "groups": ["a", "b"]},
                {"name": "bob", "groups": ["c"]}
            ],
            "empty": null
        });

        assert_eq!(
            extract_field_value(&message, "host.hostname"),
            Some(json!("ws-01"))
        );
        // A literal dotted key wins over traversal.
        assert_eq!(
            extract_field_value(&message, "flat.key"),
            Some(json!("flat-value"))
        );
        // Lists of mappings map across elements.
        assert_eq!(
            extract_field_value(&message, "users.name"),
            Some(json!(["alice", "bob"]))
        );
        // Lists of lists flatten one level.
        assert_eq!(
            extract_field_value(&message, "users.groups"),
            Some(json!(["a", "b", "c"]))
        );
        assert_eq!(extract_field_value(&message, "does.not.exist"), None);
        assert_eq!(extract_field_value(&message, "empty"), None);
    }

    #[test]
    fn jsonify_hides_private_fields_and_empties() {
        let event = Event::from_record(&signal_record("ws-01", "Rule A"), &signal_spec()).unwrap();

        let value: Value = serde_json::from_str(&event.jsonify()).unwrap();
        let map = value.as_object().unwrap();
        assert!(map.keys().all(|k| !k.starts_with('_')));
        assert!(!map.contains_key("detection_id")); // null, skipped

        let full: Value =
            serde_json::from_str(&event.jsonify_with(false, false)).unwrap();
        let full_map = full.as_object().unwrap();
        assert!(full_map.contains_key("_message"));
        assert!(full_map.contains_key("_signature_fields"));
        assert!(full_map.contains_key("detection_id"));
    }

    #[test]
    fn events_without_signature_fields_never_collide() {
        let mut spec = signal_spec();
        spec.signature_fields.clear();
        let a = Event::from_record(&signal_record("ws-01", "Rule A"), &spec).unwrap();
        assert!(!a.signature.is_empty());
    }
}
