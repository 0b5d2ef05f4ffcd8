// src/role/detection.rs
// Detection rule model. Rules arrive from the console as JSON documents;
// `should_run` implements the interval/mute/catchup scheduling decision and
// widens the lookbehind window when a rule fires late.

use chrono::{Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{AgentError, Result};
use crate::event::ObservableMapping;

/// Post-processing policy selected per rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Match,
    Threshold,
    Metric,
    Mismatch,
    NewTerm,
}

impl RuleType {
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "threshold" => RuleType::Threshold,
            "metric" => RuleType::Metric,
            "mismatch" => RuleType::Mismatch,
            "new_term" => RuleType::NewTerm,
            _ => RuleType::Match,
        }
    }
}

/// Which backend evaluates the rule and the query it runs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueryConfig {
    pub query: String,
    // Legacy field kept for console compatibility.
    #[serde(default)]
    pub language: String,
    pub backend: String,
}

/// A MITRE ATT&CK tactic or technique attached to a rule.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MITRETacticTechnique {
    #[serde(default)]
    pub mitre_id: String,
    #[serde(default)]
    pub external_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub shortname: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Detection {
    pub uuid: String,
    pub name: String,
    pub query: QueryConfig,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Minutes between runs.
    pub interval: i64,
    /// Minutes of history each run queries.
    pub lookbehind: i64,
    /// Cap, in minutes, on how much history a late rule may catch up on.
    #[serde(default)]
    pub catchup_period: i64,
    /// Minutes (converted to seconds against last_hit) a rule stays muted
    /// after a hit.
    #[serde(default)]
    pub mute_period: i64,
    #[serde(default)]
    pub last_run: Option<String>,
    #[serde(default)]
    pub last_hit: Option<String>,
    #[serde(default)]
    pub signature_fields: Vec<String>,
    #[serde(default)]
    pub observable_fields: Vec<ObservableMapping>,
    #[serde(default)]
    pub exceptions: Vec<Value>,
    #[serde(default = "default_rule_type")]
    pub rule_type: String,
    #[serde(default)]
    pub rule_type_config: Option<Value>,
    #[serde(default)]
    pub severity: i64,
    #[serde(default)]
    pub risk_score: i64,
    #[serde(default)]
    pub detection_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tactics: Vec<MITRETacticTechnique>,
    #[serde(default)]
    pub techniques: Vec<MITRETacticTechnique>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub false_positives: Vec<String>,
    #[serde(default)]
    pub guide: String,
    #[serde(default)]
    pub kill_chain_phase: String,
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(default)]
    pub total_hits: i64,
    #[serde(default)]
    pub skip_event_rules: bool,
    #[serde(default)]
    pub from_sigma: bool,
    #[serde(default)]
    pub sigma_rule: String,
    #[serde(default)]
    pub case_template: String,
    #[serde(default)]
    pub assigned_agent: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub run_start: String,
    #[serde(default)]
    pub run_finished: String,
}

fn default_active() -> bool {
    true
}

fn default_rule_type() -> String {
    "match".to_string()
}

fn default_version() -> i64 {
    1
}

impl Detection {
    pub fn rule_type(&self) -> RuleType {
        RuleType::from_name(&self.rule_type)
    }

    /// Decides whether the rule is due, based on its last run, interval and
    /// mute period. A firing rule that is running late widens its
    /// lookbehind by the time it missed, capped at `catchup_period`.
    pub fn should_run(&mut self, catchup_period: i64) -> Result<bool> {
        let last_run = self
            .last_run
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(AgentError::DetectionMissingLastRun)?;
        let last_run = parse_utc(last_run).ok_or(AgentError::DetectionMissingLastRun)?;

        let next_run = last_run + Duration::minutes(self.interval);
        let now = Utc::now().naive_utc();

        let mut mute_time = now;
        if self.mute_period > 0 {
            if let Some(last_hit) = self.last_hit.as_deref().and_then(parse_utc) {
                mute_time = last_hit + Duration::seconds(self.mute_period * 60);
            }
        }

        if now >= next_run && now >= mute_time {
            let minutes_since = (now - next_run).num_seconds() as f64 / 60.0;
            if minutes_since > catchup_period as f64 {
                self.lookbehind = (self.lookbehind as f64 + catchup_period as f64).ceil() as i64;
            } else if minutes_since > self.lookbehind as f64 {
                self.lookbehind = (self.lookbehind as f64 + minutes_since).ceil() as i64;
            }
            return Ok(true);
        }
        Ok(false)
    }
}

// Rule timestamps come from the console as ISO-8601, with or without an
// explicit offset.
fn parse_utc(value: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    value.parse::<NaiveDateTime>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule() -> Detection {
        serde_json::from_value(json!({
            "uuid": "1234567890",
            "name": "Test Rule",
            "description": "This is just a test rule",
            "query": {"query": "event.code: 1", "language": "lucene", "backend": "elasticsearch"},
            "active": true,
            "interval": 5,
            "lookbehind": 30,
            "catchup_period": 1440,
            "mute_period": 5,
            "severity": 1,
            "risk_score": 1,
            "signature_fields": ["event.code"],
            "observable_fields": [
                {"field": "host.name", "alias": "host.name", "data_type": "host", "tlp": 1, "tags": ["test"]}
            ],
            "tactics": [
                {"mitre_id": "TA0008", "external_id": "TA0008", "name": "Lateral Movement", "shortname": "lateral_movement"}
            ],
            "techniques": [
                {"mitre_id": "T1021", "external_id": "T1021", "name": "Remote Services", "shortname": "remote_services"}
            ],
            "last_run": (Utc::now().naive_utc() - Duration::days(2)).format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            "last_hit": (Utc::now().naive_utc() - Duration::days(1)).format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
        }))
        .unwrap()
    }

    #[test]
    fn late_rule_fires_and_caps_lookbehind_at_catchup() {
        let mut rule = rule();
        // Two days behind exceeds the catchup period.
        assert!(rule.should_run(1440).unwrap());
        assert_eq!(rule.lookbehind, 1470);
    }

    #[test]
    fn mitre_metadata_parses() {
        let rule = rule();
        assert_eq!(rule.tactics.len(), 1);
        assert_eq!(rule.tactics[0].shortname, "lateral_movement");
        assert_eq!(rule.techniques.len(), 1);
        assert_eq!(rule.techniques[0].external_id, "T1021");
    }

    #[test]
    fn freshly_run_rule_does_not_fire() {
        let mut rule = rule();
        rule.last_run = Some(
            Utc::now()
                .naive_utc()
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        );
        assert!(!rule.should_run(1440).unwrap());
    }

    #[test]
    fn moderately_late_rule_grows_lookbehind_by_missed_minutes() {
        let mut rule = rule();
        rule.last_run = Some(
            (Utc::now().naive_utc() - Duration::minutes(1570))
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        );
        assert!(rule.should_run(2500).unwrap());
        // minutes_since is 1565 plus the test's own runtime, so the ceiling
        // lands on 1595 or 1596.
        assert!((1595..=1596).contains(&rule.lookbehind));
    }

    #[test]
    fn muted_rule_stays_quiet_until_mute_expires() {
        let mut rule = rule();
        rule.mute_period = 60 * 48; // 48 hours, last hit was 24h ago
        assert!(!rule.should_run(1440).unwrap());
    }

    #[test]
    fn missing_last_run_is_an_error() {
        let mut rule = rule();
        rule.last_run = None;
        assert!(matches!(
            rule.should_run(1440),
            Err(AgentError::DetectionMissingLastRun)
        ));
    }

    #[test]
    fn firing_is_monotone_over_last_run_updates() {
        let mut rule = rule();
        assert!(rule.should_run(1440).unwrap());

        rule.last_run = Some(
            Utc::now()
                .naive_utc()
                .format("%Y-%m-%dT%H:%M:%S%.f")
                .to_string(),
        );
        assert!(!rule.should_run(1440).unwrap());
    }

    #[test]
    fn rule_type_names_map_to_policies() {
        assert_eq!(RuleType::from_name("match"), RuleType::Match);
        assert_eq!(RuleType::from_name("THRESHOLD"), RuleType::Threshold);
        assert_eq!(RuleType::from_name("new_term"), RuleType::NewTerm);
        assert_eq!(RuleType::from_name("unknown"), RuleType::Match);
    }
}
