// src/config.rs
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use xdg::BaseDirectories;

use crate::errors::{AgentError, Result};

pub const APP_NAME: &str = "reflexsoar-agent";
pub const PERSISTENT_CONFIG_FILENAME: &str = "persistent-config.json";

// Configuration keys that may be changed through `set_value`. Everything
// else is either console-owned (uuid, console_info, policy_*) or derived.
const UPDATEABLE_CONFIG_KEYS: &[&str] = &[
    "roles",
    "event_cache_key",
    "event_cache_ttl",
    "health_check_interval",
    "role_configs",
    "disable_event_cache_check",
];

/// The single console this agent is paired with. Absent entirely while the
/// agent is unpaired.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConsoleInfo {
    pub url: String,
    pub api_key: String,
    #[serde(default)]
    pub ignore_tls: bool,
}

/// Persistent agent configuration, mirrored one-to-one by
/// `<user_data_dir>/persistent-config.json`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AgentConfig {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub role_configs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_info: Option<ConsoleInfo>,
    #[serde(default)]
    pub policy_uuid: String,
    #[serde(default)]
    pub policy_revision: u64,
    #[serde(default = "default_event_cache_key")]
    pub event_cache_key: String,
    #[serde(default = "default_event_cache_ttl")]
    pub event_cache_ttl: u64,
    #[serde(default)]
    pub disable_event_cache_check: bool,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
}

fn default_agent_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

fn default_event_cache_key() -> String {
    "signature".to_string()
}

fn default_event_cache_ttl() -> u64 {
    30
}

fn default_health_check_interval() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            uuid: None,
            name: default_agent_name(),
            roles: Vec::new(),
            role_configs: Map::new(),
            console_info: None,
            policy_uuid: String::new(),
            policy_revision: 0,
            event_cache_key: default_event_cache_key(),
            event_cache_ttl: default_event_cache_ttl(),
            disable_event_cache_check: false,
            health_check_interval: default_health_check_interval(),
        }
    }
}

impl AgentConfig {
    /// The default directory that holds the persistent config and the vault.
    pub fn default_config_dir() -> Result<PathBuf> {
        let xdg_dirs = BaseDirectories::with_prefix(APP_NAME)?;
        Ok(xdg_dirs.get_data_home())
    }

    /// Loads the persistent configuration from `<dir>/persistent-config.json`.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(PERSISTENT_CONFIG_FILENAME);
        info!("Attempting to load configuration from: {:?}", config_path);
        let config_str = std::fs::read_to_string(&config_path)?;
        let config: AgentConfig = serde_json::from_str(&config_str)?;
        debug!("Loaded persistent config: {:?}", config);
        Ok(config)
    }

    /// Persists the configuration to `<dir>/persistent-config.json`,
    /// creating the directory on first save.
    pub fn save(&self, config_dir: &Path) -> Result<()> {
        if !config_dir.exists() {
            std::fs::create_dir_all(config_dir)?;
        }
        let config_path = config_dir.join(PERSISTENT_CONFIG_FILENAME);
        std::fs::write(&config_path, serde_json::to_string_pretty(self)?)?;
        debug!("Persisted agent config to {:?}", config_path);
        Ok(())
    }

    /// Removes the persistent configuration file if present.
    pub fn clear(config_dir: &Path) -> Result<()> {
        let config_path = config_dir.join(PERSISTENT_CONFIG_FILENAME);
        if config_path.exists() {
            std::fs::remove_file(&config_path)?;
            info!("Removed persistent config at {:?}", config_path);
        }
        Ok(())
    }

    /// Returns the configuration as a JSON string.
    pub fn json(&self, pretty: bool) -> Result<String> {
        if pretty {
            Ok(serde_json::to_string_pretty(self)?)
        } else {
            Ok(serde_json::to_string(self)?)
        }
    }

    /// Merges a policy document obtained from the management console.
    ///
    /// `uuid` and `revision` are always taken from the policy; every other
    /// field is only overwritten when the policy carries it, so that fields
    /// missing from a policy retain their previously configured values.
    pub fn from_policy(&mut self, policy: &Value) {
        self.policy_revision = policy
            .get("revision")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        self.policy_uuid = policy
            .get("uuid")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        if let Some(role_configs) = policy.get("role_configs").and_then(Value::as_object) {
            self.role_configs = role_configs.clone();
        }
        if let Some(key) = policy.get("event_cache_key").and_then(Value::as_str) {
            self.event_cache_key = key.to_string();
        }
        if let Some(ttl) = policy.get("event_cache_ttl").and_then(Value::as_u64) {
            self.event_cache_ttl = ttl;
        }
        if let Some(disable) = policy
            .get("disable_event_cache_check")
            .and_then(Value::as_bool)
        {
            self.disable_event_cache_check = disable;
        }
        if let Some(interval) = policy
            .get("health_check_interval")
            .and_then(Value::as_u64)
        {
            self.health_check_interval = interval;
        }
        if let Some(console_info) = policy.get("console_info") {
            match serde_json::from_value::<ConsoleInfo>(console_info.clone()) {
                Ok(info) => self.console_info = Some(info),
                Err(e) => warn!("Ignoring malformed console_info in policy: {}", e),
            }
        }
        // Keep the existing role set when the policy does not carry one.
        if let Some(roles) = policy.get("roles").and_then(Value::as_array) {
            self.roles = roles
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
    }

    /// Records a paired console. The call fails when the stored console URL
    /// matches the new one; a differing URL replaces the previous pairing.
    pub fn add_paired_console(&mut self, url: &str, api_key: &str) -> Result<()> {
        self.add_paired_console_tls(url, api_key, false)
    }

    pub fn add_paired_console_tls(
        &mut self,
        url: &str,
        api_key: &str,
        ignore_tls: bool,
    ) -> Result<()> {
        if let Some(info) = &self.console_info {
            if info.url == url {
                return Err(AgentError::PairingConflict(url.to_string()));
            }
        }
        self.console_info = Some(ConsoleInfo {
            url: url.to_string(),
            api_key: api_key.to_string(),
            ignore_tls,
        });
        Ok(())
    }

    /// Clears the paired console record for `url`.
    pub fn remove_paired_console(&mut self, url: &str) -> Result<()> {
        match &self.console_info {
            Some(info) if info.url == url => {
                self.console_info = None;
                Ok(())
            }
            _ => Err(AgentError::NotPaired(url.to_string())),
        }
    }

    /// Sets a configuration value from its string form, coercing the value
    /// to the type of the attribute being set. Only the keys in
    /// `UPDATEABLE_CONFIG_KEYS` may be changed.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<bool> {
        if !UPDATEABLE_CONFIG_KEYS.contains(&key) {
            return Err(AgentError::ConfigKeyImmutable(key.to_string()));
        }

        match key {
            "roles" => {
                self.roles = if value.is_empty() {
                    Vec::new()
                } else {
                    value.split(',').map(|s| s.trim().to_string()).collect()
                };
            }
            "event_cache_key" => {
                self.event_cache_key = value.to_string();
            }
            "event_cache_ttl" => {
                self.event_cache_ttl = parse_int(key, value)?;
            }
            "health_check_interval" => {
                self.health_check_interval = parse_int(key, value)?;
            }
            "disable_event_cache_check" => {
                self.disable_event_cache_check = parse_bool(value);
            }
            "role_configs" => {
                let parsed: Value =
                    serde_json::from_str(value).map_err(|e| AgentError::ConfigValueInvalid {
                        key: key.to_string(),
                        reason: e.to_string(),
                    })?;
                match parsed {
                    Value::Object(map) => self.role_configs = map,
                    _ => {
                        return Err(AgentError::ConfigValueInvalid {
                            key: key.to_string(),
                            reason: "expected a JSON object".to_string(),
                        })
                    }
                }
            }
            _ => return Err(AgentError::ConfigKeyUnknown(key.to_string())),
        }
        Ok(true)
    }
}

fn parse_int(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| AgentError::ConfigValueInvalid {
            key: key.to_string(),
            reason: e.to_string(),
        })
}

// Mirrors the truthiness rules of the original setter: explicit
// "true"/"false" strings coerce to the matching bool, anything else is
// truthy when non-empty.
fn parse_bool(value: &str) -> bool {
    match value.to_lowercase().as_str() {
        "true" => true,
        "false" => false,
        other => !other.is_empty(),
    }
}

/// A console policy in its hierarchical form. Dot-path keys such as
/// `agent.logging.level` become nested maps that can be addressed with
/// `setting("agent.logging.level")`.
#[derive(Debug, Clone)]
pub struct AgentPolicy {
    flat: Map<String, Value>,
    policy: Value,
}

impl AgentPolicy {
    pub fn new(flat: Map<String, Value>) -> Self {
        let mut policy = Value::Object(Map::new());
        for (key, value) in &flat {
            let mut item = value.clone();
            for part in key.split('.').rev() {
                let mut wrapper = Map::new();
                wrapper.insert(part.to_string(), item);
                item = Value::Object(wrapper);
            }
            merge_values(&mut policy, &item);
        }
        AgentPolicy { flat, policy }
    }

    /// The nested policy document.
    pub fn policy(&self) -> &Value {
        &self.policy
    }

    /// The original flat (dot-path keyed) policy document.
    pub fn flat_policy(&self) -> &Map<String, Value> {
        &self.flat
    }

    /// Looks up a setting by its dot path, failing when any segment of the
    /// path is missing.
    pub fn setting(&self, path: &str) -> Result<&Value> {
        let mut current = &self.policy;
        for part in path.split('.') {
            current = current
                .get(part)
                .ok_or_else(|| AgentError::PolicySettingMissing(path.to_string()))?;
        }
        Ok(current)
    }
}

fn merge_values(target: &mut Value, source: &Value) {
    match (target, source) {
        (Value::Object(target_map), Value::Object(source_map)) => {
            for (key, value) in source_map {
                match target_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        merge_values(existing, value);
                    }
                    _ => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, source) => *target = source.clone(),
    }
}
