// src/agent.rs
// Agent supervisor. Owns the persistent configuration, the console pairing,
// the heartbeat/policy loop, and the lifecycle of every role worker.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::errors::{AgentError, Result};
use crate::event::EventManager;
use crate::input::InputRegistry;
use crate::management::{ConnectionRegistry, ManagementConnection, DEFAULT_CONNECTION_NAME};
use crate::role::{RoleContext, RoleRegistry, RoleWorker, SharedRoleConfig};

pub struct Agent {
    pub config: AgentConfig,
    config_dir: PathBuf,
    pub connections: ConnectionRegistry,
    role_registry: RoleRegistry,
    input_registry: Arc<InputRegistry>,
    role_configs: HashMap<String, SharedRoleConfig>,
    running_roles: HashMap<String, RoleWorker>,
    event_manager: EventManager,
    pub warnings: Vec<String>,
}

impl Agent {
    /// Creates the supervisor: loads the persistent config (falling back to
    /// defaults without persisting a stub) and indexes the installed role
    /// and input implementations.
    pub fn new(persistent_config_path: Option<PathBuf>) -> Result<Self> {
        let config_dir = match persistent_config_path {
            Some(path) => path,
            None => AgentConfig::default_config_dir()?,
        };

        let config = match AgentConfig::load(&config_dir) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Could not load persistent config from {:?} ({}). Using defaults.",
                    config_dir, e
                );
                AgentConfig::default()
            }
        };

        let role_registry = RoleRegistry::with_builtins();
        let mut warnings = Vec::new();
        for role in &config.roles {
            if !role_registry.contains(role) {
                warnings.push(format!("Role \"{role}\" not installed in agent library"));
            }
        }

        Ok(Agent {
            config,
            config_dir,
            connections: ConnectionRegistry::new(),
            role_registry,
            input_registry: Arc::new(InputRegistry::with_builtins()),
            role_configs: HashMap::new(),
            running_roles: HashMap::new(),
            event_manager: EventManager::new(),
            warnings,
        })
    }

    pub fn config_dir(&self) -> &PathBuf {
        &self.config_dir
    }

    pub fn save_config(&self) -> Result<()> {
        self.config.save(&self.config_dir)
    }

    pub fn event_manager(&self) -> &EventManager {
        &self.event_manager
    }

    pub fn running_roles(&self) -> Vec<String> {
        self.running_roles.keys().cloned().collect()
    }

    pub fn is_role_running(&self, shortname: &str) -> bool {
        self.running_roles
            .get(shortname)
            .map(RoleWorker::is_alive)
            .unwrap_or(false)
    }

    /// Pairs this agent with a console: exchanges the pairing token for the
    /// agent uuid and bearer token, persists both, and registers the
    /// connection as `"default"`.
    pub async fn pair(
        &mut self,
        console_url: &str,
        api_key: &str,
        ignore_tls: bool,
        groups: &[String],
    ) -> Result<()> {
        let conn = ManagementConnection::new(
            console_url,
            api_key,
            ignore_tls,
            DEFAULT_CONNECTION_NAME,
        )?;

        let payload = json!({
            "name": self.config.name,
            "roles": self.config.roles,
            "groups": groups,
        });
        let body = conn.agent_pair(&payload).await?;

        if let Some(uuid) = body.get("uuid").and_then(Value::as_str) {
            self.config.uuid = Some(uuid.to_string());
        }
        // The console answers with a bearer token that replaces the pairing
        // token for all future calls.
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .unwrap_or(api_key)
            .to_string();
        self.config
            .add_paired_console_tls(console_url, &token, ignore_tls)?;

        self.connections.set_default(conn);
        self.save_config()?;
        info!("Paired with console {}", console_url);
        Ok(())
    }

    /// Makes sure a `"default"` console connection exists, building it from
    /// the persisted console record when needed.
    pub fn ensure_default_connection(&self) -> Result<ManagementConnection> {
        if let Some(conn) = self.connections.get_default() {
            return Ok(conn);
        }
        let info = self
            .config
            .console_info
            .as_ref()
            .ok_or_else(|| AgentError::NotPaired("no console".to_string()))?;
        let conn = ManagementConnection::new(
            &info.url,
            &info.api_key,
            info.ignore_tls,
            DEFAULT_CONNECTION_NAME,
        )?;
        self.connections.set_default(conn.clone());
        Ok(conn)
    }

    fn heartbeat_payload(&self) -> Value {
        json!({
            "name": self.config.name,
            "roles": self.config.roles,
            "policy_uuid": self.config.policy_uuid,
            "policy_revision": self.config.policy_revision,
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    /// Sends a heartbeat. Unless `skip_run` is set, a successful heartbeat
    /// is followed by a policy reconcile.
    pub async fn heartbeat(&mut self, skip_run: bool) -> Result<()> {
        let agent_id = self
            .config
            .uuid
            .clone()
            .ok_or_else(|| AgentError::HeartbeatFailed("agent is not paired".to_string()))?;
        let conn = self.ensure_default_connection()?;

        conn.agent_heartbeat(&agent_id, &self.heartbeat_payload())
            .await?;

        if !skip_run {
            self.reconcile_policy(&conn, &agent_id).await?;
        }
        Ok(())
    }

    /// Fetches the current policy and, when its uuid or revision differs
    /// from the stored ones, applies it: merges role configs into the live
    /// shared maps and stops/starts roles to match the new role set.
    async fn reconcile_policy(&mut self, conn: &ManagementConnection, agent_id: &str) -> Result<()> {
        let Some(policy) = conn.agent_get_policy(agent_id).await else {
            return Ok(());
        };

        let policy_uuid = policy.get("uuid").and_then(Value::as_str).unwrap_or("");
        let policy_revision = policy.get("revision").and_then(Value::as_u64).unwrap_or(0);
        if policy_uuid == self.config.policy_uuid
            && policy_revision == self.config.policy_revision
        {
            return Ok(());
        }

        info!(
            "Policy change detected (uuid {}, revision {}). Reconciling.",
            policy_uuid, policy_revision
        );
        let previous_roles = self.config.roles.clone();
        self.config.from_policy(&policy);

        // Running roles read their shared config every tick, so merging the
        // new role-scoped options makes them visible immediately.
        for (key, value) in &self.config.role_configs.clone() {
            let Some(shortname) = key.strip_suffix("_config") else {
                continue;
            };
            if let Some(options) = value.as_object() {
                let shared = self.role_config_for(shortname);
                for (option, option_value) in options {
                    shared.insert(option.clone(), option_value.clone());
                }
            }
        }

        if previous_roles != self.config.roles {
            let to_stop: Vec<String> = previous_roles
                .iter()
                .filter(|role| !self.config.roles.contains(*role))
                .cloned()
                .collect();
            let to_start: Vec<String> = self
                .config
                .roles
                .clone()
                .into_iter()
                .filter(|role| !previous_roles.contains(role))
                .collect();

            for role in to_stop {
                self.stop_role(&role).await;
            }
            for role in to_start {
                self.start_role(&role);
            }
        }

        self.save_config()?;
        Ok(())
    }

    /// The live shared config map for a role, seeded from the persisted
    /// role_configs on first use.
    fn role_config_for(&mut self, shortname: &str) -> SharedRoleConfig {
        if let Some(existing) = self.role_configs.get(shortname) {
            return existing.clone();
        }
        let shared: SharedRoleConfig = Arc::new(DashMap::new());
        if let Some(options) = self
            .config
            .role_configs
            .get(&format!("{shortname}_config"))
            .and_then(Value::as_object)
        {
            for (key, value) in options {
                shared.insert(key.clone(), value.clone());
            }
        }
        self.role_configs.insert(shortname.to_string(), shared.clone());
        shared
    }

    pub fn start_role(&mut self, shortname: &str) {
        if self.is_role_running(shortname) {
            return;
        }
        let Some(role) = self.role_registry.build(shortname) else {
            warn!("Role \"{}\" not installed in agent library", shortname);
            return;
        };
        let ctx = RoleContext::new(
            self.role_config_for(shortname),
            self.connections.clone(),
            self.event_manager.clone(),
            self.input_registry.clone(),
        );
        let mut worker = RoleWorker::new(shortname);
        worker.start(role, ctx);
        self.running_roles.insert(shortname.to_string(), worker);
    }

    pub fn start_roles(&mut self) {
        for role in self.config.roles.clone() {
            self.start_role(&role);
        }
    }

    pub async fn stop_role(&mut self, shortname: &str) {
        if let Some(mut worker) = self.running_roles.remove(shortname) {
            worker.stop(false).await;
        }
    }

    pub async fn stop_roles(&mut self) {
        let names: Vec<String> = self.running_roles.keys().cloned().collect();
        for name in names {
            self.stop_role(&name).await;
        }
        self.event_manager.shutdown().await;
    }

    /// The supervisor run loop. Returns the process exit code: 0 on a
    /// graceful stop, 1 when the console stops answering heartbeats.
    pub async fn run(&mut self, offline: bool) -> Result<i32> {
        if !offline {
            // The initial heartbeat proves the pairing before anything is
            // started; a policy reconcile would race the roles.
            if let Err(e) = self.heartbeat(true).await {
                error!("Initial heartbeat failed: {}", e);
                return Ok(1);
            }
        }

        if let Ok(conn) = self.ensure_default_connection() {
            self.event_manager.initialize(conn).await?;
        } else {
            warn!("No console connection; events will not be shipped");
        }

        self.start_roles();
        info!(
            "Agent started with roles: {:?}",
            self.running_roles().join(", ")
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, stopping roles");
                    self.stop_roles().await;
                    return Ok(0);
                }
                _ = tokio::time::sleep(Duration::from_secs(self.config.health_check_interval)) => {
                    if offline {
                        continue;
                    }
                    if let Err(e) = self.heartbeat(false).await {
                        error!("Heartbeat failed during run loop: {}", e);
                        self.stop_roles().await;
                        return Ok(1);
                    }
                }
            }
        }
    }
}
