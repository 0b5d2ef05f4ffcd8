// src/role/mod.rs
// Role framework. A role is a strategy exposing `main()`; the supervisor
// owns a RoleWorker per started role which runs the loop, holds the stop
// signal, and provides the finalized operations (config access, connection
// sharing, input loading) through the RoleContext. Keeping those operations
// off the Role trait means implementations cannot override them.

pub mod detection;
pub mod detector;
pub mod poller;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::{AgentError, Result};
use crate::event::EventManager;
use crate::input::InputRegistry;
use crate::management::{ConnectionRegistry, ManagementConnection, DEFAULT_CONNECTION_NAME};

pub use detector::Detector;
pub use poller::Poller;

/// Shared, live-updatable configuration for one role. The supervisor writes
/// it during policy reconciliation; the role reads it every tick.
pub type SharedRoleConfig = Arc<DashMap<String, Value>>;

pub const DEFAULT_WAIT_INTERVAL: u64 = 10;

/// Per-worker stop signal: a flag for loop checks plus a notifier that cuts
/// sleeps short.
#[derive(Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Everything a role is allowed to touch while running.
#[derive(Clone)]
pub struct RoleContext {
    config: SharedRoleConfig,
    connections: ConnectionRegistry,
    event_manager: EventManager,
    inputs: Arc<InputRegistry>,
}

impl RoleContext {
    pub fn new(
        config: SharedRoleConfig,
        connections: ConnectionRegistry,
        event_manager: EventManager,
        inputs: Arc<InputRegistry>,
    ) -> Self {
        // Every role config carries a wait_interval.
        config
            .entry("wait_interval".to_string())
            .or_insert_with(|| json!(DEFAULT_WAIT_INTERVAL));
        RoleContext {
            config,
            connections,
            event_manager,
            inputs,
        }
    }

    pub fn wait_interval(&self) -> u64 {
        self.config
            .get("wait_interval")
            .and_then(|v| v.value().as_u64())
            .unwrap_or(DEFAULT_WAIT_INTERVAL)
    }

    pub fn config_value(&self, key: &str) -> Option<Value> {
        self.config.get(key).map(|entry| entry.value().clone())
    }

    pub fn set_config(&self, key: &str, value: Value) {
        self.config.insert(key.to_string(), value);
    }

    pub fn get_connection(&self, name: &str) -> Option<ManagementConnection> {
        self.connections.get(name)
    }

    pub fn default_connection(&self) -> Option<ManagementConnection> {
        self.connections.get_default()
    }

    /// Shares a connection with every other role. The `"default"` console
    /// connection belongs to the supervisor and cannot be replaced here.
    pub fn share_connection(&self, conn: ManagementConnection) -> Result<()> {
        if conn.name() == DEFAULT_CONNECTION_NAME {
            return Err(AgentError::ForbiddenConnectionName(conn.name().to_string()));
        }
        self.connections.add(conn)
    }

    pub fn unshare_connection(&self, name: &str) -> Result<()> {
        if name == DEFAULT_CONNECTION_NAME {
            return Err(AgentError::ForbiddenConnectionName(name.to_string()));
        }
        self.connections.remove(name)
    }

    /// The input implementations installed in this agent, indexed by alias.
    pub fn load_inputs(&self) -> &InputRegistry {
        &self.inputs
    }

    pub fn event_manager(&self) -> &EventManager {
        &self.event_manager
    }
}

/// A role implementation: identity plus one unit of work per tick.
#[async_trait]
pub trait Role: Send {
    fn shortname(&self) -> &'static str;
    async fn main(&mut self, ctx: &RoleContext) -> Result<()>;
}

/// Supervisor-owned handle around a running role.
pub struct RoleWorker {
    shortname: String,
    stop: StopSignal,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    /// Run `main()` once instead of looping.
    pub disable_run_loop: bool,
    /// Stop after this many iterations when non-zero.
    pub max_loop_count: u64,
}

impl RoleWorker {
    pub fn new(shortname: &str) -> Self {
        RoleWorker {
            shortname: shortname.to_string(),
            stop: StopSignal::new(),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            disable_run_loop: false,
            max_loop_count: 0,
        }
    }

    pub fn shortname(&self) -> &str {
        &self.shortname
    }

    pub fn is_alive(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawns the role's run loop.
    pub fn start(&mut self, mut role: Box<dyn Role>, ctx: RoleContext) {
        if self.handle.is_some() {
            warn!("Role {} is already running", self.shortname);
            return;
        }
        let shortname = self.shortname.clone();
        let stop = self.stop.clone();
        let running = self.running.clone();
        let disable_run_loop = self.disable_run_loop;
        let max_loop_count = self.max_loop_count;
        running.store(true, Ordering::SeqCst);

        self.handle = Some(tokio::spawn(async move {
            info!("Starting {} role", shortname);
            if disable_run_loop {
                if let Err(e) = role.main(&ctx).await {
                    warn!("Role {} failed: {}", shortname, e);
                }
            } else {
                let mut loops = 0u64;
                loop {
                    if stop.is_set() {
                        break;
                    }
                    if let Err(e) = role.main(&ctx).await {
                        warn!("Role {} tick failed: {}", shortname, e);
                    }
                    loops += 1;
                    if max_loop_count > 0 && loops >= max_loop_count {
                        stop.set();
                        break;
                    }
                    tokio::select! {
                        _ = stop.notified() => break,
                        _ = tokio::time::sleep(Duration::from_secs(ctx.wait_interval())) => {}
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
            info!("Role {} stopped", shortname);
        }));
    }

    /// Signals the worker to stop and, unless called from inside the worker,
    /// waits for it to exit.
    pub async fn stop(&mut self, from_self: bool) {
        info!("Stop of {} requested", self.shortname);
        self.running.store(false, Ordering::SeqCst);
        self.stop.set();
        if !from_self {
            if let Some(handle) = self.handle.take() {
                let _ = handle.await;
            }
        }
    }
}

/// Constructor signature for registering a role implementation.
pub type RoleCtor = fn() -> Box<dyn Role>;

/// Process-local registry of role implementations, indexed by shortname.
/// Replaces the original runtime subclass discovery.
#[derive(Default)]
pub struct RoleRegistry {
    ctors: HashMap<String, RoleCtor>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in roles.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(poller::SHORTNAME, || Box::new(Poller::new()));
        registry.register(detector::SHORTNAME, || Box::new(Detector::new()));
        registry
    }

    pub fn register(&mut self, shortname: &str, ctor: RoleCtor) {
        self.ctors.insert(shortname.to_string(), ctor);
    }

    pub fn contains(&self, shortname: &str) -> bool {
        self.ctors.contains_key(shortname)
    }

    pub fn shortnames(&self) -> Vec<String> {
        self.ctors.keys().cloned().collect()
    }

    pub fn build(&self, shortname: &str) -> Option<Box<dyn Role>> {
        self.ctors.get(shortname).map(|ctor| ctor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct CountingRole {
        counter: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Role for CountingRole {
        fn shortname(&self) -> &'static str {
            "counting"
        }

        async fn main(&mut self, _ctx: &RoleContext) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_ctx() -> RoleContext {
        RoleContext::new(
            Arc::new(DashMap::new()),
            ConnectionRegistry::new(),
            EventManager::new(),
            Arc::new(InputRegistry::with_builtins()),
        )
    }

    #[test]
    fn wait_interval_defaults_to_ten_seconds() {
        let ctx = test_ctx();
        assert_eq!(ctx.wait_interval(), 10);

        let config: SharedRoleConfig = Arc::new(DashMap::new());
        config.insert("random".to_string(), json!("abc"));
        let ctx = RoleContext::new(
            config,
            ConnectionRegistry::new(),
            EventManager::new(),
            Arc::new(InputRegistry::new()),
        );
        assert_eq!(ctx.wait_interval(), 10);

        ctx.set_config("wait_interval", json!(3));
        assert_eq!(ctx.wait_interval(), 3);
    }

    #[test]
    fn connection_sharing_guards_the_default_name() {
        let ctx = test_ctx();

        let shared = ManagementConnection::new("https://localhost", "key", false, "shared").unwrap();
        ctx.share_connection(shared).unwrap();
        assert!(ctx.get_connection("shared").is_some());
        ctx.unshare_connection("shared").unwrap();
        assert!(ctx.get_connection("shared").is_none());

        let forbidden =
            ManagementConnection::new("https://localhost", "key", false, "default").unwrap();
        assert!(matches!(
            ctx.share_connection(forbidden),
            Err(AgentError::ForbiddenConnectionName(_))
        ));
        assert!(matches!(
            ctx.unshare_connection("default"),
            Err(AgentError::ForbiddenConnectionName(_))
        ));
    }

    #[test]
    fn load_inputs_exposes_installed_adapters() {
        let ctx = test_ctx();
        assert!(ctx.load_inputs().contains("elastic"));
    }

    #[tokio::test]
    async fn worker_honors_max_loop_count() {
        let config: SharedRoleConfig = Arc::new(DashMap::new());
        config.insert("wait_interval".to_string(), json!(0));
        let ctx = RoleContext::new(
            config,
            ConnectionRegistry::new(),
            EventManager::new(),
            Arc::new(InputRegistry::new()),
        );

        let counter = Arc::new(AtomicU64::new(0));
        let mut worker = RoleWorker::new("counting");
        worker.max_loop_count = 2;
        worker.start(
            Box::new(CountingRole {
                counter: counter.clone(),
            }),
            ctx,
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while worker.is_alive() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(worker.stop.is_set());
        worker.stop(false).await;
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn worker_disable_run_loop_runs_main_once() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut worker = RoleWorker::new("counting");
        worker.disable_run_loop = true;
        worker.start(
            Box::new(CountingRole {
                counter: counter.clone(),
            }),
            test_ctx(),
        );

        worker.stop(false).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn worker_start_stop() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut worker = RoleWorker::new("counting");
        worker.start(
            Box::new(CountingRole {
                counter: counter.clone(),
            }),
            test_ctx(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(worker.is_alive());
        worker.stop(false).await;
        assert!(!worker.is_alive());
        assert!(counter.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn registry_indexes_builtin_roles() {
        let registry = RoleRegistry::with_builtins();
        assert!(registry.contains("poller"));
        assert!(registry.contains("detector"));
        assert!(registry.build("poller").is_some());
        assert!(registry.build("nope").is_none());

        let mut registry = RoleRegistry::new();
        registry.register("counting", || {
            Box::new(CountingRole {
                counter: Arc::new(AtomicU64::new(0)),
            })
        });
        assert_eq!(registry.shortnames(), vec!["counting".to_string()]);
    }
}
