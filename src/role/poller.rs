// src/role/poller.rs
// Poller role: keeps the agent's configured inputs in sync with the console
// and runs them, oldest first, handing the harvested records to the
// EventManager.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use crate::errors::Result;
use crate::event::EventPayload;
use crate::input::Input;
use crate::role::{Role, RoleContext};

pub const SHORTNAME: &str = "poller";

#[derive(Default)]
pub struct Poller {
    configured_inputs: HashMap<String, Box<dyn Input>>,
}

impl Poller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configured_input_count(&self) -> usize {
        self.configured_inputs.len()
    }

    /// Reconciles the configured inputs against the console's input list:
    /// new inputs are instantiated (resolving their credential first),
    /// removed ones are dropped.
    async fn configure_inputs(&mut self, inputs: &[Value], ctx: &RoleContext) {
        let conn = ctx.default_connection();
        for entry in inputs {
            let Some(uuid) = entry.get("uuid").and_then(Value::as_str) else {
                continue;
            };
            if self.configured_inputs.contains_key(uuid) {
                continue;
            }

            let alias = entry
                .get("plugin")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_lowercase();
            if !ctx.load_inputs().contains(&alias) {
                warn!("Input plugin \"{}\" is not installed in this agent", alias);
                continue;
            }

            let mut credentials = None;
            if let (Some(conn), Some(cred_id)) =
                (&conn, entry.get("credential").and_then(Value::as_str))
            {
                credentials = conn.agent_get_input_credentials(cred_id).await;
            }

            match ctx.load_inputs().build(&alias, entry, credentials) {
                Ok(input) => {
                    info!("Configured input {} ({})", uuid, alias);
                    self.configured_inputs.insert(uuid.to_string(), input);
                }
                Err(e) => warn!("Failed to configure input {}: {}", uuid, e),
            }
        }

        // Drop inputs that are no longer assigned to this agent.
        let active: HashSet<String> = inputs
            .iter()
            .filter_map(|i| i.get("uuid").and_then(Value::as_str))
            .map(str::to_lowercase)
            .collect();
        self.configured_inputs
            .retain(|uuid, _| active.contains(&uuid.to_lowercase()));
    }

    /// The inputs due next: every input that has never run, or failing
    /// that, the one that ran longest ago.
    fn fetch_inputs(&self) -> Vec<String> {
        let unrun: Vec<String> = self
            .configured_inputs
            .iter()
            .filter(|(_, input)| input.last_run().is_none())
            .map(|(uuid, _)| uuid.clone())
            .collect();
        if !unrun.is_empty() {
            return unrun;
        }
        self.configured_inputs
            .iter()
            .min_by_key(|(_, input)| input.last_run())
            .map(|(uuid, _)| vec![uuid.clone()])
            .unwrap_or_default()
    }

    async fn run_input(&mut self, uuid: &str, ctx: &RoleContext) {
        let Some(input) = self.configured_inputs.get_mut(uuid) else {
            return;
        };
        let events = match input.run().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Input {} failed: {}", uuid, e);
                return;
            }
        };
        if events.is_empty() {
            return;
        }
        let spec = input.parsed_config().event_spec();
        let payloads: Vec<EventPayload> = events.into_iter().map(Into::into).collect();
        if let Err(e) = ctx.event_manager().prepare_events(payloads, &spec).await {
            warn!("Failed to prepare events from input {}: {}", uuid, e);
        }
    }
}

#[async_trait]
impl Role for Poller {
    fn shortname(&self) -> &'static str {
        SHORTNAME
    }

    async fn main(&mut self, ctx: &RoleContext) -> Result<()> {
        let Some(conn) = ctx.default_connection() else {
            warn!("Poller has no default console connection yet");
            return Ok(());
        };

        match conn.agent_get_inputs().await {
            Some(inputs) if !inputs.is_empty() => {
                info!("Loading and configuring inputs...");
                self.configure_inputs(&inputs, ctx).await;
            }
            _ => {
                info!("No inputs configured for this agent.");
                self.configured_inputs.clear();
            }
        }

        for uuid in self.fetch_inputs() {
            self.run_input(&uuid, ctx).await;
        }
        Ok(())
    }
}
