// src/cli.rs

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use crate::agent::Agent;
use crate::config::AgentConfig;
use crate::vault::{Vault, VaultOptions};

/// ReflexSOAR endpoint agent
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Pair this agent with a management console
    #[clap(long)]
    pub pair: bool,

    /// Pair but do not start the agent afterwards
    #[clap(long)]
    pub pair_skip_start: bool,

    /// Start the agent
    #[clap(long)]
    pub start: bool,

    /// Management console URL (or REFLEX_API_HOST)
    #[clap(long, value_name = "URL")]
    pub console: Option<String>,

    /// Pairing token (or REFLEX_AGENT_PAIR_TOKEN)
    #[clap(long, value_name = "TOKEN")]
    pub token: Option<String>,

    /// Agent groups to join when pairing
    #[clap(long, value_name = "GROUP", value_delimiter = ',')]
    pub groups: Vec<String>,

    /// Remove the persistent configuration file
    #[clap(long)]
    pub clear_persistent_config: bool,

    /// Remove the pairing record for the given console URL
    #[clap(long, value_name = "URL")]
    pub reset_console_pairing: Option<String>,

    /// Print the persistent configuration
    #[clap(long)]
    pub view_config: bool,

    /// Set a configuration value, e.g. roles:poller,detector
    #[clap(long, value_name = "KEY:VALUE")]
    pub set_config_value: Option<String>,

    /// Load environment variables from this file before anything else
    #[clap(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Send a single heartbeat and exit
    #[clap(long)]
    pub heartbeat: bool,

    /// Run without a console (no pairing, no heartbeats)
    #[clap(long)]
    pub offline: bool,

    /// Directory holding the persistent configuration
    #[clap(long, value_name = "DIR")]
    pub config_path: Option<PathBuf>,

    /// Create the secrets vault file
    #[clap(long)]
    pub init_secrets_vault: bool,

    /// Directory holding the secrets vault
    #[clap(long, value_name = "DIR")]
    pub vault_path: Option<PathBuf>,

    /// Secrets vault filename (or REFLEX_AGENT_VAULT_NAME)
    #[clap(long, value_name = "NAME")]
    pub vault_name: Option<String>,

    /// Secrets vault master key (or REFLEX_AGENT_VAULT_SECRET)
    #[clap(long, value_name = "KEY")]
    pub vault_key: Option<String>,

    /// Add a secret to the vault, e.g. username:password
    #[clap(long, value_name = "USERNAME:PASSWORD")]
    pub add_secret: Option<String>,
}

impl Cli {
    fn vault_options(&self) -> VaultOptions {
        VaultOptions {
            path: self.vault_path.clone(),
            name: self.vault_name.clone(),
            secret: self.vault_key.clone(),
            iterations: None,
            empty_vault: false,
        }
    }
}

fn env_truthy(name: &str) -> bool {
    std::env::var(name)
        .map(|v| !matches!(v.to_lowercase().as_str(), "" | "0" | "false" | "no"))
        .unwrap_or(false)
}

/// Dispatches the parsed CLI. Returns the process exit code: 0 on graceful
/// termination or a successful no-op, 1 on pair or heartbeat failure.
pub async fn handle_command(cli: Cli) -> Result<i32> {
    let config_dir = match &cli.config_path {
        Some(path) => path.clone(),
        None => AgentConfig::default_config_dir()?,
    };

    if cli.clear_persistent_config {
        AgentConfig::clear(&config_dir)?;
        info!("Persistent configuration cleared");
        return Ok(0);
    }

    if let Some(url) = &cli.reset_console_pairing {
        let mut agent = Agent::new(Some(config_dir))?;
        match agent.config.remove_paired_console(url) {
            Ok(()) => {
                agent.save_config()?;
                info!("Removed console pairing for {}", url);
            }
            Err(e) => warn!("Could not reset console pairing: {}", e),
        }
        return Ok(0);
    }

    if let Some(pair_spec) = &cli.set_config_value {
        let (key, value) = pair_spec.split_once(':').unwrap_or((pair_spec.as_str(), ""));
        let mut agent = Agent::new(Some(config_dir))?;
        agent.config.set_value(key, value)?;
        agent.save_config()?;
        info!("Set {} to \"{}\"", key, value);
        return Ok(0);
    }

    if cli.view_config {
        let agent = Agent::new(Some(config_dir))?;
        println!("Configuration Preview");
        println!("{}", agent.config.json(true)?);
        return Ok(0);
    }

    if cli.init_secrets_vault {
        let mut options = cli.vault_options();
        options.empty_vault = true;
        let vault = Vault::open(options)?;
        println!("Initialized secrets vault at {:?}", vault.vault_path());
        return Ok(0);
    }

    if let Some(secret_spec) = &cli.add_secret {
        let Some((username, password)) = secret_spec.split_once(':') else {
            error!("--add-secret expects USERNAME:PASSWORD");
            return Ok(0);
        };
        let mut vault = Vault::open(cli.vault_options())?;
        let uuid = vault.create_secret(username, password)?;
        println!("{uuid}");
        return Ok(0);
    }

    let mut agent = Agent::new(Some(config_dir))?;

    // Explicit --pair, or pair-on-start forced through the environment.
    if cli.pair || env_truthy("REFLEX_AGENT_PAIR_MODE") {
        let console = cli
            .console
            .clone()
            .or_else(|| std::env::var("REFLEX_API_HOST").ok());
        let token = cli
            .token
            .clone()
            .or_else(|| std::env::var("REFLEX_AGENT_PAIR_TOKEN").ok());
        let (Some(console), Some(token)) = (console, token) else {
            error!("Pairing requires --console and --token (or REFLEX_API_HOST / REFLEX_AGENT_PAIR_TOKEN)");
            return Ok(1);
        };

        if let Err(e) = agent.pair(&console, &token, false, &cli.groups).await {
            error!("Pairing failed: {}", e);
            return Ok(1);
        }
        if cli.pair_skip_start {
            return Ok(0);
        }
        return Ok(agent.run(cli.offline).await?);
    }

    if cli.heartbeat {
        return match agent.heartbeat(true).await {
            Ok(()) => {
                info!("Heartbeat acknowledged");
                Ok(0)
            }
            Err(e) => {
                error!("Heartbeat failed: {}", e);
                Ok(1)
            }
        };
    }

    if cli.start || cli.offline {
        return Ok(agent.run(cli.offline).await?);
    }

    // No action requested; show the warnings collected at load time so an
    // operator notices misconfigured roles.
    for warning in &agent.warnings {
        warn!("{}", warning);
    }
    info!("Nothing to do. Use --start, --pair or --heartbeat.");
    Ok(0)
}
