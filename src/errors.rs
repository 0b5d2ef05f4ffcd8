// src/errors.rs
use thiserror::Error;

/// Error taxonomy for the agent. Variants are named for what went wrong in
/// the domain, not for the library that surfaced the failure.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Console {0} is already paired with this agent")]
    PairingConflict(String),

    #[error("Console returned an internal server error during pairing: {0}")]
    PairingUnreachable(String),

    #[error("Agent heartbeat failed: {0}")]
    HeartbeatFailed(String),

    #[error("Console {0} is not paired with this agent")]
    NotPaired(String),

    #[error("Connection with name \"{0}\" already exists")]
    DuplicateConnection(String),

    #[error("Connection with name \"{0}\" does not exist")]
    ConnectionNotExist(String),

    #[error("Connection name \"{0}\" is reserved for the agent supervisor")]
    ForbiddenConnectionName(String),

    #[error("The EventManager has already been initialized")]
    EventManagerInitialized,

    #[error("The EventManager has not been initialized")]
    EventManagerNotInitialized,

    #[error("Authorization failed for \"{0}\"")]
    AuthorizationFailed(String),

    #[error("Key \"{0}\" does not exist in the agent configuration")]
    ConfigKeyUnknown(String),

    #[error("Key \"{0}\" is not updateable")]
    ConfigKeyImmutable(String),

    #[error("Invalid value for configuration key \"{key}\": {reason}")]
    ConfigValueInvalid { key: String, reason: String },

    #[error("Policy setting \"{0}\" does not exist")]
    PolicySettingMissing(String),

    #[error("Detection rule is missing the last_run property")]
    DetectionMissingLastRun,

    #[error("Invalid event field: {0}")]
    InvalidEventField(String),

    #[error("Vault error: {0}")]
    VaultError(String),

    #[error("Input error: {0}")]
    InputError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("XDG directory error: {0}")]
    XdgError(#[from] xdg::BaseDirectoriesError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
