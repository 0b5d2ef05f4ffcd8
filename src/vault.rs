// src/vault.rs
// Encrypted credential store. Secrets live in a single YAML document keyed
// by uuid; every field is individually wrapped with a key derived from the
// master secret and a per-encryption salt, so the master key never touches
// the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use fs2::FileExt;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::APP_NAME;
use crate::errors::{AgentError, Result};

pub const DEFAULT_VAULT_NAME: &str = "reflexsoar-agent-vault.yml";
pub const DEFAULT_ITERATIONS: u32 = 100_000;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// An encrypted credential pair as stored on disk.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VaultEntry {
    pub username: String,
    pub password: String,
}

/// Decrypted credentials returned to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultSecret {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct VaultOptions {
    /// Directory holding the vault file; the agent data dir when absent.
    pub path: Option<PathBuf>,
    /// Vault filename; `REFLEX_AGENT_VAULT_NAME` or the default when absent.
    pub name: Option<String>,
    /// Master key; `REFLEX_AGENT_VAULT_SECRET` when absent.
    pub secret: Option<String>,
    pub iterations: Option<u32>,
    /// Start from an empty document instead of reading a missing file.
    pub empty_vault: bool,
}

pub struct Vault {
    pub name: String,
    vault_path: PathBuf,
    secret_key: String,
    iterations: u32,
    secrets: HashMap<String, VaultEntry>,
}

impl Vault {
    pub fn open(options: VaultOptions) -> Result<Self> {
        let name = options
            .name
            .or_else(|| std::env::var("REFLEX_AGENT_VAULT_NAME").ok())
            .unwrap_or_else(|| DEFAULT_VAULT_NAME.to_string());
        let secret_key = options
            .secret
            .or_else(|| std::env::var("REFLEX_AGENT_VAULT_SECRET").ok())
            .unwrap_or_default();

        let data_dir = match options.path {
            Some(path) => path,
            None => {
                let xdg_dirs = xdg::BaseDirectories::with_prefix(APP_NAME)?;
                xdg_dirs.get_data_home()
            }
        };

        let mut vault = Vault {
            vault_path: data_dir.join(&name),
            name,
            secret_key,
            iterations: options.iterations.unwrap_or(DEFAULT_ITERATIONS),
            secrets: HashMap::new(),
        };

        if options.empty_vault {
            vault.setup()?;
        } else {
            vault.load()?;
        }
        Ok(vault)
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }

    /// Creates the vault file with an empty document when missing.
    pub fn setup(&mut self) -> Result<()> {
        if !self.vault_path.exists() {
            if let Some(parent) = self.vault_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.save()?;
        }
        Ok(())
    }

    /// Loads the vault document from disk, creating it when missing.
    pub fn load(&mut self) -> Result<()> {
        if self.vault_path.exists() {
            let file = std::fs::File::open(&self.vault_path)?;
            file.lock_shared()?;
            let parsed: Option<HashMap<String, VaultEntry>> = serde_yaml::from_reader(&file)?;
            file.unlock()?;
            self.secrets = parsed.unwrap_or_default();
            debug!("Loaded {} vault entries", self.secrets.len());
        } else {
            self.setup()?;
        }
        Ok(())
    }

    /// Re-reads the vault from disk, picking up writes from other workers.
    pub fn refresh(&mut self) -> Result<()> {
        self.load()
    }

    /// Writes the vault document under an exclusive cross-process lock.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.vault_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.vault_path)?;
        file.lock_exclusive()?;
        file.set_len(0)?;
        serde_yaml::to_writer(&file, &self.secrets)?;
        file.unlock()?;
        Ok(())
    }

    /// Stores a new credential pair and returns its uuid.
    pub fn create_secret(&mut self, username: &str, password: &str) -> Result<String> {
        let secret_uuid = Uuid::new_v4().to_string();
        let entry = VaultEntry {
            username: self.encrypt(username)?,
            password: self.encrypt(password)?,
        };
        self.secrets.insert(secret_uuid.clone(), entry);
        self.save()?;
        Ok(secret_uuid)
    }

    /// Fetches and decrypts a credential pair. Entries that fail integrity
    /// checks decrypt to empty strings rather than erroring.
    pub fn get_secret(&self, secret_uuid: &str) -> Option<VaultSecret> {
        self.secrets.get(secret_uuid).map(|entry| VaultSecret {
            username: self.decrypt(&entry.username),
            password: self.decrypt(&entry.password),
        })
    }

    pub fn update_secret(&mut self, secret_uuid: &str, username: &str, password: &str) -> Result<()> {
        let entry = VaultEntry {
            username: self.encrypt(username)?,
            password: self.encrypt(password)?,
        };
        self.secrets.insert(secret_uuid.to_string(), entry);
        self.save()?;
        Ok(())
    }

    pub fn delete_secret(&mut self, secret_uuid: &str, skip_save: bool) -> Result<()> {
        self.secrets.remove(secret_uuid);
        if !skip_save {
            self.save()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    fn derive_key(&self, salt: &[u8], iterations: u32) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(self.secret_key.as_bytes(), salt, iterations, &mut key);
        key
    }

    /// Wraps a plaintext as `base64(salt || iterations_be || base64(nonce || ct))`.
    fn encrypt(&self, message: &str) -> Result<String> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = self.derive_key(&salt, self.iterations);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), message.as_bytes())
            .map_err(|_| AgentError::VaultError("encryption failed".to_string()))?;

        let mut token = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        token.extend_from_slice(&nonce_bytes);
        token.extend_from_slice(&ciphertext);
        let inner = URL_SAFE.encode(token);

        let mut outer = Vec::with_capacity(SALT_LEN + 4 + inner.len());
        outer.extend_from_slice(&salt);
        outer.extend_from_slice(&self.iterations.to_be_bytes());
        outer.extend_from_slice(inner.as_bytes());
        Ok(URL_SAFE.encode(outer))
    }

    /// Unwraps a ciphertext produced by `encrypt`. Any parse or integrity
    /// failure yields an empty string.
    fn decrypt(&self, ciphertext: &str) -> String {
        let Ok(decoded) = URL_SAFE.decode(ciphertext) else {
            return String::new();
        };
        if decoded.len() < SALT_LEN + 4 {
            return String::new();
        }
        let salt = &decoded[..SALT_LEN];
        let iterations = u32::from_be_bytes(
            decoded[SALT_LEN..SALT_LEN + 4]
                .try_into()
                .unwrap_or([0u8; 4]),
        );
        let Ok(token) = URL_SAFE.decode(&decoded[SALT_LEN + 4..]) else {
            return String::new();
        };
        if token.len() < NONCE_LEN {
            return String::new();
        }

        let key = self.derive_key(salt, iterations);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        match cipher.decrypt(Nonce::from_slice(&token[..NONCE_LEN]), &token[NONCE_LEN..]) {
            Ok(plaintext) => String::from_utf8(plaintext).unwrap_or_default(),
            Err(_) => {
                warn!("Vault entry failed its integrity check");
                String::new()
            }
        }
    }
}
