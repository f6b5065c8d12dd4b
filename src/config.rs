//! Configuration for the gateway.
//!
//! The configuration is read once at startup, a TOML file plus a handful of
//! environment overrides, and shared by every hook as an immutable
//! `Arc<Config>` snapshot.
//!
//! # Example
//!
//! ```toml
//! [id]
//! label = "mqtt-gateway"
//! account_label = "svc"
//! audience = "example.org"
//!
//! [authn."iam.svc.example.net"]
//! algorithm = "ES256"
//! audience = ["example.net"]
//! key_file = "keys/iam.public_key.pem"
//!
//! [authz."example.org"]
//! type = "trusted"
//! trusted = [{ label = "conference", audience = "svc.example.org" }]
//!
//! [stat]
//! enabled = true
//! id = { label = "observer", account_label = "svc", audience = "example.org" }
//! ```

use std::collections::{HashMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::ident::{AccountId, AgentId};

/// Default config path when `APP_CONFIG` is unset.
const DEFAULT_CONFIG_PATH: &str = "App.toml";

/// Verification settings for one token issuer.
#[derive(Debug, Clone, Deserialize)]
pub struct IssuerConfig {
    /// JWT algorithm name, e.g. `ES256` or `HS256`.
    pub algorithm: String,

    /// Audiences this issuer may vouch for.
    pub audience: Vec<String>,

    /// Inline verification key: a PEM document, or the shared secret for
    /// HMAC algorithms.
    #[serde(default)]
    pub key: Option<String>,

    /// Verification key loaded from a file instead.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl IssuerConfig {
    /// Resolve the key material, reading `key_file` when configured.
    pub fn key_material(&self) -> Result<Vec<u8>> {
        match (&self.key, &self.key_file) {
            (Some(key), _) => Ok(key.as_bytes().to_vec()),
            (None, Some(path)) => fs::read(path)
                .with_context(|| format!("cannot read key file {}", path.display())),
            (None, None) => bail!("issuer has neither `key` nor `key_file`"),
        }
    }
}

/// Issuer name to verification settings.
pub type AuthnConfig = HashMap<String, IssuerConfig>;

/// Connection-mode policy for one audience.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudiencePolicy {
    /// Accounts allowed to connect in non-default modes.
    Trusted { trusted: HashSet<AccountId> },
}

impl AudiencePolicy {
    pub fn is_trusted(&self, account: &AccountId) -> bool {
        match self {
            Self::Trusted { trusted } => trusted.contains(account),
        }
    }
}

/// Audience to connection-mode policy.
pub type AuthzConfig = HashMap<String, AudiencePolicy>;

/// Audience lifecycle event settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatConfig {
    /// Emit `agent.enter` / `agent.leave` events.
    #[serde(default)]
    pub enabled: bool,

    /// Identity used as the author of those events.
    #[serde(default)]
    pub id: Option<AgentId>,
}

/// Immutable configuration snapshot shared by all hooks.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The broker's own identity.
    pub id: AgentId,

    /// Token verification; `None` disables authentication.
    #[serde(default)]
    pub authn: Option<AuthnConfig>,

    /// Mode policy; `None` allows every mode.
    #[serde(default)]
    pub authz: Option<AuthzConfig>,

    /// Audience event settings.
    #[serde(default)]
    pub stat: StatConfig,
}

impl Config {
    /// Load from the path named by `APP_CONFIG` (default `App.toml`).
    pub fn load() -> Result<Self> {
        let path = env::var("APP_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        Self::load_from(Path::new(&path))
    }

    /// Load from an explicit path and apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let mut config: Config = toml::from_str(&data)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides on top of the file.
    fn apply_env(&mut self) {
        if let Ok(label) = env::var("APP_AGENT_LABEL") {
            self.id.label = label;
        }
        if let Ok(label) = env::var("APP_ACCOUNT_LABEL") {
            self.id.account_label = label;
        }
        if let Ok(audience) = env::var("APP_AUDIENCE") {
            self.id.audience = audience;
        }
        // "0" disables audience events; any other value enables them.
        if let Ok(value) = env::var("APP_STAT_ENABLED") {
            self.stat.enabled = value != "0";
        }
    }

    fn validate(&self) -> Result<()> {
        if self.stat.enabled && self.stat.id.is_none() {
            bail!("stat events are enabled but `stat.id` is not set");
        }
        Ok(())
    }
}
