//! Structured identifiers carried in the MQTT Client-ID.
//!
//! A connecting agent encodes its connection mode and identity in the
//! Client-ID:
//!
//! ```text
//! <version>/<mode>/<agent_label>.<account_label>.<audience>
//! ```
//!
//! The `(version, mode)` prefix selects one of five connection modes; the
//! dotted triple names the connection. Labels are non-empty and contain none
//! of `.` `/` `+` `#`; the audience is a namespace (typically a DNS name) and
//! may contain dots.

use std::fmt;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Role of a connection; governs ACL checks and property rewriting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionMode {
    Default,
    Service,
    ServicePayloadOnly,
    Observer,
    Bridge,
}

impl ConnectionMode {
    /// Resolve a `(version, mode)` Client-ID prefix. The mapping is bijective
    /// with [`version`](Self::version) / [`label`](Self::label).
    pub fn from_prefix(version: &str, label: &str) -> Option<Self> {
        match (version, label) {
            ("v1", "agents") => Some(Self::Default),
            ("v1", "service-agents") => Some(Self::Service),
            ("v1.payload-only", "service-agents") => Some(Self::ServicePayloadOnly),
            ("v1", "observer-agents") => Some(Self::Observer),
            ("v1", "bridge-agents") => Some(Self::Bridge),
            _ => None,
        }
    }

    /// Version half of the Client-ID prefix, reused as the
    /// `connection_version` user property.
    pub fn version(self) -> &'static str {
        match self {
            Self::ServicePayloadOnly => "v1.payload-only",
            _ => "v1",
        }
    }

    /// Mode half of the Client-ID prefix, reused as the `connection_mode`
    /// user property.
    pub fn label(self) -> &'static str {
        match self {
            Self::Default => "agents",
            Self::Service | Self::ServicePayloadOnly => "service-agents",
            Self::Observer => "observer-agents",
            Self::Bridge => "bridge-agents",
        }
    }
}

/// A tenant principal: `<label>.<audience>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
pub struct AccountId {
    pub label: String,
    pub audience: String,
}

impl AccountId {
    pub fn new(label: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            audience: audience.into(),
        }
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.label, self.audience)
    }
}

/// The broker's own identity: a Client-ID triple without a mode.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentId {
    pub label: String,
    pub account_label: String,
    pub audience: String,
}

impl AgentId {
    pub fn new(
        label: impl Into<String>,
        account_label: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            label: label.into(),
            account_label: account_label.into(),
            audience: audience.into(),
        }
    }

    /// `<account_label>.<audience>`.
    pub fn account_id(&self) -> String {
        format!("{}.{}", self.account_label, self.audience)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.label, self.account_label, self.audience)
    }
}

/// Parsed Client-ID of a connecting agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId {
    mode: ConnectionMode,
    agent_label: String,
    account_label: String,
    audience: String,
}

fn valid_label(s: &str) -> bool {
    !s.is_empty() && !s.contains(['.', '/', '+', '#'])
}

fn valid_audience(s: &str) -> bool {
    !s.is_empty() && !s.contains(['/', '+', '#'])
}

impl ClientId {
    pub fn new(
        mode: ConnectionMode,
        agent_label: impl Into<String>,
        account_label: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            mode,
            agent_label: agent_label.into(),
            account_label: account_label.into(),
            audience: audience.into(),
        }
    }

    /// Identity an agent of `id` would use when connecting in `mode`. Used
    /// for broker-authored messages, which run through the same rewriter as
    /// client messages.
    pub fn from_agent_id(mode: ConnectionMode, id: &AgentId) -> Self {
        Self::new(mode, &id.label, &id.account_label, &id.audience)
    }

    /// Parse a Client-ID string.
    pub fn parse(s: &str) -> Result<Self> {
        let bad = |detail: &str| Error::BadClientId(format!("`{s}`: {detail}"));

        let mut parts = s.splitn(3, '/');
        let version = parts.next().unwrap_or_default();
        let mode_label = parts.next().ok_or_else(|| bad("missing mode segment"))?;
        let triple = parts.next().ok_or_else(|| bad("missing agent triple"))?;

        let mode = ConnectionMode::from_prefix(version, mode_label)
            .ok_or_else(|| bad("unknown mode prefix"))?;

        let (agent_label, rest) = triple
            .split_once('.')
            .ok_or_else(|| bad("missing account label"))?;
        let (account_label, audience) = rest
            .split_once('.')
            .ok_or_else(|| bad("missing audience"))?;

        if !valid_label(agent_label) || !valid_label(account_label) {
            return Err(bad("empty or malformed label"));
        }
        if !valid_audience(audience) {
            return Err(bad("empty or malformed audience"));
        }

        Ok(Self::new(mode, agent_label, account_label, audience))
    }

    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    pub fn agent_label(&self) -> &str {
        &self.agent_label
    }

    pub fn account_label(&self) -> &str {
        &self.account_label
    }

    pub fn audience(&self) -> &str {
        &self.audience
    }

    /// `<agent_label>.<account_label>.<audience>`, the unique name of the
    /// connection.
    pub fn agent_id(&self) -> String {
        format!(
            "{}.{}.{}",
            self.agent_label, self.account_label, self.audience
        )
    }

    /// `<account_label>.<audience>` as a plain string.
    pub fn account_id(&self) -> String {
        format!("{}.{}", self.account_label, self.audience)
    }

    /// The owning account as a typed id.
    pub fn account(&self) -> AccountId {
        AccountId::new(&self.account_label, &self.audience)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}.{}.{}",
            self.mode.version(),
            self.mode.label(),
            self.agent_label,
            self.account_label,
            self.audience
        )
    }
}
