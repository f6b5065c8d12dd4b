//! Authentication, authorization and message-shaping gateway for an MQTT
//! broker.
//!
//! The gateway plugs into an MQTT 3.1.1 / MQTT 5 broker as a set of ten
//! synchronous hooks and provides:
//!
//! - **Identity**: structured Client-IDs
//!   (`<version>/<mode>/<agent>.<account>.<audience>`) naming every
//!   connection
//! - **Authentication**: JWT passwords verified against per-issuer keys and
//!   cross-checked against the Client-ID
//! - **Authorization**: connection modes gated by per-audience trust policy
//! - **Access control**: per-mode broadcast/multicast/unicast topic grammar
//! - **Message shaping**: broker-attested provenance and timing properties
//!   stamped on every publish, with MQTT 3 clients served through a JSON
//!   envelope that carries MQTT 5 user properties
//! - **Dynamic subscriptions**: `subscription.create`/`subscription.delete`
//!   requests from services, mirrored so they survive session-clean eviction
//! - **Audience events**: `agent.enter`/`agent.leave` lifecycle notifications
//!
//! # Architecture
//!
//! The host broker invokes one hook per in-flight MQTT event. Each hook
//! pipeline composes the identifier codec, the authenticator, the topic ACL,
//! and the property rewriter, and returns accept / accept-with-modifications
//! / deny. The only shared state is the immutable [`Config`] snapshot, the
//! connection table, and the dynamic-subscription mirror; the broker itself
//! is reached through the narrow [`BrokerClient`] trait.

pub mod acl;
pub mod auth;
pub mod broker;
pub mod config;
pub mod dynsub;
pub mod error;
pub mod gateway;
pub mod ident;
pub mod mqtt;
pub mod rewrite;

// Re-export main types
pub use broker::{BrokerClient, BrokerError, NullBroker};
pub use config::Config;
pub use error::{Error, ReasonCode};
pub use gateway::{Gateway, HookOutcome, Modifiers};
pub use ident::{AccountId, AgentId, ClientId, ConnectionMode};
