//! The narrow broker interface consumed by the gateway.
//!
//! The gateway performs no network I/O of its own; everything it needs from
//! the host broker (publishing gateway-authored messages and managing
//! subscriptions on behalf of agents) goes through this trait.

use thiserror::Error;

/// Error returned by the host broker.
#[derive(Error, Debug)]
#[error("broker: {0}")]
pub struct BrokerError(pub String);

/// Host-broker operations, with topics as segment arrays.
pub trait BrokerClient: Send + Sync {
    /// Publish a gateway-authored message.
    fn publish(&self, topic: &[String], payload: &[u8], qos: u8) -> Result<(), BrokerError>;

    /// Install subscriptions on behalf of the connection identified by
    /// `subject` (a Client-ID string).
    fn subscribe(
        &self,
        subject: &str,
        subscriptions: &[(Vec<String>, u8)],
    ) -> Result<(), BrokerError>;

    /// Remove subscriptions previously installed for `subject`.
    fn unsubscribe(&self, subject: &str, topics: &[Vec<String>]) -> Result<(), BrokerError>;

    /// Client-ID strings of all live connections.
    fn list_connections(&self) -> Result<Vec<String>, BrokerError>;
}

/// Broker stub for contexts without a host broker, such as the config
/// preflight binary.
pub struct NullBroker;

impl BrokerClient for NullBroker {
    fn publish(&self, _topic: &[String], _payload: &[u8], _qos: u8) -> Result<(), BrokerError> {
        Ok(())
    }

    fn subscribe(
        &self,
        _subject: &str,
        _subscriptions: &[(Vec<String>, u8)],
    ) -> Result<(), BrokerError> {
        Ok(())
    }

    fn unsubscribe(&self, _subject: &str, _topics: &[Vec<String>]) -> Result<(), BrokerError> {
        Ok(())
    }

    fn list_connections(&self) -> Result<Vec<String>, BrokerError> {
        Ok(Vec::new())
    }
}
