//! MQTT-facing data model: segmented topics and the message envelope.

pub mod envelope;
pub mod topic;

pub use envelope::{Message, Properties, UserProperties};
