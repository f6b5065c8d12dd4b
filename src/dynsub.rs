//! Dynamic subscriptions installed on behalf of service agents.
//!
//! A service can ask the gateway to subscribe another connection (the
//! *subject*) to an application's broadcast topic by delivering a
//! `subscription.create` request to it; `subscription.delete` is the
//! inverse. Installed subscriptions are mirrored in [`DynSubState`] so they
//! can be torn down, with a `subscription.delete` event per entry, when
//! the subject disconnects or the broker shuts down.
//!
//! The mirror exists because the host broker drops subscription metadata on
//! clean-session reconnect; it can go once the broker exposes an enumeration
//! API.

use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};

use crate::broker::BrokerClient;
use crate::error::{Error, Result};
use crate::ident::{AgentId, ClientId, ConnectionMode};
use crate::mqtt::envelope::{self, keys, Message};
use crate::mqtt::topic;
use crate::rewrite;

pub const METHOD_CREATE: &str = "subscription.create";
pub const METHOD_DELETE: &str = "subscription.delete";

const DEFAULT_VERSION: &str = "v1";

fn default_version() -> String {
    DEFAULT_VERSION.to_owned()
}

/// One installed dynamic subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DynSubData {
    pub app: String,
    pub object: Vec<String>,
    #[serde(default = "default_version")]
    pub version: String,
}

impl DynSubData {
    /// `apps/<app>/api/<version>/<object...>`, the topic the subject is
    /// subscribed to.
    pub fn subscription_topic(&self) -> Vec<String> {
        let mut segments = vec![
            "apps".to_owned(),
            self.app.clone(),
            "api".to_owned(),
            self.version.clone(),
        ];
        segments.extend(self.object.iter().cloned());
        segments
    }
}

/// Process-wide mirror of installed dynamic subscriptions, keyed by the
/// subject's Client-ID string.
#[derive(Debug, Default)]
pub struct DynSubState {
    subjects: DashMap<String, HashSet<DynSubData>>,
}

impl DynSubState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, subject: &str, data: DynSubData) {
        self.subjects.entry(subject.to_owned()).or_default().insert(data);
    }

    pub fn remove(&self, subject: &str, data: &DynSubData) -> bool {
        match self.subjects.get_mut(subject) {
            Some(mut set) => set.remove(data),
            None => false,
        }
    }

    pub fn get(&self, subject: &str) -> Vec<DynSubData> {
        self.subjects
            .get(subject)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return everything recorded for `subject`.
    pub fn drain(&self, subject: &str) -> Vec<DynSubData> {
        self.subjects
            .remove(subject)
            .map(|(_, set)| set.into_iter().collect())
            .unwrap_or_default()
    }
}

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Create,
    Delete,
}

impl Method {
    pub fn label(self) -> &'static str {
        match self {
            Self::Create => METHOD_CREATE,
            Self::Delete => METHOD_DELETE,
        }
    }
}

/// A recognized subscription request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub subject: ClientId,
    pub data: DynSubData,
    pub correlation_data: Vec<u8>,
}

#[derive(Deserialize)]
struct RequestPayload {
    subject: String,
    object: Vec<String>,
    app: String,
    #[serde(default = "default_version")]
    version: String,
}

/// Recognize a subscription request in a delivered message.
///
/// Returns `Ok(None)` for ordinary messages. A message is treated as a
/// subscription request when it is a request envelope whose response topic
/// folds back onto the delivery topic and whose method is one of ours; from
/// that point on any defect is an error.
pub fn parse_request(message: &Message, delivery_topic: &[String]) -> Result<Option<Request>> {
    let properties = &message.properties;
    if properties.user.get(keys::TYPE) != Some("request") {
        return Ok(None);
    }
    let method = match properties.user.get(keys::METHOD) {
        Some(METHOD_CREATE) => Method::Create,
        Some(METHOD_DELETE) => Method::Delete,
        _ => return Ok(None),
    };
    match &properties.response_topic {
        Some(response_topic) if topic::split(response_topic) == delivery_topic => {}
        _ => return Ok(None),
    }

    if properties.user.get(keys::CONNECTION_MODE) != Some("service-agents") {
        return Err(Error::BadDynSubRequest(
            "sender is not a service agent".into(),
        ));
    }
    for key in [keys::AGENT_LABEL, keys::ACCOUNT_LABEL, keys::AUDIENCE] {
        if !properties.user.contains(key) {
            return Err(Error::BadDynSubRequest(format!(
                "sender identity is missing `{key}`"
            )));
        }
    }
    let correlation_data = properties
        .correlation_data
        .clone()
        .ok_or_else(|| Error::BadDynSubRequest("missing correlation data".into()))?;

    let payload: RequestPayload = serde_json::from_slice(&message.payload)
        .map_err(|e| Error::BadDynSubRequest(format!("malformed payload: {e}")))?;
    let subject = ClientId::parse(&payload.subject)
        .map_err(|e| Error::BadDynSubRequest(format!("bad subject: {e}")))?;
    if payload.object.is_empty() {
        return Err(Error::BadDynSubRequest("empty object".into()));
    }

    Ok(Some(Request {
        method,
        subject,
        data: DynSubData {
            app: payload.app,
            object: payload.object,
            version: payload.version,
        },
        correlation_data,
    }))
}

/// Apply a request: install or remove the broker-side subscription and keep
/// the mirror in sync. A failure here must deny the deliver; the requester
/// would otherwise get a `200` for nothing.
pub fn apply_request(
    request: &Request,
    state: &DynSubState,
    broker: &dyn BrokerClient,
) -> Result<()> {
    let subject = request.subject.to_string();
    let subscription = request.data.subscription_topic();

    match request.method {
        Method::Create => {
            broker
                .subscribe(&subject, &[(subscription, 1)])
                .map_err(|e| Error::Broker(e.to_string()))?;
            state.put(&subject, request.data.clone());
        }
        Method::Delete => {
            broker
                .unsubscribe(&subject, &[subscription])
                .map_err(|e| Error::Broker(e.to_string()))?;
            state.remove(&subject, &request.data);
        }
    }

    debug!(
        subject = %subject,
        app = %request.data.app,
        method = request.method.label(),
        "dynamic subscription updated"
    );
    Ok(())
}

/// Emit the multicast `subscription.create`/`subscription.delete` event for
/// the application. Failures are logged and swallowed.
pub fn emit_event(
    method: Method,
    subject: &str,
    data: &DynSubData,
    broker_id: &AgentId,
    broker: &dyn BrokerClient,
    now_ms: i64,
) {
    // Events go out on the gateway's own v1 API whatever version the
    // subscription itself uses.
    let event_topic = vec![
        "agents".to_owned(),
        broker_id.to_string(),
        "api".to_owned(),
        "v1".to_owned(),
        "out".to_owned(),
        data.app.clone(),
    ];

    let mut message = Message {
        payload: json!({ "object": data.object, "subject": subject })
            .to_string()
            .into_bytes(),
        ..Default::default()
    };
    message.properties.user.set(keys::LABEL, method.label());

    if let Err(e) = publish_as_broker(&mut message, &event_topic, broker_id, broker, now_ms) {
        error!(
            topic = %topic::join(&event_topic),
            error = %e,
            "failed to emit subscription event"
        );
    }
}

/// Send the unicast `status = 200` response back to the requester's inbox on
/// the recipient connection. Failures are logged and swallowed.
pub fn emit_response(
    request: &Request,
    recipient: &ClientId,
    broker_id: &AgentId,
    broker: &dyn BrokerClient,
    now_ms: i64,
) {
    let response_topic = vec![
        "agents".to_owned(),
        recipient.agent_id(),
        "api".to_owned(),
        "v1".to_owned(),
        "in".to_owned(),
        request.data.app.clone(),
    ];

    let mut message = Message {
        payload: b"{}".to_vec(),
        ..Default::default()
    };
    message.properties.user.set(keys::TYPE, "response");
    message.properties.user.set(keys::STATUS, "200");
    message.properties.correlation_data = Some(request.correlation_data.clone());

    if let Err(e) = publish_as_broker(&mut message, &response_topic, broker_id, broker, now_ms) {
        error!(
            topic = %topic::join(&response_topic),
            error = %e,
            "failed to respond to subscription request"
        );
    }
}

/// Tear down everything recorded for a disconnected subject, emitting one
/// delete event per entry. Broker failures are logged and swallowed.
pub fn cleanup_subject(
    subject: &str,
    state: &DynSubState,
    broker_id: &AgentId,
    broker: &dyn BrokerClient,
    now_ms: i64,
) {
    for data in state.drain(subject) {
        if let Err(e) = broker.unsubscribe(subject, &[data.subscription_topic()]) {
            error!(subject = %subject, error = %e, "failed to remove dynamic subscription");
        }
        emit_event(Method::Delete, subject, &data, broker_id, broker, now_ms);
    }
}

/// Stamp and publish a broker-authored message; it goes through the same
/// rewriter as client publishes so consumers see one envelope dialect.
fn publish_as_broker(
    message: &mut Message,
    publish_topic: &[String],
    broker_id: &AgentId,
    broker: &dyn BrokerClient,
    now_ms: i64,
) -> Result<()> {
    let author = ClientId::from_agent_id(ConnectionMode::Service, broker_id);
    rewrite::rewrite_publish(message, &author, broker_id, now_ms)?;
    let payload = envelope::emit_v3(message)?;
    broker
        .publish(publish_topic, &payload, 1)
        .map_err(|e| Error::Broker(e.to_string()))
}
