//! Hook pipelines: one entry point per broker callback.
//!
//! The broker invokes one of ten hooks per MQTT event; each pipeline
//! composes identifier parsing, authentication, authorization, ACL checks,
//! and property rewriting, and returns accept / accept-with-modifications /
//! deny. Hooks are synchronous, invoked concurrently from many threads, and
//! never block on remote I/O; shared state is the immutable config snapshot,
//! the connection table, and the dynamic-subscription mirror.

use std::sync::Arc;

use anyhow::Result as AnyResult;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tracing::{error, info, warn};

use crate::acl;
use crate::auth::Authenticator;
use crate::broker::BrokerClient;
use crate::config::Config;
use crate::dynsub::{self, DynSubState};
use crate::error::{Error, ReasonCode, Result};
use crate::ident::{ClientId, ConnectionMode};
use crate::mqtt::envelope::{self, keys, Message, Properties};
use crate::mqtt::topic;
use crate::rewrite;

/// Payload and property changes applied to an accepted message.
#[derive(Debug, Clone, Default)]
pub struct Modifiers {
    pub payload: Option<Vec<u8>>,
    pub properties: Option<Properties>,
}

impl Modifiers {
    fn is_empty(&self) -> bool {
        self.payload.is_none() && self.properties.is_none()
    }
}

/// Outcome of a hook call, surfaced to the broker.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    /// Accept the event unchanged.
    Accept,
    /// Accept with payload/property changes.
    AcceptWith(Modifiers),
    /// Deny with an MQTT reason code.
    Reject(ReasonCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone)]
struct Connection {
    client: ClientId,
    state: SessionState,
}

/// The gateway: all hook pipelines over one immutable config snapshot.
pub struct Gateway {
    config: Arc<Config>,
    auth: Authenticator,
    broker: Arc<dyn BrokerClient>,
    connections: DashMap<String, Connection>,
    dynsub: DynSubState,
}

impl Gateway {
    /// Build the gateway, parsing every issuer key so configuration errors
    /// surface at startup.
    pub fn new(config: Arc<Config>, broker: Arc<dyn BrokerClient>) -> AnyResult<Self> {
        let auth = Authenticator::new(&config)?;
        Ok(Self {
            config,
            auth,
            broker,
            connections: DashMap::new(),
            dynsub: DynSubState::new(),
        })
    }

    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    // ------------------------------------------------------------------
    // Connect
    // ------------------------------------------------------------------

    /// MQTT 3 CONNECT.
    pub fn auth_on_register(
        &self,
        peer: &str,
        subscriber_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
        clean_session: bool,
    ) -> HookOutcome {
        let _ = username; // identity comes from the Client-ID
        match self.register(subscriber_id, password, clean_session) {
            Ok(()) => HookOutcome::Accept,
            Err(e) => {
                warn!(
                    client_id = subscriber_id,
                    peer,
                    kind = e.kind(),
                    error = %e,
                    "connect denied"
                );
                HookOutcome::Reject(e.reason_code())
            }
        }
    }

    /// MQTT 5 CONNECT.
    pub fn auth_on_register_v5(
        &self,
        peer: &str,
        subscriber_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
        clean_start: bool,
        _properties: &Properties,
    ) -> HookOutcome {
        self.auth_on_register(peer, subscriber_id, username, password, clean_start)
    }

    fn register(
        &self,
        subscriber_id: &str,
        password: Option<&[u8]>,
        clean_session: bool,
    ) -> Result<()> {
        let client = ClientId::parse(subscriber_id)?;
        acl::check_connect_constraints(&client, clean_session)?;
        self.auth.authenticate(&client, password)?;
        self.auth.authorize_mode(&client)?;

        self.connections.insert(
            subscriber_id.to_owned(),
            Connection {
                client: client.clone(),
                state: SessionState::Connected,
            },
        );

        info!(client_id = %client, mode = client.mode().label(), "agent connected");
        self.emit_audience_event(&client, "agent.enter");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------

    /// MQTT 3 PUBLISH.
    pub fn auth_on_publish(
        &self,
        _username: Option<&str>,
        subscriber_id: &str,
        qos: u8,
        topic_segments: &[String],
        payload: &[u8],
        retain: bool,
    ) -> HookOutcome {
        let _ = qos; // QoS is unconstrained
        match self.publish(subscriber_id, topic_segments, payload, retain, None) {
            Ok(modifiers) => HookOutcome::AcceptWith(modifiers),
            Err(e) => self.deny("publish", subscriber_id, topic_segments, e),
        }
    }

    /// MQTT 5 PUBLISH.
    #[allow(clippy::too_many_arguments)]
    pub fn auth_on_publish_v5(
        &self,
        _username: Option<&str>,
        subscriber_id: &str,
        qos: u8,
        topic_segments: &[String],
        payload: &[u8],
        retain: bool,
        properties: &Properties,
    ) -> HookOutcome {
        let _ = qos;
        match self.publish(subscriber_id, topic_segments, payload, retain, Some(properties)) {
            Ok(modifiers) => HookOutcome::AcceptWith(modifiers),
            Err(e) => self.deny("publish", subscriber_id, topic_segments, e),
        }
    }

    fn publish(
        &self,
        subscriber_id: &str,
        topic_segments: &[String],
        payload: &[u8],
        retain: bool,
        native: Option<&Properties>,
    ) -> Result<Modifiers> {
        let client = self.connected_client(subscriber_id)?;
        acl::check_publish_constraints(&client, retain)?;
        acl::authorize_publish(&client, topic_segments)?;

        let mut message = if client.mode() == ConnectionMode::ServicePayloadOnly {
            // Payload-only services send bare payloads; the gateway supplies
            // the envelope.
            Message {
                payload: payload.to_vec(),
                properties: native.cloned().unwrap_or_default(),
            }
        } else {
            match native {
                Some(properties) => envelope::parse_v5(payload, properties)?,
                None => envelope::parse_v3(payload)?,
            }
        };

        rewrite::rewrite_publish(&mut message, &client, &self.config.id, self.now_ms())?;

        let (payload, properties) = match native {
            Some(_) => {
                let (payload, properties) = envelope::emit_v5(&message)?;
                (payload, Some(properties))
            }
            None => (envelope::emit_v3(&message)?, None),
        };
        Ok(Modifiers {
            payload: Some(payload),
            properties,
        })
    }

    // ------------------------------------------------------------------
    // Deliver
    // ------------------------------------------------------------------

    /// MQTT 3 message delivery.
    pub fn on_deliver(
        &self,
        _username: Option<&str>,
        subscriber_id: &str,
        topic_segments: &[String],
        payload: &[u8],
    ) -> HookOutcome {
        match self.deliver(subscriber_id, topic_segments, payload, None) {
            Ok(modifiers) if modifiers.is_empty() => HookOutcome::Accept,
            Ok(modifiers) => HookOutcome::AcceptWith(modifiers),
            Err(e) => self.deny("deliver", subscriber_id, topic_segments, e),
        }
    }

    /// MQTT 5 message delivery.
    pub fn on_deliver_v5(
        &self,
        _username: Option<&str>,
        subscriber_id: &str,
        topic_segments: &[String],
        payload: &[u8],
        properties: &Properties,
    ) -> HookOutcome {
        match self.deliver(subscriber_id, topic_segments, payload, Some(properties)) {
            Ok(modifiers) if modifiers.is_empty() => HookOutcome::Accept,
            Ok(modifiers) => HookOutcome::AcceptWith(modifiers),
            Err(e) => self.deny("deliver", subscriber_id, topic_segments, e),
        }
    }

    fn deliver(
        &self,
        subscriber_id: &str,
        topic_segments: &[String],
        payload: &[u8],
        native: Option<&Properties>,
    ) -> Result<Modifiers> {
        let client = self.connected_client(subscriber_id)?;

        // Stored messages are always enveloped, whatever the recipient mode.
        let message = match native {
            Some(properties) => envelope::parse_v5(payload, properties)?,
            None => envelope::parse_v3(payload)?,
        };

        if let Some(request) = dynsub::parse_request(&message, topic_segments)? {
            // The same multicast fans out to every subscriber; only the
            // subject itself acts on the request.
            if request.subject == client {
                dynsub::apply_request(&request, &self.dynsub, self.broker.as_ref())?;
                let now = self.now_ms();
                dynsub::emit_event(
                    request.method,
                    &request.subject.to_string(),
                    &request.data,
                    &self.config.id,
                    self.broker.as_ref(),
                    now,
                );
                dynsub::emit_response(
                    &request,
                    &client,
                    &self.config.id,
                    self.broker.as_ref(),
                    now,
                );
            }
            return Ok(Modifiers::default());
        }

        match (client.mode(), native) {
            // Payload-only services receive the bare payload; properties
            // survive only where MQTT 5 carries them natively.
            (ConnectionMode::ServicePayloadOnly, native) => Ok(Modifiers {
                payload: Some(message.payload.clone()),
                properties: native.map(|_| message.properties),
            }),
            (_, Some(_)) => {
                let (payload, properties) = envelope::emit_v5(&message)?;
                Ok(Modifiers {
                    payload: Some(payload),
                    properties: Some(properties),
                })
            }
            (_, None) => Ok(Modifiers {
                payload: Some(envelope::emit_v3(&message)?),
                properties: None,
            }),
        }
    }

    // ------------------------------------------------------------------
    // Subscribe
    // ------------------------------------------------------------------

    /// MQTT 3 SUBSCRIBE.
    pub fn auth_on_subscribe(
        &self,
        _username: Option<&str>,
        subscriber_id: &str,
        subscriptions: &[(Vec<String>, u8)],
    ) -> HookOutcome {
        match self.subscribe(subscriber_id, subscriptions) {
            Ok(()) => HookOutcome::Accept,
            Err(e) => {
                let filters: Vec<String> =
                    subscriptions.iter().map(|(f, _)| topic::join(f)).collect();
                error!(
                    client_id = subscriber_id,
                    filters = ?filters,
                    kind = e.kind(),
                    error = %e,
                    "subscribe denied"
                );
                HookOutcome::Reject(e.reason_code())
            }
        }
    }

    /// MQTT 5 SUBSCRIBE.
    pub fn auth_on_subscribe_v5(
        &self,
        username: Option<&str>,
        subscriber_id: &str,
        subscriptions: &[(Vec<String>, u8)],
        _properties: &Properties,
    ) -> HookOutcome {
        self.auth_on_subscribe(username, subscriber_id, subscriptions)
    }

    fn subscribe(&self, subscriber_id: &str, subscriptions: &[(Vec<String>, u8)]) -> Result<()> {
        let client = self.connected_client(subscriber_id)?;
        for (filter, _qos) in subscriptions {
            acl::authorize_subscribe(&client, filter)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Disconnect
    // ------------------------------------------------------------------

    /// The session went offline but may resume.
    pub fn on_client_offline(&self, subscriber_id: &str) {
        if let Some(mut entry) = self.connections.get_mut(subscriber_id) {
            if entry.state == SessionState::Disconnected {
                return;
            }
            entry.state = SessionState::Disconnected;
            let client = entry.client.clone();
            drop(entry);
            self.teardown(subscriber_id, &client);
        }
    }

    /// The session is gone for good.
    pub fn on_client_gone(&self, subscriber_id: &str) {
        if let Some((_, connection)) = self.connections.remove(subscriber_id) {
            if connection.state == SessionState::Connected {
                self.teardown(subscriber_id, &connection.client);
            }
        }
    }

    fn teardown(&self, subscriber_id: &str, client: &ClientId) {
        info!(client_id = %client, mode = client.mode().label(), "agent disconnected");
        if self.auth.authz_enabled() {
            dynsub::cleanup_subject(
                subscriber_id,
                &self.dynsub,
                &self.config.id,
                self.broker.as_ref(),
                self.now_ms(),
            );
        }
        self.emit_audience_event(client, "agent.leave");
    }

    /// Broker shutdown: tear down dynamic subscriptions of every live
    /// connection.
    pub fn on_broker_stop(&self) {
        let subjects = match self.broker.list_connections() {
            Ok(subjects) => subjects,
            Err(e) => {
                error!(error = %e, "cannot enumerate connections on shutdown");
                return;
            }
        };
        let now = self.now_ms();
        for subject in subjects {
            dynsub::cleanup_subject(
                &subject,
                &self.dynsub,
                &self.config.id,
                self.broker.as_ref(),
                now,
            );
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn connected_client(&self, subscriber_id: &str) -> Result<ClientId> {
        match self.connections.get(subscriber_id) {
            Some(connection) if connection.state == SessionState::Connected => {
                Ok(connection.client.clone())
            }
            Some(_) => Err(Error::NotAuthorized("connection is disconnected".into())),
            None => Err(Error::NotAuthorized("connection is not registered".into())),
        }
    }

    fn deny(
        &self,
        hook: &str,
        subscriber_id: &str,
        topic_segments: &[String],
        e: Error,
    ) -> HookOutcome {
        error!(
            client_id = subscriber_id,
            topic = %topic::join(topic_segments),
            hook,
            kind = e.kind(),
            error = %e,
            "denied"
        );
        HookOutcome::Reject(e.reason_code())
    }

    /// Publish an `agent.enter`/`agent.leave` audience event, authored by
    /// the stat identity. Failures are logged and swallowed.
    fn emit_audience_event(&self, client: &ClientId, label: &str) {
        if !self.config.stat.enabled {
            return;
        }
        let Some(stat_id) = &self.config.stat.id else {
            return;
        };

        let event_topic = vec![
            "apps".to_owned(),
            self.config.id.account_id(),
            "api".to_owned(),
            "v1".to_owned(),
            "audiences".to_owned(),
            client.audience().to_owned(),
            "events".to_owned(),
        ];

        let mut message = Message {
            payload: json!({ "agent_id": client.agent_id() })
                .to_string()
                .into_bytes(),
            ..Default::default()
        };
        message.properties.user.set(keys::LABEL, label);

        let author = ClientId::from_agent_id(ConnectionMode::Service, stat_id);
        let result = rewrite::rewrite_publish(
            &mut message,
            &author,
            &self.config.id,
            self.now_ms(),
        )
        .and_then(|()| envelope::emit_v3(&message))
        .and_then(|payload| {
            self.broker
                .publish(&event_topic, &payload, 0)
                .map_err(|e| Error::Broker(e.to_string()))
        });

        if let Err(e) = result {
            error!(
                client_id = %client,
                label,
                error = %e,
                "failed to emit audience event"
            );
        }
    }
}
