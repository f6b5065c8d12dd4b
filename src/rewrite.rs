//! Outbound property rewriting.
//!
//! Every accepted publish is stamped with broker-attested provenance: the
//! sender identity from the verified Client-ID, the broker identity, and
//! processing timestamps. Client-supplied identity properties are never
//! trusted except in bridge mode, where they are required and validated but
//! left untouched.

use crate::error::{Error, Result};
use crate::ident::{AgentId, ClientId, ConnectionMode};
use crate::mqtt::envelope::{keys, Message, Properties};
use crate::mqtt::topic;

/// Rewrite the properties of an inbound publish.
///
/// `now_ms` is the broker processing timestamp in milliseconds since the
/// epoch. New keys are appended in step order; existing keys are updated in
/// place.
pub fn rewrite_publish(
    message: &mut Message,
    client: &ClientId,
    broker: &AgentId,
    now_ms: i64,
) -> Result<()> {
    let user = &mut message.properties.user;
    let mode = client.mode();

    if !user.contains(keys::TYPE) {
        user.set(keys::TYPE, "event");
    }

    if mode == ConnectionMode::Bridge {
        for key in [keys::AGENT_LABEL, keys::ACCOUNT_LABEL, keys::AUDIENCE] {
            if !user.contains(key) {
                return Err(Error::BadProperties(format!(
                    "bridge message is missing `{key}`"
                )));
            }
        }
    } else {
        user.set(keys::AGENT_LABEL, client.agent_label());
        user.set(keys::ACCOUNT_LABEL, client.account_label());
        user.set(keys::AUDIENCE, client.audience());
    }

    user.set(keys::CONNECTION_VERSION, mode.version());
    user.set(keys::CONNECTION_MODE, mode.label());

    user.set(keys::BROKER_AGENT_LABEL, broker.label.as_str());
    user.set(keys::BROKER_ACCOUNT_LABEL, broker.account_label.as_str());
    user.set(keys::BROKER_AUDIENCE, broker.audience.as_str());

    user.set(keys::BROKER_PROCESSING_TIMESTAMP, now_ms.to_string());
    if !user.contains(keys::BROKER_INITIAL_PROCESSING_TIMESTAMP) {
        user.set(keys::BROKER_INITIAL_PROCESSING_TIMESTAMP, now_ms.to_string());
    }

    if let Some(timestamp) = user.get(keys::TIMESTAMP).map(str::to_owned) {
        if !user.contains(keys::INITIAL_TIMESTAMP) {
            user.set(keys::INITIAL_TIMESTAMP, timestamp);
        }
    }

    // A stray timediff from a default-mode client is meaningless without the
    // local timestamp it was derived from.
    if mode == ConnectionMode::Default
        && user.contains(keys::LOCAL_INITIAL_TIMEDIFF)
        && !user.contains(keys::LOCAL_TIMESTAMP)
    {
        user.remove(keys::LOCAL_INITIAL_TIMEDIFF);
    }
    if let Some(local) = user.get(keys::LOCAL_TIMESTAMP) {
        if !user.contains(keys::LOCAL_INITIAL_TIMEDIFF) {
            let local: i64 = local.parse().map_err(|_| {
                Error::BadProperties("`local_timestamp` is not an integer".into())
            })?;
            user.set(keys::LOCAL_INITIAL_TIMEDIFF, (now_ms - local).to_string());
        }
    }

    validate(&message.properties, client)
}

/// Validate the invariants of a rewritten property map.
pub fn validate(properties: &Properties, client: &ClientId) -> Result<()> {
    let user = &properties.user;
    let mode = client.mode();

    match user.get(keys::TYPE) {
        Some("request") => {
            if !user.contains(keys::METHOD) {
                return Err(Error::BadProperties("request without `method`".into()));
            }
            if properties.correlation_data.is_none() {
                return Err(Error::BadProperties(
                    "request without correlation data".into(),
                ));
            }
            if properties.response_topic.is_none() {
                return Err(Error::BadProperties("request without response topic".into()));
            }
        }
        Some("response") => {
            if !user.contains(keys::STATUS) {
                return Err(Error::BadProperties("response without `status`".into()));
            }
            if properties.correlation_data.is_none() {
                return Err(Error::BadProperties(
                    "response without correlation data".into(),
                ));
            }
        }
        _ => {}
    }

    // Only services may direct responses at arbitrary topics; everyone else
    // must fold responses back onto their own inbox.
    if let Some(response_topic) = &properties.response_topic {
        if !matches!(
            mode,
            ConnectionMode::Service | ConnectionMode::ServicePayloadOnly
        ) {
            let segments = topic::split(response_topic);
            let own_inbox = segments.len() >= 6
                && segments[0] == "agents"
                && segments[1] == client.agent_id()
                && segments[2] == "api"
                && !segments[3].is_empty()
                && segments[4] == "in";
            if !own_inbox {
                return Err(Error::BadProperties(format!(
                    "response topic `{response_topic}` is not the sender's inbox"
                )));
            }
        }
    }

    if mode == ConnectionMode::Default && !user.contains(keys::LOCAL_INITIAL_TIMEDIFF) {
        return Err(Error::BadProperties(
            "default-mode message without `local_initial_timediff`".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::envelope::UserProperties;

    fn broker() -> AgentId {
        AgentId::new("mqtt-gateway", "svc", "example.org")
    }

    fn client(id: &str) -> ClientId {
        ClientId::parse(id).unwrap()
    }

    fn message(pairs: &[(&str, &str)]) -> Message {
        let mut user = UserProperties::new();
        for (k, v) in pairs {
            user.set(*k, *v);
        }
        Message {
            payload: b"hi".to_vec(),
            properties: Properties {
                user,
                correlation_data: None,
                response_topic: None,
            },
        }
    }

    #[test]
    fn test_default_mode_stamping() {
        let client = client("v1/agents/a.b.example.net");
        let mut m = message(&[("local_timestamp", "3")]);

        rewrite_publish(&mut m, &client, &broker(), 5).unwrap();

        let user = &m.properties.user;
        assert_eq!(user.get("type"), Some("event"));
        assert_eq!(user.get("agent_label"), Some("a"));
        assert_eq!(user.get("account_label"), Some("b"));
        assert_eq!(user.get("audience"), Some("example.net"));
        assert_eq!(user.get("connection_version"), Some("v1"));
        assert_eq!(user.get("connection_mode"), Some("agents"));
        assert_eq!(user.get("broker_agent_label"), Some("mqtt-gateway"));
        assert_eq!(user.get("broker_account_label"), Some("svc"));
        assert_eq!(user.get("broker_audience"), Some("example.org"));
        assert_eq!(user.get("broker_processing_timestamp"), Some("5"));
        assert_eq!(user.get("broker_initial_processing_timestamp"), Some("5"));
        assert_eq!(user.get("local_initial_timediff"), Some("2"));
    }

    #[test]
    fn test_untouched_keys_keep_position_and_new_keys_append_in_step_order() {
        let client = client("v1/agents/a.b.example.net");
        let mut m = message(&[("custom", "x"), ("local_timestamp", "3")]);
        rewrite_publish(&mut m, &client, &broker(), 5).unwrap();

        let order: Vec<&str> = m.properties.user.iter().map(|(k, _)| k).collect();
        assert_eq!(
            order,
            [
                "custom",
                "local_timestamp",
                "type",
                "agent_label",
                "account_label",
                "audience",
                "connection_version",
                "connection_mode",
                "broker_agent_label",
                "broker_account_label",
                "broker_audience",
                "broker_processing_timestamp",
                "broker_initial_processing_timestamp",
                "local_initial_timediff",
            ]
        );
    }

    #[test]
    fn test_identity_never_taken_from_client() {
        let client = client("v1/agents/a.b.example.net");
        let mut m = message(&[
            ("agent_label", "evil"),
            ("account_label", "evil"),
            ("audience", "evil.example.org"),
            ("local_timestamp", "1"),
        ]);

        rewrite_publish(&mut m, &client, &broker(), 5).unwrap();

        let user = &m.properties.user;
        assert_eq!(user.get("agent_label"), Some("a"));
        assert_eq!(user.get("account_label"), Some("b"));
        assert_eq!(user.get("audience"), Some("example.net"));
    }

    #[test]
    fn test_bridge_preserves_identity() {
        let client = client("v1/bridge-agents/relay.bridge.example.net");
        let mut m = message(&[
            ("agent_label", "remote"),
            ("account_label", "tenant"),
            ("audience", "other.example.org"),
        ]);

        rewrite_publish(&mut m, &client, &broker(), 5).unwrap();

        let user = &m.properties.user;
        assert_eq!(user.get("agent_label"), Some("remote"));
        assert_eq!(user.get("account_label"), Some("tenant"));
        assert_eq!(user.get("audience"), Some("other.example.org"));
        assert_eq!(user.get("connection_mode"), Some("bridge-agents"));
    }

    #[test]
    fn test_bridge_requires_identity() {
        let client = client("v1/bridge-agents/relay.bridge.example.net");
        let mut m = message(&[]);
        let err = rewrite_publish(&mut m, &client, &broker(), 5).unwrap_err();
        assert!(matches!(err, Error::BadProperties(_)));
    }

    #[test]
    fn test_initial_processing_timestamp_set_once() {
        let client = client("v1/service-agents/a.b.svc.example.org");
        let mut m = message(&[]);

        rewrite_publish(&mut m, &client, &broker(), 5).unwrap();
        assert_eq!(
            m.properties.user.get("broker_initial_processing_timestamp"),
            Some("5")
        );

        rewrite_publish(&mut m, &client, &broker(), 9).unwrap();
        assert_eq!(m.properties.user.get("broker_processing_timestamp"), Some("9"));
        assert_eq!(
            m.properties.user.get("broker_initial_processing_timestamp"),
            Some("5")
        );
    }

    #[test]
    fn test_initial_timestamp_seeded_once() {
        let client = client("v1/service-agents/a.b.svc.example.org");
        let mut m = message(&[("timestamp", "100")]);
        rewrite_publish(&mut m, &client, &broker(), 5).unwrap();
        assert_eq!(m.properties.user.get("initial_timestamp"), Some("100"));

        m.properties.user.set("timestamp", "200");
        rewrite_publish(&mut m, &client, &broker(), 9).unwrap();
        assert_eq!(m.properties.user.get("initial_timestamp"), Some("100"));
    }

    #[test]
    fn test_stray_timediff_stripped_for_default() {
        let client = client("v1/agents/a.b.example.net");
        let mut m = message(&[("local_initial_timediff", "7")]);
        // Without a local timestamp the stray diff is dropped, which then
        // fails the default-mode requirement.
        let err = rewrite_publish(&mut m, &client, &broker(), 5).unwrap_err();
        assert!(matches!(err, Error::BadProperties(_)));
    }

    #[test]
    fn test_existing_timediff_kept_with_local_timestamp() {
        let client = client("v1/agents/a.b.example.net");
        let mut m = message(&[("local_timestamp", "3"), ("local_initial_timediff", "7")]);
        rewrite_publish(&mut m, &client, &broker(), 5).unwrap();
        assert_eq!(m.properties.user.get("local_initial_timediff"), Some("7"));
    }

    #[test]
    fn test_default_requires_local_timestamp() {
        let client = client("v1/agents/a.b.example.net");
        let mut m = message(&[]);
        assert!(rewrite_publish(&mut m, &client, &broker(), 5).is_err());
    }

    #[test]
    fn test_request_requires_routing_fields() {
        let client = client("v1/service-agents/a.b.svc.example.org");

        let mut m = message(&[("type", "request")]);
        assert!(rewrite_publish(&mut m, &client, &broker(), 5).is_err());

        let mut m = message(&[("type", "request"), ("method", "room.create")]);
        m.properties.correlation_data = Some(b"c".to_vec());
        m.properties.response_topic = Some("agents/a.b.svc.example.org/api/v1/in/x".into());
        rewrite_publish(&mut m, &client, &broker(), 5).unwrap();
    }

    #[test]
    fn test_response_requires_status() {
        let client = client("v1/service-agents/a.b.svc.example.org");
        let mut m = message(&[("type", "response")]);
        m.properties.correlation_data = Some(b"c".to_vec());
        assert!(rewrite_publish(&mut m, &client, &broker(), 5).is_err());

        let mut m = message(&[("type", "response"), ("status", "200")]);
        m.properties.correlation_data = Some(b"c".to_vec());
        rewrite_publish(&mut m, &client, &broker(), 5).unwrap();
    }

    #[test]
    fn test_response_topic_must_be_own_inbox() {
        let client = client("v1/observer-agents/probe.ops.example.com");

        let mut m = message(&[("type", "request"), ("method", "ping")]);
        m.properties.correlation_data = Some(b"c".to_vec());
        m.properties.response_topic =
            Some("agents/other.ops.example.com/api/v1/in/x.example.org".into());
        assert!(rewrite_publish(&mut m, &client, &broker(), 5).is_err());

        let mut m = message(&[("type", "request"), ("method", "ping")]);
        m.properties.correlation_data = Some(b"c".to_vec());
        m.properties.response_topic =
            Some("agents/probe.ops.example.com/api/v1/in/x.example.org".into());
        rewrite_publish(&mut m, &client, &broker(), 5).unwrap();
    }
}
