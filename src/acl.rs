//! Per-mode topic access control.
//!
//! Three topic families, all rooted at literal prefixes:
//!
//! * broadcast: `apps/<account_id>/api/<version>/...`
//! * multicast: `agents/<agent_id>/api/<version>/out/<account_id>`
//! * unicast:   `agents/<agent_id>/api/<version>/in/<account_id>`
//!
//! What a connection may publish to or subscribe from is decided purely by
//! its connection mode and its own identity; there is no rule table.

use crate::error::{Error, Result};
use crate::ident::{ClientId, ConnectionMode};
use crate::mqtt::topic;

/// Modes running on behalf of a service rather than an end user.
fn is_service_like(mode: ConnectionMode) -> bool {
    matches!(
        mode,
        ConnectionMode::Service
            | ConnectionMode::ServicePayloadOnly
            | ConnectionMode::Observer
            | ConnectionMode::Bridge
    )
}

/// Connect-time constraint: non-trusted modes must not resume sessions.
pub fn check_connect_constraints(client: &ClientId, clean_session: bool) -> Result<()> {
    if client.mode() == ConnectionMode::Default && !clean_session {
        return Err(Error::Constraint(
            "default-mode agents must connect with a clean session".into(),
        ));
    }
    Ok(())
}

/// Publish-time constraint: only services may retain messages.
pub fn check_publish_constraints(client: &ClientId, retain: bool) -> Result<()> {
    if retain && client.mode() != ConnectionMode::Service {
        return Err(Error::Constraint(format!(
            "mode `{}` may not publish retained messages",
            client.mode().label()
        )));
    }
    Ok(())
}

/// Authorize a publish to `topic`.
pub fn authorize_publish(client: &ClientId, topic_segments: &[String]) -> Result<()> {
    let mode = client.mode();
    let agent_id = client.agent_id();
    let account_id = client.account_id();
    let seg = |i: usize| topic_segments.get(i).map(String::as_str);
    let deny = || {
        Err(Error::NotAuthorized(format!(
            "publishing to `{}` is not allowed in mode `{}`",
            topic::join(topic_segments),
            mode.label()
        )))
    };

    match seg(0) {
        // Broadcast into the connection's own application namespace.
        Some("apps") if topic_segments.len() >= 4 && seg(2) == Some("api") => {
            if seg(1) == Some(account_id.as_str()) && is_service_like(mode) {
                Ok(())
            } else {
                deny()
            }
        }
        Some("agents") if topic_segments.len() == 6 && seg(2) == Some("api") => match seg(4) {
            // Multicast from the connection's own outbox, any mode.
            Some("out") if seg(1) == Some(agent_id.as_str()) => Ok(()),
            // Unicast into another agent's inbox, service-like only.
            Some("in") if seg(5) == Some(account_id.as_str()) && is_service_like(mode) => Ok(()),
            _ => deny(),
        },
        _ => deny(),
    }
}

/// Authorize a subscription to `filter`.
///
/// `$share/<group>/<rest>` is authorized exactly like `<rest>`.
pub fn authorize_subscribe(client: &ClientId, filter: &[String]) -> Result<()> {
    let mode = client.mode();
    if mode == ConnectionMode::Observer {
        return Ok(());
    }

    let filter = topic::strip_share(filter);
    let agent_id = client.agent_id();
    let account_id = client.account_id();
    let seg = |i: usize| filter.get(i).map(String::as_str);
    let deny = || {
        Err(Error::NotAuthorized(format!(
            "subscribing to `{}` is not allowed in mode `{}`",
            topic::join(filter),
            mode.label()
        )))
    };
    let service_like = matches!(
        mode,
        ConnectionMode::Service | ConnectionMode::ServicePayloadOnly | ConnectionMode::Bridge
    );

    match seg(0) {
        // Broadcast namespaces of any application.
        Some("apps") if filter.len() >= 4 && seg(2) == Some("api") => {
            if service_like {
                Ok(())
            } else {
                deny()
            }
        }
        Some("agents") if filter.len() == 6 && seg(2) == Some("api") => match seg(4) {
            // Multicasts addressed to the connection's own account.
            Some("out") if seg(5) == Some(account_id.as_str()) && service_like => Ok(()),
            // The connection's own inbox, any mode.
            Some("in") if seg(1) == Some(agent_id.as_str()) => Ok(()),
            _ => deny(),
        },
        _ => deny(),
    }
}
