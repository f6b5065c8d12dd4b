//! Segmented MQTT topics.
//!
//! Topics cross the gateway as segment arrays so that `/` inside labels can
//! never be confused with a level separator. String forms appear only on the
//! wire (`response_topic`) and in logs.

/// Split a topic string into its levels.
pub fn split(topic: &str) -> Vec<String> {
    topic.split('/').map(str::to_owned).collect()
}

/// Join topic levels back into the string form.
pub fn join(topic: &[String]) -> String {
    topic.join("/")
}

/// Strip a `$share/<group>/` prefix from a subscription filter.
///
/// Shared subscriptions are authorized exactly like the inner filter they
/// wrap.
pub fn strip_share(filter: &[String]) -> &[String] {
    match filter.first().map(String::as_str) {
        Some("$share") if filter.len() > 2 => &filter[2..],
        _ => filter,
    }
}
