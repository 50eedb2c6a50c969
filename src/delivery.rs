//! Delivery context: where a reply should land.
//!
//! A context is the channel-routing tuple `{channel, to, accountId,
//! threadId}` captured from an inbound message or a session entry. All
//! fields are optional; a context that cleans down to nothing normalizes
//! to `None` so callers never route on an empty tuple.

use crate::sessions::SessionEntry;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Thread identifier. Wire payloads carry this as either a string or
    /// a number; numbers are truncated to integers, non-finite values are
    /// elided.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_thread_id"
    )]
    pub thread_id: Option<String>,
}

fn deserialize_thread_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(f64),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::Text(value)) => Some(value),
        Some(Raw::Number(value)) if value.is_finite() => {
            Some((value.trunc() as i64).to_string())
        }
        Some(Raw::Number(_)) => None,
    })
}

fn clean(field: &Option<String>) -> Option<String> {
    field
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl DeliveryContext {
    /// Trim every field, lowercase the channel, and elide empties.
    /// Returns `None` when nothing routable remains.
    pub fn normalized(&self) -> Option<DeliveryContext> {
        let context = DeliveryContext {
            channel: clean(&self.channel).map(|value| value.to_ascii_lowercase()),
            to: clean(&self.to),
            account_id: clean(&self.account_id),
            thread_id: clean(&self.thread_id),
        };

        if context.channel.is_none()
            && context.to.is_none()
            && context.account_id.is_none()
            && context.thread_id.is_none()
        {
            return None;
        }

        Some(context)
    }

    /// Field-wise merge, `primary` first, `fallback` second. The result
    /// is re-normalized.
    pub fn merge(
        primary: Option<&DeliveryContext>,
        fallback: Option<&DeliveryContext>,
    ) -> Option<DeliveryContext> {
        let pick = |field: fn(&DeliveryContext) -> &Option<String>| {
            primary
                .and_then(|context| clean(field(context)))
                .or_else(|| fallback.and_then(|context| clean(field(context))))
        };

        DeliveryContext {
            channel: pick(|context| &context.channel),
            to: pick(|context| &context.to),
            account_id: pick(|context| &context.account_id),
            thread_id: pick(|context| &context.thread_id),
        }
        .normalized()
    }

    /// Routing context for a session entry: the last-seen routing fields
    /// win, then the session's persisted delivery context, then the
    /// origin thread id.
    pub fn from_session(entry: &SessionEntry) -> Option<DeliveryContext> {
        let last = DeliveryContext {
            channel: entry.last_channel.clone(),
            to: entry.last_to.clone(),
            account_id: entry.last_account_id.clone(),
            thread_id: entry.last_thread_id.clone(),
        };

        let mut merged =
            Self::merge(Some(&last), entry.delivery_context.as_ref()).unwrap_or_default();
        if merged.thread_id.is_none() {
            merged.thread_id = entry.origin_thread_id.clone();
        }
        merged.normalized()
    }

    /// Canonical string form of the routing tuple, for callers that
    /// bucket deliveries by destination. Defined only when channel and
    /// recipient are both present; account and thread collapse to empty
    /// strings.
    pub fn queue_key(&self) -> Option<String> {
        let channel = self.channel.as_deref()?;
        let to = self.to.as_deref()?;
        Some(format!(
            "{channel}|{to}|{}|{}",
            self.account_id.as_deref().unwrap_or(""),
            self.thread_id.as_deref().unwrap_or("")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(
        channel: Option<&str>,
        to: Option<&str>,
        account_id: Option<&str>,
        thread_id: Option<&str>,
    ) -> DeliveryContext {
        DeliveryContext {
            channel: channel.map(String::from),
            to: to.map(String::from),
            account_id: account_id.map(String::from),
            thread_id: thread_id.map(String::from),
        }
    }

    #[test]
    fn normalize_trims_and_lowercases_channel() {
        let normalized = context(Some("  Discord "), Some(" user-1 "), None, None)
            .normalized()
            .expect("context should survive normalization");
        assert_eq!(normalized.channel.as_deref(), Some("discord"));
        assert_eq!(normalized.to.as_deref(), Some("user-1"));
    }

    #[test]
    fn fully_empty_context_normalizes_to_absent() {
        assert_eq!(context(Some("  "), Some(""), None, Some(" ")).normalized(), None);
        assert_eq!(DeliveryContext::default().normalized(), None);
    }

    #[test]
    fn normalize_is_idempotent() {
        let original = context(Some(" Slack"), Some("C123 "), Some(" acct "), Some("42"));
        let once = original.normalized().expect("non-empty");
        let twice = once.normalized().expect("non-empty");
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_with_absent_sides_degenerates_to_normalize() {
        let a = context(Some("Slack "), Some("C1"), None, None);
        assert_eq!(DeliveryContext::merge(Some(&a), None), a.normalized());
        assert_eq!(DeliveryContext::merge(None, Some(&a)), a.normalized());
        assert_eq!(DeliveryContext::merge(None, None), None);
    }

    #[test]
    fn merge_prefers_primary_per_field() {
        let primary = context(Some("slack"), None, None, Some("7"));
        let fallback = context(Some("discord"), Some("user-2"), Some("acct"), Some("9"));
        let merged =
            DeliveryContext::merge(Some(&primary), Some(&fallback)).expect("non-empty merge");
        assert_eq!(merged.channel.as_deref(), Some("slack"));
        assert_eq!(merged.to.as_deref(), Some("user-2"));
        assert_eq!(merged.account_id.as_deref(), Some("acct"));
        assert_eq!(merged.thread_id.as_deref(), Some("7"));
    }

    #[test]
    fn thread_id_deserializes_from_number_and_string() {
        let from_number: DeliveryContext =
            serde_json::from_value(serde_json::json!({"threadId": 42.9})).expect("valid context");
        assert_eq!(from_number.thread_id.as_deref(), Some("42"));

        let from_string: DeliveryContext =
            serde_json::from_value(serde_json::json!({"threadId": " 17 "})).expect("valid context");
        // Trimming happens at normalization, not deserialization.
        assert_eq!(
            from_string.normalized().and_then(|c| c.thread_id),
            Some("17".to_string())
        );
    }

    #[test]
    fn from_session_prefers_last_routing_then_persisted_then_origin_thread() {
        let entry = SessionEntry {
            key: "agent:main:main".into(),
            last_channel: Some("Slack".into()),
            last_to: None,
            delivery_context: Some(context(Some("discord"), Some("user-3"), Some("a1"), None)),
            origin_thread_id: Some("555".into()),
            ..Default::default()
        };

        let resolved = DeliveryContext::from_session(&entry).expect("resolvable context");
        assert_eq!(resolved.channel.as_deref(), Some("slack"));
        assert_eq!(resolved.to.as_deref(), Some("user-3"));
        assert_eq!(resolved.account_id.as_deref(), Some("a1"));
        assert_eq!(resolved.thread_id.as_deref(), Some("555"));
    }

    #[test]
    fn queue_key_requires_channel_and_to() {
        assert_eq!(context(Some("slack"), None, None, None).queue_key(), None);
        assert_eq!(context(None, Some("u"), None, None).queue_key(), None);
        assert_eq!(
            context(Some("slack"), Some("C9"), None, Some("3")).queue_key(),
            Some("slack|C9||3".to_string())
        );
        assert_eq!(
            context(Some("slack"), Some("C9"), Some("acct"), None).queue_key(),
            Some("slack|C9|acct|".to_string())
        );
    }
}
