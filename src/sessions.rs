//! Session key grammar and the session store contract.
//!
//! Child sessions live under `agent:<agentId>:subagent:<uuid>`. The store
//! itself (history, transcripts, run activity) is owned by the embedding
//! gateway; the core consumes it through [`SessionStore`].

use crate::delivery::DeliveryContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Reserved key routed to no conversation in particular.
pub const GLOBAL_SESSION_KEY: &str = "global";

/// Reserved key for messages whose origin could not be resolved.
pub const UNKNOWN_SESSION_KEY: &str = "unknown";

const SUBAGENT_KEY_MARKER: &str = ":subagent:";

/// Mint a fresh child session key for an agent.
pub fn subagent_session_key(agent_id: &str) -> String {
    format!("agent:{agent_id}:subagent:{}", uuid::Uuid::new_v4())
}

/// Whether a key names a subagent child session.
pub fn is_subagent_session_key(key: &str) -> bool {
    key.starts_with("agent:") && key.contains(SUBAGENT_KEY_MARKER)
}

/// The `<agentId>` portion of an `agent:*` key.
pub fn agent_id_from_key(key: &str) -> Option<&str> {
    let rest = key.strip_prefix("agent:")?;
    let (agent_id, _) = rest.split_once(':')?;
    if agent_id.is_empty() {
        None
    } else {
        Some(agent_id)
    }
}

/// Resolve a session key to its canonical form.
///
/// `main` (and the configured main key itself) resolve to the configured
/// main key; `global` and `unknown` pass through unchanged, as do
/// `agent:*` keys and any other non-reserved key. Whitespace is trimmed;
/// an empty key resolves to the main key.
pub fn canonical_session_key(key: &str, main_key: &str) -> String {
    let key = key.trim();
    if key.is_empty() || key == "main" || key == main_key {
        return main_key.to_string();
    }
    key.to_string()
}

/// Token counts for a session, as reported by the store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

/// One session store entry, as the core sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_context: Option<DeliveryContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<String>,
}

/// Read surface of the gateway's session store.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn entry(&self, session_key: &str) -> Option<SessionEntry>;

    /// Latest assistant reply in the session, if any.
    async fn latest_assistant_reply(&self, session_key: &str) -> Option<String>;

    async fn usage(&self, session_key: &str) -> Option<TokenUsage>;

    /// Whether the session currently has an embedded run processing.
    async fn is_run_active(&self, session_key: &str) -> bool;

    /// Inject a message into the session's live embedded run. Returns
    /// false when there is no run to steer into.
    async fn steer(&self, session_key: &str, message: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN: &str = "agent:main:main";

    #[test]
    fn child_keys_round_trip_through_the_grammar() {
        let key = subagent_session_key("ops");
        assert!(is_subagent_session_key(&key));
        assert_eq!(agent_id_from_key(&key), Some("ops"));
    }

    #[test]
    fn generic_agent_keys_are_not_subagent_keys() {
        assert!(!is_subagent_session_key("agent:main:main"));
        assert!(!is_subagent_session_key("global"));
        assert_eq!(agent_id_from_key("agent:main:main"), Some("main"));
        assert_eq!(agent_id_from_key("global"), None);
    }

    #[test]
    fn canonical_key_resolves_main_aliases() {
        assert_eq!(canonical_session_key("main", MAIN), MAIN);
        assert_eq!(canonical_session_key(MAIN, MAIN), MAIN);
        assert_eq!(canonical_session_key("  main  ", MAIN), MAIN);
        assert_eq!(canonical_session_key("", MAIN), MAIN);
    }

    #[test]
    fn canonical_key_passes_reserved_and_agent_keys_through() {
        assert_eq!(canonical_session_key("global", MAIN), "global");
        assert_eq!(canonical_session_key("unknown", MAIN), "unknown");
        assert_eq!(
            canonical_session_key("agent:ops:subagent:abc", MAIN),
            "agent:ops:subagent:abc"
        );
        assert_eq!(canonical_session_key("backlog", MAIN), "backlog");
    }
}
