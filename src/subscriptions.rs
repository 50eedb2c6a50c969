//! Node subscription index: routes gateway events to subscribed sessions.
//!
//! Two symmetric mappings are maintained pair-wise: `node → sessions` and
//! `session → nodes`. The fan-out helpers serialize the payload once per
//! call and hand `(node_id, event, payload_json)` to the caller's send
//! closure.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct SubscriptionMaps {
    node_sessions: HashMap<String, HashSet<String>>,
    session_nodes: HashMap<String, HashSet<String>>,
}

/// Bidirectional node/session subscription index.
#[derive(Default)]
pub struct NodeSubscriptions {
    maps: Mutex<SubscriptionMaps>,
}

impl std::fmt::Debug for NodeSubscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let maps = self.lock();
        f.debug_struct("NodeSubscriptions")
            .field("nodes", &maps.node_sessions.len())
            .field("sessions", &maps.session_nodes.len())
            .finish()
    }
}

impl NodeSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SubscriptionMaps> {
        self.maps
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe a session to a node. Empty (post-trim) ids are no-ops.
    pub fn subscribe(&self, node_id: &str, session_key: &str) {
        let node_id = node_id.trim();
        let session_key = session_key.trim();
        if node_id.is_empty() || session_key.is_empty() {
            return;
        }

        let mut maps = self.lock();
        maps.node_sessions
            .entry(node_id.to_string())
            .or_default()
            .insert(session_key.to_string());
        maps.session_nodes
            .entry(session_key.to_string())
            .or_default()
            .insert(node_id.to_string());
    }

    /// Drop one node/session pairing. Emptied inner sets are removed so
    /// neither map leaks empty buckets.
    pub fn unsubscribe(&self, node_id: &str, session_key: &str) {
        let node_id = node_id.trim();
        let session_key = session_key.trim();
        if node_id.is_empty() || session_key.is_empty() {
            return;
        }

        let mut maps = self.lock();
        if let Some(sessions) = maps.node_sessions.get_mut(node_id) {
            sessions.remove(session_key);
            if sessions.is_empty() {
                maps.node_sessions.remove(node_id);
            }
        }
        if let Some(nodes) = maps.session_nodes.get_mut(session_key) {
            nodes.remove(node_id);
            if nodes.is_empty() {
                maps.session_nodes.remove(session_key);
            }
        }
    }

    /// Drop every subscription a node holds, pruning the inverse map.
    pub fn unsubscribe_all(&self, node_id: &str) {
        let node_id = node_id.trim();
        if node_id.is_empty() {
            return;
        }

        let mut maps = self.lock();
        let Some(sessions) = maps.node_sessions.remove(node_id) else {
            return;
        };
        for session_key in sessions {
            if let Some(nodes) = maps.session_nodes.get_mut(&session_key) {
                nodes.remove(node_id);
                if nodes.is_empty() {
                    maps.session_nodes.remove(&session_key);
                }
            }
        }
    }

    pub fn nodes_for_session(&self, session_key: &str) -> Vec<String> {
        let maps = self.lock();
        maps.session_nodes
            .get(session_key.trim())
            .map(|nodes| {
                let mut nodes: Vec<String> = nodes.iter().cloned().collect();
                nodes.sort();
                nodes
            })
            .unwrap_or_default()
    }

    pub fn sessions_for_node(&self, node_id: &str) -> Vec<String> {
        let maps = self.lock();
        maps.node_sessions
            .get(node_id.trim())
            .map(|sessions| {
                let mut sessions: Vec<String> = sessions.iter().cloned().collect();
                sessions.sort();
                sessions
            })
            .unwrap_or_default()
    }

    /// Fan an event out to every node the session is subscribed to.
    /// Returns the number of sends issued.
    pub fn send_to_session(
        &self,
        session_key: &str,
        event: &str,
        payload: &serde_json::Value,
        mut send: impl FnMut(&str, &str, &str),
    ) -> usize {
        let nodes = self.nodes_for_session(session_key);
        if nodes.is_empty() {
            return 0;
        }

        let payload_json = payload.to_string();
        for node_id in &nodes {
            send(node_id, event, &payload_json);
        }
        nodes.len()
    }

    /// Fan an event out to every node with at least one subscriber.
    pub fn send_to_all_subscribed(
        &self,
        event: &str,
        payload: &serde_json::Value,
        mut send: impl FnMut(&str, &str, &str),
    ) -> usize {
        let nodes: Vec<String> = {
            let maps = self.lock();
            maps.node_sessions.keys().cloned().collect()
        };
        if nodes.is_empty() {
            return 0;
        }

        let payload_json = payload.to_string();
        for node_id in &nodes {
            send(node_id, event, &payload_json);
        }
        nodes.len()
    }

    /// Fan an event out to every connected node, ignoring subscriptions.
    pub fn send_to_all_connected(
        &self,
        event: &str,
        payload: &serde_json::Value,
        list: impl FnOnce() -> Vec<String>,
        mut send: impl FnMut(&str, &str, &str),
    ) -> usize {
        let nodes = list();
        if nodes.is_empty() {
            return 0;
        }

        let payload_json = payload.to_string();
        for node_id in &nodes {
            send(node_id, event, &payload_json);
        }
        nodes.len()
    }

    #[cfg(test)]
    fn is_symmetric(&self) -> bool {
        let maps = self.lock();
        let forward_holds = maps.node_sessions.iter().all(|(node, sessions)| {
            sessions.iter().all(|session| {
                maps.session_nodes
                    .get(session)
                    .is_some_and(|nodes| nodes.contains(node))
            })
        });
        let inverse_holds = maps.session_nodes.iter().all(|(session, nodes)| {
            nodes.iter().all(|node| {
                maps.node_sessions
                    .get(node)
                    .is_some_and(|sessions| sessions.contains(session))
            })
        });
        let no_empty_buckets = maps.node_sessions.values().all(|set| !set.is_empty())
            && maps.session_nodes.values().all(|set| !set.is_empty());
        forward_holds && inverse_holds && no_empty_buckets
    }
}
