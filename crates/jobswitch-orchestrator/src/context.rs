use crate::types::ContextMap;
use std::collections::{BTreeMap, BTreeSet};

/// Context channel every agent joins on registration.
pub const GLOBAL_CONTEXT: &str = "global";

/// Shared context maps plus the agents subscribed to each key.
///
/// Owned by the orchestrator; agents only ever see merged copies.
#[derive(Debug, Default)]
pub struct ContextStore {
    shared: BTreeMap<String, ContextMap>,
    subscriptions: BTreeMap<String, BTreeSet<String>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, agent_id: &str, context_key: &str) {
        self.subscriptions
            .entry(context_key.to_string())
            .or_default()
            .insert(agent_id.to_string());
    }

    pub fn unsubscribe(&mut self, agent_id: &str, context_key: &str) -> bool {
        let Some(subscribers) = self.subscriptions.get_mut(context_key) else {
            return false;
        };
        let removed = subscribers.remove(agent_id);
        if subscribers.is_empty() {
            self.subscriptions.remove(context_key);
        }
        removed
    }

    /// Drop every subscription held by `agent_id`.
    pub fn unsubscribe_all(&mut self, agent_id: &str) {
        self.subscriptions.retain(|_, subscribers| {
            subscribers.remove(agent_id);
            !subscribers.is_empty()
        });
    }

    pub fn subscribers(&self, context_key: &str) -> Vec<String> {
        self.subscriptions
            .get(context_key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriptions_of(&self, agent_id: &str) -> Vec<String> {
        self.subscriptions
            .iter()
            .filter(|(_, subscribers)| subscribers.contains(agent_id))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Merge `update` into the map stored under `context_key` and return the result.
    pub fn merge(&mut self, context_key: &str, update: &ContextMap) -> ContextMap {
        let entry = self.shared.entry(context_key.to_string()).or_default();
        for (k, v) in update {
            entry.insert(k.clone(), v.clone());
        }
        entry.clone()
    }

    pub fn get(&self, context_key: &str) -> Option<&ContextMap> {
        self.shared.get(context_key)
    }

    /// Flattened view of every context the agent subscribes to.
    ///
    /// The global context is applied first, then the others in key order;
    /// later keys win on conflicts.
    pub fn snapshot_for(&self, agent_id: &str) -> ContextMap {
        let mut merged = ContextMap::new();
        let mut keys = self.subscriptions_of(agent_id);
        keys.sort_by_key(|k| (k != GLOBAL_CONTEXT, k.clone()));
        for key in keys {
            if let Some(values) = self.shared.get(&key) {
                for (k, v) in values {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        merged
    }

    pub fn context_count(&self) -> usize {
        self.shared.len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: serde_json::Value) -> ContextMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let mut store = ContextStore::new();
        store.subscribe("resume", GLOBAL_CONTEXT);
        store.subscribe("interview", GLOBAL_CONTEXT);
        assert_eq!(store.subscribers(GLOBAL_CONTEXT), vec!["interview", "resume"]);

        assert!(store.unsubscribe("resume", GLOBAL_CONTEXT));
        assert!(!store.unsubscribe("resume", GLOBAL_CONTEXT));
        assert_eq!(store.subscribers(GLOBAL_CONTEXT), vec!["interview"]);
    }

    #[test]
    fn test_unsubscribe_all() {
        let mut store = ContextStore::new();
        store.subscribe("a", GLOBAL_CONTEXT);
        store.subscribe("a", "user:42");
        store.subscribe("b", "user:42");
        store.unsubscribe_all("a");
        assert!(store.subscriptions_of("a").is_empty());
        assert!(store.subscribers(GLOBAL_CONTEXT).is_empty());
        assert_eq!(store.subscribers("user:42"), vec!["b"]);
    }

    #[test]
    fn test_merge_overwrites_keys() {
        let mut store = ContextStore::new();
        store.merge("user:42", &map(json!({"role": "engineer", "years": 3})));
        let merged = store.merge("user:42", &map(json!({"years": 4})));
        assert_eq!(merged["role"], "engineer");
        assert_eq!(merged["years"], 4);
    }

    #[test]
    fn test_snapshot_applies_global_first() {
        let mut store = ContextStore::new();
        store.subscribe("a", GLOBAL_CONTEXT);
        store.subscribe("a", "career");
        store.merge(GLOBAL_CONTEXT, &map(json!({"tone": "formal", "lang": "en"})));
        store.merge("career", &map(json!({"tone": "casual"})));
        store.merge("unrelated", &map(json!({"secret": true})));

        let snapshot = store.snapshot_for("a");
        assert_eq!(snapshot["tone"], "casual");
        assert_eq!(snapshot["lang"], "en");
        assert!(!snapshot.contains_key("secret"));
    }
}
