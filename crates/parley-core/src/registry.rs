//! Process-owned session table keyed by participant id.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ParleyError, Result};

/// Keyed store of live sessions, one per participant.
///
/// Passed by reference to whatever needs lookups; there is no global.
pub struct SessionRegistry<H> {
    sessions: RwLock<HashMap<String, H>>,
}

impl<H> Default for SessionRegistry<H> {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl<H: Clone> SessionRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, participant: &str) -> bool {
        self.sessions.read().await.contains_key(participant)
    }

    /// Register a session. Fails if the participant already has one.
    pub async fn insert(&self, participant: &str, handle: H) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(participant) {
            return Err(ParleyError::DuplicateSession(participant.to_string()));
        }
        sessions.insert(participant.to_string(), handle);
        debug!(participant, total = sessions.len(), "Registered session");
        Ok(())
    }

    pub async fn get(&self, participant: &str) -> Option<H> {
        self.sessions.read().await.get(participant).cloned()
    }

    pub async fn remove(&self, participant: &str) -> Option<H> {
        let removed = self.sessions.write().await.remove(participant);
        if removed.is_some() {
            debug!(participant, "Removed session");
        }
        removed
    }

    /// Remove and return every session.
    pub async fn drain(&self) -> Vec<(String, H)> {
        self.sessions.write().await.drain().collect()
    }

    pub async fn participants(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_insert_fails_and_keeps_first() {
        let registry = SessionRegistry::new();
        registry.insert("user-1", 1u32).await.unwrap();

        let err = registry.insert("user-1", 2u32).await.unwrap_err();
        assert!(matches!(err, ParleyError::DuplicateSession(ref p) if p == "user-1"));
        assert_eq!(registry.get("user-1").await, Some(1));
    }

    #[tokio::test]
    async fn test_remove_allows_recreate() {
        let registry = SessionRegistry::new();
        registry.insert("user-1", "a".to_string()).await.unwrap();
        assert_eq!(registry.remove("user-1").await.as_deref(), Some("a"));
        assert!(registry.remove("user-1").await.is_none());
        registry.insert("user-1", "b".to_string()).await.unwrap();
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_drain_empties() {
        let registry = SessionRegistry::new();
        registry.insert("a", 1u8).await.unwrap();
        registry.insert("b", 2u8).await.unwrap();
        let mut drained = registry.drain().await;
        drained.sort();
        assert_eq!(drained, vec![("a".into(), 1), ("b".into(), 2)]);
        assert!(registry.is_empty().await);
    }
}
