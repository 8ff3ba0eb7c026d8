use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use super::SessionStore;
use crate::models::{BroadcastSession, SessionId, SessionPatch};
use crate::{Error, Result};

/// In-process session store keyed by session id
#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<DashMap<SessionId, BroadcastSession>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row (the CRUD layer's create)
    pub fn insert(&self, session: BroadcastSession) {
        debug!(session_id = %session.id, status = %session.status, "Session row inserted");
        self.sessions.insert(session.id.clone(), session);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl std::fmt::Debug for MemorySessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySessionStore")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, id: &SessionId) -> Result<BroadcastSession> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("Session {id} not found")))
    }

    async fn update(&self, id: &SessionId, patch: SessionPatch) -> Result<BroadcastSession> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Session {id} not found")))?;
        patch.apply(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn list(&self) -> Result<Vec<BroadcastSession>> {
        Ok(self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SessionStatus, TransportKind};

    #[tokio::test]
    async fn test_get_missing_session() {
        let store = MemorySessionStore::new();
        let result = store.get(&SessionId::from("missing")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_applies_patch() {
        let store = MemorySessionStore::new();
        let id = SessionId::from("s1");
        store.insert(BroadcastSession::new(id.clone(), TransportKind::Direct));

        let updated = store
            .update(
                &id,
                SessionPatch {
                    status: Some(SessionStatus::Published),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, SessionStatus::Published);
        assert_eq!(store.get(&id).await.unwrap().status, SessionStatus::Published);
    }

    #[tokio::test]
    async fn test_list_returns_all_rows() {
        let store = MemorySessionStore::new();
        store.insert(BroadcastSession::new(SessionId::from("a"), TransportKind::Direct));
        store.insert(BroadcastSession::new(SessionId::from("b"), TransportKind::Hosted));

        assert_eq!(store.list().await.unwrap().len(), 2);
        assert_eq!(store.len(), 2);
    }
}
