use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use tracing::info;

use super::ViewerConnection;
use crate::models::ViewerId;

/// Directly connected viewers of one session.
///
/// Its size is the authoritative count of video-connected viewers, which can
/// differ from the presence count.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ViewerId, Arc<ViewerConnection>>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, returning the one it replaced
    pub fn insert(&self, connection: Arc<ViewerConnection>) -> Option<Arc<ViewerConnection>> {
        self.connections
            .insert(connection.viewer_id.clone(), connection)
    }

    pub fn remove(&self, viewer_id: &ViewerId) -> Option<Arc<ViewerConnection>> {
        self.connections.remove(viewer_id).map(|(_, conn)| conn)
    }

    #[must_use]
    pub fn get(&self, viewer_id: &ViewerId) -> Option<Arc<ViewerConnection>> {
        self.connections.get(viewer_id).map(|e| Arc::clone(e.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    #[must_use]
    pub fn viewer_ids(&self) -> Vec<ViewerId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Remove and close every connection, returning how many were closed
    pub async fn close_all(&self) -> usize {
        let ids = self.viewer_ids();
        let drained: Vec<_> = ids.iter().filter_map(|id| self.remove(id)).collect();
        let count = drained.len();

        join_all(drained.iter().map(|conn| conn.close())).await;

        if count > 0 {
            info!(closed = count, "Closed all viewer connections");
        }
        count
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish()
    }
}
