//! Session persistence boundary
//!
//! The relational store owning event metadata lives outside this crate; the
//! coordinator only needs `get`, `update` and `list` on broadcast rows.

mod memory;

pub use memory::MemorySessionStore;

use async_trait::async_trait;

use crate::models::{BroadcastSession, SessionId, SessionPatch};
use crate::Result;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch one session, `Error::NotFound` if it does not exist
    async fn get(&self, id: &SessionId) -> Result<BroadcastSession>;

    /// Apply a partial update atomically and return the updated row
    async fn update(&self, id: &SessionId, patch: SessionPatch) -> Result<BroadcastSession>;

    async fn list(&self) -> Result<Vec<BroadcastSession>>;
}
