use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::SignalingRelay;
use crate::models::{SessionId, SessionPatch, SignalMessage};
use crate::store::SessionStore;
use crate::Result;

/// Relay backed by the session row's `mailbox` column
#[derive(Clone)]
pub struct MailboxRelay {
    store: Arc<dyn SessionStore>,
}

impl MailboxRelay {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

impl std::fmt::Debug for MailboxRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxRelay").finish()
    }
}

#[async_trait]
impl SignalingRelay for MailboxRelay {
    async fn publish(&self, session_id: &SessionId, message: SignalMessage) -> Result<()> {
        debug!(
            session_id = %session_id,
            kind = message.kind.as_str(),
            sender = %message.sender,
            revision = ?message.revision,
            "Publishing to mailbox"
        );
        self.store
            .update(session_id, SessionPatch::mailbox(Some(message)))
            .await?;
        Ok(())
    }

    async fn poll(&self, session_id: &SessionId) -> Result<Option<SignalMessage>> {
        Ok(self.store.get(session_id).await?.mailbox)
    }

    async fn clear(&self, session_id: &SessionId) -> Result<()> {
        self.store.update(session_id, SessionPatch::mailbox(None)).await?;
        Ok(())
    }
}
