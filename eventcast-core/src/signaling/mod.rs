//! Polled signaling relay
//!
//! Offers and answers travel through a single overwritable mailbox per
//! session. There is no queue and no acknowledgment: every poller observes the
//! most recent message, and the coordinator re-publishes to cover staleness.

mod mailbox;

pub use mailbox::MailboxRelay;

use async_trait::async_trait;

use crate::models::{SessionId, SignalMessage};
use crate::Result;

#[async_trait]
pub trait SignalingRelay: Send + Sync {
    /// Overwrite the mailbox unconditionally
    async fn publish(&self, session_id: &SessionId, message: SignalMessage) -> Result<()>;

    /// Read the mailbox without consuming it
    async fn poll(&self, session_id: &SessionId) -> Result<Option<SignalMessage>>;

    /// Empty the mailbox (teardown only)
    async fn clear(&self, session_id: &SessionId) -> Result<()>;
}
