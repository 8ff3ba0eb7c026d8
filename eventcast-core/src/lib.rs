//! Live-broadcast session coordination
//!
//! Turns a scheduled event into a running broadcast: the session state
//! machine, polled mailbox signaling between one broadcaster and many viewers,
//! per-viewer peer connections, a presence and chat side-channel, and the
//! Direct / Hosted transport strategies.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod media;
pub mod models;
pub mod presence;
pub mod service;
pub mod signaling;
pub mod store;
pub mod transport;
pub mod webrtc;

#[cfg(test)]
pub mod test_helpers;

pub use config::Config;
pub use coordinator::{BroadcastCoordinator, CoordinatorEvent, PollOutcome};
pub use error::{Error, Result};
pub use service::{BroadcastService, PublicSessionInfo, ViewerCounts};
