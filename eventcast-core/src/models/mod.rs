pub mod id;
pub mod session;
pub mod signal;

pub use id::{generate_id, SessionId, ViewerId};
pub use session::{BroadcastSession, SessionPatch, SessionStatus, TransportKind};
pub use signal::{SignalKind, SignalMessage, BROADCASTER_SENDER};
