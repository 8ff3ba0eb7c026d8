//! Presence & chat side-channel
//!
//! Push-based and entirely in memory: a restart resets viewer counts and chat
//! history. Independent of the signaling mailbox.

mod events;
mod hub;

pub use events::{ChatMessage, ClientEvent, Participant, ParticipantRole, ServerEvent};
pub use hub::{ClientOutcome, ConnectionId, PresenceHub, Subscription};
