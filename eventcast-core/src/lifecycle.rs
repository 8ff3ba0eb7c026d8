//! Broadcast session state machine
//!
//! Transitions are planned against a snapshot of the session and returned as a
//! [`SessionPatch`]; the caller persists the patch only after any side effects
//! (transport start/stop) succeeded.
//!
//! ```text
//! draft --publish--> published --start--> live --stop--> published
//!   \                    \                  \
//!    `------------------- end ---------------`--> ended (terminal)
//! ```

use crate::models::{BroadcastSession, SessionPatch, SessionStatus, TransportKind};
use crate::{Error, Result};

/// Outcome of planning a `start()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPlan {
    /// Already live and streaming; nothing to do
    AlreadyLive { room_reference: String },
    /// Transport must be started, then [`started_patch`] persisted
    Begin,
}

fn ensure_not_ended(session: &BroadcastSession) -> Result<()> {
    if session.status.is_terminal() {
        return Err(Error::SessionEnded);
    }
    Ok(())
}

const fn invalid(from: SessionStatus, action: &'static str) -> Error {
    Error::InvalidTransition { from, action }
}

/// draft -> published
pub fn plan_publish(session: &BroadcastSession) -> Result<SessionPatch> {
    ensure_not_ended(session)?;
    match session.status {
        SessionStatus::Draft => Ok(SessionPatch {
            status: Some(SessionStatus::Published),
            ..Default::default()
        }),
        other => Err(invalid(other, "publish")),
    }
}

/// {published, live} -> live
pub fn plan_start(session: &BroadcastSession) -> Result<StartPlan> {
    ensure_not_ended(session)?;
    match session.status {
        SessionStatus::Published => Ok(StartPlan::Begin),
        SessionStatus::Live => match (&session.room_reference, session.is_streaming) {
            (Some(room_reference), true) => Ok(StartPlan::AlreadyLive {
                room_reference: room_reference.clone(),
            }),
            _ => Ok(StartPlan::Begin),
        },
        other => Err(invalid(other, "start")),
    }
}

/// Patch persisted once the transport reported a room reference
#[must_use]
pub fn started_patch(room_reference: String) -> SessionPatch {
    SessionPatch {
        status: Some(SessionStatus::Live),
        is_streaming: Some(true),
        room_reference: Some(Some(room_reference)),
        ..Default::default()
    }
}

fn teardown_patch(status: SessionStatus) -> SessionPatch {
    SessionPatch {
        status: Some(status),
        is_streaming: Some(false),
        is_recording: Some(false),
        room_reference: Some(None),
        ..Default::default()
    }
}

/// live -> published, clearing streaming state
pub fn plan_stop(session: &BroadcastSession) -> Result<SessionPatch> {
    ensure_not_ended(session)?;
    match session.status {
        SessionStatus::Live => Ok(teardown_patch(SessionStatus::Published)),
        other => Err(invalid(other, "stop")),
    }
}

/// any -> ended
pub fn plan_end(session: &BroadcastSession) -> Result<SessionPatch> {
    ensure_not_ended(session)?;
    Ok(teardown_patch(SessionStatus::Ended))
}

/// Flip `is_recording`; only while streaming
pub fn plan_toggle_recording(session: &BroadcastSession) -> Result<SessionPatch> {
    ensure_not_ended(session)?;
    if !session.is_streaming {
        return Err(invalid(session.status, "toggle recording on"));
    }
    Ok(SessionPatch {
        is_recording: Some(!session.is_recording),
        ..Default::default()
    })
}

/// Change the transport strategy. `None` when it is already `kind`.
pub fn plan_transport_change(
    session: &BroadcastSession,
    kind: TransportKind,
) -> Result<Option<SessionPatch>> {
    ensure_not_ended(session)?;
    if session.transport == kind {
        return Ok(None);
    }
    if session.status == SessionStatus::Live {
        return Err(Error::TransportLocked);
    }
    Ok(Some(SessionPatch {
        transport: Some(kind),
        ..Default::default()
    }))
}
