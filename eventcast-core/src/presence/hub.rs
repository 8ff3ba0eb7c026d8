use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{ChatMessage, ClientEvent, Participant, ParticipantRole, ServerEvent};
use crate::config::PresenceConfig;
use crate::models::{generate_id, SessionId};
use crate::{Error, Result};

/// Handle for a client connection subscription
pub type ConnectionId = String;

type MessageSender = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone)]
struct Subscriber {
    connection_id: ConnectionId,
    participant: Participant,
    sender: MessageSender,
    last_seen: Instant,
}

/// Returned by [`PresenceHub::join`]
#[derive(Debug)]
pub struct Subscription {
    pub connection_id: ConnectionId,
    pub receiver: mpsc::UnboundedReceiver<ServerEvent>,
    /// Most recent chat messages, oldest first
    pub history: Vec<ChatMessage>,
}

#[derive(Debug)]
pub enum ClientOutcome {
    Joined(Subscription),
    Sent(ChatMessage),
    Refreshed,
    Left,
}

/// In-memory hub routing presence and chat events to the subscribers of
/// each session
#[derive(Clone)]
pub struct PresenceHub {
    config: Arc<PresenceConfig>,

    /// session_id -> subscribers
    sessions: Arc<DashMap<SessionId, Vec<Subscriber>>>,

    /// connection_id -> session_id, for cleanup
    connections: Arc<DashMap<ConnectionId, SessionId>>,

    /// Bounded chat history per session
    history: Arc<DashMap<SessionId, VecDeque<ChatMessage>>>,
}

impl PresenceHub {
    #[must_use]
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config: Arc::new(config),
            sessions: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
            history: Arc::new(DashMap::new()),
        }
    }

    /// Subscribe a participant and announce the new viewer count
    pub fn join(&self, session_id: SessionId, participant: Participant) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = generate_id();

        info!(
            session_id = %session_id,
            participant_id = %participant.id,
            role = ?participant.role,
            connection_id = %connection_id,
            "Participant joined"
        );

        self.sessions
            .entry(session_id.clone())
            .or_default()
            .push(Subscriber {
                connection_id: connection_id.clone(),
                participant,
                sender: tx,
                last_seen: Instant::now(),
            });
        self.connections
            .insert(connection_id.clone(), session_id.clone());

        let history = self.history(&session_id);
        self.broadcast_viewer_count(&session_id);

        Subscription {
            connection_id,
            receiver: rx,
            history,
        }
    }

    /// Unsubscribe one connection and announce the new viewer count
    pub fn leave(&self, connection_id: &str) -> bool {
        let Some((session_id, subscriber)) = self.remove_connection(connection_id) else {
            warn!(connection_id = %connection_id, "Attempted to leave with unknown connection");
            return false;
        };

        info!(
            session_id = %session_id,
            participant_id = %subscriber.participant.id,
            connection_id = %connection_id,
            "Participant left"
        );
        self.broadcast_viewer_count(&session_id);
        true
    }

    fn remove_connection(&self, connection_id: &str) -> Option<(SessionId, Subscriber)> {
        let (_, session_id) = self.connections.remove(connection_id)?;

        let mut removed = None;
        if let Some(mut subscribers) = self.sessions.get_mut(&session_id) {
            if let Some(index) = subscribers
                .iter()
                .position(|s| s.connection_id == connection_id)
            {
                removed = Some(subscribers.remove(index));
            }
            if subscribers.is_empty() {
                drop(subscribers);
                self.sessions.remove_if(&session_id, |_, subs| subs.is_empty());
                debug!(session_id = %session_id, "Session has no more subscribers");
            }
        }

        removed.map(|subscriber| (session_id, subscriber))
    }

    /// Distinct viewers subscribed to a session. Broadcasters are not counted
    /// and a viewer with several connections counts once.
    #[must_use]
    pub fn viewer_count(&self, session_id: &SessionId) -> usize {
        self.sessions.get(session_id).map_or(0, |subscribers| {
            subscribers
                .iter()
                .filter(|s| s.participant.role == ParticipantRole::Viewer)
                .map(|s| &s.participant.id)
                .collect::<HashSet<_>>()
                .len()
        })
    }

    /// Validate, record and broadcast a chat message from a joined connection
    pub fn send_chat(
        &self,
        session_id: &SessionId,
        connection_id: &str,
        text: &str,
    ) -> Result<ChatMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::InvalidInput("Message content cannot be empty".to_string()));
        }
        let max = self.config.max_message_length;
        if text.chars().count() > max {
            return Err(Error::InvalidInput(format!(
                "Message content must be at most {max} characters"
            )));
        }

        let sender = self
            .sessions
            .get(session_id)
            .and_then(|subs| {
                subs.iter()
                    .find(|s| s.connection_id == connection_id)
                    .map(|s| s.participant.clone())
            })
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "connection {connection_id} is not joined to session {session_id}"
                ))
            })?;

        let message = ChatMessage::new(session_id.clone(), &sender, text.to_string());
        {
            let mut history = self.history.entry(session_id.clone()).or_default();
            history.push_back(message.clone());
            while history.len() > self.config.chat_history_limit {
                history.pop_front();
            }
        }

        debug!(
            session_id = %session_id,
            sender_id = %message.sender_id,
            message_id = %message.id,
            "Chat message accepted"
        );
        self.broadcast(session_id, ServerEvent::NewMessage(message.clone()));
        Ok(message)
    }

    /// Chat retained for late joiners, oldest first
    #[must_use]
    pub fn history(&self, session_id: &SessionId) -> Vec<ChatMessage> {
        self.history
            .get(session_id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Mark a connection as alive
    pub fn heartbeat(&self, connection_id: &str) -> bool {
        let Some(session_id) = self.connections.get(connection_id).map(|e| e.value().clone())
        else {
            return false;
        };

        self.sessions.get_mut(&session_id).is_some_and(|mut subscribers| {
            subscribers
                .iter_mut()
                .find(|s| s.connection_id == connection_id)
                .map(|s| s.last_seen = Instant::now())
                .is_some()
        })
    }

    /// Drop participants not heard from within `timeout`. Returns how many
    /// connections were removed.
    pub fn prune_stale(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<ConnectionId> = self
            .sessions
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|s| now.duration_since(s.last_seen) > timeout)
                    .map(|s| s.connection_id.clone())
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut touched = HashSet::new();
        for connection_id in &stale {
            if let Some((session_id, subscriber)) = self.remove_connection(connection_id) {
                debug!(
                    session_id = %session_id,
                    participant_id = %subscriber.participant.id,
                    "Participant timed out"
                );
                touched.insert(session_id);
            }
        }
        for session_id in &touched {
            self.broadcast_viewer_count(session_id);
        }

        if !stale.is_empty() {
            info!(removed = stale.len(), "Pruned stale participants");
        }
        stale.len()
    }

    /// Periodically prune stale participants until `shutdown` is cancelled
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let hub = self.clone();
        let period = self.config.reaper_interval();
        let timeout = self.config.participant_timeout();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        hub.prune_stale(timeout);
                    }
                }
            }
            debug!("Presence reaper stopped");
        })
    }

    /// Drop every subscriber and the chat history of a session
    pub fn close_session(&self, session_id: &SessionId) -> usize {
        self.history.remove(session_id);
        let Some((_, subscribers)) = self.sessions.remove(session_id) else {
            return 0;
        };
        for subscriber in &subscribers {
            self.connections.remove(&subscriber.connection_id);
        }
        info!(session_id = %session_id, closed = subscribers.len(), "Presence session closed");
        subscribers.len()
    }

    /// Dispatch one inbound client frame. `connection_id` is `None` until the
    /// client has joined.
    pub fn handle_client_event(
        &self,
        connection_id: Option<&str>,
        event: ClientEvent,
    ) -> Result<ClientOutcome> {
        match (event, connection_id) {
            (ClientEvent::JoinEvent { session_id, participant }, current) => {
                if let Some(current) = current {
                    self.leave(current);
                }
                let subscription = self.join(session_id.clone(), participant);
                if !subscription.history.is_empty() {
                    self.send_to(
                        &session_id,
                        &subscription.connection_id,
                        ServerEvent::ChatHistory {
                            session_id: session_id.clone(),
                            messages: subscription.history.clone(),
                        },
                    );
                }
                Ok(ClientOutcome::Joined(subscription))
            }
            (ClientEvent::SendMessage { session_id, text }, Some(current)) => self
                .send_chat(&session_id, current, &text)
                .map(ClientOutcome::Sent),
            (ClientEvent::Heartbeat, Some(current)) => {
                if self.heartbeat(current) {
                    Ok(ClientOutcome::Refreshed)
                } else {
                    Err(Error::NotFound(format!("connection {current}")))
                }
            }
            (ClientEvent::LeaveEvent, Some(current)) => {
                self.leave(current);
                Ok(ClientOutcome::Left)
            }
            (_, None) => Err(Error::InvalidInput(
                "join-event must be sent before any other event".to_string(),
            )),
        }
    }

    /// Decode and dispatch one JSON frame
    pub fn handle_client_frame(
        &self,
        connection_id: Option<&str>,
        frame: &str,
    ) -> Result<ClientOutcome> {
        let event: ClientEvent = serde_json::from_str(frame)?;
        self.handle_client_event(connection_id, event)
    }

    fn broadcast_viewer_count(&self, session_id: &SessionId) -> usize {
        let count = self.viewer_count(session_id);
        self.broadcast(
            session_id,
            ServerEvent::ViewerCount {
                session_id: session_id.clone(),
                count,
            },
        )
    }

    fn send_to(&self, session_id: &SessionId, connection_id: &str, event: ServerEvent) -> bool {
        self.sessions.get(session_id).is_some_and(|subscribers| {
            subscribers
                .iter()
                .find(|s| s.connection_id == connection_id)
                .is_some_and(|s| s.sender.send(event).is_ok())
        })
    }

    /// Send an event to the subscribers of a session holding `role`
    pub fn send_to_role(&self, session_id: &SessionId, role: ParticipantRole, event: ServerEvent) -> usize {
        self.sessions.get(session_id).map_or(0, |subscribers| {
            subscribers
                .iter()
                .filter(|s| s.participant.role == role)
                .filter(|s| s.sender.send(event.clone()).is_ok())
                .count()
        })
    }

    /// Broadcast an event to all subscribers of a session
    pub fn broadcast(&self, session_id: &SessionId, event: ServerEvent) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        if let Some(subscribers) = self.sessions.get(session_id) {
            for subscriber in subscribers.iter() {
                match subscriber.sender.send(event.clone()) {
                    Ok(()) => sent_count += 1,
                    Err(err) => {
                        warn!(
                            session_id = %session_id,
                            connection_id = %subscriber.connection_id,
                            error = %err,
                            "Failed to send event to client, marking for cleanup"
                        );
                        failed_connections.push(subscriber.connection_id.clone());
                    }
                }
            }
        }

        let cleaned = failed_connections
            .iter()
            .filter(|id| self.remove_connection(id).is_some())
            .count();

        debug!(
            session_id = %session_id,
            sent_count,
            event_type = event.event_type(),
            "Event broadcast complete"
        );

        if cleaned > 0 {
            self.broadcast_viewer_count(session_id);
        }
        sent_count
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

impl std::fmt::Debug for PresenceHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceHub")
            .field("sessions", &self.sessions.len())
            .field("connections", &self.connections.len())
            .finish()
    }
}
