use nanoid::nanoid;
use serde::{Deserialize, Serialize};

/// Generate a 12-character nanoid for entity IDs
pub fn generate_id() -> String {
    nanoid!(12)
}

/// Broadcast session ID, stable for the session's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(generate_id())
    }

    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic rendezvous peer id used by the Direct transport.
    #[must_use]
    pub fn direct_peer_id(&self) -> String {
        format!("event-{}-admin", self.0)
    }

    /// Inverse of [`SessionId::direct_peer_id`].
    #[must_use]
    pub fn from_direct_peer_id(peer_id: &str) -> Option<Self> {
        peer_id
            .strip_prefix("event-")
            .and_then(|rest| rest.strip_suffix("-admin"))
            .filter(|id| !id.is_empty())
            .map(|id| Self(id.to_string()))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Viewer identity as reported by the viewer itself (answer sender, presence identity)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewerId(pub String);

impl ViewerId {
    #[must_use]
    pub fn new() -> Self {
        Self(generate_id())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ViewerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ViewerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ViewerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ViewerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_eq!(a.as_str().len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_direct_peer_id_round_trip() {
        let id = SessionId::from("launch-42");
        let peer_id = id.direct_peer_id();

        assert_eq!(peer_id, "event-launch-42-admin");
        assert_eq!(SessionId::from_direct_peer_id(&peer_id), Some(id));
    }

    #[test]
    fn test_from_direct_peer_id_rejects_foreign_ids() {
        assert_eq!(SessionId::from_direct_peer_id("viewer-123"), None);
        assert_eq!(SessionId::from_direct_peer_id("event--admin"), None);
        assert_eq!(SessionId::from_direct_peer_id("event-abc"), None);
    }
}
