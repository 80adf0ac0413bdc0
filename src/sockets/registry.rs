//! Per-instance registry of accepted sockets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};

use super::{HibernatableSocket, SocketMessage};
use crate::types::{Error, Result, SocketId};

/// Most tags one socket may carry.
pub const MAX_TAGS: usize = 10;
/// Longest accepted tag, in characters.
pub const MAX_TAG_LEN: usize = 256;

/// Exact-match request/response pair answered without waking the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoResponse {
    pub request: String,
    pub response: String,
}

impl AutoResponse {
    pub fn new(request: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            response: response.into(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    socket: HibernatableSocket,
    tags: Vec<String>,
    last_auto_reply: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct RegistryState {
    // Accept order
    entries: Vec<Entry>,
    auto_response: Option<AutoResponse>,
}

/// Sockets accepted by one instance, with their tags and auto-reply state.
#[derive(Debug, Default)]
pub struct SocketRegistry {
    state: Mutex<RegistryState>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `socket` under `tags`.
    pub fn accept(&self, socket: HibernatableSocket, tags: Vec<String>) -> Result<()> {
        validate_tags(&tags)?;
        let mut state = self.lock();
        if state.entries.iter().any(|e| e.socket == socket) {
            return Err(Error::validation(format!(
                "socket {} was already accepted",
                socket.id()
            )));
        }
        tracing::debug!("socket_accepted: id={} tags={:?}", socket.id(), tags);
        state.entries.push(Entry {
            socket,
            tags,
            last_auto_reply: None,
        });
        Ok(())
    }

    /// Every accepted socket, or only those carrying `tag`.
    pub fn list(&self, tag: Option<&str>) -> Vec<HibernatableSocket> {
        self.lock()
            .entries
            .iter()
            .filter(|e| tag.map_or(true, |t| e.tags.iter().any(|own| own == t)))
            .map(|e| e.socket.clone())
            .collect()
    }

    /// Tags of `id`; empty for unknown sockets.
    pub fn tags_of(&self, id: &SocketId) -> Vec<String> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.socket.id() == id)
            .map(|e| e.tags.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &SocketId) -> Option<HibernatableSocket> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.socket.id() == id)
            .map(|e| e.socket.clone())
    }

    pub fn set_auto_response(&self, pair: Option<AutoResponse>) {
        self.lock().auto_response = pair;
    }

    pub fn auto_response(&self) -> Option<AutoResponse> {
        self.lock().auto_response.clone()
    }

    /// When the last auto-reply went to `id`, if ever.
    pub fn auto_response_timestamp(&self, id: &SocketId) -> Option<DateTime<Utc>> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.socket.id() == id)
            .and_then(|e| e.last_auto_reply)
    }

    /// Answer `message` from the configured pair if it matches exactly.
    ///
    /// Returns `true` when a reply was sent and the handler must not run.
    pub fn try_auto_respond(&self, id: &SocketId, message: &SocketMessage) -> Result<bool> {
        let mut state = self.lock();
        let Some(pair) = state.auto_response.clone() else {
            return Ok(false);
        };
        if message.as_text() != Some(pair.request.as_str()) {
            return Ok(false);
        }
        let Some(entry) = state.entries.iter_mut().find(|e| e.socket.id() == id) else {
            return Ok(false);
        };
        entry.socket.send(SocketMessage::Text(pair.response))?;
        entry.last_auto_reply = Some(Utc::now());
        tracing::trace!("socket_auto_replied: id={}", id);
        Ok(true)
    }

    pub fn remove(&self, id: &SocketId) -> Option<HibernatableSocket> {
        let mut state = self.lock();
        let index = state.entries.iter().position(|e| e.socket.id() == id)?;
        Some(state.entries.remove(index).socket)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}

fn validate_tags(tags: &[String]) -> Result<()> {
    if tags.len() > MAX_TAGS {
        return Err(Error::validation(format!(
            "a socket may carry at most {} tags, got {}",
            MAX_TAGS,
            tags.len()
        )));
    }
    for tag in tags {
        if tag.is_empty() {
            return Err(Error::validation("socket tags must not be empty"));
        }
        if tag.chars().count() > MAX_TAG_LEN {
            return Err(Error::validation(format!(
                "socket tag exceeds {} characters",
                MAX_TAG_LEN
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sockets::OutboundFrame;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn test_list_by_tag() {
        let registry = SocketRegistry::new();
        let (a, _pa) = HibernatableSocket::pair();
        let (b, _pb) = HibernatableSocket::pair();
        registry.accept(a.clone(), tags(&["room:a", "admin"])).unwrap();
        registry.accept(b.clone(), tags(&["room:b"])).unwrap();

        assert_eq!(registry.list(None), vec![a.clone(), b.clone()]);
        assert_eq!(registry.list(Some("room:a")), vec![a.clone()]);
        assert!(registry.list(Some("room:z")).is_empty());
        assert_eq!(registry.tags_of(a.id()), tags(&["room:a", "admin"]));
    }

    #[test]
    fn test_tags_of_unknown_socket_is_empty() {
        let registry = SocketRegistry::new();
        let (stranger, _peer) = HibernatableSocket::pair();
        assert!(registry.tags_of(stranger.id()).is_empty());
        assert_eq!(registry.auto_response_timestamp(stranger.id()), None);
    }

    #[test]
    fn test_accept_validation() {
        let registry = SocketRegistry::new();
        let (socket, _peer) = HibernatableSocket::pair();

        let too_many: Vec<String> = (0..=MAX_TAGS).map(|i| format!("t{i}")).collect();
        assert!(registry.accept(socket.clone(), too_many).is_err());
        assert!(registry.accept(socket.clone(), vec!["x".repeat(MAX_TAG_LEN + 1)]).is_err());

        registry.accept(socket.clone(), Vec::new()).unwrap();
        assert!(matches!(
            registry.accept(socket, Vec::new()),
            Err(Error::Validation(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_auto_response_exact_match_only() {
        let registry = SocketRegistry::new();
        let (socket, mut peer) = HibernatableSocket::pair();
        registry.accept(socket.clone(), Vec::new()).unwrap();

        assert!(!registry.try_auto_respond(socket.id(), &"ping".into()).unwrap());

        registry.set_auto_response(Some(AutoResponse::new("ping", "pong")));
        assert!(!registry.try_auto_respond(socket.id(), &"ping ".into()).unwrap());
        assert!(!registry.try_auto_respond(socket.id(), &"hello".into()).unwrap());
        assert_eq!(registry.auto_response_timestamp(socket.id()), None);

        assert!(registry.try_auto_respond(socket.id(), &"ping".into()).unwrap());
        assert_eq!(peer.try_recv(), Some(OutboundFrame::Message("pong".into())));
        assert_eq!(peer.try_recv(), None);
        assert!(registry.auto_response_timestamp(socket.id()).is_some());

        registry.set_auto_response(None);
        assert_eq!(registry.auto_response(), None);
    }

    #[test]
    fn test_remove() {
        let registry = SocketRegistry::new();
        let (socket, _peer) = HibernatableSocket::pair();
        registry.accept(socket.clone(), tags(&["room:a"])).unwrap();

        assert_eq!(registry.remove(socket.id()), Some(socket.clone()));
        assert_eq!(registry.remove(socket.id()), None);
        assert!(registry.is_empty());
        assert!(registry.list(Some("room:a")).is_empty());
    }
}
