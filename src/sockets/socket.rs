//! Server end of a live bidirectional connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::executor::protocol::{BridgePayload, FromExecutor};
use crate::types::{Error, Result, SocketId};

/// One message on a socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum SocketMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl SocketMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

impl From<&str> for SocketMessage {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// What the server side writes to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Message(SocketMessage),
    Close { code: u16, reason: String },
}

/// Client side of a [`HibernatableSocket::pair`]; receives what the server sends.
#[derive(Debug)]
pub struct SocketPeer {
    rx: mpsc::UnboundedReceiver<OutboundFrame>,
}

impl SocketPeer {
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
enum SocketSink {
    Local(mpsc::UnboundedSender<OutboundFrame>),
    /// Lives inside an executor; writes are forwarded to the initiator.
    Bridged(mpsc::UnboundedSender<FromExecutor>),
}

#[derive(Debug)]
struct SocketInner {
    id: SocketId,
    sink: SocketSink,
    closed: AtomicBool,
}

/// Server end of a socket. Clones share one connection; equality is by id.
#[derive(Clone)]
pub struct HibernatableSocket {
    inner: Arc<SocketInner>,
}

impl fmt::Debug for HibernatableSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HibernatableSocket")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for HibernatableSocket {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for HibernatableSocket {}

impl HibernatableSocket {
    /// New in-process socket and the peer that observes its output.
    pub fn pair() -> (Self, SocketPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket = Self::with_sink(SocketId::new(), SocketSink::Local(tx));
        (socket, SocketPeer { rx })
    }

    pub(crate) fn bridged(id: SocketId, outbound: mpsc::UnboundedSender<FromExecutor>) -> Self {
        Self::with_sink(id, SocketSink::Bridged(outbound))
    }

    fn with_sink(id: SocketId, sink: SocketSink) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                id,
                sink,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &SocketId {
        &self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn send(&self, message: impl Into<SocketMessage>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::validation(format!("socket {} is closed", self.inner.id)));
        }
        let message = message.into();
        match &self.inner.sink {
            SocketSink::Local(tx) => tx
                .send(OutboundFrame::Message(message))
                .map_err(|_| self.peer_gone()),
            SocketSink::Bridged(tx) => tx
                .send(FromExecutor::WsBridge {
                    payload: BridgePayload::WsSend {
                        socket_id: self.inner.id.clone(),
                        data: message,
                    },
                })
                .map_err(|_| self.peer_gone()),
        }
    }

    /// Close the socket. Closing twice is a no-op.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let reason = reason.into();
        tracing::debug!("socket_closed: id={} code={}", self.inner.id, code);
        match &self.inner.sink {
            SocketSink::Local(tx) => tx
                .send(OutboundFrame::Close { code, reason })
                .map_err(|_| self.peer_gone()),
            SocketSink::Bridged(tx) => tx
                .send(FromExecutor::WsBridge {
                    payload: BridgePayload::WsClose {
                        socket_id: self.inner.id.clone(),
                        code,
                        reason,
                    },
                })
                .map_err(|_| self.peer_gone()),
        }
    }

    /// Record that the client closed; later sends fail.
    pub(crate) fn mark_closed(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Tell the initiator the socket was accepted with `tags`.
    pub(crate) fn notify_accepted(&self, tags: &[String]) -> Result<()> {
        match &self.inner.sink {
            SocketSink::Local(_) => Ok(()),
            SocketSink::Bridged(tx) => tx
                .send(FromExecutor::WsBridge {
                    payload: BridgePayload::WsAccept {
                        socket_id: self.inner.id.clone(),
                        tags: tags.to_vec(),
                    },
                })
                .map_err(|_| self.peer_gone()),
        }
    }

    fn peer_gone(&self) -> Error {
        self.mark_closed();
        Error::validation(format!("socket {} peer is gone", self.inner.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_frames_in_order() {
        let (socket, mut peer) = HibernatableSocket::pair();
        socket.send("one").unwrap();
        socket.send(SocketMessage::Binary(vec![1, 2])).unwrap();
        socket.close(1000, "bye").unwrap();

        assert_eq!(peer.recv().await, Some(OutboundFrame::Message("one".into())));
        assert_eq!(
            peer.recv().await,
            Some(OutboundFrame::Message(SocketMessage::Binary(vec![1, 2])))
        );
        assert_eq!(
            peer.recv().await,
            Some(OutboundFrame::Close {
                code: 1000,
                reason: "bye".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (socket, mut peer) = HibernatableSocket::pair();
        socket.close(1000, "").unwrap();
        socket.close(1001, "again").unwrap();

        assert!(socket.is_closed());
        assert!(matches!(socket.send("late"), Err(Error::Validation(_))));
        assert!(matches!(peer.recv().await, Some(OutboundFrame::Close { code: 1000, .. })));
        assert_eq!(peer.try_recv(), None);
    }

    #[tokio::test]
    async fn test_bridged_socket_forwards_to_initiator() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = SocketId::new();
        let socket = HibernatableSocket::bridged(id.clone(), tx);

        socket.notify_accepted(&["room:a".to_string()]).unwrap();
        socket.send("hi").unwrap();

        match rx.recv().await {
            Some(FromExecutor::WsBridge {
                payload: BridgePayload::WsAccept { socket_id, tags },
            }) => {
                assert_eq!(socket_id, id);
                assert_eq!(tags, vec!["room:a"]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            rx.recv().await,
            Some(FromExecutor::WsBridge {
                payload: BridgePayload::WsSend { .. }
            })
        ));
    }

    #[test]
    fn test_clones_share_identity() {
        let (socket, _peer) = HibernatableSocket::pair();
        let clone = socket.clone();
        let (other, _other_peer) = HibernatableSocket::pair();

        assert_eq!(socket, clone);
        assert_ne!(socket, other);
        clone.mark_closed();
        assert!(socket.is_closed());
    }
}
