//! Transport boundary.
//!
//! The orchestrator never speaks a wire protocol itself. A transport adapter
//! authenticates clients and multiplexes their channels, then hands the core:
//!
//! - a [`Connection`] per client, yielding [`ChannelOpen`] requests;
//! - for each accepted channel a [`SessionChannel`]: inbound bytes, an outbound
//!   [`ChannelSink`], and the channel's [`ControlRequest`]s.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// Channel type carrying interactive shells.
pub const SESSION_CHANNEL: &str = "session";

/// Outbound half of a channel.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// Send bytes to the remote side.
    async fn send(&self, data: Bytes) -> io::Result<()>;

    /// Close the channel. Closing an already closed channel is a no-op.
    async fn close(&self);
}

/// A sideband request on a session channel.
pub struct ControlRequest {
    /// Request type as named on the wire (`shell`, `pty-req`, ...).
    pub kind: String,
    /// Raw request-specific payload.
    pub payload: Bytes,
    /// Whether the client expects a reply.
    pub want_reply: bool,
    responder: Option<oneshot::Sender<bool>>,
}

impl ControlRequest {
    /// Create a request; the receiver resolves to the reply.
    ///
    /// The receiver is dropped without a value when `want_reply` is false.
    pub fn new(
        kind: impl Into<String>,
        payload: impl Into<Bytes>,
        want_reply: bool,
    ) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            kind: kind.into(),
            payload: payload.into(),
            want_reply,
            responder: Some(tx),
        };
        (request, rx)
    }

    /// Answer the request. Does nothing unless a reply was requested.
    pub fn reply(mut self, ok: bool) {
        if !self.want_reply {
            return;
        }
        if let Some(tx) = self.responder.take() {
            let _ = tx.send(ok);
        }
    }
}

impl fmt::Debug for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlRequest")
            .field("kind", &self.kind)
            .field("payload_len", &self.payload.len())
            .field("want_reply", &self.want_reply)
            .finish()
    }
}

/// An accepted session channel.
pub struct SessionChannel {
    /// Bytes typed by the remote user. Ends when the remote side closes.
    pub input: mpsc::Receiver<Bytes>,
    /// Bytes towards the remote user.
    pub output: Arc<dyn ChannelSink>,
    /// Sideband requests, in arrival order.
    pub requests: mpsc::Receiver<ControlRequest>,
}

/// Why a channel open was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The channel type is not supported.
    UnknownChannelType,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownChannelType => write!(f, "unknown channel type"),
        }
    }
}

/// Answer to a [`ChannelOpen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelDecision {
    /// The channel was accepted and is being served.
    Accepted,
    /// The channel was refused.
    Rejected(RejectReason),
}

/// A client's request to open a channel.
pub struct ChannelOpen {
    kind: String,
    identity: String,
    channel: SessionChannel,
    decision: oneshot::Sender<ChannelDecision>,
}

impl ChannelOpen {
    /// Create a pending channel open.
    ///
    /// `channel` is handed to the orchestrator on accept and dropped on
    /// reject. The receiver yields the decision.
    pub fn new(
        kind: impl Into<String>,
        identity: impl Into<String>,
        channel: SessionChannel,
    ) -> (Self, oneshot::Receiver<ChannelDecision>) {
        let (tx, rx) = oneshot::channel();
        let open = Self {
            kind: kind.into(),
            identity: identity.into(),
            channel,
            decision: tx,
        };
        (open, rx)
    }

    /// Channel type requested by the client.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Authenticated identity of the client.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Accept the channel.
    pub fn accept(self) -> (String, SessionChannel) {
        let _ = self.decision.send(ChannelDecision::Accepted);
        (self.identity, self.channel)
    }

    /// Refuse the channel.
    pub fn reject(self, reason: RejectReason) {
        let _ = self.decision.send(ChannelDecision::Rejected(reason));
    }
}

impl fmt::Debug for ChannelOpen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOpen")
            .field("kind", &self.kind)
            .field("identity", &self.identity)
            .finish()
    }
}

/// A client connection that completed the transport handshake.
pub struct Connection {
    /// Remote address.
    pub peer: SocketAddr,
    /// Channel open requests. Ends when the connection is gone.
    pub channels: mpsc::Receiver<ChannelOpen>,
}

/// Performs the transport handshake on an accepted socket.
///
/// Connection-global requests the core does not understand are the adapter's
/// to discard.
#[async_trait]
pub trait Handshaker: Send + Sync + 'static {
    /// Run the handshake and start serving the connection.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Handshake`](crate::CoreError::Handshake) when the
    /// client cannot be brought to an authenticated, multiplexed state.
    async fn handshake(&self, stream: TcpStream, peer: SocketAddr) -> Result<Connection>;
}
