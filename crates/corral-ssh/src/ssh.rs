//! SSH transport over `russh`.
//!
//! [`SshHandshaker`] runs the SSH handshake on each accepted socket and turns
//! the resulting session into a core [`Connection`]. Channel data and
//! requests are forwarded to the session's [`SessionChannel`]; requests are
//! re-encoded into their wire payloads so the core dispatcher sees exactly
//! what the client sent.
//!
//! Nothing in a handler callback waits on a shell: russh runs the callbacks
//! on the connection's event loop, which also drains outgoing channel data.

use async_trait::async_trait;
use bytes::Bytes;
use corral_core::{
    encode_env, encode_pty_request, encode_window_change, Authorizer, ChannelDecision,
    ChannelOpen, ChannelSink, Connection, ControlRequest, CoreError, Handshaker, OfferedKey,
    SessionChannel, WindowSize, SESSION_CHANNEL,
};
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, MethodSet, Pty};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::keys::ServerIdentity;

/// Pending channel opens per connection.
const OPEN_QUEUE: usize = 8;
/// Buffered input chunks per channel.
const INPUT_QUEUE: usize = 64;
/// Buffered control requests per channel.
const REQUEST_QUEUE: usize = 16;

/// Build the `russh` server configuration.
pub fn server_config(identity: ServerIdentity) -> russh::server::Config {
    russh::server::Config {
        methods: MethodSet::PUBLICKEY,
        keys: identity.into_keys(),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    }
}

/// Performs SSH handshakes for the connection supervisor.
pub struct SshHandshaker {
    config: Arc<russh::server::Config>,
    authorizer: Arc<dyn Authorizer>,
}

impl SshHandshaker {
    /// Create a handshaker presenting `identity` and admitting clients
    /// through `authorizer`.
    pub fn new(identity: ServerIdentity, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            config: Arc::new(server_config(identity)),
            authorizer,
        }
    }
}

#[async_trait]
impl Handshaker for SshHandshaker {
    async fn handshake(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> corral_core::Result<Connection> {
        let (opens_tx, opens_rx) = mpsc::channel(OPEN_QUEUE);
        let handler = SshHandler::new(peer, Arc::clone(&self.authorizer), opens_tx);

        let running = russh::server::run_stream(Arc::clone(&self.config), stream, handler)
            .await
            .map_err(|e| CoreError::Handshake(e.to_string()))?;

        tokio::spawn(
            async move {
                if let Err(e) = running.await {
                    tracing::debug!(error = %e, "SSH session ended with error");
                }
            }
            .in_current_span(),
        );

        Ok(Connection {
            peer,
            channels: opens_rx,
        })
    }
}

/// `russh` handler for one client connection.
///
/// Channel input is read from each channel's own message stream by a
/// [`pump_channel`] task, so a session that is slow to take input never holds
/// up the connection. Control requests are answered from their callbacks:
/// russh only remembers whether the most recent request on a channel wanted a
/// reply. The session answers them as soon as the channel is open.
struct SshHandler {
    peer: SocketAddr,
    authorizer: Arc<dyn Authorizer>,
    identity: Option<String>,
    opens: mpsc::Sender<ChannelOpen>,
    requests: HashMap<ChannelId, mpsc::Sender<ControlRequest>>,
}

impl SshHandler {
    fn new(
        peer: SocketAddr,
        authorizer: Arc<dyn Authorizer>,
        opens: mpsc::Sender<ChannelOpen>,
    ) -> Self {
        Self {
            peer,
            authorizer,
            identity: None,
            opens,
            requests: HashMap::new(),
        }
    }

    /// Offer a channel to the core and wait for its decision.
    async fn open(&mut self, kind: &str, channel: Channel<Msg>, session: &mut Session) -> bool {
        let Some(identity) = self.identity.clone() else {
            return false;
        };
        let id = channel.id();

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE);
        let session_channel = SessionChannel {
            input: input_rx,
            output: Arc::new(SshSink::new(session.handle(), id)),
            requests: requests_rx,
        };
        let (open, decision) = ChannelOpen::new(kind, identity, session_channel);
        if self.opens.send(open).await.is_err() {
            return false;
        }

        match decision.await {
            Ok(ChannelDecision::Accepted) => {
                self.requests.insert(id, requests_tx);
                tokio::spawn(pump_channel(channel, input_tx).in_current_span());
                true
            }
            Ok(ChannelDecision::Rejected(reason)) => {
                tracing::debug!(%reason, kind, "Channel rejected");
                false
            }
            Err(_) => false,
        }
    }

    /// Hand a control request to the session and relay its reply.
    async fn forward(
        &mut self,
        id: ChannelId,
        kind: &str,
        payload: Bytes,
        session: &mut Session,
    ) -> Result<(), anyhow::Error> {
        let Some(requests) = self.requests.get(&id) else {
            session.channel_failure(id);
            return Ok(());
        };

        let (request, reply) = ControlRequest::new(kind, payload, true);
        if requests.send(request).await.is_err() {
            session.channel_failure(id);
            return Ok(());
        }
        match reply.await {
            Ok(true) => session.channel_success(id),
            _ => session.channel_failure(id),
        }
        Ok(())
    }
}

/// Feed a channel's data to its session until the client sends EOF or the
/// channel goes away.
async fn pump_channel(mut channel: Channel<Msg>, input: mpsc::Sender<Bytes>) {
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                if input.send(Bytes::copy_from_slice(&data)).await.is_err() {
                    break;
                }
            }
            // End of client input ends the session.
            ChannelMsg::Eof => break,
            // Requests arrive through the handler callbacks.
            _ => {}
        }
    }
    tracing::debug!(channel = %channel.id(), "Channel input ended");
}

#[async_trait]
impl russh::server::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let offered = OfferedKey::new(key.name(), key.public_key_base64());
        if self.authorizer.authorize(user, &offered) {
            tracing::info!(peer = %self.peer, identity = user, "Client authenticated");
            self.identity = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open(SESSION_CHANNEL, channel, session).await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.open("direct-tcpip", channel, session).await)
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.requests.remove(&channel);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = WindowSize {
            cols: col_width,
            rows: row_height,
            pixel_width: pix_width,
            pixel_height: pix_height,
        };
        let payload = encode_pty_request(term, size).freeze();
        self.forward(channel, "pty-req", payload, session).await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let size = WindowSize {
            cols: col_width,
            rows: row_height,
            pixel_width: pix_width,
            pixel_height: pix_height,
        };
        let payload = encode_window_change(size).freeze();
        self.forward(channel, "window-change", payload, session).await
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = encode_env(variable_name, variable_value).freeze();
        self.forward(channel, "env", payload, session).await
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward(channel, "shell", Bytes::new(), session).await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = Bytes::copy_from_slice(data);
        self.forward(channel, "exec", payload, session).await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = Bytes::copy_from_slice(name.as_bytes());
        self.forward(channel, "subsystem", payload, session).await
    }
}

/// Outbound half of an SSH channel.
struct SshSink {
    handle: Handle,
    id: ChannelId,
    closed: AtomicBool,
}

impl SshSink {
    fn new(handle: Handle, id: ChannelId) -> Self {
        Self {
            handle,
            id,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ChannelSink for SshSink {
    async fn send(&self, data: Bytes) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.handle
            .data(self.id, CryptoVec::from_slice(&data))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "ssh channel closed"))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.handle.eof(self.id).await;
        let _ = self.handle.close(self.id).await;
    }
}
