//! Connection supervisor: the accept loop.
//!
//! Every accepted socket gets its own task that runs the handshake and then
//! spawns one session per accepted `session` channel. Per-connection failures
//! are logged; the loop itself only stops when its task is dropped.

use crate::error::{CoreError, Result};
use crate::session::SessionOrchestrator;
use crate::transport::{Connection, Handshaker, RejectReason, SESSION_CHANNEL};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::Instrument;

/// Pause after a failed accept, so that fd exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts connections and hands their channels to the orchestrator.
pub struct ConnectionSupervisor {
    listener: TcpListener,
    handshaker: Arc<dyn Handshaker>,
    orchestrator: Arc<SessionOrchestrator>,
}

impl ConnectionSupervisor {
    /// Bind the listen address.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Listen`] if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        handshaker: Arc<dyn Handshaker>,
        orchestrator: Arc<SessionOrchestrator>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| CoreError::Listen { addr, source })?;
        Ok(Self {
            listener,
            handshaker,
            orchestrator,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections forever.
    pub async fn run(&self) {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "Accepting connections");
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "Accepted connection");
                    let handshaker = Arc::clone(&self.handshaker);
                    let orchestrator = Arc::clone(&self.orchestrator);
                    let span = tracing::info_span!("connection", %peer);
                    tokio::spawn(
                        async move {
                            match handshaker.handshake(stream, peer).await {
                                Ok(conn) => serve_connection(conn, orchestrator).await,
                                Err(e) => tracing::warn!(error = %e, "Dropping connection"),
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    tracing::error!(error = %CoreError::Accept(e), "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
}

/// Dispatch a connection's channel opens until the connection goes away.
pub async fn serve_connection(mut conn: Connection, orchestrator: Arc<SessionOrchestrator>) {
    tracing::info!(peer = %conn.peer, "Connection established");
    while let Some(open) = conn.channels.recv().await {
        if open.kind() != SESSION_CHANNEL {
            tracing::info!(kind = open.kind(), identity = open.identity(), "Rejecting channel");
            open.reject(RejectReason::UnknownChannelType);
            continue;
        }
        let (identity, channel) = open.accept();
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(
            async move { orchestrator.run_session(identity, channel).await }
                .in_current_span(),
        );
    }
    tracing::info!(peer = %conn.peer, "Connection closed");
}
