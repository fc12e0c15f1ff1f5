//! Session orchestrator: one accepted channel from open to close.

use crate::bridge::{close_unstarted, TerminalBridge, DEFAULT_SHELL_EXIT_GRACE};
use crate::codec::WindowSize;
use crate::dispatch::{run_dispatcher, WindowSizer};
use crate::pty::PtySpawner;
use crate::registry::{ResolvedSandbox, SandboxRegistry};
use crate::script::login_account;
use crate::transport::{ChannelSink, SessionChannel};
use bytes::Bytes;
use chrono::Utc;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::Instrument;
use uuid::Uuid;

/// Runs sessions: resolves the sandbox, starts the shell on a pty, bridges it
/// to the channel and serves control requests until the session closes.
pub struct SessionOrchestrator {
    registry: Arc<SandboxRegistry>,
    pty: Arc<dyn PtySpawner>,
    shell_exit_grace: Duration,
}

impl SessionOrchestrator {
    /// Create an orchestrator.
    pub fn new(registry: Arc<SandboxRegistry>, pty: Arc<dyn PtySpawner>) -> Self {
        Self {
            registry,
            pty,
            shell_exit_grace: DEFAULT_SHELL_EXIT_GRACE,
        }
    }

    /// Set how long a hung-up shell may take to exit before it is killed.
    pub fn with_shell_exit_grace(mut self, grace: Duration) -> Self {
        self.shell_exit_grace = grace;
        self
    }

    /// Get the registry.
    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    /// Serve one session channel for `identity`. Returns once it is closed.
    pub async fn run_session(&self, identity: String, channel: SessionChannel) {
        let session_id = Uuid::new_v4();
        let span = tracing::info_span!("session", %session_id, identity = %identity);
        self.serve(identity, channel).instrument(span).await
    }

    async fn serve(&self, identity: String, channel: SessionChannel) {
        let opened_at = Utc::now();
        let SessionChannel {
            input,
            output,
            requests,
        } = channel;

        // Requests are answered from the moment the channel is accepted.
        let terminal = Arc::new(TerminalSlot::default());
        let sizer: Arc<dyn WindowSizer> = terminal.clone();
        let dispatcher =
            tokio::spawn(run_dispatcher(requests, sizer).instrument(tracing::Span::current()));

        self.bridge(&identity, input, output, &terminal).await;
        dispatcher.abort();

        let elapsed = Utc::now() - opened_at;
        tracing::info!(duration_ms = elapsed.num_milliseconds(), "Session closed");
    }

    async fn bridge(
        &self,
        identity: &str,
        input: mpsc::Receiver<Bytes>,
        output: Arc<dyn ChannelSink>,
        terminal: &TerminalSlot,
    ) {
        if let Err(e) = login_account(identity) {
            close_unstarted(output.as_ref(), &e).await;
            return;
        }

        let sandbox = match self.registry.resolve(identity).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                close_unstarted(output.as_ref(), &e).await;
                return;
            }
        };
        tracing::info!(sandbox_id = %sandbox.id(), ephemeral = sandbox.is_ephemeral(), "Session opened");

        let command = match self.registry.shell_command(&sandbox, identity) {
            Ok(command) => command,
            Err(e) => {
                close_unstarted(output.as_ref(), &e).await;
                return;
            }
        };
        let size = terminal.initial_size();
        let process = match self.pty.spawn(&command, size) {
            Ok(process) => process,
            Err(e) => {
                close_unstarted(output.as_ref(), &e).await;
                return;
            }
        };

        match TerminalBridge::start(process, input, output, self.shell_exit_grace).await {
            Ok(bridge) => {
                terminal.attach(bridge.clone(), size);
                bridge.closed().await;
            }
            Err(e) => tracing::error!(error = %e, "Failed to bridge pty"),
        }

        self.discard(&sandbox).await;
    }

    /// Force-remove an ephemeral sandbox the engine may have left behind.
    async fn discard(&self, sandbox: &ResolvedSandbox) {
        if !sandbox.is_ephemeral() {
            return;
        }
        if let Err(e) = self.registry.engine().remove(&[sandbox.id()]).await {
            // Usually the engine already removed it (`--rm`).
            tracing::debug!(error = %e, "Ephemeral sandbox cleanup");
        }
    }
}

/// Where a session's resize requests land.
///
/// Sizes requested before the pty exists are remembered and used for it;
/// afterwards they go straight to the bridge.
#[derive(Default)]
struct TerminalSlot {
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    requested: Option<WindowSize>,
    bridge: Option<TerminalBridge>,
}

impl TerminalSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Size to open the pty with.
    fn initial_size(&self) -> WindowSize {
        self.lock().requested.unwrap_or_default()
    }

    /// Route later resizes to `bridge`, catching up on any size requested
    /// since the pty was opened with `opened_with`.
    fn attach(&self, bridge: TerminalBridge, opened_with: WindowSize) {
        let mut state = self.lock();
        if let Some(size) = state.requested.filter(|size| *size != opened_with) {
            if let Err(e) = bridge.resize(size) {
                tracing::warn!(error = %e, cols = size.cols, rows = size.rows, "Failed to resize pty");
            }
        }
        state.bridge = Some(bridge);
    }
}

impl WindowSizer for TerminalSlot {
    fn resize(&self, size: WindowSize) -> io::Result<()> {
        let mut state = self.lock();
        state.requested = Some(size);
        match &state.bridge {
            Some(bridge) => bridge.resize(size),
            None => Ok(()),
        }
    }
}
