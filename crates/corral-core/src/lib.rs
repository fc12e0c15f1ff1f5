//! # corral-core
//!
//! Session orchestration for corral: every remote login lands in its own
//! container sandbox, shown to the user as if it were the host's shell.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                ConnectionSupervisor                      │
//! │   accept ──▶ Handshaker (transport) ──▶ ChannelOpen      │
//! └───────────────────────────┬──────────────────────────────┘
//!                             │ one task per session channel
//!                             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                SessionOrchestrator                       │
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ SandboxRegistry │────▶│  SandboxEngine (docker)  │    │
//! │  │  - resolve()    │     │  run -d / exec / rm -f   │    │
//! │  │  - shutdown()   │     └──────────────────────────┘    │
//! │  └─────────────────┘                                     │
//! │           │ ShellCommand                                 │
//! │           ▼                                              │
//! │  ┌─────────────────┐     ┌──────────────────────────┐    │
//! │  │ TerminalBridge  │◀───▶│  PtySpawner (pty+shell)  │    │
//! │  │  - close()      │     └──────────────────────────┘    │
//! │  └─────────────────┘                                     │
//! │           ▲ resize                                       │
//! │  ┌─────────────────┐                                     │
//! │  │   dispatcher    │◀── shell / pty-req / window-change  │
//! │  └─────────────────┘                                     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The wire protocol lives outside this crate, behind [`Handshaker`]. The
//! container engine and the pty are collaborators behind [`SandboxEngine`] and
//! [`PtySpawner`], so everything here can be driven with in-memory fakes.
//!
//! ## Quick Start
//!
//! ```ignore
//! use corral_core::*;
//! use std::sync::Arc;
//!
//! # async fn example(handshaker: Arc<dyn Handshaker>) -> corral_core::Result<()> {
//! let policy = SandboxPolicy::builder().image("ubuntu").persistent(true).build()?;
//! let registry = Arc::new(SandboxRegistry::new(Arc::new(DockerEngine::default()), policy));
//! let orchestrator = Arc::new(SessionOrchestrator::new(registry.clone(), Arc::new(NativePty)));
//!
//! let supervisor =
//!     ConnectionSupervisor::bind("0.0.0.0:22".parse().unwrap(), handshaker, orchestrator).await?;
//! tokio::select! {
//!     _ = supervisor.run() => {}
//!     _ = tokio::signal::ctrl_c() => {}
//! }
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod bridge;
mod codec;
mod config;
mod dispatch;
mod engine;
mod error;
mod pty;
mod registry;
mod script;
mod session;
mod supervisor;
mod transport;

pub use auth::{AllowAll, AuthorizedKeys, Authorizer, DenyAll, OfferedKey};
pub use bridge::{CloseCause, TerminalBridge, DEFAULT_SHELL_EXIT_GRACE};
pub use codec::{
    decode_pty_request, decode_window_change, encode_env, encode_pty_request,
    encode_window_change, DecodeError, PtyRequest, WindowSize,
};
pub use config::{SandboxPolicy, SandboxPolicyBuilder, DEFAULT_CREATE_TIMEOUT, DEFAULT_IMAGE};
pub use dispatch::{dispatch, run_dispatcher, RequestKind, WindowSizer};
pub use engine::{DockerEngine, LaunchSpec, SandboxEngine, SandboxId, ShellCommand, ShellTarget};
pub use error::{CoreError, Result};
pub use pty::{NativePty, PtyMaster, PtyProcess, PtySpawner, ShellChild, ShellExit};
pub use registry::{ResolvedSandbox, SandboxNaming, SandboxRegistry, NAME_PREFIX};
pub use script::{login_account, login_script, MAX_ACCOUNT_LEN, ROOT_ALIAS};
pub use session::SessionOrchestrator;
pub use supervisor::{serve_connection, ConnectionSupervisor};
pub use transport::{
    ChannelDecision, ChannelOpen, ChannelSink, Connection, ControlRequest, Handshaker,
    RejectReason, SessionChannel, SESSION_CHANNEL,
};
