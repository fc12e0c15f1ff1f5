//! Sandbox registry: decides which sandbox a session's shell runs in.
//!
//! In persistent mode every identity owns at most one long-lived sandbox. The
//! map holds one [`OnceCell`] per identity; the cell is the in-flight creation
//! slot, so concurrent first sessions for the same identity wait on a single
//! `run_detached` call instead of racing. A failed creation leaves the cell
//! empty and the next session retries.
//!
//! In ephemeral mode nothing is recorded; every session gets a fresh, uniquely
//! named sandbox started by its own shell command.

use crate::config::SandboxPolicy;
use crate::engine::{LaunchSpec, SandboxEngine, SandboxId, ShellCommand, ShellTarget};
use crate::error::{CoreError, Result};
use crate::script::login_script;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Prefix of every container name created by this server.
pub const NAME_PREFIX: &str = "corral";

/// Outcome of [`SandboxRegistry::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSandbox {
    /// A running persistent sandbox shared by all of the identity's sessions.
    Persistent(SandboxId),
    /// A sandbox dedicated to one session, started by the session's shell.
    Ephemeral(LaunchSpec),
}

impl ResolvedSandbox {
    /// Identifier of the sandbox (the container name for ephemeral ones).
    pub fn id(&self) -> SandboxId {
        match self {
            Self::Persistent(id) => id.clone(),
            Self::Ephemeral(spec) => SandboxId::new(spec.name.clone()),
        }
    }

    /// Whether the sandbox is discarded when the session ends.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Ephemeral(_))
    }
}

/// Deterministic container names scoped to one server process.
#[derive(Debug, Clone)]
pub struct SandboxNaming {
    pid: u32,
}

impl SandboxNaming {
    /// Naming for the current process.
    pub fn for_current_process() -> Self {
        Self::with_pid(std::process::id())
    }

    /// Naming for an explicit process id.
    pub fn with_pid(pid: u32) -> Self {
        Self { pid }
    }

    /// Name of the persistent sandbox for `identity`.
    pub fn persistent(&self, identity: &str) -> String {
        format!("{}-{}-{}", NAME_PREFIX, self.pid, name_component(identity))
    }

    /// Name of the `seq`-th ephemeral sandbox for `identity`.
    pub fn ephemeral(&self, identity: &str, seq: u64) -> String {
        format!("{}-{}", self.persistent(identity), seq)
    }
}

/// Reduce `identity` to characters container engines accept in names.
///
/// Identities that had to be rewritten get a hash suffix so that distinct
/// identities never share a name.
fn name_component(identity: &str) -> String {
    let sanitized: String = identity
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized == identity && !identity.is_empty() {
        sanitized
    } else {
        format!("{}-{:08x}", sanitized, fnv1a(identity.as_bytes()))
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5u32, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(0x0100_0193)
    })
}

/// Maps identities to sandboxes and owns every persistent sandbox it creates.
pub struct SandboxRegistry {
    engine: Arc<dyn SandboxEngine>,
    policy: SandboxPolicy,
    naming: SandboxNaming,
    hostname: String,
    instances: Mutex<HashMap<String, Arc<OnceCell<SandboxId>>>>,
    ephemeral_seq: AtomicU64,
}

impl SandboxRegistry {
    /// Create a registry backed by `engine`.
    pub fn new(engine: Arc<dyn SandboxEngine>, policy: SandboxPolicy) -> Self {
        Self::with_naming(engine, policy, SandboxNaming::for_current_process())
    }

    /// Create a registry with explicit naming.
    pub fn with_naming(
        engine: Arc<dyn SandboxEngine>,
        policy: SandboxPolicy,
        naming: SandboxNaming,
    ) -> Self {
        let hostname = policy.sandbox_hostname();
        tracing::info!(
            engine = engine.name(),
            image = %policy.image,
            persistent = policy.persistent,
            hostname = %hostname,
            "Creating sandbox registry"
        );
        Self {
            engine,
            policy,
            naming,
            hostname,
            instances: Mutex::new(HashMap::new()),
            ephemeral_seq: AtomicU64::new(0),
        }
    }

    /// Get the engine.
    pub fn engine(&self) -> &Arc<dyn SandboxEngine> {
        &self.engine
    }

    /// Decide which sandbox `identity`'s new session uses.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::SandboxCreateFailed`] if a persistent sandbox had
    /// to be created and the engine failed or timed out.
    pub async fn resolve(&self, identity: &str) -> Result<ResolvedSandbox> {
        if !self.policy.persistent {
            let seq = self.ephemeral_seq.fetch_add(1, Ordering::Relaxed);
            let spec = self.launch_spec(self.naming.ephemeral(identity, seq));
            tracing::debug!(identity, name = %spec.name, "Planned ephemeral sandbox");
            return Ok(ResolvedSandbox::Ephemeral(spec));
        }

        let cell = {
            let mut instances = self
                .instances
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(instances.entry(identity.to_string()).or_default())
        };

        let id = cell
            .get_or_try_init(|| self.create_persistent(identity))
            .await?;
        Ok(ResolvedSandbox::Persistent(id.clone()))
    }

    /// Build the shell command for a session of `identity` in `sandbox`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidIdentity`] if `identity` has no login
    /// account.
    pub fn shell_command(
        &self,
        sandbox: &ResolvedSandbox,
        identity: &str,
    ) -> Result<ShellCommand> {
        let script = login_script(identity)?;
        let target = match sandbox {
            ResolvedSandbox::Persistent(id) => ShellTarget::Existing(id.clone()),
            ResolvedSandbox::Ephemeral(spec) => ShellTarget::Fresh(spec.clone()),
        };
        Ok(self.engine.shell_command(&target, &script))
    }

    /// Identifiers of every persistent sandbox currently tracked.
    pub fn tracked(&self) -> Vec<SandboxId> {
        let instances = self
            .instances
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        instances
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    /// Force-remove every tracked sandbox with a single engine request.
    ///
    /// The registry is emptied before the request is issued; an engine failure
    /// is returned to the caller.
    pub async fn destroy_all(&self) -> Result<()> {
        let ids: Vec<SandboxId> = {
            let mut instances = self
                .instances
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *instances)
                .into_values()
                .filter_map(|cell| cell.get().cloned())
                .collect()
        };

        tracing::info!(count = ids.len(), "Destroying all sandboxes");
        if ids.is_empty() {
            return Ok(());
        }
        self.engine.remove(&ids).await
    }

    /// Process-wide cleanup entry point.
    pub async fn shutdown(&self) -> Result<()> {
        let result = self.destroy_all().await;
        match &result {
            Ok(()) => tracing::info!("Sandbox registry shut down"),
            Err(e) => tracing::error!(error = %e, "Error during sandbox cleanup"),
        }
        result
    }

    fn launch_spec(&self, name: String) -> LaunchSpec {
        LaunchSpec {
            name,
            hostname: self.hostname.clone(),
            image: self.policy.image.clone(),
        }
    }

    async fn create_persistent(&self, identity: &str) -> Result<SandboxId> {
        let spec = self.launch_spec(self.naming.persistent(identity));
        let start = std::time::Instant::now();
        tracing::info!(identity, name = %spec.name, "Creating persistent sandbox");

        let id = match tokio::time::timeout(
            self.policy.create_timeout,
            self.engine.run_detached(&spec),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::SandboxCreateFailed {
                output: format!(
                    "timed out after {:?} creating {}",
                    self.policy.create_timeout, spec.name
                ),
            }),
        };

        match &id {
            Ok(id) => tracing::info!(
                identity,
                sandbox_id = %id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Persistent sandbox ready"
            ),
            Err(e) => {
                tracing::error!(identity, error = %e, "Failed to create sandbox");
                self.discard_partial(&spec.name).await;
            }
        }
        id
    }

    /// Remove whatever a failed create left under `name`.
    ///
    /// Killing the CLI does not stop the daemon, and a container whose
    /// command failed stays `Created`. Either would hold the name and make
    /// every retry for the identity fail.
    async fn discard_partial(&self, name: &str) {
        match self.engine.remove(&[SandboxId::new(name)]).await {
            Ok(()) => tracing::debug!(name, "Removed partially created sandbox"),
            Err(e) => tracing::debug!(name, error = %e, "Nothing to remove after failed create"),
        }
    }
}
