//! corral entry point.
//!
//! Listens for SSH connections and drops every login into a container
//! sandbox. See [`corral_ssh::ServerConfig::from_env`] for the settings.

use corral_core::{
    ConnectionSupervisor, DockerEngine, NativePty, SandboxRegistry, SessionOrchestrator,
};
use corral_ssh::{ServerConfig, ServerIdentity, SshHandshaker};
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("corral=info".parse()?))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!(?config, "Configuration loaded");

    let identity = ServerIdentity::load(&config.host_keys)?;
    let authorizer = config.authorizer()?;
    let policy = config.sandbox_policy()?;

    let engine = Arc::new(DockerEngine::new(&config.engine));
    let registry = Arc::new(SandboxRegistry::new(engine, policy));
    let orchestrator = Arc::new(SessionOrchestrator::new(
        Arc::clone(&registry),
        Arc::new(NativePty),
    ));
    let handshaker = Arc::new(SshHandshaker::new(identity, authorizer));

    let supervisor = ConnectionSupervisor::bind(config.listen, handshaker, orchestrator).await?;
    tracing::info!(
        addr = %supervisor.local_addr()?,
        image = %config.image,
        persistent = config.persistent,
        "corral listening"
    );

    tokio::select! {
        _ = supervisor.run() => {}
        result = signal::ctrl_c() => {
            result?;
            tracing::info!("Received shutdown signal, cleaning up...");
        }
    }

    if let Err(e) = registry.shutdown().await {
        tracing::error!(error = %e, "Sandboxes may have been left running");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
