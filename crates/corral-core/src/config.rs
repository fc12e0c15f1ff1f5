//! Sandbox policy types.

use crate::error::CoreError;
use std::time::Duration;

/// Image used when none is configured.
pub const DEFAULT_IMAGE: &str = "ubuntu";

/// Default upper bound on sandbox creation.
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(60);

/// How sandboxes are assigned to sessions.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    /// Image every sandbox is started from (default: `ubuntu`).
    pub image: String,
    /// Reuse one long-lived sandbox per identity instead of one per session.
    pub persistent: bool,
    /// Maximum time the engine may take to create a persistent sandbox.
    pub create_timeout: Duration,
    /// Hostname presented inside sandboxes. Derived from the host when unset.
    pub hostname: Option<String>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            persistent: false,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
            hostname: None,
        }
    }
}

impl SandboxPolicy {
    /// Create a new policy builder.
    pub fn builder() -> SandboxPolicyBuilder {
        SandboxPolicyBuilder::default()
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.image.trim().is_empty() {
            return Err(CoreError::Policy("image must not be empty".into()));
        }
        if self.create_timeout.is_zero() {
            return Err(CoreError::Policy("create_timeout must be > 0".into()));
        }
        if let Some(hostname) = &self.hostname {
            if hostname.is_empty() {
                return Err(CoreError::Policy("hostname must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Hostname given to sandboxes.
    ///
    /// Falls back to the server's hostname, then to the image's first path
    /// segment.
    pub fn sandbox_hostname(&self) -> String {
        if let Some(hostname) = &self.hostname {
            return hostname.clone();
        }
        match nix::unistd::gethostname() {
            Ok(name) if !name.is_empty() => name.to_string_lossy().into_owned(),
            _ => image_hostname(&self.image),
        }
    }
}

fn image_hostname(image: &str) -> String {
    image.split('/').next().unwrap_or(image).to_string()
}

/// Builder for SandboxPolicy.
#[derive(Debug, Default)]
pub struct SandboxPolicyBuilder {
    policy: SandboxPolicy,
}

impl SandboxPolicyBuilder {
    /// Set the sandbox image.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.policy.image = image.into();
        self
    }

    /// Enable or disable persistent sandboxes.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.policy.persistent = persistent;
        self
    }

    /// Set the creation timeout.
    pub fn create_timeout(mut self, timeout: Duration) -> Self {
        self.policy.create_timeout = timeout;
        self
    }

    /// Set a fixed sandbox hostname.
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.policy.hostname = Some(hostname.into());
        self
    }

    /// Build the policy, validating all fields.
    pub fn build(self) -> Result<SandboxPolicy, CoreError> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = SandboxPolicy::default();
        assert_eq!(policy.image, "ubuntu");
        assert!(!policy.persistent);
        assert_eq!(policy.create_timeout, Duration::from_secs(60));
        assert!(policy.hostname.is_none());
    }

    #[test]
    fn test_builder_rejects_empty_image() {
        let result = SandboxPolicy::builder().image("  ").build();
        assert!(matches!(result, Err(CoreError::Policy(_))));
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = SandboxPolicy::builder()
            .create_timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_success() {
        let policy = SandboxPolicy::builder()
            .image("debian:bookworm")
            .persistent(true)
            .create_timeout(Duration::from_secs(5))
            .hostname("jail")
            .build()
            .expect("should build successfully");

        assert_eq!(policy.image, "debian:bookworm");
        assert!(policy.persistent);
        assert_eq!(policy.create_timeout, Duration::from_secs(5));
        assert_eq!(policy.sandbox_hostname(), "jail");
    }

    #[test]
    fn test_image_hostname() {
        assert_eq!(image_hostname("library/ubuntu"), "library");
        assert_eq!(image_hostname("ubuntu"), "ubuntu");
    }
}
