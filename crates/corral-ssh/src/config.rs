//! Configuration for the corral server.
//!
//! Settings come from an optional TOML file named by `CORRAL_CONFIG`, then
//! environment variables override individual values.

use crate::keys::expand_tilde;
use corral_core::{
    AllowAll, AuthorizedKeys, Authorizer, CoreError, DenyAll, SandboxPolicy,
    DEFAULT_CREATE_TIMEOUT, DEFAULT_IMAGE,
};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default SSH port.
pub const DEFAULT_PORT: u16 = 22;

/// Default container engine binary.
pub const DEFAULT_ENGINE: &str = "docker";

/// How clients are admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Nobody gets in.
    #[default]
    Deny,
    /// Anyone with any key gets in.
    AllowAll,
    /// Keys listed in an authorized_keys file get in.
    AuthorizedKeys,
}

impl AuthMode {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "deny" | "none" => Some(Self::Deny),
            "allow-all" | "allow_all" | "any" => Some(Self::AllowAll),
            "authorized-keys" | "authorized_keys" | "keys" => Some(Self::AuthorizedKeys),
            _ => None,
        }
    }
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("no host keys configured (set CORRAL_HOST_KEYS)")]
    NoHostKeys,

    #[error("failed to load host key {}: {message}", path.display())]
    HostKey { path: PathBuf, message: String },

    #[error("invalid sandbox policy: {0}")]
    Policy(#[from] CoreError),
}

/// Contents of the TOML config file. Every field is optional.
///
/// ```toml
/// listen = "0.0.0.0:2222"
/// host_keys = ["~/.ssh/ssh_host_ed25519_key"]
/// image = "ubuntu:24.04"
/// persistent = true
/// create_timeout_secs = 120
/// engine = "podman"
/// auth = "authorized-keys"
/// authorized_keys = "/etc/corral/authorized_keys"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<SocketAddr>,
    pub host_keys: Option<Vec<String>>,
    pub image: Option<String>,
    pub persistent: Option<bool>,
    pub create_timeout_secs: Option<u64>,
    pub engine: Option<String>,
    pub auth: Option<String>,
    pub authorized_keys: Option<String>,
}

impl FileConfig {
    /// Parse TOML text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

/// Configuration for the corral server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the SSH server listens on.
    pub listen: SocketAddr,

    /// Private host key files.
    pub host_keys: Vec<PathBuf>,

    /// Sandbox image (default: ubuntu).
    pub image: String,

    /// Keep one sandbox per identity across sessions (default: false).
    pub persistent: bool,

    /// Upper bound on creating a persistent sandbox (default: 60s).
    pub create_timeout: Duration,

    /// Container engine binary (default: docker).
    pub engine: String,

    /// Authorization policy (default: deny).
    pub auth: AuthMode,

    /// authorized_keys file for [`AuthMode::AuthorizedKeys`].
    pub authorized_keys: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            host_keys: Vec::new(),
            image: DEFAULT_IMAGE.to_string(),
            persistent: false,
            create_timeout: DEFAULT_CREATE_TIMEOUT,
            engine: DEFAULT_ENGINE.to_string(),
            auth: AuthMode::Deny,
            authorized_keys: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CORRAL_CONFIG` | unset (no file) |
    /// | `CORRAL_LISTEN` | `0.0.0.0:22` |
    /// | `CORRAL_HOST_KEYS` | required, comma-separated |
    /// | `CORRAL_IMAGE` | `ubuntu` |
    /// | `CORRAL_PERSISTENT` | `false` |
    /// | `CORRAL_CREATE_TIMEOUT_SECS` | `60` |
    /// | `CORRAL_ENGINE` | `docker` |
    /// | `CORRAL_AUTH` | `deny` (deny, allow-all, authorized-keys) |
    /// | `CORRAL_AUTHORIZED_KEYS` | unset |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration using `lookup` in place of the environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = lookup("CORRAL_CONFIG") {
            let path = expand_tilde(&path);
            let text = std::fs::read_to_string(&path)
                .map_err(|source| ConfigError::Read { path, source })?;
            config.apply_file(FileConfig::parse(&text)?)?;
        }

        if let Some(v) = lookup("CORRAL_LISTEN") {
            config.listen = parse_value("CORRAL_LISTEN", &v)?;
        }
        if let Some(v) = lookup("CORRAL_HOST_KEYS") {
            config.host_keys = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(expand_tilde)
                .collect();
        }
        if let Some(v) = lookup("CORRAL_IMAGE") {
            config.image = v;
        }
        if let Some(v) = lookup("CORRAL_PERSISTENT") {
            config.persistent = parse_bool("CORRAL_PERSISTENT", &v)?;
        }
        if let Some(v) = lookup("CORRAL_CREATE_TIMEOUT_SECS") {
            config.create_timeout =
                Duration::from_secs(parse_value("CORRAL_CREATE_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = lookup("CORRAL_ENGINE") {
            config.engine = v;
        }
        if let Some(v) = lookup("CORRAL_AUTH") {
            config.auth = parse_auth("CORRAL_AUTH", &v)?;
        }
        if let Some(v) = lookup("CORRAL_AUTHORIZED_KEYS") {
            config.authorized_keys = Some(expand_tilde(&v));
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<(), ConfigError> {
        if let Some(listen) = file.listen {
            self.listen = listen;
        }
        if let Some(keys) = file.host_keys {
            self.host_keys = keys.iter().map(|p| expand_tilde(p)).collect();
        }
        if let Some(image) = file.image {
            self.image = image;
        }
        if let Some(persistent) = file.persistent {
            self.persistent = persistent;
        }
        if let Some(secs) = file.create_timeout_secs {
            self.create_timeout = Duration::from_secs(secs);
        }
        if let Some(engine) = file.engine {
            self.engine = engine;
        }
        if let Some(auth) = file.auth {
            self.auth = parse_auth("auth", &auth)?;
        }
        if let Some(path) = file.authorized_keys {
            self.authorized_keys = Some(expand_tilde(&path));
        }
        Ok(())
    }

    /// Check the settings that have no usable default.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host_keys.is_empty() {
            return Err(ConfigError::NoHostKeys);
        }
        if self.engine.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "engine",
                value: self.engine.clone(),
            });
        }
        if self.auth == AuthMode::AuthorizedKeys && self.authorized_keys.is_none() {
            return Err(ConfigError::InvalidValue {
                key: "CORRAL_AUTHORIZED_KEYS",
                value: String::new(),
            });
        }
        self.sandbox_policy()?;
        Ok(())
    }

    /// Sandbox policy for the registry.
    pub fn sandbox_policy(&self) -> Result<SandboxPolicy, ConfigError> {
        Ok(SandboxPolicy::builder()
            .image(&self.image)
            .persistent(self.persistent)
            .create_timeout(self.create_timeout)
            .build()?)
    }

    /// Build the configured authorization policy.
    pub fn authorizer(&self) -> Result<Arc<dyn Authorizer>, ConfigError> {
        match self.auth {
            AuthMode::Deny => {
                tracing::warn!("Authorization policy is deny; no client can log in");
                Ok(Arc::new(DenyAll))
            }
            AuthMode::AllowAll => {
                tracing::warn!("Authorization policy is allow-all; any key is accepted");
                Ok(Arc::new(AllowAll))
            }
            AuthMode::AuthorizedKeys => {
                let path = self
                    .authorized_keys
                    .clone()
                    .ok_or(ConfigError::InvalidValue {
                        key: "CORRAL_AUTHORIZED_KEYS",
                        value: String::new(),
                    })?;
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
                let keys = AuthorizedKeys::parse(&text);
                tracing::info!(path = %path.display(), count = keys.len(), "Loaded authorized keys");
                Ok(Arc::new(keys))
            }
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_auth(key: &'static str, value: &str) -> Result<AuthMode, ConfigError> {
    AuthMode::parse(value).ok_or_else(|| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
    })
}
