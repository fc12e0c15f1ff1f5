//! Host key loading.

use crate::config::ConfigError;
use russh_keys::key::KeyPair;
use std::path::{Path, PathBuf};

/// Signing keys that prove the server's identity during the handshake.
pub struct ServerIdentity {
    keys: Vec<KeyPair>,
}

impl ServerIdentity {
    /// Load every private key in `paths`.
    ///
    /// Encrypted keys are not supported.
    pub fn load(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        if paths.is_empty() {
            return Err(ConfigError::NoHostKeys);
        }
        let keys = paths
            .iter()
            .map(|path| load_key(path))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { keys })
    }

    /// Hand the keys to the SSH server configuration.
    pub fn into_keys(self) -> Vec<KeyPair> {
        self.keys
    }
}

fn load_key(path: &Path) -> Result<KeyPair, ConfigError> {
    let key = russh_keys::load_secret_key(path, None).map_err(|e| ConfigError::HostKey {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    tracing::info!(path = %path.display(), algorithm = key.name(), "Loaded host key");
    Ok(key)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => match std::env::var_os("HOME") {
            Some(home) => Path::new(&home).join(rest),
            None => PathBuf::from(path),
        },
        None if path == "~" => std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
