//! # corral-ssh
//!
//! SSH front end for corral: loads configuration and host keys, speaks SSH
//! via `russh`, and hands authenticated channels to `corral-core`.

pub mod config;
pub mod keys;
pub mod ssh;

pub use config::{AuthMode, ConfigError, FileConfig, ServerConfig};
pub use keys::{expand_tilde, ServerIdentity};
pub use ssh::{server_config, SshHandshaker};
