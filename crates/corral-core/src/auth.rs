//! Authorization hook consulted by the transport before a client is admitted.
//!
//! The default policy is [`DenyAll`]. Operators opt into [`AllowAll`] or an
//! [`AuthorizedKeys`] list.

use std::collections::HashSet;

/// A public key offered by a client, in OpenSSH text form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OfferedKey {
    /// Key algorithm, e.g. `ssh-ed25519`.
    pub algorithm: String,
    /// Base64 encoded key blob.
    pub base64: String,
}

impl OfferedKey {
    /// Create an offered key.
    pub fn new(algorithm: impl Into<String>, base64: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            base64: base64.into(),
        }
    }
}

/// Decides whether an identity may log in with a key.
pub trait Authorizer: Send + Sync {
    /// Policy name, for logs.
    fn name(&self) -> &'static str;

    /// Whether `identity` presenting `key` is admitted.
    fn authorize(&self, identity: &str, key: &OfferedKey) -> bool;
}

/// Rejects everyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn name(&self) -> &'static str {
        "deny"
    }

    fn authorize(&self, identity: &str, _key: &OfferedKey) -> bool {
        tracing::debug!(identity, "Denying login");
        false
    }
}

/// Admits every identity with any key.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn name(&self) -> &'static str {
        "allow-all"
    }

    fn authorize(&self, identity: &str, key: &OfferedKey) -> bool {
        tracing::warn!(identity, algorithm = %key.algorithm, "Admitting unauthenticated identity");
        true
    }
}

/// Admits any identity whose key appears in an OpenSSH `authorized_keys` list.
#[derive(Debug, Default, Clone)]
pub struct AuthorizedKeys {
    keys: HashSet<OfferedKey>,
}

impl AuthorizedKeys {
    /// Parse the contents of an `authorized_keys` file.
    ///
    /// Blank lines, comments and lines without a recognizable key are skipped.
    /// Leading options (`no-pty,from="..."`) are ignored.
    pub fn parse(text: &str) -> Self {
        let keys = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(parse_line)
            .collect();
        Self { keys }
    }

    /// Number of keys in the list.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Authorizer for AuthorizedKeys {
    fn name(&self) -> &'static str {
        "authorized-keys"
    }

    fn authorize(&self, identity: &str, key: &OfferedKey) -> bool {
        let ok = self.keys.contains(key);
        if !ok {
            tracing::info!(identity, algorithm = %key.algorithm, "Key not authorized");
        }
        ok
    }
}

fn parse_line(line: &str) -> Option<OfferedKey> {
    let mut tokens = line.split_whitespace();
    // Options never start with a key type; skip ahead to the first one that does.
    let algorithm = tokens.find(|t| is_key_type(t))?;
    let base64 = tokens.next()?;
    Some(OfferedKey::new(algorithm, base64))
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-") || token.starts_with("sk-")
}
