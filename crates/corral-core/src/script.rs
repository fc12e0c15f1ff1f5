//! Login script executed inside a sandbox to land the user in their shell.
//!
//! The remote identity is mapped onto an unprivileged account in the image:
//! `root` is renamed to `r00t`, anything that is not a portable user name is
//! refused, the account is created on first use, and the session switches to
//! it with `su`.

use crate::error::{CoreError, Result};

/// Alias used for identities that would otherwise log in as the superuser.
pub const ROOT_ALIAS: &str = "r00t";

/// Longest account name `adduser` accepts.
pub const MAX_ACCOUNT_LEN: usize = 32;

const LOGIN_SCRIPT: &str = r#"user=__USER__
if ! getent passwd "$user" >/dev/null 2>&1; then
  adduser --disabled-password --gecos '' -- "$user" >/dev/null 2>&1 || exit 1
fi
cd "/home/$user"
exec su -- "$user"
"#;

/// Account that `identity` logs in as.
///
/// # Errors
///
/// Returns [`CoreError::InvalidIdentity`] unless the account name matches
/// `[a-z_][a-z0-9_-]*` and fits in [`MAX_ACCOUNT_LEN`] bytes.
pub fn login_account(identity: &str) -> Result<&str> {
    let account = if identity == "root" {
        ROOT_ALIAS
    } else {
        identity
    };
    if is_portable_user_name(account) {
        Ok(account)
    } else {
        Err(CoreError::InvalidIdentity(identity.to_string()))
    }
}

/// Render the login script for `identity`.
///
/// # Errors
///
/// Fails like [`login_account`]; no script is produced for such identities.
pub fn login_script(identity: &str) -> Result<String> {
    let account = login_account(identity)?;
    Ok(LOGIN_SCRIPT.replace("__USER__", &shell_quote(account)))
}

fn is_portable_user_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    let first_ok = matches!(bytes.next(), Some(b'a'..=b'z' | b'_'));
    first_ok
        && name.len() <= MAX_ACCOUNT_LEN
        && bytes.all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
}

/// Quote `value` as a single POSIX shell word.
fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str(r"'\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_assigns_user() {
        let script = login_script("alice").unwrap();
        assert!(script.starts_with("user='alice'\n"));
        assert!(script.contains("getent passwd \"$user\""));
        assert!(script.contains("adduser --disabled-password --gecos '' -- \"$user\""));
        assert!(script.trim_end().ends_with("exec su -- \"$user\""));
    }

    #[test]
    fn test_root_is_aliased() {
        assert_eq!(login_account("root").unwrap(), ROOT_ALIAS);
        assert!(login_script("root").unwrap().starts_with("user='r00t'\n"));
    }

    #[test]
    fn test_option_like_identity_gets_no_shell() {
        for identity in ["--command=id", "-c id", "-", "-root", "--login"] {
            let err = login_script(identity).unwrap_err();
            assert!(matches!(err, CoreError::InvalidIdentity(ref id) if id == identity));
        }
    }

    #[test]
    fn test_unportable_identities_are_refused() {
        let long = "a".repeat(MAX_ACCOUNT_LEN + 1);
        for identity in [
            "",
            "Alice",
            "9lives",
            "x'; rm -rf / #",
            "a b",
            "a@b",
            "bob.smith",
            "ünïcode",
            long.as_str(),
        ] {
            assert!(login_account(identity).is_err(), "{identity:?} was accepted");
        }
    }

    #[test]
    fn test_portable_identities_are_accepted() {
        let longest = "a".repeat(MAX_ACCOUNT_LEN);
        for identity in ["alice", "_svc", "bob-2", "r00t", longest.as_str()] {
            assert_eq!(login_account(identity).unwrap(), identity);
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("bob"), "'bob'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
