#![forbid(unsafe_code)]

//! Shared security helpers used by the clipgate binaries.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when a binary is started as root. Running as a regular
/// unprivileged user keeps local installs predictable and avoids accidental
/// writes into system directories.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Constant-time equality for the shared admin secrets. Comparing blake3
/// digests instead of the raw strings keeps the comparison independent of
/// where the first mismatching byte sits.
pub fn secrets_match(supplied: &str, expected: &str) -> bool {
    blake3::hash(supplied.as_bytes()) == blake3::hash(expected.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        let uid = Uid::from_raw(1000);
        assert!(ensure_not_root_for(uid, "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let uid = Uid::from_raw(0);
        let err = ensure_not_root_for(uid, "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn secrets_match_accepts_equal_values() {
        assert!(secrets_match("hunter2", "hunter2"));
    }

    #[test]
    fn secrets_match_rejects_different_values() {
        assert!(!secrets_match("hunter2", "hunter3"));
        assert!(!secrets_match("", "hunter2"));
        assert!(!secrets_match("hunter2", ""));
    }
}
