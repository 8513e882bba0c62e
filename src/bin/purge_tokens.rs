#![forbid(unsafe_code)]

//! Maintenance binary that deletes expired credentials from the token store.
//! Meant to be run from cron; expired tokens already fail validation, this
//! just keeps the table from growing without bound.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clipgate::{
    config::{self, TOKENS_DB_FILE},
    security::ensure_not_root,
    store::{SqliteTokenStore, TokenStore},
};

#[derive(Debug, Clone)]
struct PurgeArgs {
    data_root: Option<PathBuf>,
}

impl PurgeArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut data_root: Option<PathBuf> = None;
        let mut args = iter.into_iter();

        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--data-root=") {
                data_root = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--data-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("--data-root requires a value"))?;
                    data_root = Some(PathBuf::from(value));
                }
                _ => {
                    bail!("unknown argument: {arg}");
                }
            }
        }

        Ok(Self { data_root })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = PurgeArgs::parse()?;

    ensure_not_root("purge_tokens")?;

    let data_root = config::resolve_data_root(args.data_root)?;
    let db_path = data_root.join(TOKENS_DB_FILE);
    if !db_path.exists() {
        println!("No token store at {}; nothing to purge", db_path.display());
        return Ok(());
    }

    let store = SqliteTokenStore::open(&db_path)
        .await
        .context("opening token store")?;
    let removed = store
        .purge_expired(Utc::now())
        .await
        .context("purging expired tokens")?;

    if removed == 0 {
        println!("No expired tokens found");
    } else {
        println!("Purged {removed} expired token(s)");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_slice(values: &[&str]) -> Result<PurgeArgs> {
        PurgeArgs::from_iter(values.iter().map(|value| value.to_string()))
    }

    #[test]
    fn purge_args_accept_data_root_override() {
        let args = from_slice(&["--data-root", "/srv/clipgate"]).unwrap();
        assert_eq!(args.data_root, Some(PathBuf::from("/srv/clipgate")));

        let args = from_slice(&["--data-root=/srv/other"]).unwrap();
        assert_eq!(args.data_root, Some(PathBuf::from("/srv/other")));
    }

    #[test]
    fn purge_args_reject_unknown_flags() {
        let err = from_slice(&["--media-root", "/tmp"]).unwrap_err();
        assert!(err.to_string().contains("unknown argument"));
    }

    #[test]
    fn purge_args_default_to_no_override() {
        let args = from_slice(&[]).unwrap();
        assert!(args.data_root.is_none());
    }
}
