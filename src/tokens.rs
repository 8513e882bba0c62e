#![forbid(unsafe_code)]

//! Signed credential issuing and verification.
//!
//! A credential is `base64url(claims_json) + "." + base64url(signature)`
//! where the signature is an Ed25519 detached signature over the exact claim
//! bytes. The signature only proves the credential was minted by this service
//! and is inside its signed validity window; quota and revocation live in the
//! token store and are checked separately.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, Verifier, SigningKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};

/// Issued credentials stay verifiable for 30 days.
pub const CREDENTIAL_TTL_DAYS: i64 = 30;

/// The payload embedded in every credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub owner: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Signature-layer failures. Store-layer outcomes (revoked, quota) are the
/// caller's concern.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential is malformed")]
    Malformed,
    #[error("credential signature is invalid")]
    BadSignature,
    #[error("credential expired at {0}")]
    Expired(DateTime<Utc>),
}

/// Holds the service Ed25519 key and mints/verifies credentials with it.
pub struct TokenSigner {
    key: SigningKey,
}

impl TokenSigner {
    /// Loads the signing key from `path`, generating and persisting a fresh
    /// one on first start.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read(path)
                .with_context(|| format!("reading signing key {}", path.display()))?;
            let bytes: [u8; 32] = raw
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("signing key {} is not 32 bytes", path.display()))?;
            return Ok(Self {
                key: SigningKey::from_bytes(&bytes),
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let key = SigningKey::generate(&mut OsRng);
        fs::write(path, key.to_bytes())
            .with_context(|| format!("writing signing key {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))
                .with_context(|| format!("restricting signing key {}", path.display()))?;
        }
        Ok(Self { key })
    }

    /// Mints a credential for `owner` that expires 30 days out.
    pub fn issue(&self, owner: &str) -> Result<(String, Claims)> {
        let issued_at = Utc::now();
        let claims = Claims {
            owner: owner.to_string(),
            issued_at,
            expires_at: issued_at + Duration::days(CREDENTIAL_TTL_DAYS),
        };
        let credential = self.sign_claims(&claims)?;
        Ok((credential, claims))
    }

    fn sign_claims(&self, claims: &Claims) -> Result<String> {
        let payload = serde_json::to_vec(claims).context("serializing claims")?;
        let signature = self.key.sign(&payload);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    /// Checks the signature and the signed expiry. Does not touch the store.
    pub fn verify(&self, credential: &str) -> Result<Claims, CredentialError> {
        let (payload_part, signature_part) = credential
            .split_once('.')
            .ok_or(CredentialError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_part)
            .map_err(|_| CredentialError::Malformed)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature_part)
            .map_err(|_| CredentialError::Malformed)?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| CredentialError::Malformed)?;

        self.key
            .verifying_key()
            .verify(&payload, &signature)
            .map_err(|_| CredentialError::BadSignature)?;

        let claims: Claims =
            serde_json::from_slice(&payload).map_err(|_| CredentialError::Malformed)?;
        if claims.expires_at <= Utc::now() {
            return Err(CredentialError::Expired(claims.expires_at));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn signer_in(dir: &tempfile::TempDir) -> TokenSigner {
        TokenSigner::load_or_create(&dir.path().join("signing.key")).unwrap()
    }

    #[test]
    fn issue_and_verify_roundtrip() {
        let dir = tempdir().unwrap();
        let signer = signer_in(&dir);

        let (credential, claims) = signer.issue("user@example.test").unwrap();
        assert_eq!(claims.owner, "user@example.test");
        assert_eq!(
            claims.expires_at - claims.issued_at,
            Duration::days(CREDENTIAL_TTL_DAYS)
        );

        let verified = signer.verify(&credential).unwrap();
        assert_eq!(verified.owner, "user@example.test");
        assert_eq!(verified.expires_at, claims.expires_at);
    }

    #[test]
    fn key_persists_across_reloads() {
        let dir = tempdir().unwrap();
        let (credential, _) = signer_in(&dir).issue("user@example.test").unwrap();

        let reloaded = signer_in(&dir);
        assert!(reloaded.verify(&credential).is_ok());
    }

    #[test]
    fn verify_rejects_expired_claims() {
        let dir = tempdir().unwrap();
        let signer = signer_in(&dir);
        let claims = Claims {
            owner: "user@example.test".into(),
            issued_at: Utc::now() - Duration::days(40),
            expires_at: Utc::now() - Duration::days(10),
        };
        let credential = signer.sign_claims(&claims).unwrap();

        match signer.verify(&credential) {
            Err(CredentialError::Expired(at)) => assert_eq!(at, claims.expires_at),
            other => panic!("expected expired error, got {other:?}"),
        }
    }

    #[test]
    fn verify_rejects_garbled_credentials() {
        let dir = tempdir().unwrap();
        let signer = signer_in(&dir);

        assert!(matches!(
            signer.verify("not-a-token"),
            Err(CredentialError::Malformed)
        ));
        assert!(matches!(
            signer.verify("abc.!!!"),
            Err(CredentialError::Malformed)
        ));
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let dir = tempdir().unwrap();
        let signer = signer_in(&dir);
        let (credential, _) = signer.issue("user@example.test").unwrap();

        let (_, signature_part) = credential.split_once('.').unwrap();
        let forged_claims = Claims {
            owner: "attacker@example.test".into(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + Duration::days(30),
        };
        let forged_payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        let forged = format!("{forged_payload}.{signature_part}");

        assert!(matches!(
            signer.verify(&forged),
            Err(CredentialError::BadSignature)
        ));
    }

    #[test]
    fn verify_rejects_foreign_key() {
        let ours = tempdir().unwrap();
        let theirs = tempdir().unwrap();
        let (credential, _) = signer_in(&theirs).issue("user@example.test").unwrap();

        assert!(matches!(
            signer_in(&ours).verify(&credential),
            Err(CredentialError::BadSignature)
        ));
    }
}
