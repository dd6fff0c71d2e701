use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::{HashAlg, PrivateKeyWithHashAlg};
use secrecy::{ExposeSecret, SecretString};

use crate::config::paths;
use crate::error::SessionError;

/// Secret material used to authenticate one user on one host
pub enum Credential {
    Password(SecretString),
    PrivateKey {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
}

impl Credential {
    pub fn password(password: impl Into<String>) -> Self {
        Credential::Password(SecretString::from(password.into()))
    }

    pub fn private_key(path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        Credential::PrivateKey {
            path: path.into(),
            passphrase: passphrase.map(SecretString::from),
        }
    }

    /// Method name as it appears in security logs
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PrivateKey { .. } => "publickey",
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.debug_tuple("Password").field(&"[REDACTED]").finish(),
            Credential::PrivateKey { path, passphrase } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "[REDACTED]"))
                .finish(),
        }
    }
}

/// Credential turned into what russh needs for the auth request
pub enum ResolvedAuth<'a> {
    Password(&'a SecretString),
    PublicKey(PrivateKeyWithHashAlg),
}

impl std::fmt::Debug for ResolvedAuth<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedAuth::Password(_) => f.debug_tuple("Password").field(&"[REDACTED]").finish(),
            ResolvedAuth::PublicKey(_) => f.debug_tuple("PublicKey").field(&"[KEY]").finish(),
        }
    }
}

impl<'a> ResolvedAuth<'a> {
    pub async fn resolve(credential: &'a Credential) -> Result<Self, SessionError> {
        match credential {
            Credential::Password(password) => Ok(ResolvedAuth::Password(password)),
            Credential::PrivateKey { path, passphrase } => {
                let expanded = paths::expand_tilde(&path.to_string_lossy());
                let passphrase = passphrase.as_ref().map(|p| p.expose_secret());
                load_key_file(&expanded, passphrase).await
            }
        }
    }
}

async fn load_key_file(
    path: &Path,
    passphrase: Option<&str>,
) -> Result<ResolvedAuth<'static>, SessionError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        SessionError::KeyFile(format!("Cannot read key file {}: {}", path.display(), e))
    })?;

    let first_line = content.lines().next().unwrap_or("");
    if first_line.starts_with("ssh-") || first_line.starts_with("ecdsa-") {
        return Err(SessionError::KeyFile(format!(
            "File {} contains a PUBLIC key, not a private key",
            path.display()
        )));
    }
    if !first_line.starts_with("-----BEGIN") {
        return Err(SessionError::KeyFile(format!(
            "File {} does not appear to be a valid SSH private key",
            path.display()
        )));
    }

    let key = russh::keys::load_secret_key(path, passphrase).map_err(|e| {
        let normalized = e.to_string().to_lowercase();
        let passphrase_problem = normalized.contains("encrypted")
            || normalized.contains("passphrase")
            || normalized.contains("cryptographic");
        match (passphrase_problem, passphrase.is_some()) {
            (true, true) => {
                SessionError::KeyFile(format!("Wrong passphrase for key {}", path.display()))
            }
            (true, false) => {
                SessionError::KeyFile(format!("Key {} requires a passphrase", path.display()))
            }
            (false, _) => {
                SessionError::KeyFile(format!("Failed to load key {}: {}", path.display(), e))
            }
        }
    })?;

    // RSA signs with SHA-512; other algorithms use their native hash
    let hash_alg = key.algorithm().is_rsa().then_some(HashAlg::Sha512);
    Ok(ResolvedAuth::PublicKey(PrivateKeyWithHashAlg::new(
        Arc::new(key),
        hash_alg,
    )))
}
