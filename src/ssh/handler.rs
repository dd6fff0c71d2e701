use std::future::Future;
use std::sync::Arc;

use russh::client::Handler;
use russh::keys::PublicKey;

use crate::config::HostKeyPolicy;
use crate::error::SessionError;
use crate::security_log;

use super::known_hosts::{HostKeyStatus, KnownHosts, Verdict, decide};

/// SSH client handler checking server keys against known_hosts
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHosts>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, policy: HostKeyPolicy, known_hosts: Arc<KnownHosts>) -> Self {
        Self {
            host,
            port,
            policy,
            known_hosts,
        }
    }
}

impl Handler for ClientHandler {
    type Error = SessionError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send {
        let host = self.host.clone();
        let port = self.port;
        let policy = self.policy;
        let known_hosts = self.known_hosts.clone();
        let key = server_public_key.clone();

        async move {
            let fingerprint = KnownHosts::fingerprint(&key);

            // Reading known_hosts is file I/O
            let status = tokio::task::spawn_blocking({
                let known_hosts = known_hosts.clone();
                let host = host.clone();
                let key = key.clone();
                move || known_hosts.check(&host, port, &key)
            })
            .await
            .map_err(|e| SessionError::HostKeyVerification(format!("Host key check failed: {}", e)))??;

            if let HostKeyStatus::Changed { stored_fingerprint } = &status {
                tracing::warn!(
                    "HOST KEY CHANGED for {}:{}: stored {}, presented {}",
                    host,
                    port,
                    stored_fingerprint,
                    fingerprint
                );
            }

            match decide(policy, &status) {
                Verdict::Accept => {
                    if status == HostKeyStatus::Known {
                        tracing::debug!("Host key verified for {}:{}", host, port);
                    } else {
                        security_log::log_host_key_unverified(&host, port, &fingerprint);
                    }
                    Ok(true)
                }
                Verdict::Learn => {
                    tokio::task::spawn_blocking({
                        let host = host.clone();
                        move || known_hosts.learn(&host, port, &key)
                    })
                    .await
                    .map_err(|e| {
                        SessionError::HostKeyVerification(format!("Host key store failed: {}", e))
                    })??;
                    security_log::log_host_key_learned(&host, port, &fingerprint);
                    Ok(true)
                }
                Verdict::Reject(reason) => {
                    security_log::log_host_key_rejected(&host, port, reason);
                    Err(SessionError::HostKeyVerification(format!(
                        "{} for {}:{} ({})",
                        reason, host, port, fingerprint
                    )))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys;
    use tempfile::tempdir;

    const KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIK+unj2NoXFMNvTYswi/JbDCu49tSrRbW3j/pSVN660l";
    const OTHER: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIE4hFXjtzVyt3a8RYaOvLz4h38qhNrN2AZYYaTDViadd";

    fn handler(policy: HostKeyPolicy, known_hosts: Arc<KnownHosts>) -> ClientHandler {
        ClientHandler::new("example.com".to_string(), 22, policy, known_hosts)
    }

    #[tokio::test]
    async fn accept_new_learns_then_rejects_a_different_key() {
        let dir = tempdir().unwrap();
        let known_hosts = Arc::new(KnownHosts::new(Some(dir.path().join("known_hosts"))));
        let key = keys::parse_public_key_base64(KEY).unwrap();
        let other = keys::parse_public_key_base64(OTHER).unwrap();

        let mut first = handler(HostKeyPolicy::AcceptNew, known_hosts.clone());
        assert!(first.check_server_key(&key).await.unwrap());

        let mut second = handler(HostKeyPolicy::AcceptNew, known_hosts.clone());
        assert!(second.check_server_key(&key).await.unwrap());

        let mut third = handler(HostKeyPolicy::AcceptNew, known_hosts);
        let err = third.check_server_key(&other).await.unwrap_err();
        assert!(matches!(err, SessionError::HostKeyVerification(_)));
    }

    #[tokio::test]
    async fn strict_rejects_unknown_host() {
        let dir = tempdir().unwrap();
        let known_hosts = Arc::new(KnownHosts::new(Some(dir.path().join("known_hosts"))));
        let key = keys::parse_public_key_base64(KEY).unwrap();

        let mut strict = handler(HostKeyPolicy::Strict, known_hosts.clone());
        assert!(strict.check_server_key(&key).await.is_err());
        assert!(!dir.path().join("known_hosts").exists());
    }

    #[tokio::test]
    async fn accept_any_does_not_write() {
        let dir = tempdir().unwrap();
        let known_hosts = Arc::new(KnownHosts::new(Some(dir.path().join("known_hosts"))));
        let key = keys::parse_public_key_base64(KEY).unwrap();

        let mut any = handler(HostKeyPolicy::AcceptAny, known_hosts);
        assert!(any.check_server_key(&key).await.unwrap());
        assert!(!dir.path().join("known_hosts").exists());
    }
}
