//! Opens authenticated SFTP sessions

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config};
use russh_sftp::client::SftpSession as RusshSftpSession;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::{HostKeyPolicy, SshSettings};
use crate::error::SessionError;
use crate::security_log;
use crate::ssh::auth::{Credential, ResolvedAuth};
use crate::ssh::handler::ClientHandler;
use crate::ssh::{HostTarget, KnownHosts};
use crate::transport::SessionFactory;

use super::session::SftpSession;

/// Session factory backed by russh and russh-sftp
pub struct SftpClient {
    config: Arc<Config>,
    connection_timeout: Duration,
    policy: HostKeyPolicy,
    known_hosts: Arc<KnownHosts>,
}

impl SftpClient {
    pub fn new(settings: &SshSettings) -> Self {
        Self::with_known_hosts(settings, Arc::new(KnownHosts::from_settings(settings)))
    }

    pub fn with_known_hosts(settings: &SshSettings, known_hosts: Arc<KnownHosts>) -> Self {
        // Treat 0 as "no keepalive" to avoid immediate timeout
        let keepalive = match settings.keepalive_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        // Idle lifetime belongs to the pool's reaper; an inactivity timeout
        // here could close a session that is still pooled.
        let config = Config {
            inactivity_timeout: None,
            keepalive_interval: keepalive,
            keepalive_max: 3,
            ..Default::default()
        };

        Self {
            config: Arc::new(config),
            connection_timeout: Duration::from_secs(settings.connection_timeout_secs),
            policy: settings.host_key_policy,
            known_hosts,
        }
    }

    async fn establish_sftp_session(
        &self,
        target: &HostTarget,
        credential: &Credential,
        stream: TcpStream,
    ) -> Result<SftpSession, SessionError> {
        let handler = ClientHandler::new(
            target.host.clone(),
            target.port,
            self.policy,
            self.known_hosts.clone(),
        );

        // Host key rejections come back as the handler's own error
        let mut handle = client::connect_stream(self.config.clone(), stream, handler).await?;

        let auth = ResolvedAuth::resolve(credential).await?;
        self.authenticate(&mut handle, target, credential.method(), auth)
            .await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::Channel(format!("Failed to open channel: {}", e)))?;

        channel
            .request_subsystem(false, "sftp")
            .await
            .map_err(|e| SessionError::Sftp(format!("Failed to request SFTP subsystem: {}", e)))?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SessionError::Sftp(format!("Failed to initialize SFTP session: {}", e)))?;

        security_log::log_sftp_connect(&target.host, target.port, &target.user);

        Ok(SftpSession::new(sftp, handle, target.to_string()))
    }

    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        target: &HostTarget,
        method: &str,
        auth: ResolvedAuth<'_>,
    ) -> Result<(), SessionError> {
        let (host, port, user) = (target.host.as_str(), target.port, target.user.as_str());
        security_log::log_auth_attempt(host, port, user, method);

        let result = match auth {
            ResolvedAuth::Password(password) => {
                handle
                    .authenticate_password(user, password.expose_secret())
                    .await
            }
            ResolvedAuth::PublicKey(key) => handle.authenticate_publickey(user, key).await,
        };

        match result {
            Ok(outcome) if outcome.success() => {
                security_log::log_auth_success(host, port, user, method);
                Ok(())
            }
            Ok(_) => {
                let reason = "Authentication rejected by server";
                security_log::log_auth_failure(host, port, user, method, reason);
                Err(SessionError::AuthFailed(format!("{} for {}", reason, target)))
            }
            Err(e) => {
                let reason = format!("{} auth failed: {}", method, e);
                security_log::log_auth_failure(host, port, user, method, &reason);
                Err(SessionError::AuthFailed(reason))
            }
        }
    }
}

#[async_trait]
impl SessionFactory for SftpClient {
    type Session = SftpSession;

    async fn open_session(
        &self,
        target: &HostTarget,
        credential: &Credential,
    ) -> Result<SftpSession, SessionError> {
        let addr = (target.host.as_str(), target.port);

        let stream = timeout(self.connection_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::Timeout(format!("TCP connect to {}", target)))?
            .map_err(|e| SessionError::Unreachable {
                host: target.host.clone(),
                port: target.port,
                reason: e.to_string(),
            })?;
        // Small SFTP requests should not wait on Nagle
        let _ = stream.set_nodelay(true);

        match timeout(
            self.connection_timeout,
            self.establish_sftp_session(target, credential, stream),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(format!(
                "SFTP session setup for {}",
                target
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn settings() -> SshSettings {
        SshSettings {
            connection_timeout_secs: 2,
            ..Default::default()
        }
    }

    fn client(settings: &SshSettings) -> SftpClient {
        SftpClient::with_known_hosts(settings, Arc::new(KnownHosts::new(None)))
    }

    #[test]
    fn config_has_no_inactivity_timeout() {
        let client = client(&settings());
        assert_eq!(client.config.inactivity_timeout, None);
    }

    #[test]
    fn nonzero_keepalive_sets_duration() {
        let mut settings = settings();
        settings.keepalive_interval_secs = 45;
        assert_eq!(
            client(&settings).config.keepalive_interval,
            Some(Duration::from_secs(45))
        );
    }

    #[test]
    fn zero_keepalive_sets_none_interval() {
        let mut settings = settings();
        settings.keepalive_interval_secs = 0;
        let client = client(&settings);
        assert_eq!(client.config.keepalive_interval, None);
        assert_eq!(client.config.keepalive_max, 3);
    }

    #[tokio::test]
    async fn refused_port_is_unreachable() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = SftpClient::with_known_hosts(&settings(), Arc::new(KnownHosts::new(None)));
        let target = HostTarget::new("127.0.0.1", port, "nobody");
        let err = client
            .open_session(&target, &Credential::password("x"))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Unreachable { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        // Accepts TCP but never speaks SSH
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let mut settings = settings();
        settings.connection_timeout_secs = 1;
        let client = SftpClient::with_known_hosts(&settings, Arc::new(KnownHosts::new(None)));
        let target = HostTarget::new("127.0.0.1", port, "nobody");
        let err = client
            .open_session(&target, &Credential::password("x"))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Timeout(_)), "got {err:?}");
    }
}
