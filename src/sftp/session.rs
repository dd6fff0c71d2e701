//! SFTP session bound to one authenticated SSH connection

use async_trait::async_trait;
use russh::Disconnect;
use russh::client::Handle;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::client::error::Error as SftpError;
use russh_sftp::client::fs::File;
use russh_sftp::protocol::{FileAttributes, OpenFlags, StatusCode};
use tokio::sync::Mutex;

use crate::error::TransportError;
use crate::ssh::handler::ClientHandler;
use crate::transport::{OpenMode, RemoteMetadata, RemoteSession};

/// SFTP subsystem plus the SSH connection carrying it
pub struct SftpSession {
    sftp: Mutex<RusshSftpSession>,
    handle: Mutex<Handle<ClientHandler>>,
    peer: String,
}

impl std::fmt::Debug for SftpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSession")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl SftpSession {
    pub fn new(sftp: RusshSftpSession, handle: Handle<ClientHandler>, peer: String) -> Self {
        Self {
            sftp: Mutex::new(sftp),
            handle: Mutex::new(handle),
            peer,
        }
    }
}

/// Status replies that leave the connection usable map to soft errors;
/// everything else means the session is gone.
fn classify(err: SftpError) -> TransportError {
    match err {
        SftpError::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => TransportError::NotFound,
            StatusCode::NoConnection | StatusCode::ConnectionLost => {
                TransportError::Connection(status.error_message)
            }
            _ => TransportError::Status(status.error_message),
        },
        other => TransportError::Connection(other.to_string()),
    }
}

#[async_trait]
impl RemoteSession for SftpSession {
    type File = File;

    async fn open(&self, path: &str, mode: OpenMode) -> Result<File, TransportError> {
        let sftp = self.sftp.lock().await;
        let result = match mode {
            OpenMode::Read => sftp.open(path).await,
            OpenMode::CreateTruncate => {
                sftp.open_with_flags(
                    path,
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                )
                .await
            }
        };
        result.map_err(classify)
    }

    async fn stat(&self, path: &str) -> Result<RemoteMetadata, TransportError> {
        let sftp = self.sftp.lock().await;
        let metadata = sftp.metadata(path).await.map_err(classify)?;
        Ok(RemoteMetadata {
            size: metadata.size.unwrap_or(0),
            is_dir: metadata.is_dir(),
        })
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), TransportError> {
        let sftp = self.sftp.lock().await;
        let attrs = FileAttributes {
            permissions: Some(mode),
            ..Default::default()
        };
        sftp.set_metadata(path, attrs).await.map_err(classify)
    }

    async fn close(self) {
        let sftp = self.sftp.into_inner();
        if let Err(e) = sftp.close().await {
            tracing::debug!("SFTP close for {} failed: {}", self.peer, e);
        }

        let handle = self.handle.into_inner();
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await
        {
            tracing::debug!("SSH disconnect for {} failed: {}", self.peer, e);
        }
        tracing::debug!("Closed session to {}", self.peer);
    }
}
