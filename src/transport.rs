//! Capability traits the pool and the transfer service are written against.
//!
//! The production implementation lives in [`crate::sftp`] and [`crate::ssh`];
//! tests plug in scripted in-memory transports.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{SessionError, TransportError};
use crate::ssh::auth::Credential;
use crate::ssh::HostTarget;

/// How a remote file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create the file if missing and truncate it otherwise
    CreateTruncate,
}

/// Subset of remote file attributes the transfer logic needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteMetadata {
    pub size: u64,
    pub is_dir: bool,
}

/// An authenticated session able to operate on remote files.
#[async_trait]
pub trait RemoteSession: Send + Sync + Sized + 'static {
    /// Handle to an open remote file
    type File: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn open(&self, path: &str, mode: OpenMode) -> Result<Self::File, TransportError>;

    async fn stat(&self, path: &str) -> Result<RemoteMetadata, TransportError>;

    async fn chmod(&self, path: &str, mode: u32) -> Result<(), TransportError>;

    /// Tear the session down. Errors are logged by the implementation.
    async fn close(self);
}

/// Opens new authenticated sessions. Never touches the pool.
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: RemoteSession;

    async fn open_session(
        &self,
        target: &HostTarget,
        credential: &Credential,
    ) -> Result<Self::Session, SessionError>;
}
