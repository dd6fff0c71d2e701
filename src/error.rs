use std::path::PathBuf;
use thiserror::Error;

use crate::pool::SessionKey;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to create config directory: {0}")]
    CreateDir(std::io::Error),
}

/// Errors raised while opening an authenticated session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Host {host}:{port} is unreachable: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Timeout connecting to {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Key file error: {0}")]
    KeyFile(String),

    #[error("Host key verification failed: {0}")]
    HostKeyVerification(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("SFTP subsystem error: {0}")]
    Sftp(String),

    #[error("russh error: {0}")]
    Russh(String),
}

impl From<russh::Error> for SessionError {
    fn from(err: russh::Error) -> Self {
        SessionError::Russh(err.to_string())
    }
}

/// Errors reported by a remote file operation on an open session
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No such file")]
    NotFound,

    /// The server answered with a failure status; the session itself is fine.
    #[error("Remote refused: {0}")]
    Status(String),

    #[error("Connection lost: {0}")]
    Connection(String),

    #[error("Stream error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the session that produced this error should be considered broken.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Connection(_) | TransportError::Io(_))
    }
}

/// Connection pool errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("No pooled connection for {0}")]
    NoConnection(SessionKey),

    #[error("Connection for {0} stayed checked out past the wait limit")]
    Busy(SessionKey),
}

/// What to do with a leased session once an operation is over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Release,
    Evict,
}

/// Errors surfaced by the transfer service
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("No connection available for {0}")]
    NoConnection(SessionKey),

    #[error("Connection for {0} is busy")]
    Busy(SessionKey),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Remote I/O failed on {key} for {path}: {source}")]
    RemoteIo {
        key: SessionKey,
        path: String,
        source: TransportError,
    },

    #[error("{path} on {key} is a directory, not a file")]
    NotAFile { key: SessionKey, path: String },

    #[error("Source and destination are the same file: {path} on {key}")]
    SameFile { key: SessionKey, path: String },

    #[error("Failed to set permissions on {path} at {key}: {source}")]
    Permissions {
        key: SessionKey,
        path: String,
        source: TransportError,
    },

    #[error("Client disconnected during download")]
    ClientDisconnected,

    #[error("Failed to write download output: {0}")]
    Sink(std::io::Error),

    #[error("Failed to read upload source: {0}")]
    LocalIo(std::io::Error),
}

impl From<PoolError> for TransferError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NoConnection(key) => TransferError::NoConnection(key),
            PoolError::Busy(key) => TransferError::Busy(key),
        }
    }
}

impl TransferError {
    /// Decide whether the session leased for `key` can go back to the pool.
    pub fn disposition_for(&self, key: &SessionKey) -> Disposition {
        match self {
            TransferError::RemoteIo { key: faulted, source, .. }
            | TransferError::Permissions { key: faulted, source, .. }
                if faulted == key && source.is_fatal() =>
            {
                Disposition::Evict
            }
            // The read position of the remote file is meaningless now.
            TransferError::ClientDisconnected | TransferError::Sink(_) => Disposition::Evict,
            _ => Disposition::Release,
        }
    }
}
