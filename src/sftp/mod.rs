//! russh-sftp backed implementation of the transport traits.

pub mod client;
pub mod session;

pub use client::SftpClient;
pub use session::SftpSession;
