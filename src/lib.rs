//! ferry library
//!
//! Pooled SSH/SFTP sessions and the transfer operations built on them. The
//! binary and the integration tests both go through this crate.

pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod sftp;
pub mod ssh;
pub mod transfer;
pub mod transport;

pub(crate) mod security_log;
