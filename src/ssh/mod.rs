//! SSH plumbing: credentials, server key checks and connection targets.

pub mod auth;
pub mod handler;
pub mod known_hosts;

use std::fmt;

use serde::Serialize;

use crate::pool::SessionKey;

pub use auth::Credential;
pub use known_hosts::KnownHosts;

/// Where to connect and as whom
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl HostTarget {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
        }
    }

    /// Parse `user@host`, `user@host:port` or `user@[v6addr]:port`.
    pub fn parse(spec: &str, default_port: u16) -> Result<Self, String> {
        let (user, rest) = spec
            .rsplit_once('@')
            .ok_or_else(|| format!("Expected user@host, got '{}'", spec))?;
        if user.is_empty() {
            return Err(format!("Missing user in '{}'", spec));
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| format!("Unterminated '[' in '{}'", spec))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, parse_port(port)?),
                None if tail.is_empty() => (host, default_port),
                None => return Err(format!("Unexpected '{}' after host in '{}'", tail, spec)),
            }
        } else {
            match rest.split_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (rest, default_port),
            }
        };

        if host.is_empty() {
            return Err(format!("Missing host in '{}'", spec));
        }
        Ok(Self::new(host, port, user))
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.host.as_str(), self.port, self.user.as_str())
    }
}

fn parse_port(raw: &str) -> Result<u16, String> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err(format!("Invalid port '{}'", raw)),
        Ok(port) => Ok(port),
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}
