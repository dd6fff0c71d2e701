//! known_hosts lookup and trust-on-first-use learning.

use std::path::{Path, PathBuf};

use data_encoding::BASE64;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use russh::keys::{self, HashAlg, PublicKey};
use sha1::Sha1;

use crate::config::{HostKeyPolicy, SshSettings, paths};
use crate::error::SessionError;

/// Result of looking a server key up in known_hosts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyStatus {
    Known,
    /// No entry for this host with the key's algorithm
    Unknown,
    /// An entry of the same algorithm exists with a different key
    Changed { stored_fingerprint: String },
    /// The key is listed under `@revoked`
    Revoked,
}

/// What the handler does with a presented key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    /// Accept and append the key to known_hosts
    Learn,
    Reject(&'static str),
}

/// Apply a policy to a lookup result.
pub fn decide(policy: HostKeyPolicy, status: &HostKeyStatus) -> Verdict {
    match (policy, status) {
        (_, HostKeyStatus::Revoked) => Verdict::Reject("host key has been revoked"),
        (HostKeyPolicy::AcceptAny, _) => Verdict::Accept,
        (_, HostKeyStatus::Known) => Verdict::Accept,
        (_, HostKeyStatus::Changed { .. }) => Verdict::Reject("host key changed"),
        (HostKeyPolicy::Strict, HostKeyStatus::Unknown) => Verdict::Reject("host is not in known_hosts"),
        (HostKeyPolicy::AcceptNew, HostKeyStatus::Unknown) => Verdict::Learn,
    }
}

#[derive(Default)]
struct Entries {
    keys: Vec<PublicKey>,
    revoked: Vec<PublicKey>,
}

/// A single known_hosts file shared by every connection attempt
pub struct KnownHosts {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl KnownHosts {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Configured path, or ferry's own file under the config directory
    pub fn from_settings(settings: &SshSettings) -> Self {
        let path = settings
            .known_hosts_path
            .as_ref()
            .map(|p| paths::expand_tilde(&p.to_string_lossy()))
            .or_else(paths::known_hosts_file);
        Self::new(path)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn fingerprint(key: &PublicKey) -> String {
        key.fingerprint(HashAlg::Sha256).to_string()
    }

    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> Result<HostKeyStatus, SessionError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(HostKeyStatus::Unknown);
        };
        let entries = read_entries(path, host, port)?;

        if entries.revoked.iter().any(|revoked| revoked == key) {
            return Ok(HostKeyStatus::Revoked);
        }
        if entries.keys.iter().any(|known| known == key) {
            return Ok(HostKeyStatus::Known);
        }
        Ok(entries
            .keys
            .iter()
            .find(|known| known.algorithm() == key.algorithm())
            .map(|stored| HostKeyStatus::Changed {
                stored_fingerprint: Self::fingerprint(stored),
            })
            .unwrap_or(HostKeyStatus::Unknown))
    }

    /// Append a key for `host:port`. Fails closed when nothing can be written.
    pub fn learn(&self, host: &str, port: u16, key: &PublicKey) -> Result<(), SessionError> {
        let path = self.path.as_deref().ok_or_else(|| {
            SessionError::HostKeyVerification("No known_hosts path configured".to_string())
        })?;

        let _guard = self.write_lock.lock();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SessionError::HostKeyVerification(format!(
                    "Failed to create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        keys::known_hosts::learn_known_hosts_path(host, port, key, path).map_err(|e| {
            SessionError::HostKeyVerification(format!(
                "Failed to write known_hosts {}: {}",
                path.display(),
                e
            ))
        })
    }
}

fn read_entries(path: &Path, host: &str, port: u16) -> Result<Entries, SessionError> {
    if !path.exists() {
        return Ok(Entries::default());
    }
    let content = std::fs::read_to_string(path).map_err(|e| {
        SessionError::HostKeyVerification(format!(
            "Failed to read known_hosts {}: {}",
            path.display(),
            e
        ))
    })?;

    let host_port = if port == 22 {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    };

    let mut entries = Entries::default();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (marker, rest) = match line.strip_prefix('@') {
            Some(marked) => match marked.split_once(char::is_whitespace) {
                Some((marker, rest)) => (Some(marker), rest.trim_start()),
                None => continue,
            },
            None => (None, line),
        };

        let mut fields = rest.split_whitespace();
        let (Some(hosts), Some(_key_type), Some(key_data)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !hosts_match(hosts, host, &host_port) {
            continue;
        }

        let key = match keys::parse_public_key_base64(key_data) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(
                    "Skipping unparsable key in {} line {}: {}",
                    path.display(),
                    index + 1,
                    e
                );
                continue;
            }
        };

        match marker {
            None => entries.keys.push(key),
            Some("revoked") => entries.revoked.push(key),
            // cert-authority and unknown markers never vouch for a plain key
            Some(_) => {}
        }
    }
    Ok(entries)
}

/// Comma separated patterns; any negated match vetoes the line.
fn hosts_match(field: &str, host: &str, host_port: &str) -> bool {
    let mut matched = false;
    for entry in field.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (negated, pattern) = match entry.strip_prefix('!') {
            Some(pattern) => (true, pattern),
            None => (false, entry),
        };
        if pattern_matches(pattern, host, host_port) {
            if negated {
                return false;
            }
            matched = true;
        }
    }
    matched
}

fn pattern_matches(pattern: &str, host: &str, host_port: &str) -> bool {
    if let Some(hashed) = pattern.strip_prefix("|1|") {
        return hashed_matches(hashed, host_port);
    }
    if pattern.contains(['*', '?']) {
        return wildcard(pattern.as_bytes(), host.as_bytes())
            || wildcard(pattern.as_bytes(), host_port.as_bytes());
    }
    pattern == host || pattern == host_port
}

/// `salt|hash`, both base64, HMAC-SHA1 over the host name
fn hashed_matches(encoded: &str, host_port: &str) -> bool {
    let Some((salt, hash)) = encoded.split_once('|') else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (BASE64.decode(salt.as_bytes()), BASE64.decode(hash.as_bytes()))
    else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(&salt) else {
        return false;
    };
    mac.update(host_port.as_bytes());
    mac.verify_slice(&hash).is_ok()
}

fn wildcard(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.split_first(), text.split_first()) {
        (None, None) => true,
        (Some((b'*', rest)), _) => {
            wildcard(rest, text) || (!text.is_empty() && wildcard(pattern, &text[1..]))
        }
        (Some((b'?', rest)), Some((_, tail))) => wildcard(rest, tail),
        (Some((p, rest)), Some((t, tail))) if p == t => wildcard(rest, tail),
        _ => false,
    }
}
