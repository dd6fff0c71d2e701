use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Identifies the remote endpoint a pooled session is bound to.
///
/// The user is part of the key: a session authenticated as one account is
/// never handed to a request made on behalf of another.
#[derive(Clone, Debug, Eq)]
pub struct SessionKey {
    pub host: Arc<str>,
    pub port: u16,
    pub username: Arc<str>,
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port
            && self.host.as_ref() == other.host.as_ref()
            && self.username.as_ref() == other.username.as_ref()
    }
}

impl Hash for SessionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.as_ref().hash(state);
        self.port.hash(state);
        self.username.as_ref().hash(state);
    }
}

impl SessionKey {
    pub fn new(host: &str, port: u16, username: &str) -> Self {
        Self {
            host: Arc::from(host),
            port,
            username: Arc::from(username),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}
