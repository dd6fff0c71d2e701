use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Disposition;
use crate::transport::RemoteSession;

use super::{ConnectionPool, Session, SessionKey};

/// Exclusive hold on a checked-out session.
///
/// End it with [`release`](Self::release) or [`evict`](Self::evict). A lease
/// that is dropped instead (early return, panic, cancelled future) gives up
/// its pool entry immediately and closes the transport in the background.
pub struct SessionLease<S: RemoteSession> {
    pool: Arc<ConnectionPool<S>>,
    key: SessionKey,
    session: Option<Session<S>>,
}

impl<S: RemoteSession> SessionLease<S> {
    pub(super) fn new(pool: Arc<ConnectionPool<S>>, session: Session<S>) -> Self {
        Self {
            pool,
            key: session.key().clone(),
            session: Some(session),
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn transport(&self) -> &S {
        match &self.session {
            Some(session) => session.transport(),
            // release/evict consume the lease, so it is never observed empty
            None => unreachable!("session lease used after it ended"),
        }
    }

    /// Return the session to the pool as idle.
    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session).await;
        }
    }

    /// Close the session and drop its pool entry.
    pub async fn evict(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.retire(session).await;
        }
    }

    pub async fn finish(self, disposition: Disposition) {
        match disposition {
            Disposition::Release => self.release().await,
            Disposition::Evict => self.evict().await,
        }
    }
}

impl<S: RemoteSession> std::fmt::Debug for SessionLease<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("key", &self.key)
            .field("active", &self.session.is_some())
            .finish()
    }
}

impl<S: RemoteSession> Drop for SessionLease<S> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        warn!(key = %self.key, "Session lease abandoned, evicting");
        self.pool.forget_lease(&self.key, session.ticket);

        let key = self.key.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    session.into_transport().close().await;
                    debug!(key = %key, "Abandoned session closed");
                });
            }
            Err(_) => {
                debug!(key = %key, "Lease dropped without a Tokio runtime; close skipped");
            }
        }
    }
}
