//! Capacity-bounded pool of authenticated sessions, one per [`SessionKey`].
//!
//! Every map access happens under a single `parking_lot` mutex that is never
//! held across an `.await`; transports are always closed after the lock is
//! released. A key is either idle in the pool or leased to exactly one
//! operation, so two operations never drive the same transport at once.

mod key;
mod lease;
mod reaper;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolSettings;
use crate::error::PoolError;
use crate::transport::RemoteSession;

pub use key::SessionKey;
pub use lease::SessionLease;
pub use reaper::ReaperHandle;

/// A transport together with the key it is pooled under and its last use.
pub struct Session<S> {
    key: SessionKey,
    transport: S,
    last_used: Instant,
    ticket: u64,
}

impl<S> Session<S> {
    pub fn new(key: SessionKey, transport: S) -> Self {
        Self {
            key,
            transport,
            last_used: Instant::now(),
            ticket: 0,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn transport(&self) -> &S {
        &self.transport
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn into_transport(self) -> S {
        self.transport
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

impl<S> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("idle", &self.idle_time())
            .finish_non_exhaustive()
    }
}

enum Slot<S> {
    Idle(Session<S>),
    /// `ticket` identifies the checkout, so a holder whose lease was revoked
    /// cannot end a later lease on the same key.
    Leased { since: Instant, ticket: u64 },
}

impl<S> Slot<S> {
    fn is_leased(&self) -> bool {
        matches!(self, Slot::Leased { .. })
    }

    fn is_held_by(&self, holder: u64) -> bool {
        matches!(self, Slot::Leased { ticket, .. } if *ticket == holder)
    }
}

enum Checkout<S> {
    Ready(Session<S>),
    Stale(Session<S>),
    Leased,
    Missing,
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum resident sessions across all keys, idle or leased
    pub capacity: usize,
    /// Idle time after which a session is closed
    pub idle_timeout: Duration,
    /// How long `acquire` waits for a key leased by another operation
    pub checkout_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            idle_timeout: Duration::from_secs(300),
            checkout_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            capacity: settings.capacity,
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
            checkout_timeout: Duration::from_secs(settings.checkout_timeout_secs),
        }
    }
}

/// Outcome of [`ConnectionPool::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Inserted,
    /// An idle session for the key was closed and replaced
    Replaced,
    /// The new session was closed without touching the pool
    Shed(ShedReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShedReason {
    /// The key is new and the pool is full
    Capacity,
    /// The key is currently leased to another operation
    InUse,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub leased: usize,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.idle + self.leased
    }
}

/// Session pool shared by every transfer operation
pub struct ConnectionPool<S> {
    slots: Mutex<HashMap<SessionKey, Slot<S>>>,
    returned: Notify,
    tickets: AtomicU64,
    config: PoolConfig,
}

impl<S: RemoteSession> ConnectionPool<S> {
    /// Create a new pool.
    ///
    /// A capacity of 0 is clamped to 1 so that the pool can hold anything at all.
    pub fn new(mut config: PoolConfig) -> Self {
        config.capacity = config.capacity.max(1);
        Self {
            slots: Mutex::new(HashMap::new()),
            returned: Notify::new(),
            tickets: AtomicU64::new(1),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(PoolConfig::default())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Check out the session for `key`.
    ///
    /// Returns [`PoolError::NoConnection`] when nothing usable is pooled; a
    /// stale session is closed on the way. When another operation holds the
    /// key, waits up to the checkout timeout for it to come back.
    pub async fn acquire(&self, key: &SessionKey) -> Result<Session<S>, PoolError> {
        let deadline = Instant::now() + self.config.checkout_timeout;

        loop {
            // Register interest before looking so a return in between is not missed.
            let notified = self.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_checkout(key) {
                Checkout::Ready(session) => {
                    debug!(key = %key, "Reusing pooled session");
                    return Ok(session);
                }
                Checkout::Stale(session) => {
                    debug!(
                        key = %key,
                        idle_secs = session.idle_time().as_secs(),
                        "Pooled session too idle, closing"
                    );
                    session.transport.close().await;
                    return Err(PoolError::NoConnection(key.clone()));
                }
                Checkout::Missing => return Err(PoolError::NoConnection(key.clone())),
                Checkout::Leased => {
                    debug!(key = %key, "Session checked out elsewhere, waiting");
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        warn!(key = %key, "Timed out waiting for a checked-out session");
                        return Err(PoolError::Busy(key.clone()));
                    }
                }
            }
        }
    }

    /// [`acquire`](Self::acquire) wrapped in a guard that always returns or
    /// discards the session.
    pub async fn checkout(self: &Arc<Self>, key: &SessionKey) -> Result<SessionLease<S>, PoolError> {
        let session = self.acquire(key).await?;
        Ok(SessionLease::new(self.clone(), session))
    }

    fn try_checkout(&self, key: &SessionKey) -> Checkout<S> {
        let mut slots = self.slots.lock();
        match slots.remove(key) {
            None => Checkout::Missing,
            Some(leased @ Slot::Leased { .. }) => {
                slots.insert(key.clone(), leased);
                Checkout::Leased
            }
            Some(Slot::Idle(session)) if session.idle_time() > self.config.idle_timeout => {
                Checkout::Stale(session)
            }
            Some(Slot::Idle(mut session)) => {
                session.touch();
                session.ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
                slots.insert(
                    key.clone(),
                    Slot::Leased {
                        since: Instant::now(),
                        ticket: session.ticket,
                    },
                );
                Checkout::Ready(session)
            }
        }
    }

    /// Insert a freshly opened session as idle.
    ///
    /// Capacity is enforced by shedding: the pool never grows past its limit
    /// and never queues, the surplus session is closed instead.
    pub async fn add(&self, key: SessionKey, transport: S) -> Admission {
        let (admission, discard) = {
            let mut slots = self.slots.lock();
            let existing = slots.get(&key).map(Slot::is_leased);
            match existing {
                Some(true) => (Admission::Shed(ShedReason::InUse), Some(transport)),
                Some(false) => {
                    let previous =
                        slots.insert(key.clone(), Slot::Idle(Session::new(key.clone(), transport)));
                    let old = match previous {
                        Some(Slot::Idle(old)) => Some(old.transport),
                        _ => None,
                    };
                    (Admission::Replaced, old)
                }
                None if slots.len() >= self.config.capacity => {
                    (Admission::Shed(ShedReason::Capacity), Some(transport))
                }
                None => {
                    slots.insert(key.clone(), Slot::Idle(Session::new(key.clone(), transport)));
                    (Admission::Inserted, None)
                }
            }
        };

        match admission {
            Admission::Inserted => debug!(key = %key, "Session added to pool"),
            Admission::Replaced => debug!(key = %key, "Replaced idle session"),
            Admission::Shed(reason) => warn!(
                key = %key,
                ?reason,
                capacity = self.config.capacity,
                "Shedding new session"
            ),
        }

        if let Some(transport) = discard {
            transport.close().await;
        }
        if !matches!(admission, Admission::Shed(_)) {
            self.returned.notify_waiters();
        }
        admission
    }

    /// Hand a leased session back as idle.
    ///
    /// If the key lost this lease in the meantime (evicted, pool closed) the
    /// pool is left as it is and the session is closed rather than resurrected.
    pub async fn release(&self, mut session: Session<S>) {
        let key = session.key.clone();
        let orphan = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&key) {
                Some(slot) if slot.is_held_by(session.ticket) => {
                    session.touch();
                    session.ticket = 0;
                    *slot = Slot::Idle(session);
                    None
                }
                _ => Some(session),
            }
        };

        match orphan {
            None => {
                debug!(key = %key, "Session returned to pool");
                self.returned.notify_waiters();
            }
            Some(session) => {
                warn!(key = %key, "Released session has no pool entry, closing it");
                session.transport.close().await;
            }
        }
    }

    /// Close and forget whatever the pool holds for `key`.
    ///
    /// A leased session cannot be closed from here; its lease is dropped and
    /// the holder's transport is closed when it comes back.
    pub async fn evict(&self, key: &SessionKey) -> bool {
        let removed = self.slots.lock().remove(key);
        match removed {
            None => false,
            Some(Slot::Idle(session)) => {
                info!(key = %key, "Evicting pooled session");
                self.returned.notify_waiters();
                session.transport.close().await;
                true
            }
            Some(Slot::Leased { since, .. }) => {
                info!(
                    key = %key,
                    leased_secs = since.elapsed().as_secs(),
                    "Evicting checked-out session"
                );
                self.returned.notify_waiters();
                true
            }
        }
    }

    /// Close a leased session after a transport fault and drop its lease.
    pub async fn retire(&self, session: Session<S>) {
        let key = session.key.clone();
        self.forget_lease(&key, session.ticket);
        debug!(key = %key, "Closing retired session");
        session.transport.close().await;
    }

    /// Drop the lease marker for `key` if `ticket` still holds it.
    /// Synchronous so guards can call it from `Drop`.
    pub(crate) fn forget_lease(&self, key: &SessionKey, ticket: u64) -> bool {
        let removed = {
            let mut slots = self.slots.lock();
            if slots.get(key).is_some_and(|slot| slot.is_held_by(ticket)) {
                slots.remove(key);
                true
            } else {
                false
            }
        };
        if removed {
            self.returned.notify_waiters();
        }
        removed
    }

    /// Close every idle session whose idle time exceeds the timeout.
    pub async fn reap(&self) -> usize {
        let expired: Vec<Session<S>> = {
            let mut slots = self.slots.lock();
            let stale: Vec<SessionKey> = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Idle(session) if session.idle_time() > self.config.idle_timeout => {
                        Some(key.clone())
                    }
                    _ => None,
                })
                .collect();
            stale
                .into_iter()
                .filter_map(|key| match slots.remove(&key) {
                    Some(Slot::Idle(session)) => Some(session),
                    _ => None,
                })
                .collect()
        };

        let closed = expired.len();
        for session in expired {
            debug!(key = %session.key, "Closing idle session");
            session.transport.close().await;
        }

        if closed > 0 {
            let remaining = self.len();
            info!(closed, remaining, "Cleaned up idle sessions");
        }
        closed
    }

    /// Number of resident sessions, idle or leased
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn is_leased(&self, key: &SessionKey) -> bool {
        self.slots.lock().get(key).is_some_and(Slot::is_leased)
    }

    #[must_use = "pool stats should be used for monitoring or logging"]
    pub fn stats(&self) -> PoolStats {
        let slots = self.slots.lock();
        let leased = slots.values().filter(|slot| slot.is_leased()).count();
        PoolStats {
            capacity: self.config.capacity,
            idle: slots.len() - leased,
            leased,
        }
    }

    /// Close all idle sessions and clear the pool
    pub async fn close_all(&self) {
        let drained: Vec<(SessionKey, Slot<S>)> = self.slots.lock().drain().collect();
        self.returned.notify_waiters();

        for (key, slot) in drained {
            if let Slot::Idle(session) = slot {
                debug!(key = %key, "Closing pooled session");
                session.transport.close().await;
            }
        }

        info!("Connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::io::DuplexStream;

    use crate::error::TransportError;
    use crate::transport::{OpenMode, RemoteMetadata};

    struct Stub {
        closed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RemoteSession for Stub {
        type File = DuplexStream;

        async fn open(&self, _path: &str, _mode: OpenMode) -> Result<DuplexStream, TransportError> {
            Err(TransportError::NotFound)
        }

        async fn stat(&self, _path: &str) -> Result<RemoteMetadata, TransportError> {
            Err(TransportError::NotFound)
        }

        async fn chmod(&self, _path: &str, _mode: u32) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(capacity: usize) -> (Arc<ConnectionPool<Stub>>, Arc<AtomicUsize>) {
        let pool = ConnectionPool::new(PoolConfig {
            capacity,
            idle_timeout: Duration::from_secs(60),
            checkout_timeout: Duration::from_secs(1),
        });
        (Arc::new(pool), Arc::new(AtomicUsize::new(0)))
    }

    fn stub(closed: &Arc<AtomicUsize>) -> Stub {
        Stub {
            closed: closed.clone(),
        }
    }

    fn key(host: &str) -> SessionKey {
        SessionKey::new(host, 22, "deploy")
    }

    #[test]
    fn pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.capacity, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.checkout_timeout, Duration::from_secs(30));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let pool: ConnectionPool<Stub> = ConnectionPool::new(PoolConfig {
            capacity: 0,
            ..PoolConfig::default()
        });
        assert_eq!(pool.config().capacity, 1);
    }

    #[tokio::test]
    async fn acquire_on_empty_pool_is_no_connection() {
        let (pool, _) = pool(2);
        let err = pool.acquire(&key("a")).await.unwrap_err();
        assert_eq!(err, PoolError::NoConnection(key("a")));
    }

    #[tokio::test]
    async fn acquire_marks_key_leased_and_release_returns_it() {
        let (pool, closed) = pool(2);
        pool.add(key("a"), stub(&closed)).await;

        let session = pool.acquire(&key("a")).await.unwrap();
        assert!(pool.is_leased(&key("a")));
        assert_eq!(pool.stats().leased, 1);

        pool.release(session).await;
        assert!(!pool.is_leased(&key("a")));
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn add_replaces_idle_session() {
        let (pool, closed) = pool(2);
        assert_eq!(pool.add(key("a"), stub(&closed)).await, Admission::Inserted);
        assert_eq!(pool.add(key("a"), stub(&closed)).await, Admission::Replaced);
        assert_eq!(pool.len(), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn add_for_leased_key_sheds_new_session() {
        let (pool, closed) = pool(2);
        pool.add(key("a"), stub(&closed)).await;
        let session = pool.acquire(&key("a")).await.unwrap();

        assert_eq!(
            pool.add(key("a"), stub(&closed)).await,
            Admission::Shed(ShedReason::InUse)
        );
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(pool.is_leased(&key("a")));

        pool.release(session).await;
    }

    #[tokio::test]
    async fn evict_leased_key_closes_handle_on_release() {
        let (pool, closed) = pool(2);
        pool.add(key("a"), stub(&closed)).await;
        let session = pool.acquire(&key("a")).await.unwrap();

        assert!(pool.evict(&key("a")).await);
        assert!(pool.is_empty());
        assert_eq!(closed.load(Ordering::SeqCst), 0);

        pool.release(session).await;
        assert!(pool.is_empty());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn revoked_holder_cannot_end_a_newer_lease() {
        let (pool, closed) = pool(2);
        pool.add(key("a"), stub(&closed)).await;
        let old = pool.acquire(&key("a")).await.unwrap();
        pool.evict(&key("a")).await;

        pool.add(key("a"), stub(&closed)).await;
        let current = pool.acquire(&key("a")).await.unwrap();

        pool.release(old).await;
        assert!(pool.is_leased(&key("a")));
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        pool.release(current).await;
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn evict_unknown_key_is_false() {
        let (pool, _) = pool(2);
        assert!(!pool.evict(&key("a")).await);
    }

    #[tokio::test]
    async fn retire_drops_lease_and_closes() {
        let (pool, closed) = pool(2);
        pool.add(key("a"), stub(&closed)).await;
        let session = pool.acquire(&key("a")).await.unwrap();

        pool.retire(session).await;
        assert!(!pool.contains(&key("a")));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leased_key_waits_then_times_out() {
        let (pool, closed) = pool(2);
        pool.add(key("a"), stub(&closed)).await;
        let _held = pool.acquire(&key("a")).await.unwrap();

        let err = pool.acquire(&key("a")).await.unwrap_err();
        assert_eq!(err, PoolError::Busy(key("a")));
    }

    #[tokio::test]
    async fn waiter_gets_session_after_release() {
        let (pool, closed) = pool(2);
        pool.add(key("a"), stub(&closed)).await;
        let held = pool.acquire(&key("a")).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(&key("a")).await.map(|s| s.key().clone()) })
        };
        tokio::task::yield_now().await;
        pool.release(held).await;

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, key("a"));
        assert!(pool.is_leased(&key("a")));
    }

    #[tokio::test]
    async fn close_all_empties_pool() {
        let (pool, closed) = pool(3);
        pool.add(key("a"), stub(&closed)).await;
        pool.add(key("b"), stub(&closed)).await;

        pool.close_all().await;
        assert!(pool.is_empty());
        assert_eq!(closed.load(Ordering::SeqCst), 2);
    }
}
