use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::transport::RemoteSession;

use super::ConnectionPool;

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to the background task that evicts idle sessions.
///
/// Dropping the handle aborts the task.
pub struct ReaperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Stop the reaper and wait for its current cycle to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ReaperHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl<S: RemoteSession> ConnectionPool<S> {
    /// Start the reaper. It sweeps every half idle timeout and stops on its
    /// own once the pool is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) -> ReaperHandle {
        let period = (self.config.idle_timeout / 2).max(MIN_REAP_INTERVAL);
        let pool = Arc::downgrade(self);
        let (tx, mut rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else {
                            break;
                        };
                        pool.reap().await;
                    }
                    _ = &mut rx => break,
                }
            }
            debug!("Session reaper stopped");
        });

        debug!(interval_ms = period.as_millis() as u64, "Session reaper started");
        ReaperHandle {
            shutdown: Some(tx),
            task: Some(task),
        }
    }
}
