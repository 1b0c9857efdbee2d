//! Named one-shot timers
//!
//! Each timer kind has at most one live task. Arming a kind aborts whatever
//! was armed under it before.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Fires when this node should propose
    Mining,
    /// Fires when a committee member gives up waiting for the slot's block
    BlockReceiveTimeout,
    /// Periodic miner registration
    MinerBroadcast,
}

#[derive(Default)]
pub struct TimerTable {
    handles: Mutex<HashMap<TimerKind, JoinHandle<()>>>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing any live timer of the same kind
    pub fn arm<F>(&self, kind: TimerKind, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        if let Some(previous) = self.handles.lock().insert(kind, handle) {
            if !previous.is_finished() {
                tracing::debug!("{:?} timer superseded", kind);
            }
            previous.abort();
        }
    }

    pub fn cancel(&self, kind: TimerKind) -> bool {
        match self.handles.lock().remove(&kind) {
            Some(handle) => {
                let live = !handle.is_finished();
                handle.abort();
                live
            }
            None => false,
        }
    }

    pub fn is_live(&self, kind: TimerKind) -> bool {
        self.handles
            .lock()
            .get(&kind)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn cancel_all(&self) {
        for (_, handle) in self.handles.lock().drain() {
            handle.abort();
        }
    }
}

impl Drop for TimerTable {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_rearming_supersedes_previous_timer() {
        let timers = TimerTable::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fired = fired.clone();
            timers.arm(TimerKind::Mining, Duration::from_secs(10), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(timers.is_live(TimerKind::Mining));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_live(TimerKind::Mining));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_only_that_kind() {
        let timers = TimerTable::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for kind in [TimerKind::Mining, TimerKind::BlockReceiveTimeout] {
            let fired = fired.clone();
            timers.arm(kind, Duration::from_secs(5), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(timers.cancel(TimerKind::Mining));
        assert!(!timers.cancel(TimerKind::MinerBroadcast));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
