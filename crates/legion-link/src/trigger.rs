//! Synchronized-start arithmetic and the cancellable deferred start.
//!
//! A start command carries the commander's send time `T0` and a lead `D`.
//! Every receiver, the commander included, begins recording when its
//! synchronized clock reads `T0 + D`, by waiting
//! `max(0, T0 + D - synchronized_now)` from the moment it handles the
//! command. Delivery latency cancels out; only offset error shows up as skew.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Smallest lead a commander may use.
pub const MIN_LEAD_MS: u64 = 100;

/// Largest lead a commander may use.
pub const MAX_LEAD_MS: u64 = 5_000;

/// Synchronized time at which a start issued now with `lead_ms` fires.
#[must_use]
pub fn fire_at(sync_now: i64, lead_ms: u64) -> i64 {
    sync_now.saturating_add(i64::try_from(lead_ms).unwrap_or(i64::MAX))
}

/// How long to wait before beginning a start stamped `origin_ms` with
/// `delay_ms`, given the receiver's synchronized clock.
///
/// Never negative: a command that arrives after its fire time starts at once.
#[must_use]
pub fn wait_ms(origin_ms: i64, delay_ms: u64, sync_now: i64) -> u64 {
    let target = fire_at(origin_ms, delay_ms);
    u64::try_from(target.saturating_sub(sync_now)).unwrap_or(0)
}

/// At most one deferred start per node.
///
/// Scheduling replaces any start already pending; cancelling aborts it
/// before it fires.
#[derive(Debug, Default)]
pub struct PendingStart {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PendingStart {
    /// Create with nothing pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `wait`, replacing any pending start.
    pub fn schedule<F>(&self, wait: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            action.await;
        });
        if let Ok(mut slot) = self.handle.lock() {
            if let Some(previous) = slot.replace(task) {
                if !previous.is_finished() {
                    debug!("Replacing pending start");
                    previous.abort();
                }
            }
        } else {
            task.abort();
        }
    }

    /// Abort the pending start, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let Ok(mut slot) = self.handle.lock() else {
            return false;
        };
        match slot.take() {
            Some(task) if !task.is_finished() => {
                task.abort();
                debug!("Pending start cancelled");
                true
            }
            _ => false,
        }
    }

    /// Whether a start is scheduled and has not yet run.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.handle
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for PendingStart {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_wait_for_exact_offset() {
        // Commander sends at 0 with a 500 ms lead; A receives at 50 on an
        // exactly synchronized clock
        assert_eq!(wait_ms(0, 500, 50), 450);
    }

    #[test]
    fn test_wait_with_offset_error() {
        // B's synchronized clock reads 100 ms ahead at the same instant
        assert_eq!(wait_ms(0, 500, 150), 350);
    }

    #[test]
    fn test_wait_is_never_negative() {
        assert_eq!(wait_ms(1_000, 500, 1_500), 0);
        assert_eq!(wait_ms(1_000, 500, 9_000), 0);
    }

    #[test]
    fn test_fire_at() {
        assert_eq!(fire_at(10_000, 750), 10_750);
        assert_eq!(fire_at(i64::MAX - 1, 750), i64::MAX);
    }

    #[test]
    fn test_wait_independent_of_latency() {
        // Whatever the delivery delay, receipt + wait lands on origin + delay
        for latency in [0_i64, 3, 120, 499] {
            let now = 5_000 + latency;
            let wait = i64::try_from(wait_ms(5_000, 500, now)).unwrap();
            assert_eq!(now + wait, 5_500);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_start_fires_after_wait() {
        let fired = Arc::new(AtomicUsize::new(0));
        let pending = PendingStart::new();
        let f = Arc::clone(&fired);
        pending.schedule(Duration::from_millis(450), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(pending.is_pending());

        tokio::time::sleep(Duration::from_millis(449)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!pending.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_start() {
        let fired = Arc::new(AtomicUsize::new(0));
        let pending = PendingStart::new();
        let f = Arc::clone(&fired);
        pending.schedule(Duration::from_millis(500), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pending.cancel());
        assert!(!pending.cancel());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending() {
        let fired = Arc::new(AtomicUsize::new(0));
        let pending = PendingStart::new();
        for _ in 0..3 {
            let f = Arc::clone(&fired);
            pending.schedule(Duration::from_millis(300), async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
