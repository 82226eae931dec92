//! Local clocks and commander-relative time.
//!
//! Every node answers "what time is it on the commander right now" by
//! subtracting a single offset from its own clock. The offset is the
//! difference between when a commander timestamp arrived locally and the
//! timestamp itself, so it folds one-way network latency into the estimate.
//! Each new sample replaces the previous one outright.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::trace;

/// A source of wall-clock milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// The operating system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to. Cheap to clone; clones share time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock reading `start_ms`.
    #[must_use]
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Move forward by `delta_ms`.
    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Epoch milliseconds that advance with tokio's clock.
///
/// Reads as `origin_ms` when created and moves with
/// [`tokio::time::Instant`] from then on, so it follows paused and
/// auto-advanced time in tests.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin_ms: i64,
    started: tokio::time::Instant,
}

impl TokioClock {
    /// Create a clock reading `origin_ms` now.
    #[must_use]
    pub fn new(origin_ms: i64) -> Self {
        Self {
            origin_ms,
            started: tokio::time::Instant::now(),
        }
    }

    /// A clock that runs in step with this one but reads `skew_ms` ahead.
    #[must_use]
    pub fn skewed(&self, skew_ms: i64) -> Self {
        Self {
            origin_ms: self.origin_ms + skew_ms,
            started: self.started,
        }
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.origin_ms.saturating_add(elapsed)
    }
}

/// Tracks the offset between this node's clock and the commander's.
#[derive(Debug)]
pub struct ClockSync {
    clock: Arc<dyn Clock>,
    reference: bool,
    offset_ms: AtomicI64,
    sampled: AtomicBool,
}

impl ClockSync {
    /// Synchronizer for the commander: it is the reference clock, so its
    /// offset stays at zero whatever it receives.
    #[must_use]
    pub fn reference(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, true)
    }

    /// Synchronizer for a field node, starting with a zero offset.
    #[must_use]
    pub fn follower(clock: Arc<dyn Clock>) -> Self {
        Self::new(clock, false)
    }

    fn new(clock: Arc<dyn Clock>, reference: bool) -> Self {
        Self {
            clock,
            reference,
            offset_ms: AtomicI64::new(0),
            sampled: AtomicBool::new(false),
        }
    }

    /// Record a commander timestamp that arrived at `local_receipt_ms`.
    pub fn on_sync_sample(&self, origin_ms: i64, local_receipt_ms: i64) {
        if self.reference {
            return;
        }
        let offset = local_receipt_ms.saturating_sub(origin_ms);
        let previous = self.offset_ms.swap(offset, Ordering::SeqCst);
        self.sampled.store(true, Ordering::SeqCst);
        trace!(offset_ms = offset, previous_ms = previous, "Clock offset updated");
    }

    /// Current offset estimate: local minus commander time.
    #[must_use]
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::SeqCst)
    }

    /// Whether any sample has been taken yet. Always true on the commander.
    #[must_use]
    pub fn has_sample(&self) -> bool {
        self.reference || self.sampled.load(Ordering::SeqCst)
    }

    /// This node's own clock reading.
    #[must_use]
    pub fn local_now(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Best estimate of the commander's clock right now.
    #[must_use]
    pub fn synchronized_now(&self) -> i64 {
        self.local_now().saturating_sub(self.offset_ms())
    }
}
