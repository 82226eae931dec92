//! Seam between the cluster protocol and the device's camera pipeline.
//!
//! The coordinator only ever asks three things of a device: start recording,
//! stop recording, and whether it is recording. Everything about how frames
//! are captured lives behind [`CaptureLayer`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;

use crate::clock::Clock;

/// Errors reported by a capture layer.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Recording could not be started.
    #[error("failed to start recording: {0}")]
    StartFailed(String),

    /// Recording could not be stopped cleanly.
    #[error("failed to stop recording: {0}")]
    StopFailed(String),
}

/// A device's local recording pipeline.
///
/// Implementations must tolerate redundant calls: the coordinator guards
/// against double starts, but a stop may arrive when nothing is recording.
#[async_trait::async_trait]
pub trait CaptureLayer: Send + Sync + fmt::Debug {
    /// Short name for log lines.
    fn name(&self) -> &'static str;

    /// Begin recording now.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline refuses to start.
    async fn begin_local_recording(&self) -> Result<(), CaptureError>;

    /// Stop recording now.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline fails to stop cleanly.
    async fn end_local_recording(&self) -> Result<(), CaptureError>;

    /// Whether the pipeline is currently recording.
    fn is_locally_recording(&self) -> bool;
}

/// One transition of a [`LoggingCapture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTransition {
    /// `true` for a start, `false` for a stop.
    pub recording: bool,
    /// Clock reading when the transition happened.
    pub at: i64,
}

/// A capture layer with no camera behind it.
///
/// It logs each transition and keeps a history, which makes it the backend
/// for the CLI and for tests that check when recording began.
#[derive(Debug, Clone)]
pub struct LoggingCapture {
    clock: Arc<dyn Clock>,
    recording: Arc<AtomicBool>,
    history: Arc<Mutex<Vec<CaptureTransition>>>,
}

impl LoggingCapture {
    /// Create an idle capture layer stamping transitions with `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            recording: Arc::new(AtomicBool::new(false)),
            history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every transition so far, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<CaptureTransition> {
        self.history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Clock readings at which recording began.
    #[must_use]
    pub fn starts(&self) -> Vec<i64> {
        self.history()
            .into_iter()
            .filter(|t| t.recording)
            .map(|t| t.at)
            .collect()
    }

    fn push(&self, recording: bool) -> i64 {
        let at = self.clock.now_ms();
        if let Ok(mut history) = self.history.lock() {
            history.push(CaptureTransition { recording, at });
        }
        at
    }
}

#[async_trait::async_trait]
impl CaptureLayer for LoggingCapture {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn begin_local_recording(&self) -> Result<(), CaptureError> {
        if self.recording.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let at = self.push(true);
        info!(at, "Recording started");
        Ok(())
    }

    async fn end_local_recording(&self) -> Result<(), CaptureError> {
        if !self.recording.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let at = self.push(false);
        info!(at, "Recording stopped");
        Ok(())
    }

    fn is_locally_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }
}
