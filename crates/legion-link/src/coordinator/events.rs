//! Events a coordinator publishes to its observers.
//!
//! Events travel over a `tokio::sync::broadcast` channel. Order is preserved
//! for messages arriving on one connection; there is no ordering guarantee
//! across connections. A slow observer that falls behind loses the oldest
//! events and is told how many it missed.

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::membership::DeviceRecord;
use crate::protocol::ControlMessage;

use super::SessionState;

/// Capacity of the event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observers may want to react to.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The commander's device list changed. Carries the new snapshot.
    MembershipChanged(Vec<DeviceRecord>),
    /// A control message was handled, whatever its kind.
    Message(ControlMessage),
    /// Local recording started or stopped at synchronized time `at`.
    Recording {
        /// Whether the device is now recording.
        recording: bool,
        /// Synchronized time of the transition.
        at: i64,
    },
    /// The session moved to a new lifecycle state.
    StateChanged(SessionState),
}

/// Run `handler` for every event `select` picks out, until the channel closes.
pub(crate) fn spawn_listener<T, S, F>(
    mut events: broadcast::Receiver<NodeEvent>,
    select: S,
    mut handler: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    S: Fn(NodeEvent) -> Option<T> + Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(value) = select(event) {
                        handler(value);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Event listener fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
