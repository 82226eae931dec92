//! Session coordination: lifecycle, message routing and the synchronized
//! start protocol.
//!
//! [`Coordinator`] is the only entry point applications need. Internally each
//! session runs an event loop that drains link events and looped-back
//! messages, a heartbeat timer, and at most one deferred start.

mod core;
mod events;
mod node;
mod state;

pub use self::core::Coordinator;
pub use events::{NodeEvent, EVENT_CHANNEL_CAPACITY};
pub use state::SessionState;
