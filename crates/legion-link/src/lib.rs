//! `legion-link` - synchronized start/stop for a cluster of capture devices
//!
//! One device runs as the commander and the rest connect to it as field
//! nodes over persistent TCP links. Field nodes estimate the commander's
//! clock from its timestamps, so a start command carrying a short lead time
//! makes every device begin recording at the same commander-relative instant.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod capture;
pub mod cli;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod logging;
pub mod membership;
pub mod protocol;
pub mod transport;
pub mod trigger;

pub use capture::{CaptureError, CaptureLayer, LoggingCapture};
pub use clock::{Clock, ClockSync, SystemClock};
pub use config::Config;
pub use coordinator::{Coordinator, NodeEvent, SessionState};
pub use error::{Error, Result};
pub use identity::{NodeId, Role};
pub use logging::init_logging;
pub use membership::{DeviceRecord, DeviceStatus, MembershipTracker};
pub use protocol::{ControlMessage, MessageKind, Payload};
pub use transport::ProtocolHint;
